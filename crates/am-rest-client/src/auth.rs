//! Signature headers for the REST API client

use am_api_contract::{Operation, RequestAuth};
use am_auth::SignedRequest;
use am_client_api::{TransportError, TransportResult};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

pub const KEY_ID_HEADER: &str = "x-am-key-id";
pub const TIMESTAMP_HEADER: &str = "x-am-timestamp";
pub const NONCE_HEADER: &str = "x-am-nonce";
pub const SIGNATURE_HEADER: &str = "x-am-signature";
pub const OPERATION_HEADER: &str = "x-am-operation";

/// Wire form of the authentication data covering a signed payload
pub fn request_auth(signed: &SignedRequest) -> RequestAuth {
    RequestAuth {
        key_id: signed.key_id.clone(),
        timestamp: signed.timestamp,
        nonce: signed.nonce_base64(),
        signature: signed.signature_base64(),
    }
}

/// Apply signature headers to a request
pub fn apply_to_headers(
    operation: Operation,
    auth: &RequestAuth,
    headers: &mut HeaderMap,
) -> TransportResult<()> {
    let pairs = [
        (KEY_ID_HEADER, auth.key_id.clone()),
        (TIMESTAMP_HEADER, auth.timestamp.to_string()),
        (NONCE_HEADER, auth.nonce.clone()),
        (SIGNATURE_HEADER, auth.signature.clone()),
        (OPERATION_HEADER, operation.as_str().to_string()),
    ];

    for (name, value) in pairs {
        let value = HeaderValue::from_str(&value)
            .map_err(|e| TransportError::Protocol(format!("invalid {name} header: {e}")))?;
        headers.insert(HeaderName::from_static(name), value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_auth::{Credential, Signer};

    #[test]
    fn test_signature_headers() {
        let signer = Signer::new(Credential::generate());
        let signed = signer.sign(b"{}");
        let auth = request_auth(&signed);

        let mut headers = HeaderMap::new();
        apply_to_headers(Operation::CancelTask, &auth, &mut headers).unwrap();

        assert_eq!(headers.get(KEY_ID_HEADER).unwrap(), signer.key_id());
        assert_eq!(
            headers.get(TIMESTAMP_HEADER).unwrap(),
            &signed.timestamp.to_string()
        );
        assert_eq!(headers.get(SIGNATURE_HEADER).unwrap(), &signed.signature_base64());
        assert_eq!(headers.get(OPERATION_HEADER).unwrap(), "cancelTask");
    }

    #[test]
    fn test_invalid_header_value_rejected() {
        let auth = RequestAuth {
            key_id: "bad\nid".to_string(),
            timestamp: 0,
            nonce: String::new(),
            signature: String::new(),
        };
        let mut headers = HeaderMap::new();
        assert!(matches!(
            apply_to_headers(Operation::SubmitTask, &auth, &mut headers),
            Err(TransportError::Protocol(_))
        ));
    }
}
