//! Request signing.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::Signer as _;
use rand::RngCore;

use crate::credential::{Credential, PublicKey};
use crate::error::{AuthError, AuthResult};

/// Magic preamble for signed request messages.
const SIGN_MAGIC: &[u8; 16] = b"AGENT-MARKET-SIG";

/// Canonical message format version.
const SIGN_VERSION_V1: u8 = 0x01;

pub const NONCE_LEN: usize = 16;
pub const SIGNATURE_LEN: usize = 64;

/// 128 bits of OS randomness, used once per signed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> AuthResult<Self> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| AuthError::malformed(format!("nonce is not base64: {e}")))?;
        let bytes: [u8; NONCE_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| AuthError::malformed(format!("nonce must be {NONCE_LEN} bytes")))?;
        Ok(Self(bytes))
    }
}

/// Build the byte string that gets signed.
///
/// | Field       | Size | Description                       |
/// |-------------|------|-----------------------------------|
/// | magic       | 16   | `AGENT-MARKET-SIG`                |
/// | version     | 1    | `0x01`                            |
/// | timestamp   | 8    | Unix milliseconds, i64 big-endian |
/// | nonce       | 16   | Random nonce                      |
/// | payload_len | 8    | u64 big-endian                    |
/// | payload     | var  | Request payload                   |
pub fn build_canonical_message(timestamp: i64, nonce: &Nonce, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(SIGN_MAGIC.len() + 1 + 8 + NONCE_LEN + 8 + payload.len());
    msg.extend_from_slice(SIGN_MAGIC);
    msg.push(SIGN_VERSION_V1);
    msg.extend_from_slice(&timestamp.to_be_bytes());
    msg.extend_from_slice(nonce.as_bytes());
    msg.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    msg.extend_from_slice(payload);
    msg
}

/// A payload together with the authentication data that covers it.
#[derive(Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub payload: Vec<u8>,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    pub nonce: Nonce,
    pub signature: [u8; SIGNATURE_LEN],
    pub key_id: String,
}

impl SignedRequest {
    pub fn signature_base64(&self) -> String {
        STANDARD.encode(self.signature)
    }

    pub fn nonce_base64(&self) -> String {
        self.nonce.to_base64()
    }

    /// Rebuild a signed request from its transport encoding.
    pub fn from_encoded(
        payload: Vec<u8>,
        key_id: impl Into<String>,
        timestamp: i64,
        nonce: &str,
        signature: &str,
    ) -> AuthResult<Self> {
        let nonce = Nonce::from_base64(nonce)?;
        let signature = STANDARD
            .decode(signature)
            .map_err(|e| AuthError::malformed(format!("signature is not base64: {e}")))?;
        let signature: [u8; SIGNATURE_LEN] = signature.as_slice().try_into().map_err(|_| {
            AuthError::malformed(format!("signature must be {SIGNATURE_LEN} bytes"))
        })?;

        Ok(Self {
            payload,
            timestamp,
            nonce,
            signature,
            key_id: key_id.into(),
        })
    }
}

impl std::fmt::Debug for SignedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedRequest")
            .field("key_id", &self.key_id)
            .field("timestamp", &self.timestamp)
            .field("nonce", &self.nonce_base64())
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Signs outbound payloads with a shared, read-only credential.
#[derive(Clone, Debug)]
pub struct Signer {
    credential: Arc<Credential>,
}

impl Signer {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential: Arc::new(credential),
        }
    }

    pub fn key_id(&self) -> &str {
        self.credential.key_id()
    }

    pub fn public_key(&self) -> PublicKey {
        self.credential.public_key()
    }

    /// Sign a payload at the current wall-clock time with a fresh nonce.
    pub fn sign(&self, payload: &[u8]) -> SignedRequest {
        self.sign_at(payload, chrono::Utc::now().timestamp_millis())
    }

    /// Sign a payload at an explicit timestamp with a fresh nonce.
    pub fn sign_at(&self, payload: &[u8], timestamp: i64) -> SignedRequest {
        let nonce = Nonce::random();
        let message = build_canonical_message(timestamp, &nonce, payload);
        let signature = self.credential.signing_key().sign(&message);

        SignedRequest {
            payload: payload.to_vec(),
            timestamp,
            nonce,
            signature: signature.to_bytes(),
            key_id: self.credential.key_id().to_string(),
        }
    }
}

/// Check the signature of a request against a public key.
///
/// This does not check the timestamp window or nonce reuse; see
/// [`crate::Verifier`] for that.
pub fn verify(public_key: &PublicKey, request: &SignedRequest) -> AuthResult<()> {
    let message = build_canonical_message(request.timestamp, &request.nonce, &request.payload);
    let signature = ed25519_dalek::Signature::from_bytes(&request.signature);
    public_key
        .verifying_key()
        .verify_strict(&message, &signature)
        .map_err(|_| AuthError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn signer() -> Signer {
        Signer::new(Credential::from_secret_bytes(&[42u8; 32], Some("agent-1".into())).unwrap())
    }

    #[test]
    fn test_sign_then_verify() {
        let signer = signer();
        let request = signer.sign(br#"{"op":"sum","args":[1,2]}"#);

        assert_eq!(request.key_id, "agent-1");
        assert!(verify(&signer.public_key(), &request).is_ok());
    }

    #[test]
    fn test_nonce_is_fresh_per_signature() {
        let signer = signer();
        let a = signer.sign_at(b"same", 1_700_000_000_000);
        let b = signer.sign_at(b"same", 1_700_000_000_000);

        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.signature, b.signature);
    }

    #[test]
    fn test_wrong_key_fails() {
        let request = signer().sign(b"payload");
        let other = Credential::generate().public_key();
        assert_eq!(verify(&other, &request), Err(AuthError::InvalidSignature));
    }

    #[test]
    fn test_encoded_round_trip() {
        let signer = signer();
        let request = signer.sign(b"payload");
        let decoded = SignedRequest::from_encoded(
            request.payload.clone(),
            request.key_id.clone(),
            request.timestamp,
            &request.nonce_base64(),
            &request.signature_base64(),
        )
        .unwrap();

        assert_eq!(decoded, request);
    }

    #[test]
    fn test_malformed_nonce_rejected() {
        let err = SignedRequest::from_encoded(vec![], "k", 0, "AAAA", "AAAA").unwrap_err();
        assert!(matches!(err, AuthError::Malformed { .. }));
    }

    proptest! {
        #[test]
        fn prop_payload_bit_flip_fails(payload in proptest::collection::vec(any::<u8>(), 1..256), bit in any::<usize>()) {
            let signer = signer();
            let mut request = signer.sign(&payload);
            prop_assert!(verify(&signer.public_key(), &request).is_ok());

            let bit = bit % (request.payload.len() * 8);
            request.payload[bit / 8] ^= 1 << (bit % 8);
            prop_assert_eq!(verify(&signer.public_key(), &request), Err(AuthError::InvalidSignature));
        }

        #[test]
        fn prop_timestamp_bit_flip_fails(timestamp in any::<i64>(), bit in 0u32..64) {
            let signer = signer();
            let mut request = signer.sign_at(b"payload", timestamp);
            request.timestamp ^= 1i64 << bit;
            prop_assert_eq!(verify(&signer.public_key(), &request), Err(AuthError::InvalidSignature));
        }

        #[test]
        fn prop_nonce_bit_flip_fails(bit in 0usize..(NONCE_LEN * 8)) {
            let signer = signer();
            let mut request = signer.sign(b"payload");
            let mut nonce = *request.nonce.as_bytes();
            nonce[bit / 8] ^= 1 << (bit % 8);
            request.nonce = Nonce::from_bytes(nonce);
            prop_assert_eq!(verify(&signer.public_key(), &request), Err(AuthError::InvalidSignature));
        }
    }
}
