//! Ed25519 credentials.
//!
//! Secret keys are accepted in two base64 forms: a 32-byte seed, or the
//! 64-byte `seed || public_key` layout produced by NaCl-style tooling. In
//! the second form the public half must match the seed.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{AuthError, AuthResult};

const SEED_LEN: usize = 32;
const NACL_SECRET_LEN: usize = 64;

/// Environment variable holding the base64 secret key.
pub const SECRET_KEY_ENV: &str = "AGENT_SECRET_KEY";

/// Environment variable overriding the key id.
pub const KEY_ID_ENV: &str = "AGENT_KEY_ID";

/// An Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Decode a base64 (standard alphabet) public key.
    pub fn from_base64(encoded: &str) -> AuthResult<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| AuthError::credential(format!("public key is not base64: {e}")))?;
        let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            AuthError::credential(format!("public key must be 32 bytes, got {}", bytes.len()))
        })?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|_| AuthError::credential("public key is not a valid curve point"))?;
        Ok(Self(key))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0.as_bytes())
    }

    /// Fingerprint in the form `SHA256:<url-safe base64>`.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        format!("SHA256:{}", URL_SAFE_NO_PAD.encode(digest))
    }

    pub(crate) fn verifying_key(&self) -> &VerifyingKey {
        &self.0
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PublicKey").field(&self.fingerprint()).finish()
    }
}

/// Long-term signing credential: a key id plus the private signing key.
///
/// The signing key zeroizes itself on drop and is never printed.
pub struct Credential {
    key_id: String,
    key: SigningKey,
}

impl Credential {
    /// Generate a fresh random credential. The key id is the fingerprint.
    pub fn generate() -> Self {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        Self::from_signing_key(key, None)
    }

    /// Load a credential from a base64 secret key.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::CredentialInvalid`] when the text is not base64,
    /// has the wrong length, or carries a public half that does not belong
    /// to the seed.
    pub fn from_secret_base64(secret: &str, key_id: Option<String>) -> AuthResult<Self> {
        let bytes = Zeroizing::new(
            STANDARD
                .decode(secret.trim())
                .map_err(|e| AuthError::credential(format!("secret key is not base64: {e}")))?,
        );
        Self::from_secret_bytes(&bytes, key_id)
    }

    /// Load a credential from raw secret key bytes (32-byte seed or 64-byte
    /// seed-and-public form).
    pub fn from_secret_bytes(bytes: &[u8], key_id: Option<String>) -> AuthResult<Self> {
        let seed: Zeroizing<[u8; SEED_LEN]> = match bytes.len() {
            SEED_LEN | NACL_SECRET_LEN => {
                let mut seed = Zeroizing::new([0u8; SEED_LEN]);
                seed.copy_from_slice(&bytes[..SEED_LEN]);
                seed
            }
            other => {
                return Err(AuthError::credential(format!(
                    "secret key must be {SEED_LEN} or {NACL_SECRET_LEN} bytes, got {other}"
                )))
            }
        };

        let key = SigningKey::from_bytes(&seed);
        if bytes.len() == NACL_SECRET_LEN && key.verifying_key().as_bytes() != &bytes[SEED_LEN..] {
            return Err(AuthError::credential(
                "public half of secret key does not match its seed",
            ));
        }

        if let Some(id) = &key_id {
            if id.trim().is_empty() {
                return Err(AuthError::credential("key id cannot be empty"));
            }
        }

        Ok(Self::from_signing_key(key, key_id))
    }

    /// Load from `AGENT_SECRET_KEY` and the optional `AGENT_KEY_ID`.
    pub fn from_env() -> AuthResult<Self> {
        let secret = Zeroizing::new(std::env::var(SECRET_KEY_ENV).map_err(|_| {
            AuthError::credential(format!("{SECRET_KEY_ENV} is not set"))
        })?);
        let key_id = std::env::var(KEY_ID_ENV).ok();
        Self::from_secret_base64(&secret, key_id)
    }

    fn from_signing_key(key: SigningKey, key_id: Option<String>) -> Self {
        let key_id = key_id.unwrap_or_else(|| PublicKey(key.verifying_key()).fingerprint());
        Self { key_id, key }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.key.verifying_key())
    }

    /// Export the 64-byte `seed || public` secret as base64.
    ///
    /// The returned string zeroizes on drop; avoid copying it.
    pub fn export_secret_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(self.key.to_keypair_bytes()))
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.key
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("key_id", &self.key_id)
            .field("key", &"[redacted]")
            .finish()
    }
}

/// Base64-encoded key pair, ready to be stored by the caller.
pub struct KeyPair {
    pub public_key: String,
    pub secret_key: Zeroizing<String>,
}

/// Generate a new key pair for registration with the marketplace.
pub fn generate_key_pair() -> KeyPair {
    let credential = Credential::generate();
    KeyPair {
        public_key: credential.public_key().to_base64(),
        secret_key: credential.export_secret_base64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_pair_reloads() {
        let pair = generate_key_pair();
        let credential = Credential::from_secret_base64(&pair.secret_key, None).unwrap();

        assert_eq!(credential.public_key().to_base64(), pair.public_key);
        assert!(credential.key_id().starts_with("SHA256:"));
    }

    #[test]
    fn test_seed_only_secret_accepted() {
        let seed = [7u8; 32];
        let credential = Credential::from_secret_bytes(&seed, Some("agent-7".into())).unwrap();
        assert_eq!(credential.key_id(), "agent-7");
    }

    #[test]
    fn test_wrong_length_rejected() {
        let err = Credential::from_secret_bytes(&[1u8; 31], None).unwrap_err();
        assert!(matches!(err, AuthError::CredentialInvalid { .. }));
    }

    #[test]
    fn test_mismatched_public_half_rejected() {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&[3u8; 32]);
        bytes[32..].copy_from_slice(&[9u8; 32]);

        let err = Credential::from_secret_bytes(&bytes, None).unwrap_err();
        assert!(matches!(err, AuthError::CredentialInvalid { .. }));
    }

    #[test]
    fn test_non_base64_rejected() {
        let err = Credential::from_secret_base64("not base64!!", None).unwrap_err();
        assert!(matches!(err, AuthError::CredentialInvalid { .. }));
    }

    #[test]
    fn test_debug_redacts_key() {
        let credential = Credential::generate();
        let rendered = format!("{credential:?}");
        assert!(rendered.contains("[redacted]"));
    }

    #[test]
    fn test_public_key_base64_round_trip() {
        let credential = Credential::generate();
        let encoded = credential.public_key().to_base64();
        assert_eq!(
            PublicKey::from_base64(&encoded).unwrap(),
            credential.public_key()
        );
    }
}
