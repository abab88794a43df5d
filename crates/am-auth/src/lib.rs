//! Request authentication for the agent-market client.
//!
//! A [`Credential`] holds an Ed25519 signing key and the key id the
//! marketplace knows it by. A [`Signer`] turns payloads into
//! [`SignedRequest`]s whose signature covers the payload, a millisecond
//! timestamp and a random nonce. The verification side ([`verify`],
//! [`Verifier`], [`ReplayGuard`]) is used by the in-memory marketplace and
//! by tests, and enforces the skew window and nonce uniqueness.

mod credential;
mod error;
mod replay;
mod signer;

pub use credential::{generate_key_pair, Credential, KeyPair, PublicKey};
pub use error::{AuthError, AuthResult};
pub use replay::{ReplayGuard, Verifier, DEFAULT_MAX_SKEW};
pub use signer::{build_canonical_message, verify, Nonce, SignedRequest, Signer};
