//! agent-market API contract types and validation
//!
//! This crate defines the schema types shared by the request client, the
//! event stream engine and the in-memory marketplace used in tests:
//! operations and their payloads, task and event records, stream frames,
//! the response envelope and response status classification.

pub mod error;
pub mod types;
pub mod validation;

pub use error::*;
pub use types::*;
