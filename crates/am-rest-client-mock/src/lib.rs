//! Test doubles for the agent-market client
//!
//! [`MockMarketplace`] is a small in-memory server implementing both the
//! request transport and the stream connector. [`ScriptedConnector`] plays
//! back a [`am_test_scenarios::Scenario`] for precise control over frame
//! ordering, drops and silences.

mod market;
mod scripted;

pub use market::{InjectedFailure, MockMarketplace};
pub use scripted::ScriptedConnector;
