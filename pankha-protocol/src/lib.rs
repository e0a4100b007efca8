//! Shared protocol definitions for the Pankha fleet.
//!
//! Both the agent and the hub depend on this crate so that frame shapes,
//! command payloads, curve evaluation, and chip-name derivation can never
//! drift between the two sides of the wire.

pub mod chips;
pub mod commands;
pub mod curves;
pub mod frames;
pub mod types;

/// Current wire timestamp: milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
