//! Session Management Module
//!
//! One tunnel session per manager:
//! - State machine for the session lifecycle
//! - Transport retries with exponential backoff
//! - Heartbeat supervision and automatic reconnection
//! - Status snapshots and a watch channel for transitions

mod manager;
mod reconnect;
pub mod types;

pub use manager::SessionManager;
pub use reconnect::RetryPolicy;
pub use types::{SessionError, SessionState, SessionStatus};
