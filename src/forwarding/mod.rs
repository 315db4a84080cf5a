//! Port Forwarding Module
//!
//! The local SOCKS5 front: accepts client connections and carries each
//! CONNECT request over one tunnel channel.

mod dynamic;
pub mod socks5;

pub use dynamic::{start_dynamic_forward, DynamicForwardHandle, ForwardStats, ListenError};
pub use socks5::{Destination, Socks5Error};
