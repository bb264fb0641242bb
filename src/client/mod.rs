//! Tunnel client implementation.
//!
//! This module provides the core tunnel functionality:
//! - [`TunnelClient`] - Opens the control channel and drives reconnects
//! - [`TunnelSession`] - Handle exposing the public URL, events, close
//!   and replay
//! - HTTP proxy for forwarding relayed requests to the local service

mod backoff;
mod connection;
mod http_proxy;
mod replay;
mod session;
#[cfg(test)]
pub(crate) mod test_support;

pub use backoff::Backoff;
pub use connection::{TunnelClient, REGISTRATION_TIMEOUT};
pub use http_proxy::{forward, LocalTarget, FORWARD_TIMEOUT};
pub use replay::ReplayBuffer;
pub use session::{SessionState, TunnelEvent, TunnelSession};
