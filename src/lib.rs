//! Skyhook Tunnel Client
//!
//! Client library for exposing a local HTTP service through a Skyhook
//! relay. The client keeps a persistent control channel to the relay,
//! forwards each proxied request to the local service, and sends the
//! response back, reconnecting with exponential backoff when the channel
//! drops.
//!
//! ```no_run
//! use skyhook_client::{TunnelClient, TunnelConfig, TunnelEvent};
//!
//! # async fn run() -> Result<(), skyhook_client::TunnelError> {
//! let mut session = TunnelClient::new(TunnelConfig::new(3000)).open().await?;
//! println!("public URL: {}", session.url().await);
//!
//! while let Some(event) = session.next_event().await {
//!     if let TunnelEvent::RequestCompleted { method, path, status, duration_ms } = event {
//!         println!("{method} {path} -> {status} ({duration_ms}ms)");
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Presentation concerns (argument parsing, terminal output, signal
//! wiring) belong to the consuming binary; fatal startup failures surface
//! as [`TunnelError`], transient disconnects as [`TunnelEvent`]s.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

mod client;
mod config;
mod error;
pub mod protocol;

pub use client::{
    forward, Backoff, LocalTarget, ReplayBuffer, SessionState, TunnelClient, TunnelEvent,
    TunnelSession, FORWARD_TIMEOUT, REGISTRATION_TIMEOUT,
};
pub use config::{ConfigFile, TunnelConfig, DEFAULT_RELAY_HOST};
pub use error::TunnelError;
pub use protocol::{ForwardedRequest, ForwardedResponse, RequestId};
