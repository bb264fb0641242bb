//! Protocol message types for the relay control channel.
//!
//! Defines the JSON frame format exchanged with the relay:
//! - [`WireMessage`] - The tagged frame union, both directions
//! - [`ForwardedRequest`] / [`ForwardedResponse`] - Decoded request/response
//!   pairs with raw byte bodies
//!
//! Also provides a type-safe request id wrapper.

mod ids;
mod messages;

pub use ids::*;
pub use messages::*;
