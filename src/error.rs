use thiserror::Error;

/// Failures surfaced to the caller that requested the tunnel.
///
/// Everything here is fatal for the session. Post-registration transport
/// faults are not errors: they feed the reconnect path and reach
/// subscribers as events instead.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The relay refused the tunnel with an `error` frame. Never retried.
    #[error("relay rejected the tunnel: {message}")]
    Rejected { message: String },

    /// Registration did not complete within the startup bound.
    #[error("timed out waiting for tunnel registration")]
    RegistrationTimeout,

    /// Transport failure before the first registration.
    #[error("control channel error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// The relay closed the channel before registration completed.
    #[error("control channel closed by relay")]
    ChannelClosed,

    /// The configured local target cannot be forwarded to.
    #[error("invalid local target: {0}")]
    InvalidTarget(String),
}
