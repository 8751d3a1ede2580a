//! Call-related error types.

use thiserror::Error;

pub use crate::calls::session::InvalidTransition;

#[derive(Debug, Error)]
pub enum CallError {
    /// A new call intent arrived while another call is in flight.
    /// Rejected without touching the existing session.
    #[error("a call is already in progress")]
    CallInProgress,

    /// The intent is not valid for the session's current phase (or the
    /// session no longer exists). Rejected, no state change.
    #[error("intent not valid for current call state: {0}")]
    InvalidCallState(String),

    /// A peer-transport operation failed. Forces the session to
    /// `Ended(Failed)`.
    #[error("negotiation error: {0}")]
    NegotiationError(String),

    /// Signaling could not be delivered within the bounded window.
    #[error("signaling transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Camera/microphone acquisition failed.
    #[error("media device unavailable: {0}")]
    DeviceUnavailable(String),
}

impl From<InvalidTransition> for CallError {
    fn from(t: InvalidTransition) -> Self {
        Self::InvalidCallState(t.to_string())
    }
}
