//! Call-related error types.

use callcore::{InvalidTransition, MessageError, UserId};
use thiserror::Error;

/// Failures of local media capture.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission to capture {0} denied")]
    PermissionDenied(String),

    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Failures while negotiating the peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("failed to create {0}: {1}")]
    CreateDescription(&'static str, String),

    #[error("remote description rejected: {0}")]
    RemoteDescription(String),

    #[error("ice candidate rejected: {0}")]
    Candidate(String),

    #[error("failed to attach local tracks: {0}")]
    Tracks(String),

    #[error("ice connection failed: {0}")]
    IceFailed(String),

    #[error("peer connection closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("already subscribed to {0}")]
    AlreadySubscribed(String),

    #[error("signaling channel unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("no active call")]
    NoActiveCall,

    #[error("already in a call with {0}")]
    Busy(UserId),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("cannot call yourself")]
    SelfCall,

    #[error("call manager shut down")]
    Shutdown,
}

impl CallError {
    /// Whether this error ends the session it occurred in.
    ///
    /// Rejected local actions (busy, wrong state, no call) leave the session
    /// untouched.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Media(_) | Self::Negotiation(_) | Self::Signaling(_) | Self::Timeout(_)
        )
    }
}
