//! Platform-independent vocabulary of the peer call subsystem: identifiers,
//! the signaling wire model and the call status transition table.

pub mod message;
pub mod signaling;
pub mod state;
pub mod types;

pub use message::{IceCandidate, MessageError, Payload, SdpType, SessionDescription, SignalingMessage};
pub use signaling::{SignalingType, topic_for};
pub use state::{CallStatus, CallTransition, InvalidTransition};
pub use types::{CallDirection, CallId, CallKind, EndReason, TrackKind, UserId, UserProfile};
