//! Call signaling type definitions.
//!
//! Six message types carry the whole call protocol. Two of them are control
//! messages (`call-request`, `call-response`) that decide whether a session
//! exists; the rest negotiate or tear down the peer connection.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::UserId;

/// Prefix of the per-user pub/sub topic.
pub const TOPIC_PREFIX: &str = "call:";

/// Topic a user subscribes to in order to receive all call traffic addressed
/// to them.
pub fn topic_for(user_id: &UserId) -> String {
    format!("{TOPIC_PREFIX}{user_id}")
}

/// Signaling message types for call control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingType {
    /// Caller asks the callee to ring. Carries the call kind.
    CallRequest,
    /// Callee accepts or rejects. Carries the `accepted` flag.
    CallResponse,
    /// Caller's session description.
    Offer,
    /// Callee's session description.
    Answer,
    /// One trickled ICE candidate. Either direction.
    IceCandidate,
    /// Either party hangs up.
    CallEnd,
}

impl SignalingType {
    /// Name used on the wire.
    pub const fn wire_name(&self) -> &'static str {
        match self {
            Self::CallRequest => "call-request",
            Self::CallResponse => "call-response",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::CallEnd => "call-end",
        }
    }

    /// Whether this type carries peer connection negotiation data.
    pub const fn is_negotiation(&self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::IceCandidate)
    }

    /// Whether a message of this type may be held for a sender that has no
    /// session yet. Only the caller's SDP and candidates can overtake the
    /// `call-request` that creates the callee's session.
    pub const fn may_precede_session(&self) -> bool {
        matches!(self, Self::Offer | Self::IceCandidate)
    }
}

impl fmt::Display for SignalingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}
