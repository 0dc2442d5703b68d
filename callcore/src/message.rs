//! Signaling message wire model.
//!
//! Messages travel as JSON records:
//!
//! ```text
//! { "type": "offer", "senderId": "alice", "targetId": "bob",
//!   "callId": "5F0E9B2C...", "timestamp": "2026-10-19T12:00:00Z",
//!   "payload": { "sdp": "v=0..." } }
//! ```
//!
//! The payload is a flat record of optional fields; which ones must be present
//! depends on the type. Accessors such as
//! [`SignalingMessage::session_description`] check that. The call id is set
//! by the caller and echoed by both sides for the life of the call.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::signaling::SignalingType;
use crate::types::{CallId, CallKind, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("malformed signaling message: {0}")]
    Malformed(String),

    #[error("{kind} message is missing field `{field}`")]
    MissingField {
        kind: SignalingType,
        field: &'static str,
    },
}

impl From<serde_json::Error> for MessageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

/// Offer or answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offer => f.write_str("offer"),
            Self::Answer => f.write_str("answer"),
        }
    }
}

/// A session description exchanged during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate. Field names follow `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_kind: Option<CallKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: SignalingType,
    pub sender_id: UserId,
    pub target_id: UserId,
    #[serde(default)]
    pub call_id: CallId,
    /// Advisory only. Never used for ordering.
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub payload: Payload,
}

impl SignalingMessage {
    pub fn new(kind: SignalingType, sender_id: UserId, target_id: UserId) -> Self {
        Self {
            kind,
            sender_id,
            target_id,
            call_id: CallId::default(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            payload: Payload::default(),
        }
    }

    pub fn call_request(from: &UserId, to: &UserId, call_kind: CallKind) -> Self {
        let mut msg = Self::new(SignalingType::CallRequest, from.clone(), to.clone());
        msg.payload.call_kind = Some(call_kind);
        msg
    }

    pub fn call_response(from: &UserId, to: &UserId, accepted: bool) -> Self {
        let mut msg = Self::new(SignalingType::CallResponse, from.clone(), to.clone());
        msg.payload.accepted = Some(accepted);
        msg
    }

    /// `offer` or `answer` message, depending on the description type.
    pub fn description(from: &UserId, to: &UserId, desc: &SessionDescription) -> Self {
        let kind = match desc.sdp_type {
            SdpType::Offer => SignalingType::Offer,
            SdpType::Answer => SignalingType::Answer,
        };
        let mut msg = Self::new(kind, from.clone(), to.clone());
        msg.payload.sdp = Some(desc.sdp.clone());
        msg
    }

    pub fn ice_candidate(from: &UserId, to: &UserId, candidate: IceCandidate) -> Self {
        let mut msg = Self::new(SignalingType::IceCandidate, from.clone(), to.clone());
        msg.payload.candidate = Some(candidate);
        msg
    }

    pub fn call_end(from: &UserId, to: &UserId) -> Self {
        Self::new(SignalingType::CallEnd, from.clone(), to.clone())
    }

    /// Tag the message with the call it belongs to.
    pub fn with_call_id(mut self, call_id: &CallId) -> Self {
        self.call_id = call_id.clone();
        self
    }

    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }

    fn missing(&self, field: &'static str) -> MessageError {
        MessageError::MissingField {
            kind: self.kind,
            field,
        }
    }

    pub fn call_kind(&self) -> Result<CallKind, MessageError> {
        self.payload.call_kind.ok_or_else(|| self.missing("callKind"))
    }

    pub fn accepted(&self) -> Result<bool, MessageError> {
        self.payload.accepted.ok_or_else(|| self.missing("accepted"))
    }

    /// The session description carried by an `offer` or `answer`.
    pub fn session_description(&self) -> Result<SessionDescription, MessageError> {
        let sdp_type = match self.kind {
            SignalingType::Offer => SdpType::Offer,
            SignalingType::Answer => SdpType::Answer,
            _ => return Err(self.missing("sdp")),
        };
        let sdp = self
            .payload
            .sdp
            .as_ref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| self.missing("sdp"))?;
        Ok(SessionDescription {
            sdp_type,
            sdp: sdp.clone(),
        })
    }

    pub fn candidate(&self) -> Result<&IceCandidate, MessageError> {
        self.payload
            .candidate
            .as_ref()
            .ok_or_else(|| self.missing("candidate"))
    }

    /// Check that the payload carries every field its type needs.
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.call_id.is_empty() {
            return Err(self.missing("callId"));
        }
        match self.kind {
            SignalingType::CallRequest => self.call_kind().map(|_| ()),
            SignalingType::CallResponse => self.accepted().map(|_| ()),
            SignalingType::Offer | SignalingType::Answer => {
                self.session_description().map(|_| ())
            }
            SignalingType::IceCandidate => self.candidate().map(|_| ()),
            SignalingType::CallEnd => Ok(()),
        }
    }
}
