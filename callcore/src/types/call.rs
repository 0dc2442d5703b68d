use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable user identifier supplied by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Caller-generated identifier carried by every message of one call.
///
/// Lets both sides tell a late message of a finished call apart from the
/// next call between the same two users.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id: 16 bytes, upper-case hex.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// What media a call carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    #[default]
    Audio,
    Video,
}

impl CallKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    /// Track kinds captured for this call kind.
    pub fn track_kinds(&self) -> &'static [TrackKind] {
        match self {
            Self::Audio => &[TrackKind::Audio],
            Self::Video => &[TrackKind::Audio, TrackKind::Video],
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Why a call session reached `Ended`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EndReason {
    /// Local party hung up.
    LocalHangup,
    /// Remote party sent `call-end`.
    RemoteHangup,
    /// Local party rejected an incoming call.
    Declined,
    /// Remote party rejected our call.
    Rejected,
    /// Nobody answered within the ring timeout.
    Timeout,
    /// Lost a simultaneous-call tie-break; the remote's call replaced ours.
    Superseded,
    /// The session shut down together with its manager.
    Shutdown,
    /// Media or negotiation failure. Carries the rendered error.
    Failed(String),
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalHangup => f.write_str("local hangup"),
            Self::RemoteHangup => f.write_str("remote hangup"),
            Self::Declined => f.write_str("declined"),
            Self::Rejected => f.write_str("rejected by remote"),
            Self::Timeout => f.write_str("timed out"),
            Self::Superseded => f.write_str("superseded by remote call"),
            Self::Shutdown => f.write_str("shutdown"),
            Self::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// Display data from the profile service. Never used for routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}
