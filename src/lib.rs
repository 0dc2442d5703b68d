// Platform-free vocabulary lives in callcore
pub use callcore::{
    CallDirection, CallId, CallKind, CallStatus, CallTransition, EndReason, IceCandidate,
    InvalidTransition, MessageError, SdpType, SessionDescription, SignalingMessage,
    SignalingType, TrackKind, UserId, UserProfile, topic_for,
};

pub mod calls;
pub mod config;

pub use calls::{CallBackends, CallError, CallManager, CallNotification, CallSnapshot};
pub use config::{CallConfig, ConfigError, IceServer};
