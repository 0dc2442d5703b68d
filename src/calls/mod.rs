//! Peer-to-peer audio/video calls.
//!
//! # Architecture
//!
//! - [`SignalingChannel`]: per-user pub/sub topic carrying signaling messages
//! - [`PeerConnectionManager`]: offer/answer/ICE negotiation of one connection
//! - [`MediaController`]: local and remote tracks of one call
//! - [`CallSession`]: the state machine tying the three together
//! - [`CallManager`]: per-user event loop and the public entry point
//!
//! # Flow
//!
//! The caller publishes `call-request` then `offer`; the callee rings without
//! touching any device, and on answer publishes `call-response` then
//! `answer`. Both sides trickle `ice-candidate`s. Either side ends the call
//! with `call-end`. Messages may arrive out of order: SDP and candidates
//! that overtake their control message are held until it arrives.

mod channel;
mod error;
mod events;
mod handler;
pub mod loopback;
mod manager;
pub mod media;
mod peer;
mod profile;
mod session;

pub use channel::{InMemoryChannel, MessageSink, SignalingChannel};
pub use error::{CallError, MediaError, NegotiationError, SignalingError};
pub use events::{CallNotification, Notifier};
pub use handler::{EarlyBuffer, Hold, Route, classify, wins_glare};
pub use manager::{CallBackends, CallManager, CallSnapshot};
pub use media::{MediaController, MediaDevices, MediaTrack};
pub use peer::{
    PeerConnection, PeerConnectionFactory, PeerConnectionManager, PeerEvent, PeerEventSink,
    SessionPeerEvent,
};
pub use profile::{ProfileDirectory, StaticProfiles};
pub use session::{CallEvent, CallSession, SessionContext};
