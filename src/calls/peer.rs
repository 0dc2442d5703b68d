//! Peer connection negotiation.
//!
//! The platform peer connection sits behind [`PeerConnection`]. A
//! [`PeerConnectionFactory`] builds one per call from the configured
//! STUN/relay servers and hands back a receiver of [`PeerEvent`]s: trickled
//! local candidates, remote tracks and asynchronous failures.
//!
//! [`PeerConnectionManager`] owns the connection for one session. It opens it
//! lazily, so a call that is rejected before answering never builds one, and
//! forwards backend events to the session's event loop tagged with the
//! session generation.

use async_trait::async_trait;
use callcore::{IceCandidate, SdpType, SessionDescription};
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::error::NegotiationError;
use super::media::MediaTrack;
use crate::config::IceServer;

/// Event raised by a peer connection backend.
pub enum PeerEvent {
    /// ICE gathering produced a candidate that must reach the remote party.
    LocalCandidate(IceCandidate),
    /// The remote party's media arrived.
    RemoteTrack(Arc<dyn MediaTrack>),
    /// The connection failed after negotiation, e.g. ICE could not connect.
    Failed(NegotiationError),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::RemoteTrack(t) => f
                .debug_tuple("RemoteTrack")
                .field(&format_args!("{} {}", t.kind(), t.id()))
                .finish(),
            Self::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
        }
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Create an answer to the applied remote offer and install it as the
    /// local description.
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_remote_description(&self, desc: &SessionDescription)
    -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError>;

    async fn add_local_tracks(&self, tracks: &[Arc<dyn MediaTrack>])
    -> Result<(), NegotiationError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), NegotiationError>;
}

/// A peer event tagged with the session that produced it.
#[derive(Debug)]
pub struct SessionPeerEvent {
    pub session: u64,
    pub event: PeerEvent,
}

/// Forwards backend events into the owning event loop.
#[derive(Clone)]
pub struct PeerEventSink {
    session: u64,
    tx: mpsc::UnboundedSender<SessionPeerEvent>,
}

impl PeerEventSink {
    pub fn new(session: u64, tx: mpsc::UnboundedSender<SessionPeerEvent>) -> Self {
        Self { session, tx }
    }

    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send(SessionPeerEvent {
                session: self.session,
                event,
            })
            .is_ok()
    }
}

/// Negotiation state of a single peer connection.
pub struct PeerConnectionManager {
    factory: Arc<dyn PeerConnectionFactory>,
    ice_servers: Vec<IceServer>,
    sink: PeerEventSink,
    connection: Option<Arc<dyn PeerConnection>>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    closed: bool,
}

impl PeerConnectionManager {
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        ice_servers: Vec<IceServer>,
        sink: PeerEventSink,
    ) -> Self {
        Self {
            factory,
            ice_servers,
            sink,
            connection: None,
            local_description: None,
            remote_description: None,
            closed: false,
        }
    }

    async fn connection(&mut self) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        if self.closed {
            return Err(NegotiationError::Closed);
        }
        if let Some(conn) = &self.connection {
            return Ok(conn.clone());
        }

        let (conn, mut events) = self.factory.create(&self.ice_servers).await?;
        info!(
            target: "Call/Peer",
            "Opened peer connection with {} ice server(s)",
            self.ice_servers.len()
        );

        let sink = self.sink.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !sink.emit(event) {
                    break;
                }
            }
        });

        self.connection = Some(conn.clone());
        Ok(conn)
    }

    pub async fn add_local_tracks(
        &mut self,
        tracks: &[Arc<dyn MediaTrack>],
    ) -> Result<(), NegotiationError> {
        let conn = self.connection().await?;
        conn.add_local_tracks(tracks).await?;
        debug!(target: "Call/Peer", "Attached {} local track(s)", tracks.len());
        Ok(())
    }

    pub async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        let conn = self.connection().await?;
        let offer = conn.create_offer().await?;
        debug!(target: "Call/Peer", "Created offer ({} bytes)", offer.sdp.len());
        self.local_description = Some(offer.clone());
        Ok(offer)
    }

    pub async fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError> {
        match &self.remote_description {
            Some(desc) if desc.sdp_type == SdpType::Offer => {}
            _ => {
                return Err(NegotiationError::CreateDescription(
                    "answer",
                    "no remote offer applied".to_string(),
                ));
            }
        }
        let conn = self.connection().await?;
        let answer = conn.create_answer().await?;
        debug!(target: "Call/Peer", "Created answer ({} bytes)", answer.sdp.len());
        self.local_description = Some(answer.clone());
        Ok(answer)
    }

    pub async fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let conn = self.connection().await?;
        conn.set_remote_description(&desc).await?;
        debug!(target: "Call/Peer", "Applied remote {}", desc.sdp_type);
        self.remote_description = Some(desc);
        Ok(())
    }

    /// Apply one remote candidate. The remote description must already be set;
    /// callers buffer candidates until then.
    pub async fn add_ice_candidate(
        &mut self,
        candidate: &IceCandidate,
    ) -> Result<(), NegotiationError> {
        if self.remote_description.is_none() {
            return Err(NegotiationError::Candidate(
                "remote description not set".to_string(),
            ));
        }
        let conn = self.connection().await?;
        conn.add_ice_candidate(candidate).await
    }

    /// Close the connection. Safe to call repeatedly and before opening.
    pub async fn close(&mut self) {
        self.closed = true;
        if let Some(conn) = self.connection.take() {
            conn.close().await;
            info!(target: "Call/Peer", "Closed peer connection");
        }
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description.is_some()
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        if self.connection.is_some() {
            warn!(target: "Call/Peer", "Peer connection dropped without close()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::loopback::LoopbackPeerFactory;

    fn manager(factory: &LoopbackPeerFactory) -> (PeerConnectionManager, mpsc::UnboundedReceiver<SessionPeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pcm = PeerConnectionManager::new(
            Arc::new(factory.clone()),
            IceServer::default_stun(),
            PeerEventSink::new(7, tx),
        );
        (pcm, rx)
    }

    #[tokio::test]
    async fn test_connection_opens_lazily() {
        let factory = LoopbackPeerFactory::new();
        let (mut pcm, _rx) = manager(&factory);
        assert!(!pcm.is_open());
        assert_eq!(factory.probe().connections(), 0);

        pcm.create_offer().await.unwrap();
        assert!(pcm.is_open());
        assert_eq!(factory.probe().connections(), 1);
        assert_eq!(factory.probe().ice_servers_seen(), 2);
        pcm.close().await;
    }

    #[tokio::test]
    async fn test_offer_emits_tagged_local_candidates() {
        let factory = LoopbackPeerFactory::new();
        let (mut pcm, mut rx) = manager(&factory);
        pcm.create_offer().await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.session, 7);
        assert!(matches!(first.event, PeerEvent::LocalCandidate(_)));
        pcm.close().await;
    }

    #[tokio::test]
    async fn test_answer_requires_remote_offer() {
        let factory = LoopbackPeerFactory::new();
        let (mut pcm, _rx) = manager(&factory);
        assert!(matches!(
            pcm.create_answer().await,
            Err(NegotiationError::CreateDescription("answer", _))
        ));

        let offer = SessionDescription::offer(crate::calls::loopback::synthetic_sdp(
            SdpType::Offer,
            callcore::CallKind::Audio,
            "remote",
        ));
        pcm.set_remote_description(offer).await.unwrap();
        let answer = pcm.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        assert_eq!(pcm.local_description(), Some(&answer));
        pcm.close().await;
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_is_refused() {
        let factory = LoopbackPeerFactory::new();
        let (mut pcm, _rx) = manager(&factory);
        let err = pcm
            .add_ice_candidate(&IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 9 typ host"))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::Candidate(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let factory = LoopbackPeerFactory::new();
        let (mut pcm, _rx) = manager(&factory);
        pcm.create_offer().await.unwrap();
        pcm.close().await;
        pcm.close().await;
        assert!(pcm.is_closed());
        assert_eq!(factory.probe().closed(), 1);
        assert_eq!(pcm.create_offer().await, Err(NegotiationError::Closed));
    }
}
