//! Peer connection backend on top of webrtc-rs.
//!
//! Enabled with the `webrtc` cargo feature. Each call gets its own
//! `RTCPeerConnection` configured with the call's STUN/relay servers.
//! Trickled candidates, remote tracks and ICE failure are forwarded as
//! [`PeerEvent`]s.
//!
//! Local tracks are attached as `TrackLocalStaticSample`s (Opus for audio,
//! VP8 for video). Feeding captured samples into them belongs to the capture
//! pipeline behind [`MediaDevices`](super::MediaDevices), not to this module.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use callcore::{IceCandidate, SdpType, SessionDescription, TrackKind};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::MediaTrack;
use crate::calls::error::NegotiationError;
use crate::calls::peer::{PeerConnection, PeerConnectionFactory, PeerEvent};
use crate::config::IceServer;

const EVENT_CAPACITY: usize = 64;
const STREAM_ID: &str = "peer-call";

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn build_api() -> Result<API, webrtc::Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription, webrtc::Error> {
    match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
    }
}

fn to_candidate(candidate: &RTCIceCandidate) -> Option<IceCandidate> {
    let init = candidate.to_json().ok()?;
    Some(IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    })
}

/// A track received from the remote party.
pub struct WebRtcRemoteTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    _track: Arc<TrackRemote>,
}

impl WebRtcRemoteTrack {
    fn new(track: Arc<TrackRemote>) -> Self {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        Self {
            id: track.id(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            _track: track,
        }
    }
}

impl MediaTrack for WebRtcRemoteTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Builds one `RTCPeerConnection` per call.
#[derive(Debug, Clone, Default)]
pub struct WebRtcPeerFactory;

impl WebRtcPeerFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), NegotiationError> {
        let api = build_api()
            .map_err(|e| NegotiationError::CreateDescription("peer connection", e.to_string()))?;
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| NegotiationError::CreateDescription("peer connection", e.to_string()))?,
        );
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);

        let candidates = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidates = candidates.clone();
            Box::pin(async move {
                // `None` marks the end of gathering.
                let Some(candidate) = candidate.as_ref().and_then(to_candidate) else {
                    return;
                };
                let _ = candidates.send(PeerEvent::LocalCandidate(candidate)).await;
            })
        }));

        let tracks = tx.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tracks = tracks.clone();
            Box::pin(async move {
                let remote = Arc::new(WebRtcRemoteTrack::new(track));
                debug!(target: "Call/Peer", "Remote {} track {}", remote.kind(), remote.id());
                let _ = tracks.send(PeerEvent::RemoteTrack(remote)).await;
            })
        }));

        let failures = tx;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let failures = failures.clone();
            Box::pin(async move {
                info!(target: "Call/Peer", "Peer connection state: {state}");
                if state == RTCPeerConnectionState::Failed {
                    let _ = failures
                        .send(PeerEvent::Failed(NegotiationError::IceFailed(
                            "peer connection failed".to_string(),
                        )))
                        .await;
                }
            })
        }));

        Ok((Arc::new(WebRtcPeer { pc }), rx))
    }
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcPeer {
    fn local_sdp(desc: RTCSessionDescription, sdp_type: SdpType) -> SessionDescription {
        SessionDescription {
            sdp_type,
            sdp: desc.sdp,
        }
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let fail = |e: webrtc::Error| NegotiationError::CreateDescription("offer", e.to_string());
        let offer = self.pc.create_offer(None).await.map_err(fail)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(fail)?;
        Ok(Self::local_sdp(offer, SdpType::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let fail = |e: webrtc::Error| NegotiationError::CreateDescription("answer", e.to_string());
        let answer = self.pc.create_answer(None).await.map_err(fail)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(fail)?;
        Ok(Self::local_sdp(answer, SdpType::Answer))
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        let fail = |e: webrtc::Error| NegotiationError::RemoteDescription(e.to_string());
        let desc = to_rtc_description(desc).map_err(fail)?;
        self.pc.set_remote_description(desc).await.map_err(fail)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| NegotiationError::Candidate(e.to_string()))
    }

    async fn add_local_tracks(
        &self,
        tracks: &[Arc<dyn MediaTrack>],
    ) -> Result<(), NegotiationError> {
        for track in tracks {
            let mime_type = match track.kind() {
                TrackKind::Audio => MIME_TYPE_OPUS,
                TrackKind::Video => MIME_TYPE_VP8,
            };
            let local = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_string(),
                    ..Default::default()
                },
                track.id().to_string(),
                STREAM_ID.to_string(),
            ));
            self.pc
                .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| NegotiationError::Tracks(e.to_string()))?;
        }
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(target: "Call/Peer", "Closing peer connection failed: {e}");
        }
    }
}
