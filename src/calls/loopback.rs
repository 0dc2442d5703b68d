//! In-process media and peer connection backends.
//!
//! Nothing here touches a device or the network. Tracks are flags, session
//! descriptions are synthetic and ICE gathering yields a couple of host
//! candidates. Every backend exposes a probe so tests can check what the
//! call machinery asked of it, and can be told to fail the next operation.

use async_trait::async_trait;
use callcore::{CallKind, IceCandidate, SdpType, SessionDescription, TrackKind};
use log::debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use super::error::{MediaError, NegotiationError};
use super::media::{MediaDevices, MediaTrack};
use super::peer::{PeerConnection, PeerConnectionFactory, PeerEvent};
use crate::config::IceServer;

const EVENT_CAPACITY: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Build a minimal SDP blob with one m-line per track kind of `kind`.
pub fn synthetic_sdp(sdp_type: SdpType, kind: CallKind, label: &str) -> String {
    let mut lines = vec![
        "v=0".to_string(),
        format!("o=- {label} 2 IN IP4 127.0.0.1"),
        format!("s=loopback-{sdp_type}"),
        "t=0 0".to_string(),
    ];
    for (mid, track_kind) in kind.track_kinds().iter().enumerate() {
        let payload = match track_kind {
            TrackKind::Audio => 111,
            TrackKind::Video => 96,
        };
        lines.push(format!("m={track_kind} 9 UDP/TLS/RTP/SAVPF {payload}"));
        lines.push(format!("a=mid:{mid}"));
    }
    lines.join("\r\n") + "\r\n"
}

/// Track kinds announced by the m-lines of an SDP blob.
fn announced_kinds(sdp: &str) -> Vec<TrackKind> {
    sdp.lines()
        .filter_map(|line| {
            if line.starts_with("m=audio") {
                Some(TrackKind::Audio)
            } else if line.starts_with("m=video") {
                Some(TrackKind::Video)
            } else {
                None
            }
        })
        .collect()
}

pub struct LoopbackTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl LoopbackTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }
}

impl MediaTrack for LoopbackTrack {
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

#[derive(Default)]
struct MediaState {
    opened: AtomicUsize,
    tracks: Mutex<Vec<Arc<LoopbackTrack>>>,
    fail_next: Mutex<Option<MediaError>>,
    open_delay: Mutex<Option<Duration>>,
}

/// Capture devices that hand out flag-only tracks.
#[derive(Clone, Default)]
pub struct LoopbackMedia {
    state: Arc<MediaState>,
}

impl LoopbackMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `open` fail with `error`.
    pub fn fail_next_open(&self, error: MediaError) {
        *lock(&self.state.fail_next) = Some(error);
    }

    /// Make every `open` take `delay`, like a pending permission prompt.
    pub fn set_open_delay(&self, delay: Duration) {
        *lock(&self.state.open_delay) = Some(delay);
    }

    pub fn probe(&self) -> MediaProbe {
        MediaProbe {
            state: self.state.clone(),
        }
    }
}

#[async_trait]
impl MediaDevices for LoopbackMedia {
    async fn open(&self, kind: CallKind) -> Result<Vec<Arc<dyn MediaTrack>>, MediaError> {
        let delay = *lock(&self.state.open_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = lock(&self.state.fail_next).take() {
            return Err(error);
        }

        let n = self.state.opened.fetch_add(1, Ordering::SeqCst);
        let tracks: Vec<Arc<LoopbackTrack>> = kind
            .track_kinds()
            .iter()
            .map(|k| Arc::new(LoopbackTrack::new(format!("local-{k}-{n}"), *k)))
            .collect();
        lock(&self.state.tracks).extend(tracks.iter().cloned());
        Ok(tracks
            .into_iter()
            .map(|t| t as Arc<dyn MediaTrack>)
            .collect())
    }
}

/// Read-only view of what a [`LoopbackMedia`] handed out.
#[derive(Clone)]
pub struct MediaProbe {
    state: Arc<MediaState>,
}

impl MediaProbe {
    /// Successful `open` calls.
    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Tracks handed out and not stopped yet.
    pub fn live_tracks(&self) -> usize {
        lock(&self.state.tracks)
            .iter()
            .filter(|t| !t.is_stopped())
            .count()
    }

    pub fn tracks(&self) -> Vec<Arc<LoopbackTrack>> {
        lock(&self.state.tracks).clone()
    }
}

#[derive(Default)]
struct PeerState {
    connections: AtomicUsize,
    ice_servers_seen: AtomicUsize,
    offers: AtomicUsize,
    answers: AtomicUsize,
    closed: AtomicUsize,
    local_tracks: AtomicUsize,
    remote_descriptions: Mutex<Vec<SessionDescription>>,
    applied_candidates: Mutex<Vec<IceCandidate>>,
    fail_remote_description: Mutex<Option<NegotiationError>>,
    fail_create: Mutex<Option<NegotiationError>>,
    suppress_candidates: AtomicBool,
    connections_live: Mutex<Vec<Arc<LoopbackPeer>>>,
}

/// Factory of in-process peer connections.
#[derive(Clone, Default)]
pub struct LoopbackPeerFactory {
    state: Arc<PeerState>,
}

impl LoopbackPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `set_remote_description` fail with `error`.
    pub fn fail_next_remote_description(&self, error: NegotiationError) {
        *lock(&self.state.fail_remote_description) = Some(error);
    }

    /// Make the next `create_offer`/`create_answer` fail with `error`.
    pub fn fail_next_create(&self, error: NegotiationError) {
        *lock(&self.state.fail_create) = Some(error);
    }

    /// Stop emitting local candidates after each description.
    pub fn suppress_local_candidates(&self) {
        self.state.suppress_candidates.store(true, Ordering::SeqCst);
    }

    /// Push an asynchronous failure into every open connection.
    pub async fn fail_connections(&self, error: NegotiationError) {
        let peers = lock(&self.state.connections_live).clone();
        for peer in peers {
            let _ = peer.events.send(PeerEvent::Failed(error.clone())).await;
        }
    }

    pub fn probe(&self) -> PeerProbe {
        PeerProbe {
            state: self.state.clone(),
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for LoopbackPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), NegotiationError> {
        let n = self.state.connections.fetch_add(1, Ordering::SeqCst);
        self.state
            .ice_servers_seen
            .store(ice_servers.len(), Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let peer = Arc::new(LoopbackPeer {
            label: format!("loopback-{n}"),
            state: self.state.clone(),
            events: tx,
            local_kind: Mutex::new(CallKind::Audio),
            has_remote: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            candidate_seq: AtomicUsize::new(0),
        });
        lock(&self.state.connections_live).push(peer.clone());
        Ok((peer, rx))
    }
}

/// Read-only view of what the call machinery asked of the peer backend.
#[derive(Clone)]
pub struct PeerProbe {
    state: Arc<PeerState>,
}

impl PeerProbe {
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Number of ice servers handed to the most recent connection.
    pub fn ice_servers_seen(&self) -> usize {
        self.state.ice_servers_seen.load(Ordering::SeqCst)
    }

    pub fn offers_created(&self) -> usize {
        self.state.offers.load(Ordering::SeqCst)
    }

    pub fn answers_created(&self) -> usize {
        self.state.answers.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Connections opened and not closed.
    pub fn open_connections(&self) -> usize {
        self.connections() - self.closed()
    }

    pub fn local_tracks_attached(&self) -> usize {
        self.state.local_tracks.load(Ordering::SeqCst)
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        lock(&self.state.remote_descriptions).clone()
    }

    /// Remote candidates applied, in application order, across connections.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state.applied_candidates).clone()
    }
}

pub struct LoopbackPeer {
    label: String,
    state: Arc<PeerState>,
    events: mpsc::Sender<PeerEvent>,
    local_kind: Mutex<CallKind>,
    has_remote: AtomicBool,
    closed: AtomicBool,
    candidate_seq: AtomicUsize,
}

impl LoopbackPeer {
    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(NegotiationError::Closed)
        } else {
            Ok(())
        }
    }

    async fn gather_candidates(&self) {
        if self.state.suppress_candidates.load(Ordering::SeqCst) {
            return;
        }
        for port in [50000u16, 50002] {
            let seq = self.candidate_seq.fetch_add(1, Ordering::SeqCst);
            let candidate = IceCandidate {
                candidate: format!(
                    "candidate:{seq} 1 udp 2122260223 127.0.0.1 {} typ host",
                    port + seq as u16
                ),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
                username_fragment: Some(self.label.clone()),
            };
            if self
                .events
                .send(PeerEvent::LocalCandidate(candidate))
                .await
                .is_err()
            {
                return;
            }
        }
    }

    fn take_create_failure(&self) -> Result<(), NegotiationError> {
        match lock(&self.state.fail_create).take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        self.take_create_failure()?;
        self.state.offers.fetch_add(1, Ordering::SeqCst);
        let kind = *lock(&self.local_kind);
        let offer = SessionDescription::offer(synthetic_sdp(SdpType::Offer, kind, &self.label));
        self.gather_candidates().await;
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        if !self.has_remote.load(Ordering::SeqCst) {
            return Err(NegotiationError::CreateDescription(
                "answer",
                "no remote offer".to_string(),
            ));
        }
        self.take_create_failure()?;
        self.state.answers.fetch_add(1, Ordering::SeqCst);
        let kind = *lock(&self.local_kind);
        let answer = SessionDescription::answer(synthetic_sdp(SdpType::Answer, kind, &self.label));
        self.gather_candidates().await;
        Ok(answer)
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        if let Some(error) = lock(&self.state.fail_remote_description).take() {
            return Err(error);
        }
        let kinds = announced_kinds(&desc.sdp);
        if kinds.is_empty() {
            return Err(NegotiationError::RemoteDescription(
                "no media sections".to_string(),
            ));
        }
        lock(&self.state.remote_descriptions).push(desc.clone());
        self.has_remote.store(true, Ordering::SeqCst);

        for kind in kinds {
            let track = Arc::new(LoopbackTrack::new(
                format!("remote-{kind}-{}", self.label),
                kind,
            ));
            if self.events.send(PeerEvent::RemoteTrack(track)).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        if !candidate.candidate.starts_with("candidate:") {
            return Err(NegotiationError::Candidate(candidate.candidate.clone()));
        }
        lock(&self.state.applied_candidates).push(candidate.clone());
        Ok(())
    }

    async fn add_local_tracks(
        &self,
        tracks: &[Arc<dyn MediaTrack>],
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        if tracks.iter().any(|t| t.kind() == TrackKind::Video) {
            *lock(&self.local_kind) = CallKind::Video;
        }
        self.state
            .local_tracks
            .fetch_add(tracks.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.closed.fetch_add(1, Ordering::SeqCst);
            lock(&self.state.connections_live).retain(|p| p.label != self.label);
            debug!(target: "Call/Peer", "Loopback connection {} closed", self.label);
        }
    }
}
