//! One call attempt between the local user and one remote party.
//!
//! A [`CallSession`] is driven by [`CallEvent`]s. [`CallSession::handle`]
//! dispatches to exactly one function per [`CallStatus`], so every
//! (status, event) pair is decided in one place. Transitions go through
//! [`CallStatus::apply`], which rejects anything outside the table.
//!
//! The session owns its [`PeerConnectionManager`] and [`MediaController`];
//! every path into `Ended` releases media and closes the connection before
//! the status changes.

use callcore::{
    CallDirection, CallId, CallKind, CallStatus, CallTransition, EndReason, IceCandidate,
    InvalidTransition, SessionDescription, SignalingMessage, SignalingType, UserId,
};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::channel::SignalingChannel;
use super::error::CallError;
use super::events::{CallNotification, Notifier};
use super::media::{MediaController, MediaDevices};
use super::peer::{
    PeerConnectionFactory, PeerConnectionManager, PeerEvent, PeerEventSink, SessionPeerEvent,
};
use crate::config::IceServer;

/// Input to a call session.
#[derive(Debug)]
pub enum CallEvent {
    /// Local `startCall`. Only valid on a fresh outgoing session.
    Start,
    Answer,
    Reject,
    End,
    SetMuted(bool),
    SetVideoEnabled(bool),
    Remote(SignalingMessage),
    Peer(PeerEvent),
    RingTimeout,
    /// The remote called us at the same time and won the tie-break.
    Superseded,
    Shutdown,
}

/// Everything a session needs from its owner.
#[derive(Clone)]
pub struct SessionContext {
    pub local: UserId,
    pub channel: Arc<dyn SignalingChannel>,
    pub devices: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub ice_servers: Vec<IceServer>,
    pub ring_timeout: Duration,
    pub operation_timeout: Duration,
    pub notifier: Notifier,
    pub peer_events: mpsc::UnboundedSender<SessionPeerEvent>,
}

/// Run one suspension point under the operation timeout.
pub(super) async fn bounded<T, E>(
    limit: Duration,
    step: &'static str,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, CallError>
where
    CallError: From<E>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(CallError::from),
        Err(_) => Err(CallError::Timeout(step)),
    }
}

pub struct CallSession {
    id: u64,
    call_id: CallId,
    local: UserId,
    remote: UserId,
    kind: CallKind,
    direction: CallDirection,
    status: CallStatus,
    history: Vec<CallStatus>,
    channel: Arc<dyn SignalingChannel>,
    notifier: Notifier,
    peer: PeerConnectionManager,
    media: MediaController,
    pending_remote_candidates: Vec<IceCandidate>,
    early_offer: Option<SessionDescription>,
    early_answer: Option<SessionDescription>,
    /// Callee answered before the offer arrived.
    answer_pending: bool,
    /// The remote party knows this session exists.
    announced: bool,
    ring_timeout: Duration,
    operation_timeout: Duration,
    ring_deadline: Option<Instant>,
    created_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
    end_reason: Option<EndReason>,
}

impl CallSession {
    /// A call we place. Picks a fresh call id.
    pub fn outgoing(id: u64, remote: UserId, kind: CallKind, ctx: &SessionContext) -> Self {
        Self::new(id, CallId::generate(), remote, kind, CallDirection::Outgoing, ctx)
    }

    /// A call the remote placed, under the id from its `call-request`.
    pub fn incoming(
        id: u64,
        call_id: CallId,
        remote: UserId,
        kind: CallKind,
        ctx: &SessionContext,
    ) -> Self {
        let mut session = Self::new(id, call_id, remote, kind, CallDirection::Incoming, ctx);
        session.announced = true;
        session
    }

    fn new(
        id: u64,
        call_id: CallId,
        remote: UserId,
        kind: CallKind,
        direction: CallDirection,
        ctx: &SessionContext,
    ) -> Self {
        Self {
            id,
            call_id,
            local: ctx.local.clone(),
            remote,
            kind,
            direction,
            status: CallStatus::Idle,
            history: vec![CallStatus::Idle],
            channel: ctx.channel.clone(),
            notifier: ctx.notifier.clone(),
            peer: PeerConnectionManager::new(
                ctx.peers.clone(),
                ctx.ice_servers.clone(),
                PeerEventSink::new(id, ctx.peer_events.clone()),
            ),
            media: MediaController::new(ctx.devices.clone()),
            pending_remote_candidates: Vec::new(),
            early_offer: None,
            early_answer: None,
            answer_pending: false,
            announced: false,
            ring_timeout: ctx.ring_timeout,
            operation_timeout: ctx.operation_timeout,
            ring_deadline: None,
            created_at: Utc::now(),
            connected_at: None,
            end_reason: None,
        }
    }

    /// Feed one event through the state machine.
    ///
    /// A terminal error (media, negotiation, signaling, timeout) ends the
    /// session before it is returned.
    pub async fn handle(&mut self, event: CallEvent) -> Result<(), CallError> {
        let result = match self.status {
            CallStatus::Idle => self.on_idle(event).await,
            CallStatus::Calling => self.on_calling(event).await,
            CallStatus::Incoming => self.on_incoming(event).await,
            CallStatus::Connected => self.on_connected(event).await,
            CallStatus::Ended => self.on_ended(event),
        };

        if let Err(e) = &result
            && e.is_terminal()
            && !self.status.is_ended()
        {
            warn!(target: "Call/Session", "Call with {} failed: {e}", self.remote);
            if self.announced {
                self.send_call_end().await;
            }
            let reason = match e {
                CallError::Timeout(_) => EndReason::Timeout,
                other => EndReason::Failed(other.to_string()),
            };
            self.terminate(CallTransition::Failed, reason).await;
        }
        result
    }

    async fn on_idle(&mut self, event: CallEvent) -> Result<(), CallError> {
        match event {
            CallEvent::Start => {
                self.transition(CallTransition::LocalStart)?;
                self.attach_local_media().await?;
                let offer = bounded(self.operation_timeout, "create offer", self.peer.create_offer())
                    .await?;
                self.publish(SignalingMessage::call_request(&self.local, &self.remote, self.kind))
                    .await?;
                self.announced = true;
                self.publish(SignalingMessage::description(&self.local, &self.remote, &offer))
                    .await
            }
            CallEvent::Remote(msg) if msg.kind == SignalingType::CallRequest => {
                self.transition(CallTransition::RemoteRequest)
            }
            CallEvent::Remote(msg) => {
                self.stash_early(msg)?;
                Ok(())
            }
            CallEvent::Answer => Err(self.invalid(CallTransition::LocalAnswer)),
            CallEvent::Reject => Err(self.invalid(CallTransition::LocalReject)),
            CallEvent::SetMuted(muted) => {
                self.media.set_muted(muted);
                Ok(())
            }
            CallEvent::SetVideoEnabled(enabled) => {
                self.media.set_video_enabled(enabled);
                Ok(())
            }
            CallEvent::End => {
                self.terminate(CallTransition::Failed, EndReason::LocalHangup)
                    .await;
                Ok(())
            }
            CallEvent::Shutdown => {
                self.terminate(CallTransition::Failed, EndReason::Shutdown)
                    .await;
                Ok(())
            }
            other => {
                debug!(target: "Call/Session", "Ignoring {other:?} before the call started");
                Ok(())
            }
        }
    }

    async fn on_calling(&mut self, event: CallEvent) -> Result<(), CallError> {
        match event {
            CallEvent::Remote(msg) => match msg.kind {
                SignalingType::CallResponse => {
                    if msg.accepted()? {
                        self.transition(CallTransition::RemoteAccepted)?;
                        self.connected_at = Some(Utc::now());
                        if let Some(answer) = self.early_answer.take() {
                            self.apply_remote_description(answer).await?;
                        }
                    } else {
                        self.terminate(CallTransition::RemoteRejected, EndReason::Rejected)
                            .await;
                    }
                    Ok(())
                }
                SignalingType::CallEnd => {
                    self.terminate(CallTransition::RemoteEnded, EndReason::RemoteHangup)
                        .await;
                    Ok(())
                }
                _ => self.stash_early(msg),
            },
            CallEvent::End => {
                self.hang_up(EndReason::LocalHangup).await;
                Ok(())
            }
            CallEvent::Shutdown => {
                self.hang_up(EndReason::Shutdown).await;
                Ok(())
            }
            CallEvent::RingTimeout => {
                info!(target: "Call/Session", "{} did not answer in time", self.remote);
                self.send_call_end().await;
                self.terminate(CallTransition::TimedOut, EndReason::Timeout).await;
                Ok(())
            }
            CallEvent::Superseded => {
                self.terminate(CallTransition::Superseded, EndReason::Superseded)
                    .await;
                Ok(())
            }
            other => self.on_common(other).await,
        }
    }

    async fn on_incoming(&mut self, event: CallEvent) -> Result<(), CallError> {
        match event {
            CallEvent::Answer => {
                self.transition(CallTransition::LocalAnswer)?;
                self.connected_at = Some(Utc::now());
                self.attach_local_media().await?;
                match self.early_offer.take() {
                    Some(offer) => {
                        self.apply_remote_description(offer).await?;
                        let answer = bounded(
                            self.operation_timeout,
                            "create answer",
                            self.peer.create_answer(),
                        )
                        .await?;
                        self.publish(SignalingMessage::call_response(
                            &self.local,
                            &self.remote,
                            true,
                        ))
                        .await?;
                        self.publish(SignalingMessage::description(
                            &self.local,
                            &self.remote,
                            &answer,
                        ))
                        .await
                    }
                    None => {
                        debug!(target: "Call/Session", "Answered before the offer arrived");
                        self.answer_pending = true;
                        self.publish(SignalingMessage::call_response(
                            &self.local,
                            &self.remote,
                            true,
                        ))
                        .await
                    }
                }
            }
            CallEvent::Reject => {
                let response = SignalingMessage::call_response(&self.local, &self.remote, false);
                if let Err(e) = self.publish(response).await {
                    warn!(target: "Call/Session", "Failed to send rejection to {}: {e}", self.remote);
                }
                self.terminate(CallTransition::LocalReject, EndReason::Declined)
                    .await;
                Ok(())
            }
            CallEvent::Remote(msg) => match msg.kind {
                SignalingType::CallEnd => {
                    self.terminate(CallTransition::RemoteEnded, EndReason::RemoteHangup)
                        .await;
                    Ok(())
                }
                SignalingType::CallRequest => {
                    debug!(target: "Call/Session", "Duplicate call-request from {}", self.remote);
                    Ok(())
                }
                _ => self.stash_early(msg),
            },
            CallEvent::End => {
                self.hang_up(EndReason::LocalHangup).await;
                Ok(())
            }
            CallEvent::Shutdown => {
                self.hang_up(EndReason::Shutdown).await;
                Ok(())
            }
            CallEvent::RingTimeout => {
                info!(target: "Call/Session", "Call from {} was not answered in time", self.remote);
                self.send_call_end().await;
                self.terminate(CallTransition::TimedOut, EndReason::Timeout).await;
                Ok(())
            }
            other => self.on_common(other).await,
        }
    }

    async fn on_connected(&mut self, event: CallEvent) -> Result<(), CallError> {
        match event {
            CallEvent::Remote(msg) => match msg.kind {
                SignalingType::Offer if !self.peer.has_remote_description() => {
                    let offer = msg.session_description()?;
                    self.apply_remote_description(offer).await?;
                    let answer = bounded(
                        self.operation_timeout,
                        "create answer",
                        self.peer.create_answer(),
                    )
                    .await?;
                    self.answer_pending = false;
                    self.publish(SignalingMessage::description(
                        &self.local,
                        &self.remote,
                        &answer,
                    ))
                    .await
                }
                SignalingType::Answer if !self.peer.has_remote_description() => {
                    let answer = msg.session_description()?;
                    self.apply_remote_description(answer).await
                }
                SignalingType::IceCandidate => {
                    let candidate = msg.candidate()?.clone();
                    if self.peer.has_remote_description() {
                        bounded(
                            self.operation_timeout,
                            "add ice candidate",
                            self.peer.add_ice_candidate(&candidate),
                        )
                        .await
                    } else {
                        self.pending_remote_candidates.push(candidate);
                        Ok(())
                    }
                }
                SignalingType::CallEnd => {
                    self.terminate(CallTransition::RemoteEnded, EndReason::RemoteHangup)
                        .await;
                    Ok(())
                }
                other => {
                    debug!(target: "Call/Session", "Ignoring {other} while connected");
                    Ok(())
                }
            },
            CallEvent::End => {
                self.hang_up(EndReason::LocalHangup).await;
                Ok(())
            }
            CallEvent::Shutdown => {
                self.hang_up(EndReason::Shutdown).await;
                Ok(())
            }
            other => self.on_common(other).await,
        }
    }

    fn on_ended(&mut self, event: CallEvent) -> Result<(), CallError> {
        match event {
            CallEvent::Answer => Err(self.invalid(CallTransition::LocalAnswer)),
            CallEvent::Reject => Err(self.invalid(CallTransition::LocalReject)),
            CallEvent::Peer(PeerEvent::RemoteTrack(track)) => {
                track.stop();
                Ok(())
            }
            other => {
                debug!(target: "Call/Session", "Ignoring {other:?} after the call ended");
                Ok(())
            }
        }
    }

    /// Events handled the same way in every live status.
    async fn on_common(&mut self, event: CallEvent) -> Result<(), CallError> {
        match event {
            CallEvent::SetMuted(muted) => {
                self.media.set_muted(muted);
                Ok(())
            }
            CallEvent::SetVideoEnabled(enabled) => {
                self.media.set_video_enabled(enabled);
                Ok(())
            }
            CallEvent::Peer(PeerEvent::LocalCandidate(candidate)) => {
                self.publish(SignalingMessage::ice_candidate(
                    &self.local,
                    &self.remote,
                    candidate,
                ))
                .await
            }
            CallEvent::Peer(PeerEvent::RemoteTrack(track)) => {
                self.notifier.notify(CallNotification::RemoteTrack {
                    remote: self.remote.clone(),
                    kind: track.kind(),
                    track_id: track.id().to_string(),
                });
                self.media.add_remote_track(track);
                Ok(())
            }
            CallEvent::Peer(PeerEvent::Failed(e)) => Err(e.into()),
            CallEvent::Answer => Err(self.invalid(CallTransition::LocalAnswer)),
            CallEvent::Reject => Err(self.invalid(CallTransition::LocalReject)),
            CallEvent::Start => Err(self.invalid(CallTransition::LocalStart)),
            CallEvent::Superseded => Err(self.invalid(CallTransition::Superseded)),
            other => {
                debug!(target: "Call/Session", "Ignoring {other:?} in {}", self.status);
                Ok(())
            }
        }
    }

    /// Hold SDP and candidates that arrived ahead of the message that makes
    /// them usable.
    fn stash_early(&mut self, msg: SignalingMessage) -> Result<(), CallError> {
        match msg.kind {
            SignalingType::Offer => {
                self.early_offer = Some(msg.session_description()?);
            }
            SignalingType::Answer => {
                self.early_answer = Some(msg.session_description()?);
            }
            SignalingType::IceCandidate => {
                self.pending_remote_candidates.push(msg.candidate()?.clone());
            }
            other => {
                debug!(target: "Call/Session", "Ignoring {other} in {}", self.status);
            }
        }
        Ok(())
    }

    async fn attach_local_media(&mut self) -> Result<(), CallError> {
        let tracks = bounded(
            self.operation_timeout,
            "media acquisition",
            self.media.acquire(self.kind),
        )
        .await?;
        bounded(
            self.operation_timeout,
            "attach local tracks",
            self.peer.add_local_tracks(&tracks),
        )
        .await
    }

    /// Apply the remote description, then every buffered candidate in
    /// arrival order.
    async fn apply_remote_description(&mut self, desc: SessionDescription) -> Result<(), CallError> {
        bounded(
            self.operation_timeout,
            "set remote description",
            self.peer.set_remote_description(desc),
        )
        .await?;

        let pending = std::mem::take(&mut self.pending_remote_candidates);
        if !pending.is_empty() {
            debug!(
                target: "Call/Session",
                "Applying {} buffered candidate(s) from {}",
                pending.len(),
                self.remote
            );
        }
        for candidate in pending {
            bounded(
                self.operation_timeout,
                "add ice candidate",
                self.peer.add_ice_candidate(&candidate),
            )
            .await?;
        }
        Ok(())
    }

    /// Send `message` under this call's id.
    async fn publish(&self, message: SignalingMessage) -> Result<(), CallError> {
        let message = message.with_call_id(&self.call_id);
        let kind = message.kind;
        bounded(self.operation_timeout, "publish", self.channel.publish(message)).await?;
        debug!(target: "Call/Session", "Sent {kind} to {}", self.remote);
        Ok(())
    }

    async fn send_call_end(&self) {
        let end = SignalingMessage::call_end(&self.local, &self.remote);
        if let Err(e) = self.publish(end).await {
            warn!(target: "Call/Session", "Failed to send call-end to {}: {e}", self.remote);
        }
    }

    async fn hang_up(&mut self, reason: EndReason) {
        self.send_call_end().await;
        self.terminate(CallTransition::LocalEnded, reason).await;
    }

    fn invalid(&self, attempted: CallTransition) -> CallError {
        InvalidTransition {
            current: self.status,
            attempted,
        }
        .into()
    }

    fn transition(&mut self, transition: CallTransition) -> Result<(), CallError> {
        let next = self.status.apply(transition)?;
        self.enter(next);
        Ok(())
    }

    fn enter(&mut self, next: CallStatus) {
        if next == self.status {
            return;
        }
        info!(
            target: "Call/Session",
            "Call with {}: {} -> {next}",
            self.remote,
            self.status
        );
        self.status = next;
        self.history.push(next);
        self.ring_deadline = next
            .is_ringing()
            .then(|| Instant::now() + self.ring_timeout);
        self.notifier.notify(CallNotification::StatusChanged {
            remote: self.remote.clone(),
            status: next,
        });
    }

    /// Release everything and move to `Ended`. No-op once ended.
    async fn terminate(&mut self, transition: CallTransition, reason: EndReason) {
        if self.status.is_ended() {
            return;
        }
        self.media.release();
        self.peer.close().await;
        self.pending_remote_candidates.clear();
        self.early_offer = None;
        self.early_answer = None;

        let next = match self.status.apply(transition) {
            Ok(next) => next,
            Err(e) => {
                warn!(target: "Call/Session", "{e}, ending anyway");
                CallStatus::Ended
            }
        };
        self.end_reason = Some(reason.clone());
        self.enter(next);
        info!(target: "Call/Session", "Call with {} ended: {reason}", self.remote);
        self.notifier.notify(CallNotification::Ended {
            remote: self.remote.clone(),
            reason,
            duration_secs: self.duration().map(|d| d.num_seconds()),
        });
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn remote(&self) -> &UserId {
        &self.remote
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    /// Every status this session went through, starting with `Idle`.
    pub fn history(&self) -> &[CallStatus] {
        &self.history
    }

    pub fn ring_deadline(&self) -> Option<Instant> {
        self.ring_deadline
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_remote_candidates.len()
    }

    pub fn media(&self) -> &MediaController {
        &self.media
    }

    pub fn peer(&self) -> &PeerConnectionManager {
        &self.peer
    }

    pub fn end_reason(&self) -> Option<&EndReason> {
        self.end_reason.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    /// Time spent connected, up to now or to the end of the call.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.connected_at.map(|at| Utc::now() - at)
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        if self.status.is_live() {
            warn!(
                target: "Call/Session",
                "Session with {} dropped in {}",
                self.remote,
                self.status
            );
            self.media.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::channel::InMemoryChannel;
    use crate::calls::error::{MediaError, NegotiationError};
    use crate::calls::loopback::{LoopbackMedia, LoopbackPeerFactory, synthetic_sdp};
    use callcore::SdpType;

    struct Rig {
        hub: InMemoryChannel,
        media: LoopbackMedia,
        peers: LoopbackPeerFactory,
        ctx: SessionContext,
        peer_rx: mpsc::UnboundedReceiver<SessionPeerEvent>,
    }

    fn rig() -> Rig {
        let hub = InMemoryChannel::new();
        let media = LoopbackMedia::new();
        let peers = LoopbackPeerFactory::new();
        let (tx, peer_rx) = mpsc::unbounded_channel();
        let ctx = SessionContext {
            local: UserId::new("bob"),
            channel: Arc::new(hub.clone()),
            devices: Arc::new(media.clone()),
            peers: Arc::new(peers.clone()),
            ice_servers: IceServer::default_stun(),
            ring_timeout: Duration::from_secs(45),
            operation_timeout: Duration::from_secs(30),
            notifier: Notifier::new(32),
            peer_events: tx,
        };
        Rig {
            hub,
            media,
            peers,
            ctx,
            peer_rx,
        }
    }

    fn alice() -> UserId {
        UserId::new("alice")
    }

    fn bob() -> UserId {
        UserId::new("bob")
    }

    fn remote_offer(kind: CallKind) -> SignalingMessage {
        let offer = SessionDescription::offer(synthetic_sdp(SdpType::Offer, kind, "alice"));
        SignalingMessage::description(&alice(), &bob(), &offer)
    }

    fn remote_candidate(n: u32) -> SignalingMessage {
        SignalingMessage::ice_candidate(
            &alice(),
            &bob(),
            IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host")),
        )
    }

    async fn incoming(rig: &Rig, kind: CallKind) -> CallSession {
        let mut session = CallSession::incoming(1, CallId::new("A1"), alice(), kind, &rig.ctx);
        session
            .handle(CallEvent::Remote(SignalingMessage::call_request(
                &alice(),
                &bob(),
                kind,
            )))
            .await
            .unwrap();
        session
    }

    /// Feed queued peer events back into the session.
    async fn pump(rig: &mut Rig, session: &mut CallSession) {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        while let Ok(tagged) = rig.peer_rx.try_recv() {
            session.handle(CallEvent::Peer(tagged.event)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_incoming_does_not_acquire_media() {
        let rig = rig();
        let session = incoming(&rig, CallKind::Video).await;
        assert_eq!(session.status(), CallStatus::Incoming);
        assert_eq!(rig.media.probe().opened(), 0);
        assert!(!session.peer().is_open());
        assert!(session.ring_deadline().is_some());
    }

    #[tokio::test]
    async fn test_early_candidates_flush_in_arrival_order() {
        let rig = rig();
        let mut session = incoming(&rig, CallKind::Audio).await;
        for n in [3, 1, 2] {
            session
                .handle(CallEvent::Remote(remote_candidate(n)))
                .await
                .unwrap();
        }
        session
            .handle(CallEvent::Remote(remote_offer(CallKind::Audio)))
            .await
            .unwrap();
        assert_eq!(session.pending_candidate_count(), 3);

        session.handle(CallEvent::Answer).await.unwrap();
        assert_eq!(session.status(), CallStatus::Connected);
        assert_eq!(session.pending_candidate_count(), 0);

        let applied: Vec<_> = rig
            .peers
            .probe()
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied.len(), 3);
        assert!(applied[0].starts_with("candidate:3"));
        assert!(applied[1].starts_with("candidate:1"));
        assert!(applied[2].starts_with("candidate:2"));
    }

    #[tokio::test]
    async fn test_answer_publishes_response_then_answer() {
        let rig = rig();
        let mut session = incoming(&rig, CallKind::Audio).await;
        session
            .handle(CallEvent::Remote(remote_offer(CallKind::Audio)))
            .await
            .unwrap();
        session.handle(CallEvent::Answer).await.unwrap();

        let kinds: Vec<_> = rig.hub.published().await.iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![SignalingType::CallResponse, SignalingType::Answer]);
        assert_eq!(session.media().local_tracks().len(), 1);
    }

    #[tokio::test]
    async fn test_answer_before_offer_defers_answer_sdp() {
        let rig = rig();
        let mut session = incoming(&rig, CallKind::Audio).await;
        session.handle(CallEvent::Answer).await.unwrap();
        assert_eq!(session.status(), CallStatus::Connected);
        assert_eq!(rig.peers.probe().answers_created(), 0);

        session
            .handle(CallEvent::Remote(remote_candidate(1)))
            .await
            .unwrap();
        assert_eq!(session.pending_candidate_count(), 1);

        session
            .handle(CallEvent::Remote(remote_offer(CallKind::Audio)))
            .await
            .unwrap();
        assert_eq!(rig.peers.probe().answers_created(), 1);
        assert_eq!(rig.peers.probe().applied_candidates().len(), 1);

        let kinds: Vec<_> = rig.hub.published().await.iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![SignalingType::CallResponse, SignalingType::Answer]);
    }

    #[tokio::test]
    async fn test_reject_never_acquires_media() {
        let rig = rig();
        let mut session = incoming(&rig, CallKind::Video).await;
        session
            .handle(CallEvent::Remote(remote_offer(CallKind::Video)))
            .await
            .unwrap();
        session.handle(CallEvent::Reject).await.unwrap();

        assert_eq!(session.status(), CallStatus::Ended);
        assert_eq!(session.end_reason(), Some(&EndReason::Declined));
        assert_eq!(rig.media.probe().opened(), 0);
        assert_eq!(rig.peers.probe().connections(), 0);
        assert_eq!(
            session.history(),
            &[CallStatus::Idle, CallStatus::Incoming, CallStatus::Ended]
        );

        let published = rig.hub.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].accepted(), Ok(false));
    }

    #[tokio::test]
    async fn test_outgoing_start_publishes_request_then_offer() {
        let rig = rig();
        let mut session = CallSession::outgoing(1, alice(), CallKind::Video, &rig.ctx);
        session.handle(CallEvent::Start).await.unwrap();

        assert_eq!(session.status(), CallStatus::Calling);
        let published = rig.hub.published().await;
        assert_eq!(published[0].kind, SignalingType::CallRequest);
        assert_eq!(published[0].call_kind(), Ok(CallKind::Video));
        assert_eq!(published[1].kind, SignalingType::Offer);
        assert_eq!(rig.media.probe().live_tracks(), 2);
    }

    #[tokio::test]
    async fn test_answer_before_call_response_is_buffered() {
        let rig = rig();
        let mut session = CallSession::outgoing(1, alice(), CallKind::Audio, &rig.ctx);
        session.handle(CallEvent::Start).await.unwrap();

        let answer = SessionDescription::answer(synthetic_sdp(SdpType::Answer, CallKind::Audio, "a"));
        session
            .handle(CallEvent::Remote(SignalingMessage::description(
                &alice(),
                &bob(),
                &answer,
            )))
            .await
            .unwrap();
        session
            .handle(CallEvent::Remote(remote_candidate(1)))
            .await
            .unwrap();
        assert!(rig.peers.probe().remote_descriptions().is_empty());

        session
            .handle(CallEvent::Remote(SignalingMessage::call_response(
                &alice(),
                &bob(),
                true,
            )))
            .await
            .unwrap();
        assert_eq!(session.status(), CallStatus::Connected);
        assert_eq!(rig.peers.probe().remote_descriptions(), vec![answer]);
        assert_eq!(rig.peers.probe().applied_candidates().len(), 1);
    }

    #[tokio::test]
    async fn test_remote_rejection_releases_media() {
        let rig = rig();
        let mut session = CallSession::outgoing(1, alice(), CallKind::Audio, &rig.ctx);
        session.handle(CallEvent::Start).await.unwrap();
        session
            .handle(CallEvent::Remote(SignalingMessage::call_response(
                &alice(),
                &bob(),
                false,
            )))
            .await
            .unwrap();
        assert_eq!(session.status(), CallStatus::Ended);
        assert_eq!(session.end_reason(), Some(&EndReason::Rejected));
        assert_eq!(rig.media.probe().live_tracks(), 0);
        assert_eq!(rig.peers.probe().open_connections(), 0);
    }

    #[tokio::test]
    async fn test_mute_never_renegotiates() {
        let mut rig = rig();
        let mut session = incoming(&rig, CallKind::Video).await;
        session
            .handle(CallEvent::Remote(remote_offer(CallKind::Video)))
            .await
            .unwrap();
        session.handle(CallEvent::Answer).await.unwrap();
        pump(&mut rig, &mut session).await;
        let offers = rig.peers.probe().offers_created();
        let answers = rig.peers.probe().answers_created();

        session.handle(CallEvent::SetMuted(true)).await.unwrap();
        session.handle(CallEvent::SetVideoEnabled(false)).await.unwrap();
        session.handle(CallEvent::SetMuted(false)).await.unwrap();

        assert_eq!(rig.peers.probe().offers_created(), offers);
        assert_eq!(rig.peers.probe().answers_created(), answers);
        assert!(!session.media().is_video_enabled());
        assert!(!session.media().is_muted());
        assert_eq!(session.media().remote_tracks().len(), 2);
    }

    #[tokio::test]
    async fn test_end_twice_is_a_no_op() {
        let rig = rig();
        let mut session = CallSession::outgoing(1, alice(), CallKind::Audio, &rig.ctx);
        let mut notes = rig.ctx.notifier.subscribe();
        session.handle(CallEvent::Start).await.unwrap();
        session.handle(CallEvent::End).await.unwrap();
        session.handle(CallEvent::End).await.unwrap();
        session
            .handle(CallEvent::Remote(SignalingMessage::call_end(&alice(), &bob())))
            .await
            .unwrap();

        let ends = rig
            .hub
            .published()
            .await
            .iter()
            .filter(|m| m.kind == SignalingType::CallEnd)
            .count();
        assert_eq!(ends, 1);

        let mut ended = 0;
        while let Ok(note) = notes.try_recv() {
            if matches!(note, CallNotification::Ended { .. }) {
                ended += 1;
            }
        }
        assert_eq!(ended, 1);
        assert_eq!(rig.media.probe().live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_media_failure_ends_session() {
        let rig = rig();
        rig.media
            .fail_next_open(MediaError::PermissionDenied("microphone".into()));
        let mut session = incoming(&rig, CallKind::Audio).await;
        let err = session.handle(CallEvent::Answer).await.unwrap_err();

        assert!(matches!(err, CallError::Media(MediaError::PermissionDenied(_))));
        assert_eq!(session.status(), CallStatus::Ended);
        assert!(matches!(session.end_reason(), Some(EndReason::Failed(_))));
        // The caller is told the call is over.
        let last = rig.hub.published().await.pop().unwrap();
        assert_eq!(last.kind, SignalingType::CallEnd);
    }

    #[tokio::test]
    async fn test_rejected_remote_description_closes_peer() {
        let rig = rig();
        rig.peers
            .fail_next_remote_description(NegotiationError::RemoteDescription("bad sdp".into()));
        let mut session = incoming(&rig, CallKind::Audio).await;
        session
            .handle(CallEvent::Remote(remote_offer(CallKind::Audio)))
            .await
            .unwrap();
        let err = session.handle(CallEvent::Answer).await.unwrap_err();

        assert!(matches!(err, CallError::Negotiation(_)));
        assert_eq!(session.status(), CallStatus::Ended);
        assert_eq!(rig.peers.probe().open_connections(), 0);
        assert_eq!(rig.media.probe().live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_answer_outside_incoming_is_invalid() {
        let rig = rig();
        let mut session = CallSession::outgoing(1, alice(), CallKind::Audio, &rig.ctx);
        session.handle(CallEvent::Start).await.unwrap();
        let err = session.handle(CallEvent::Answer).await.unwrap_err();
        assert!(matches!(err, CallError::InvalidTransition(_)));
        assert_eq!(session.status(), CallStatus::Calling);
    }

    #[tokio::test]
    async fn test_published_messages_carry_call_id() {
        let rig = rig();
        let mut outgoing = CallSession::outgoing(1, alice(), CallKind::Audio, &rig.ctx);
        outgoing.handle(CallEvent::Start).await.unwrap();
        outgoing.handle(CallEvent::End).await.unwrap();
        assert!(!outgoing.call_id().is_empty());

        let mut incoming = incoming(&rig, CallKind::Audio).await;
        incoming.handle(CallEvent::Reject).await.unwrap();

        let published = rig.hub.published().await;
        let (ours, theirs): (Vec<_>, Vec<_>) = published
            .iter()
            .partition(|m| m.kind != SignalingType::CallResponse);
        assert!(ours.iter().all(|m| &m.call_id == outgoing.call_id()));
        assert_eq!(theirs.len(), 1);
        assert_eq!(theirs[0].call_id, CallId::new("A1"));
    }

    #[tokio::test]
    async fn test_superseded_ends_quietly() {
        let rig = rig();
        let mut session = CallSession::outgoing(1, alice(), CallKind::Audio, &rig.ctx);
        session.handle(CallEvent::Start).await.unwrap();
        session.handle(CallEvent::Superseded).await.unwrap();

        assert_eq!(session.end_reason(), Some(&EndReason::Superseded));
        assert_eq!(rig.media.probe().live_tracks(), 0);
        // Losing the tie-break sends nothing.
        assert!(
            rig.hub
                .published()
                .await
                .iter()
                .all(|m| m.kind != SignalingType::CallEnd)
        );
    }
}
