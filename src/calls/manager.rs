//! Call manager: one event loop per local user.
//!
//! [`CallManager`] is a cheap handle. The work happens in a spawned task that
//! owns the active [`CallSession`] and serializes local commands, inbound
//! signaling, peer events and the ring timer through one `select!`, so no
//! two transitions ever interleave.

use callcore::{CallDirection, CallKind, CallStatus, SignalingMessage, UserId};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use super::channel::SignalingChannel;
use super::error::CallError;
use super::events::{CallNotification, Notifier};
use super::handler::{ActiveCall, EarlyBuffer, Hold, Route, classify};
use super::media::MediaDevices;
use super::peer::{PeerConnectionFactory, PeerEvent, SessionPeerEvent};
use super::profile::ProfileDirectory;
use super::session::{CallEvent, CallSession, SessionContext, bounded};
use crate::config::CallConfig;

const COMMAND_CAPACITY: usize = 32;

/// Collaborators a manager is wired to.
#[derive(Clone)]
pub struct CallBackends {
    pub channel: Arc<dyn SignalingChannel>,
    pub devices: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub profiles: Option<Arc<dyn ProfileDirectory>>,
}

/// Point-in-time view of the active call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub remote: UserId,
    pub kind: CallKind,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub history: Vec<CallStatus>,
    pub muted: bool,
    pub video_enabled: bool,
    pub local_tracks: usize,
    pub remote_tracks: usize,
    pub pending_candidates: usize,
    pub peer_open: bool,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallSnapshot {
    fn of(session: &CallSession) -> Self {
        let media = session.media();
        Self {
            remote: session.remote().clone(),
            kind: session.kind(),
            direction: session.direction(),
            status: session.status(),
            history: session.history().to_vec(),
            muted: media.is_muted(),
            video_enabled: media.is_video_enabled(),
            local_tracks: media.local_tracks().len(),
            remote_tracks: media.remote_tracks().len(),
            pending_candidates: session.pending_candidate_count(),
            peer_open: session.peer().is_open(),
            created_at: session.created_at(),
            connected_at: session.connected_at(),
        }
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Start {
        remote: UserId,
        kind: CallKind,
        reply: Reply<Result<(), CallError>>,
    },
    Answer(Reply<Result<(), CallError>>),
    Reject(Reply<Result<(), CallError>>),
    End(Reply<Result<(), CallError>>),
    SetMuted(bool, Reply<Result<(), CallError>>),
    SetVideoEnabled(bool, Reply<Result<(), CallError>>),
    Snapshot(Reply<Option<CallSnapshot>>),
    Shutdown(Reply<()>),
}

/// Handle to a user's call event loop.
///
/// Dropping every handle shuts the loop down as if [`shutdown`] was called.
///
/// [`shutdown`]: CallManager::shutdown
#[derive(Clone)]
pub struct CallManager {
    local: UserId,
    commands: mpsc::Sender<Command>,
    notifier: Notifier,
}

impl CallManager {
    /// Subscribe to the local user's topic and start the event loop.
    pub async fn connect(
        local: impl Into<UserId>,
        config: &CallConfig,
        backends: CallBackends,
    ) -> Result<Self, CallError> {
        let local = local.into();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        backends.channel.subscribe(&local, inbound_tx).await?;

        let notifier = Notifier::new(config.notification_capacity);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);

        let ctx = SessionContext {
            local: local.clone(),
            channel: backends.channel,
            devices: backends.devices,
            peers: backends.peers,
            ice_servers: config.ice_servers.clone(),
            ring_timeout: config.ring_timeout(),
            operation_timeout: config.operation_timeout(),
            notifier: notifier.clone(),
            peer_events: peer_tx,
        };
        let event_loop = CallLoop {
            ctx,
            profiles: backends.profiles,
            active: None,
            early: EarlyBuffer::new(
                config.early_buffer_limit,
                config.early_buffer_calls,
                config.ring_timeout(),
            ),
            next_id: 0,
        };
        tokio::spawn(event_loop.run(command_rx, inbound_rx, peer_rx));
        info!(target: "Call/Manager", "Call manager for {local} started");

        Ok(Self {
            local,
            commands: command_tx,
            notifier,
        })
    }

    pub fn local_user(&self) -> &UserId {
        &self.local
    }

    /// Ring `remote`. Fails with [`CallError::Busy`] while another call is
    /// active.
    pub async fn start_call(
        &self,
        remote: impl Into<UserId>,
        kind: CallKind,
    ) -> Result<(), CallError> {
        let remote = remote.into();
        self.request(|reply| Command::Start {
            remote,
            kind,
            reply,
        })
        .await?
    }

    pub async fn answer_call(&self) -> Result<(), CallError> {
        self.request(Command::Answer).await?
    }

    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(Command::Reject).await?
    }

    /// Hang up. A no-op when there is no call.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(Command::End).await?
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetMuted(muted, reply)).await?
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetVideoEnabled(enabled, reply))
            .await?
    }

    pub async fn current_call(&self) -> Option<CallSnapshot> {
        self.request(Command::Snapshot).await.ok().flatten()
    }

    /// Status of the most recent session.
    pub fn status(&self) -> CallStatus {
        self.notifier.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<CallStatus> {
        self.notifier.watch_status()
    }

    pub fn notifications(&self) -> broadcast::Receiver<CallNotification> {
        self.notifier.subscribe()
    }

    /// End any active call, unsubscribe and stop the event loop.
    pub async fn shutdown(&self) {
        if self.request(Command::Shutdown).await.is_err() {
            debug!(target: "Call/Manager", "Call manager for {} already stopped", self.local);
        }
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| CallError::Shutdown)?;
        rx.await.map_err(|_| CallError::Shutdown)
    }
}

async fn ring_expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct CallLoop {
    ctx: SessionContext,
    profiles: Option<Arc<dyn ProfileDirectory>>,
    active: Option<CallSession>,
    early: EarlyBuffer,
    next_id: u64,
}

impl CallLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<SignalingMessage>,
        mut peer_events: mpsc::UnboundedReceiver<SessionPeerEvent>,
    ) {
        loop {
            let deadline = self.active.as_ref().and_then(CallSession::ring_deadline);
            tokio::select! {
                // Deliveries already queued are handled before new commands.
                biased;
                Some(msg) = inbound.recv() => self.on_message(msg).await,
                Some(tagged) = peer_events.recv() => self.on_peer_event(tagged).await,
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                _ = ring_expiry(deadline) => {
                    if let Err(e) = self.dispatch(CallEvent::RingTimeout).await {
                        warn!(target: "Call/Manager", "Ring timeout handling failed: {e}");
                    }
                }
            }
        }
        info!(target: "Call/Manager", "Call manager for {} stopped", self.ctx.local);
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Start {
                remote,
                kind,
                reply,
            } => {
                let _ = reply.send(self.start(remote, kind).await);
            }
            Command::Answer(reply) => {
                let _ = reply.send(self.dispatch(CallEvent::Answer).await);
            }
            Command::Reject(reply) => {
                let _ = reply.send(self.dispatch(CallEvent::Reject).await);
            }
            Command::End(reply) => {
                let result = match self.active {
                    Some(_) => self.dispatch(CallEvent::End).await,
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
            Command::SetMuted(muted, reply) => {
                let _ = reply.send(self.dispatch(CallEvent::SetMuted(muted)).await);
            }
            Command::SetVideoEnabled(enabled, reply) => {
                let _ = reply.send(self.dispatch(CallEvent::SetVideoEnabled(enabled)).await);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.active.as_ref().map(CallSnapshot::of));
            }
            Command::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    async fn start(&mut self, remote: UserId, kind: CallKind) -> Result<(), CallError> {
        if remote == self.ctx.local {
            return Err(CallError::SelfCall);
        }
        if let Some(session) = &self.active {
            return Err(CallError::Busy(session.remote().clone()));
        }
        let stale = self.early.discard_from(&remote);
        if stale > 0 {
            debug!(target: "Call/Manager", "Dropped {stale} stale message(s) from {remote}");
        }

        info!(target: "Call/Manager", "Starting {kind} call to {remote}");
        let id = self.next_id();
        self.active = Some(CallSession::outgoing(id, remote, kind, &self.ctx));
        self.dispatch(CallEvent::Start).await
    }

    async fn on_message(&mut self, msg: SignalingMessage) {
        let active = self.active.as_ref().map(|s| ActiveCall {
            remote: s.remote(),
            call_id: s.call_id(),
            status: s.status(),
            direction: s.direction(),
        });
        let route = classify(&self.ctx.local, active, &msg);
        debug!(
            target: "Call/Manager",
            "{} from {} routed to {route:?}",
            msg.kind,
            msg.sender_id
        );

        let result = match route {
            Route::Discard(why) => {
                debug!(target: "Call/Manager", "Discarding {} from {}: {why}", msg.kind, msg.sender_id);
                Ok(())
            }
            Route::Malformed(e) => {
                warn!(target: "Call/Manager", "Discarding malformed message from {}: {e}", msg.sender_id);
                Ok(())
            }
            Route::Session => self.dispatch(CallEvent::Remote(msg)).await,
            Route::NewCall(kind) => self.accept_request(msg, kind).await,
            Route::Busy => {
                info!(target: "Call/Manager", "Busy, turning down call from {}", msg.sender_id);
                self.early.retire(&msg.sender_id, &msg.call_id);
                let busy = SignalingMessage::call_response(&self.ctx.local, &msg.sender_id, false)
                    .with_call_id(&msg.call_id);
                bounded(
                    self.ctx.operation_timeout,
                    "publish",
                    self.ctx.channel.publish(busy),
                )
                .await
            }
            Route::Glare { local_wins: true } => {
                // The remote drops its call for ours; whatever it sent for
                // its own is dead.
                info!(target: "Call/Manager", "Simultaneous call with {}, keeping ours", msg.sender_id);
                self.early.retire(&msg.sender_id, &msg.call_id);
                Ok(())
            }
            Route::Glare { local_wins: false } => self.yield_to(msg).await,
            Route::Early => {
                let (sender, call_id) = (msg.sender_id.clone(), msg.call_id.clone());
                match self.early.push(msg, Instant::now()) {
                    Hold::Held => {}
                    Hold::Full => {
                        warn!(target: "Call/Manager", "Early buffer for call {call_id} from {sender} full, dropping message");
                    }
                    Hold::Retired => {
                        debug!(target: "Call/Manager", "Dropping late message of finished call {call_id} from {sender}");
                    }
                }
                Ok(())
            }
            Route::DropEarly => {
                let dropped = self.early.retire(&msg.sender_id, &msg.call_id);
                debug!(
                    target: "Call/Manager",
                    "{} gave up on call {}, dropped {dropped} early message(s)",
                    msg.sender_id,
                    msg.call_id
                );
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(target: "Call/Manager", "Handling inbound message failed: {e}");
        }
    }

    /// Open an incoming session for a `call-request`, replaying anything that
    /// overtook it.
    async fn accept_request(&mut self, msg: SignalingMessage, kind: CallKind) -> Result<(), CallError> {
        let remote = msg.sender_id.clone();
        let call_id = msg.call_id.clone();
        let id = self.next_id();
        let mut session = CallSession::incoming(id, call_id.clone(), remote.clone(), kind, &self.ctx);
        session.handle(CallEvent::Remote(msg)).await?;

        let early = self.early.take(&remote, &call_id, Instant::now());
        if !early.is_empty() {
            debug!(target: "Call/Manager", "Replaying {} early message(s) from {remote}", early.len());
        }
        for held in early {
            if let Err(e) = session.handle(CallEvent::Remote(held)).await {
                warn!(target: "Call/Manager", "Replaying early message from {remote} failed: {e}");
            }
        }
        self.active = Some(session);

        let profile = match &self.profiles {
            Some(profiles) => profiles.lookup(&remote).await,
            None => None,
        };
        info!(target: "Call/Manager", "Incoming {kind} call from {remote}");
        self.ctx.notifier.notify(CallNotification::Incoming {
            from: remote,
            kind,
            profile,
        });
        Ok(())
    }

    /// Lost the glare tie-break: drop our call and pick up theirs.
    ///
    /// Anything the remote sent for its call ahead of the request is in the
    /// early buffer under its call id and is replayed by `accept_request`.
    async fn yield_to(&mut self, msg: SignalingMessage) -> Result<(), CallError> {
        let kind = msg.call_kind()?;
        info!(target: "Call/Manager", "Simultaneous call with {}, taking theirs", msg.sender_id);
        self.dispatch(CallEvent::Superseded).await?;

        self.accept_request(msg, kind).await?;
        // Both sides asked for this call; no need to ring.
        self.dispatch(CallEvent::Answer).await
    }

    async fn on_peer_event(&mut self, tagged: SessionPeerEvent) {
        match &self.active {
            Some(session) if session.id() == tagged.session => {
                if let Err(e) = self.dispatch(CallEvent::Peer(tagged.event)).await {
                    warn!(target: "Call/Manager", "Peer event handling failed: {e}");
                }
            }
            _ => {
                debug!(target: "Call/Manager", "Ignoring {:?} from ended session {}", tagged.event, tagged.session);
                if let PeerEvent::RemoteTrack(track) = tagged.event {
                    track.stop();
                }
            }
        }
    }

    async fn dispatch(&mut self, event: CallEvent) -> Result<(), CallError> {
        let Some(session) = self.active.as_mut() else {
            return Err(CallError::NoActiveCall);
        };
        let result = session.handle(event).await;
        self.reap();
        result
    }

    /// Drop the active session once it has ended.
    fn reap(&mut self) {
        if let Some(session) = &self.active
            && session.status().is_ended()
        {
            debug!(
                target: "Call/Manager",
                "Session {} (call {}) with {} closed",
                session.id(),
                session.call_id(),
                session.remote()
            );
            let stale = self.early.retire(session.remote(), session.call_id());
            if stale > 0 {
                debug!(target: "Call/Manager", "Dropped {stale} unused early message(s)");
            }
            self.active = None;
        }
    }

    async fn shutdown(&mut self) {
        if self.active.is_some()
            && let Err(e) = self.dispatch(CallEvent::Shutdown).await
        {
            warn!(target: "Call/Manager", "Ending call on shutdown failed: {e}");
        }
        if let Err(e) = self.ctx.channel.unsubscribe(&self.ctx.local).await {
            warn!(target: "Call/Manager", "Unsubscribe failed: {e}");
        }
    }
}
