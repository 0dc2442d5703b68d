//! Routing of inbound signaling messages.
//!
//! [`classify`] decides what the event loop does with each message given the
//! active session, if any. Every message names its call; traffic for a call
//! other than the active one never reaches the session. Offers and candidates
//! that overtake their `call-request` wait in an [`EarlyBuffer`] until the
//! session exists.

use callcore::{
    CallDirection, CallId, CallKind, CallStatus, MessageError, SignalingMessage, SignalingType,
    UserId,
};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// The parts of the active session routing depends on.
#[derive(Debug, Clone, Copy)]
pub struct ActiveCall<'a> {
    pub remote: &'a UserId,
    pub call_id: &'a CallId,
    pub status: CallStatus,
    pub direction: CallDirection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Not for us, or not meaningful in the current state.
    Discard(&'static str),
    /// Missing a required field.
    Malformed(MessageError),
    /// Hand to the active session.
    Session,
    /// Start an incoming session.
    NewCall(CallKind),
    /// A new call arrived while we are in another one.
    Busy,
    /// The remote called us while we were calling them.
    Glare { local_wins: bool },
    /// Hold until a session for this call exists.
    Early,
    /// The sender gave up on a call we never opened.
    DropEarly,
}

/// Glare tie-break: the smaller user id keeps its outgoing call.
pub fn wins_glare(local: &UserId, remote: &UserId) -> bool {
    local < remote
}

pub fn classify(local: &UserId, active: Option<ActiveCall<'_>>, msg: &SignalingMessage) -> Route {
    if &msg.target_id != local {
        return Route::Discard("addressed to another user");
    }
    if &msg.sender_id == local {
        return Route::Discard("sent by ourselves");
    }
    if let Err(e) = msg.validate() {
        return Route::Malformed(e);
    }

    match active {
        Some(call) if call.status.is_live() && call.remote == &msg.sender_id => {
            if &msg.call_id == call.call_id {
                return Route::Session;
            }
            match msg.kind {
                SignalingType::CallRequest
                    if call.status == CallStatus::Calling
                        && call.direction == CallDirection::Outgoing =>
                {
                    Route::Glare {
                        local_wins: wins_glare(local, &msg.sender_id),
                    }
                }
                SignalingType::CallRequest => Route::Busy,
                _ => without_session(msg),
            }
        }
        Some(call) if call.status.is_live() => match msg.kind {
            SignalingType::CallRequest => Route::Busy,
            _ => Route::Discard("no session with sender"),
        },
        _ => match msg.kind {
            SignalingType::CallRequest => match msg.call_kind() {
                Ok(kind) => Route::NewCall(kind),
                Err(e) => Route::Malformed(e),
            },
            _ => without_session(msg),
        },
    }
}

/// Route for a message whose call has no session here.
fn without_session(msg: &SignalingMessage) -> Route {
    match msg.kind {
        kind if kind.may_precede_session() => Route::Early,
        SignalingType::CallEnd => Route::DropEarly,
        _ => Route::Discard("unknown call"),
    }
}

/// Outcome of [`EarlyBuffer::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hold {
    Held,
    /// The call already has `per_call` messages waiting.
    Full,
    /// The call ended or was abandoned; its traffic is dropped.
    Retired,
}

type CallKey = (UserId, CallId);

#[derive(Debug)]
struct HeldCall {
    since: Instant,
    messages: VecDeque<SignalingMessage>,
}

/// Messages received before the session of their call, keyed by sender and
/// call id.
///
/// Bounded three ways: `per_call` messages per call, `max_calls` calls in
/// total (the oldest is evicted first), and `ttl` since the first message of
/// a call arrived. Calls that ended are remembered so their stragglers are
/// refused instead of held.
#[derive(Debug)]
pub struct EarlyBuffer {
    per_call: usize,
    max_calls: usize,
    ttl: Duration,
    held: HashMap<CallKey, HeldCall>,
    retired: VecDeque<CallKey>,
}

impl EarlyBuffer {
    pub fn new(per_call: usize, max_calls: usize, ttl: Duration) -> Self {
        Self {
            per_call,
            max_calls: max_calls.max(1),
            ttl,
            held: HashMap::new(),
            retired: VecDeque::new(),
        }
    }

    pub fn push(&mut self, msg: SignalingMessage, now: Instant) -> Hold {
        self.expire(now);
        let key = (msg.sender_id.clone(), msg.call_id.clone());
        if self.retired.contains(&key) {
            return Hold::Retired;
        }
        if !self.held.contains_key(&key) && self.held.len() >= self.max_calls {
            self.evict_oldest();
        }
        let call = self.held.entry(key).or_insert_with(|| HeldCall {
            since: now,
            messages: VecDeque::new(),
        });
        if call.messages.len() >= self.per_call {
            return Hold::Full;
        }
        call.messages.push_back(msg);
        Hold::Held
    }

    /// Remove and return everything held for one call, oldest first.
    pub fn take(&mut self, sender: &UserId, call_id: &CallId, now: Instant) -> Vec<SignalingMessage> {
        self.expire(now);
        self.held
            .remove(&(sender.clone(), call_id.clone()))
            .map(|call| Vec::from(call.messages))
            .unwrap_or_default()
    }

    /// Drop a call's held messages and refuse any that still arrive.
    pub fn retire(&mut self, sender: &UserId, call_id: &CallId) -> usize {
        let key = (sender.clone(), call_id.clone());
        let dropped = self.held.remove(&key).map_or(0, |call| call.messages.len());
        if !self.retired.contains(&key) {
            if self.retired.len() >= self.max_calls {
                self.retired.pop_front();
            }
            self.retired.push_back(key);
        }
        dropped
    }

    /// Drop everything held from `sender`, whatever the call.
    pub fn discard_from(&mut self, sender: &UserId) -> usize {
        let mut dropped = 0;
        self.held.retain(|(from, _), call| {
            if from == sender {
                dropped += call.messages.len();
                false
            } else {
                true
            }
        });
        dropped
    }

    /// Drop calls whose first held message is older than the ttl.
    pub fn expire(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.held.len();
        self.held
            .retain(|_, call| now.saturating_duration_since(call.since) < ttl);
        before - self.held.len()
    }

    /// Messages held from `sender` across all its calls.
    pub fn held_for(&self, sender: &UserId) -> usize {
        self.held
            .iter()
            .filter(|((from, _), _)| from == sender)
            .map(|(_, call)| call.messages.len())
            .sum()
    }

    /// Number of calls with messages waiting.
    pub fn calls(&self) -> usize {
        self.held.len()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .held
            .iter()
            .min_by_key(|(_, call)| call.since)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.held.remove(&key);
        }
    }
}
