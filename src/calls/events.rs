//! Notifications surfaced to the call trigger (UI).

use callcore::{CallKind, CallStatus, EndReason, TrackKind, UserId, UserProfile};
use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone, PartialEq)]
pub enum CallNotification {
    /// A remote party is ringing us.
    Incoming {
        from: UserId,
        kind: CallKind,
        profile: Option<UserProfile>,
    },
    StatusChanged {
        remote: UserId,
        status: CallStatus,
    },
    RemoteTrack {
        remote: UserId,
        kind: TrackKind,
        track_id: String,
    },
    /// Terminal. Sent exactly once per session.
    Ended {
        remote: UserId,
        reason: EndReason,
        /// Seconds spent connected, if the call ever connected.
        duration_secs: Option<i64>,
    },
}

/// Fan-out of notifications plus the latest status.
#[derive(Clone, Debug)]
pub struct Notifier {
    events: broadcast::Sender<CallNotification>,
    status: watch::Sender<CallStatus>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: broadcast::channel(capacity.max(1)).0,
            status: watch::channel(CallStatus::Idle).0,
        }
    }

    pub fn notify(&self, notification: CallNotification) {
        if let CallNotification::StatusChanged { status, .. } = &notification {
            self.status.send_replace(*status);
        }
        // No subscribers is fine.
        let _ = self.events.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallNotification> {
        self.events.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<CallStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> CallStatus {
        *self.status.borrow()
    }
}
