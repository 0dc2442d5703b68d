//! Call status state machine.
//!
//! This is the pure transition table. It decides which status follows which
//! trigger and nothing else; side effects (media, negotiation, publishing)
//! belong to the runtime session that drives it.

use serde::Serialize;
use std::fmt;

/// Current status of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum CallStatus {
    /// No call in progress.
    #[default]
    Idle,
    /// Local party initiated a call and waits for the remote response.
    Calling,
    /// Remote party initiated a call and waits for a local accept/reject.
    Incoming,
    /// Descriptions exchanged, media flowing.
    Connected,
    /// Terminal. All resources released.
    Ended,
}

impl CallStatus {
    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended)
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Calling | Self::Incoming)
    }

    /// A session in this status holds (or may hold) resources.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Calling | Self::Incoming | Self::Connected)
    }

    /// Apply a transition, returning the next status.
    ///
    /// Terminal triggers applied to `Ended` return `Ended` again: ending is
    /// idempotent. Everything else not listed is an [`InvalidTransition`].
    pub fn apply(self, transition: CallTransition) -> Result<CallStatus, InvalidTransition> {
        use CallTransition as T;

        let next = match (self, transition) {
            (Self::Idle, T::LocalStart) => Self::Calling,
            (Self::Idle, T::RemoteRequest) => Self::Incoming,
            (Self::Incoming, T::LocalAnswer) => Self::Connected,
            (Self::Incoming, T::LocalReject) => Self::Ended,
            (Self::Calling, T::RemoteAccepted) => Self::Connected,
            (Self::Calling, T::RemoteRejected) => Self::Ended,
            (Self::Calling | Self::Incoming, T::TimedOut) => Self::Ended,
            (Self::Calling, T::Superseded) => Self::Ended,
            (Self::Calling | Self::Incoming | Self::Connected, T::RemoteEnded) => Self::Ended,
            (Self::Calling | Self::Incoming | Self::Connected, T::LocalEnded) => Self::Ended,
            // Errors may strike during the very first step, while still Idle.
            (Self::Idle | Self::Calling | Self::Incoming | Self::Connected, T::Failed) => {
                Self::Ended
            }
            (Self::Ended, t) if t.is_terminal() => Self::Ended,
            (current, attempted) => {
                return Err(InvalidTransition {
                    current,
                    attempted,
                });
            }
        };
        Ok(next)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Calling => "Calling",
            Self::Incoming => "Incoming",
            Self::Connected => "Connected",
            Self::Ended => "Ended",
        };
        f.write_str(name)
    }
}

/// Triggers of status transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CallTransition {
    LocalStart,
    RemoteRequest,
    LocalAnswer,
    LocalReject,
    RemoteAccepted,
    RemoteRejected,
    RemoteEnded,
    LocalEnded,
    TimedOut,
    Superseded,
    Failed,
}

impl CallTransition {
    /// Whether this trigger always leads to `Ended`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::LocalReject
                | Self::RemoteRejected
                | Self::RemoteEnded
                | Self::LocalEnded
                | Self::TimedOut
                | Self::Superseded
                | Self::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current: CallStatus,
    pub attempted: CallTransition,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {:?} in state {}",
            self.attempted, self.current
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;
    use CallTransition as T;

    /// Flow: Idle → Calling → Connected → Ended
    #[test]
    fn test_outgoing_call_flow() {
        let status = CallStatus::Idle;
        let status = status.apply(T::LocalStart).unwrap();
        assert_eq!(status, CallStatus::Calling);
        assert!(status.is_ringing());

        let status = status.apply(T::RemoteAccepted).unwrap();
        assert_eq!(status, CallStatus::Connected);

        let status = status.apply(T::LocalEnded).unwrap();
        assert!(status.is_ended());
    }

    /// Flow: Idle → Incoming → Connected → Ended
    #[test]
    fn test_incoming_call_flow() {
        let status = CallStatus::Idle.apply(T::RemoteRequest).unwrap();
        assert_eq!(status, CallStatus::Incoming);
        assert!(status.is_ringing());

        let status = status.apply(T::LocalAnswer).unwrap();
        assert_eq!(status, CallStatus::Connected);

        let status = status.apply(T::RemoteEnded).unwrap();
        assert_eq!(status, CallStatus::Ended);
    }

    #[test]
    fn test_rejections() {
        let incoming = CallStatus::Idle.apply(T::RemoteRequest).unwrap();
        assert_eq!(incoming.apply(T::LocalReject).unwrap(), CallStatus::Ended);

        let calling = CallStatus::Idle.apply(T::LocalStart).unwrap();
        assert_eq!(calling.apply(T::RemoteRejected).unwrap(), CallStatus::Ended);
    }

    #[test]
    fn test_end_is_idempotent() {
        for t in [T::LocalEnded, T::RemoteEnded, T::Failed, T::TimedOut] {
            assert_eq!(CallStatus::Ended.apply(t).unwrap(), CallStatus::Ended);
        }
    }

    #[test]
    fn test_ended_rejects_non_terminal_triggers() {
        for t in [T::LocalStart, T::RemoteRequest, T::LocalAnswer, T::RemoteAccepted] {
            let err = CallStatus::Ended.apply(t).unwrap_err();
            assert_eq!(err.current, CallStatus::Ended);
            assert_eq!(err.attempted, t);
        }
    }

    #[test]
    fn test_invalid_transitions() {
        // Can't answer our own outgoing call
        assert!(CallStatus::Calling.apply(T::LocalAnswer).is_err());
        // Remote accept only makes sense while calling
        assert!(CallStatus::Incoming.apply(T::RemoteAccepted).is_err());
        assert!(CallStatus::Connected.apply(T::RemoteAccepted).is_err());
        // Nothing to end while idle
        assert!(CallStatus::Idle.apply(T::LocalEnded).is_err());
        assert!(CallStatus::Idle.apply(T::RemoteEnded).is_err());
        // Ring timeout does not apply once connected
        assert!(CallStatus::Connected.apply(T::TimedOut).is_err());
        // Only an outgoing call can be superseded
        assert!(CallStatus::Incoming.apply(T::Superseded).is_err());
    }

    #[test]
    fn test_failure_ends_from_every_live_state() {
        for s in [
            CallStatus::Idle,
            CallStatus::Calling,
            CallStatus::Incoming,
            CallStatus::Connected,
        ] {
            assert_eq!(s.apply(T::Failed).unwrap(), CallStatus::Ended);
        }
    }

    #[test]
    fn test_display() {
        let err = CallStatus::Ended.apply(T::LocalAnswer).unwrap_err();
        assert_eq!(err.to_string(), "invalid transition LocalAnswer in state Ended");
    }
}
