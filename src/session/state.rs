//! Capture session states, outcomes and events

use crate::audio::{EncodedClip, ErrorKind};
use crate::vad::AutoStopReason;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Identifier of one capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell sessions apart in logs
        let id = self.0.simple().to_string();
        write!(f, "{}", &id[..8])
    }
}

/// Lifecycle of a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    /// Waiting for the platform to grant a stream
    Requesting,
    Recording,
    /// Finalizing the encoder
    Stopping,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Holds (or is about to hold) hardware handles
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Requesting | Self::Recording | Self::Stopping)
    }
}

/// What moved the session out of `Recording`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopTrigger {
    Explicit,
    Auto(AutoStopReason),
}

/// Final result of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed(EncodedClip),
    Failed {
        kind: ErrorKind,
        /// Reset to idle without a blocking modal
        retry_silently: bool,
    },
    Cancelled,
}

impl SessionOutcome {
    pub fn failed(kind: ErrorKind) -> Self {
        let retry_silently = kind.retry_silently();
        Self::Failed {
            kind,
            retry_silently,
        }
    }

    pub fn state(&self) -> SessionState {
        match self {
            Self::Completed(_) => SessionState::Completed,
            Self::Failed { .. } => SessionState::Failed,
            Self::Cancelled => SessionState::Cancelled,
        }
    }

    pub fn clip(&self) -> Option<&EncodedClip> {
        match self {
            Self::Completed(clip) => Some(clip),
            _ => None,
        }
    }
}

/// A session that reached a terminal state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedSession {
    pub id: SessionId,
    pub word: String,
    pub outcome: SessionOutcome,
}

/// Events emitted to the view layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    StateChanged {
        session: SessionId,
        state: SessionState,
    },
    AutoStopTriggered {
        session: SessionId,
        reason: AutoStopReason,
    },
    Error {
        session: SessionId,
        kind: ErrorKind,
        message: String,
        retry_silently: bool,
    },
    Completed {
        session: SessionId,
        clip: EncodedClip,
    },
}

impl CaptureEvent {
    pub fn session(&self) -> SessionId {
        match self {
            Self::StateChanged { session, .. }
            | Self::AutoStopTriggered { session, .. }
            | Self::Error { session, .. }
            | Self::Completed { session, .. } => *session,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_and_active_states() {
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Cancelled.is_terminal());
        assert!(!SessionState::Stopping.is_terminal());
        assert!(SessionState::Requesting.is_active());
        assert!(!SessionState::Idle.is_active());
    }

    #[test]
    fn insufficient_audio_outcome_is_silent() {
        let outcome = SessionOutcome::failed(ErrorKind::InsufficientAudio);
        assert_eq!(
            outcome,
            SessionOutcome::Failed {
                kind: ErrorKind::InsufficientAudio,
                retry_silently: true
            }
        );
        assert_eq!(outcome.state(), SessionState::Failed);
        assert!(outcome.clip().is_none());
    }

    #[test]
    fn session_ids_are_unique_and_short_in_logs() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 8);
    }

    #[test]
    fn states_serialize_in_snake_case() {
        assert_eq!(
            serde_json::to_string(&SessionState::Recording).unwrap(),
            "\"recording\""
        );
    }
}
