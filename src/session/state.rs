//! Session lifecycle states and the legal transitions between them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a dictation session.
///
/// ```text
///             start            chunk (non-final)
///   Idle ──────────► Recording ──────────────► Transcribing
///    ▲                  │  ▲                        │
///    │                  │  └────────────────────────┘
///    │                  │ chunk (final) / stop    result
///    │                  ▼
///    │              Finalizing ──► Done
///    │                               │
///    └───────────────────────────────┘
/// ```
///
/// `Error` is reachable from every non-terminal state; acknowledging an
/// error returns to `Idle`. `Done` returns to `Idle` once the final result
/// has been delivered and the model lease released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session in progress.
    Idle,
    /// Capturing audio, waiting for the next utterance segment.
    Recording,
    /// Running inference on a non-final segment.
    Transcribing,
    /// Running inference on the final segment.
    Finalizing,
    /// Final result emitted.
    Done,
    /// Session aborted; the error event carries the cause.
    Error,
}

impl SessionState {
    /// True for states a session can never leave on its own.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Done | SessionState::Error)
    }

    /// True while the session occupies the microphone and the model.
    ///
    /// At most one session may be active at a time; the daemon rejects
    /// `start` with a busy error while this holds for the live session.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Recording | SessionState::Transcribing | SessionState::Finalizing
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Every state change in the session task goes through this check.
    /// Note there is no `Transcribing -> Finalizing` edge: segments are
    /// processed sequentially, so a final segment is always picked up from
    /// `Recording` after the previous inference completed.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (Idle, Recording) => true,
            (Recording, Transcribing) => true,
            (Transcribing, Recording) => true,
            (Recording, Finalizing) => true,
            (Finalizing, Done) => true,
            (Done, Idle) => true,
            (Error, Idle) => true,
            // A failed model acquire aborts from Idle without ever recording.
            (from, Error) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Recording => "recording",
            SessionState::Transcribing => "transcribing",
            SessionState::Finalizing => "finalizing",
            SessionState::Done => "done",
            SessionState::Error => "error",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    const ALL_STATES: [SessionState; 6] = [Idle, Recording, Transcribing, Finalizing, Done, Error];

    #[test]
    fn test_happy_path_transitions() {
        assert!(Idle.can_transition_to(Recording));
        assert!(Recording.can_transition_to(Transcribing));
        assert!(Transcribing.can_transition_to(Recording));
        assert!(Recording.can_transition_to(Finalizing));
        assert!(Finalizing.can_transition_to(Done));
        assert!(Done.can_transition_to(Idle));
    }

    #[test]
    fn test_error_reachable_from_every_non_terminal_state() {
        for state in [Idle, Recording, Transcribing, Finalizing] {
            assert!(
                state.can_transition_to(Error),
                "{:?} should be able to fail",
                state
            );
        }
    }

    #[test]
    fn test_terminal_states_cannot_fail() {
        assert!(!Done.can_transition_to(Error));
        assert!(!Error.can_transition_to(Error));
    }

    #[test]
    fn test_error_acknowledge_returns_to_idle() {
        assert!(Error.can_transition_to(Idle));
    }

    #[test]
    fn test_no_state_skipping() {
        assert!(!Idle.can_transition_to(Transcribing));
        assert!(!Idle.can_transition_to(Finalizing));
        assert!(!Idle.can_transition_to(Done));
        assert!(!Recording.can_transition_to(Done));
        assert!(!Transcribing.can_transition_to(Finalizing));
        assert!(!Transcribing.can_transition_to(Done));
        assert!(!Finalizing.can_transition_to(Recording));
        assert!(!Finalizing.can_transition_to(Transcribing));
    }

    #[test]
    fn test_no_self_transitions() {
        for state in ALL_STATES {
            assert!(
                !state.can_transition_to(state),
                "{:?} should not transition to itself",
                state
            );
        }
    }

    #[test]
    fn test_done_only_returns_to_idle() {
        for state in [Recording, Transcribing, Finalizing, Done, Error] {
            assert!(!Done.can_transition_to(state));
        }
        assert!(Done.can_transition_to(Idle));
    }

    #[test]
    fn test_terminal_classification() {
        assert!(Done.is_terminal());
        assert!(Error.is_terminal());
        for state in [Idle, Recording, Transcribing, Finalizing] {
            assert!(!state.is_terminal(), "{:?} should not be terminal", state);
        }
    }

    #[test]
    fn test_active_classification() {
        assert!(Recording.is_active());
        assert!(Transcribing.is_active());
        assert!(Finalizing.is_active());
        assert!(!Idle.is_active());
        assert!(!Done.is_active());
        assert!(!Error.is_active());
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&Transcribing).expect("should serialize");
        assert_eq!(json, r#""transcribing""#);

        let state: SessionState =
            serde_json::from_str(r#""recording""#).expect("should deserialize");
        assert_eq!(state, Recording);
    }

    #[test]
    fn test_serde_roundtrip_all_states() {
        for state in ALL_STATES {
            let json = serde_json::to_string(&state).expect("should serialize");
            let back: SessionState = serde_json::from_str(&json).expect("should deserialize");
            assert_eq!(state, back, "roundtrip failed for {:?}", state);
        }
    }

    #[test]
    fn test_serde_rejects_wrong_case() {
        let result = serde_json::from_str::<SessionState>(r#""Recording""#);
        assert!(result.is_err(), "should reject non-snake_case value");
    }

    #[test]
    fn test_display_matches_wire_format() {
        for state in ALL_STATES {
            let wire = serde_json::to_string(&state).expect("should serialize");
            assert_eq!(format!("\"{}\"", state), wire);
        }
    }
}
