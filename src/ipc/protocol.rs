//! JSON wire protocol between clients and the daemon.
//!
//! Messages are newline-delimited JSON. Commands are tagged with a `cmd`
//! field, events with a `type` field, both snake_case. Error codes are
//! SCREAMING_SNAKE_CASE strings so scripts can match on them.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::DictadError;
use crate::session::{SessionEvent, SessionState};

/// Commands sent by a client to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// Begin a dictation session. The issuing connection receives the
    /// session's event stream.
    Start,
    /// Stop capturing; the session finalizes and delivers its result.
    Stop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<Uuid>,
    },
    /// Abort the session, discarding audio and any in-flight result.
    Cancel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<Uuid>,
    },
    /// Query daemon status.
    Status,
    /// Subscribe to the daemon's event stream without owning a session.
    Listen,
    /// Shut the daemon down cleanly.
    Shutdown,
}

impl Command {
    /// Serialize to a single JSON line (without the trailing newline).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Events and responses sent by the daemon to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Command acknowledged; nothing further to report.
    Ok,
    /// Live transcription of one utterance segment.
    PartialResult {
        session_id: Uuid,
        sequence: u64,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
    },
    /// The complete session transcript. Exactly one per completed session,
    /// always the last result event.
    FinalResult {
        session_id: Uuid,
        sequence: u64,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
    },
    /// The session moved to a new state.
    StateChange {
        session_id: Uuid,
        state: SessionState,
    },
    /// A session failed, or a command was rejected.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<ErrorCode>,
        message: String,
    },
    /// Reply to a `status` command.
    Status {
        version: String,
        state: SessionState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<Uuid>,
        model_loaded: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_name: Option<String>,
        uptime_secs: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device: Option<String>,
        sample_rate: u32,
        vad_threshold: f32,
    },
}

impl Event {
    /// Serialize to a single JSON line (without the trailing newline).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl From<SessionEvent> for Event {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::StateChanged { session_id, state } => {
                Event::StateChange { session_id, state }
            }
            SessionEvent::Result(result) => {
                if result.is_final {
                    Event::FinalResult {
                        session_id: result.session_id,
                        sequence: result.sequence,
                        text: result.text,
                        confidence: result.confidence,
                    }
                } else {
                    Event::PartialResult {
                        session_id: result.session_id,
                        sequence: result.sequence,
                        text: result.text,
                        confidence: result.confidence,
                    }
                }
            }
            SessionEvent::Failed {
                session_id,
                code,
                message,
            } => Event::Error {
                session_id: Some(session_id),
                error_code: code,
                message,
            },
        }
    }
}

/// Machine-readable cause of a rejected command or failed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Another session is active.
    Busy,
    /// The model did not load within the configured timeout.
    LoadTimeout,
    /// The engine rejected the model.
    LoadFailed,
    /// A segment inference exceeded the configured timeout.
    InferTimeout,
    /// The engine failed on a segment.
    InferFailed,
    /// The capture device disappeared or failed mid-session.
    DeviceError,
    /// The session was cancelled by a client.
    Cancelled,
}

impl ErrorCode {
    /// Wire code for a session-fatal error.
    ///
    /// Returns `None` for errors that never abort a session (configuration,
    /// I/O, protocol errors); those are reported by message only.
    pub fn from_error(err: &DictadError) -> Option<ErrorCode> {
        match err {
            DictadError::Busy => Some(ErrorCode::Busy),
            DictadError::LoadTimeout { .. } => Some(ErrorCode::LoadTimeout),
            DictadError::ModelNotFound { .. } | DictadError::LoadFailed { .. } => {
                Some(ErrorCode::LoadFailed)
            }
            DictadError::InferTimeout { .. } => Some(ErrorCode::InferTimeout),
            DictadError::InferFailed { .. } => Some(ErrorCode::InferFailed),
            DictadError::AudioDeviceNotFound { .. }
            | DictadError::AudioFormatMismatch { .. }
            | DictadError::Device { .. } => Some(ErrorCode::DeviceError),
            DictadError::Cancelled => Some(ErrorCode::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            ErrorCode::Busy => "BUSY",
            ErrorCode::LoadTimeout => "LOAD_TIMEOUT",
            ErrorCode::LoadFailed => "LOAD_FAILED",
            ErrorCode::InferTimeout => "INFER_TIMEOUT",
            ErrorCode::InferFailed => "INFER_FAILED",
            ErrorCode::DeviceError => "DEVICE_ERROR",
            ErrorCode::Cancelled => "CANCELLED",
        };
        write!(f, "{}", code)
    }
}
