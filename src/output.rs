//! Shared event rendering for terminal output.
//! Used by the `dictad start` and `dictad listen` event streams.

use crate::ipc::protocol::Event;
use crate::session::SessionState;

const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Clear the current terminal line.
pub fn clear_line() {
    eprint!("\r\x1b[2K");
}

/// Return the ANSI color code for a confidence value.
fn confidence_color(confidence: f32) -> &'static str {
    if confidence >= 0.9 {
        GREEN
    } else if confidence >= 0.7 {
        "" // default terminal color
    } else if confidence >= 0.5 {
        YELLOW
    } else {
        RED
    }
}

/// Format a confidence suffix like ` 87%`. Empty when the engine reported none.
fn confidence_tag(confidence: Option<f32>) -> String {
    match confidence {
        Some(c) => {
            let pct = c * 100.0;
            let color = confidence_color(c);
            if color.is_empty() {
                format!(" {DIM}{pct:.0}%{RESET}")
            } else {
                format!(" {color}{pct:.0}%{RESET}")
            }
        }
        None => String::new(),
    }
}

/// One-line description of a session state for the event feed.
fn state_line(state: SessionState) -> &'static str {
    match state {
        SessionState::Idle => "Session idle",
        SessionState::Recording => "Recording",
        SessionState::Transcribing => "Transcribing...",
        SessionState::Finalizing => "Finalizing...",
        SessionState::Done => "Session complete",
        SessionState::Error => "Session failed",
    }
}

/// Render a daemon event to stderr.
///
/// Stdout is reserved for transcripts so `dictad start | wl-copy` stays
/// clean; everything rendered here goes to stderr.
pub fn render_event(event: &Event) {
    match event {
        Event::PartialResult {
            text, confidence, ..
        } => {
            eprintln!("{DIM}partial:{RESET} {text}{}", confidence_tag(*confidence));
        }
        Event::FinalResult {
            text, confidence, ..
        } => {
            if text.is_empty() {
                eprintln!("{DIM}(no speech){RESET}");
            } else {
                eprintln!("{GREEN}final:{RESET} {text}{}", confidence_tag(*confidence));
            }
        }
        Event::StateChange { state, .. } => {
            eprintln!("{DIM}{}{RESET}", state_line(*state));
        }
        Event::Error {
            error_code,
            message,
            ..
        } => match error_code {
            Some(code) => eprintln!("{RED}error [{code}]: {message}{RESET}"),
            None => eprintln!("{RED}error: {message}{RESET}"),
        },
        Event::Ok => {}
        // Status replies are rendered by the status command, not the feed
        Event::Status { .. } => {}
    }
}
