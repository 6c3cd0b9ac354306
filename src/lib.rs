//! dictad - Push-to-talk dictation daemon for Linux desktops
//!
//! Offline speech-to-text over a Unix socket: the daemon owns the microphone
//! and the Whisper model, thin clients start and observe dictation sessions.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
#[cfg(feature = "cli")]
pub mod cli;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod defaults;
pub mod error;
pub mod ipc;
pub mod model;
#[cfg(feature = "cli")]
pub mod output;
pub mod session;
pub mod stt;

// Core traits (capture → chunk → infer)
pub use audio::AudioSource;
pub use stt::SpeechEngine;

// Session surface
pub use session::{SessionHandle, SessionState};

// Error handling
pub use error::{DictadError, Result};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.3.1+abc1234"` when git hash is available, `"0.3.1"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
