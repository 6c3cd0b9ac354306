//! Command-line interface for dictad
//!
//! Provides argument parsing using clap derive macros. One binary serves
//! both roles: `dictad daemon` runs the server, every other subcommand is
//! a thin IPC client.

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use uuid::Uuid;

/// Push-to-talk dictation daemon for Linux desktops
#[derive(Parser, Debug)]
#[command(name = "dictad", version, about = "Push-to-talk dictation daemon for Linux desktops")]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Audio input device name (see `dictad devices`)
    #[arg(long, value_name = "DEVICE")]
    pub device: Option<String>,

    /// Path to a ggml Whisper model file
    #[arg(long, value_name = "PATH")]
    pub model: Option<PathBuf>,

    /// Language code for transcription (default: auto-detect). Examples: auto, en, de, es, fr
    #[arg(long, value_name = "LANG")]
    pub language: Option<String>,
}

/// Parse an idle-timeout string into seconds.
///
/// Supports any duration format accepted by `humantime`: bare numbers
/// (seconds), single-unit (`30s`, `5m`, `2h`), and compound (`1h30m`).
fn parse_idle_secs(s: &str) -> Result<u64, String> {
    let s = s.trim();
    // Bare number → seconds
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(secs);
    }
    humantime::parse_duration(s)
        .map(|d| d.as_secs())
        .map_err(|e| e.to_string())
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon (foreground process for systemd)
    Daemon {
        /// Path to Unix socket (default: $XDG_RUNTIME_DIR/dictad.sock)
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,

        /// Unload the model after this long without a session. Examples: 300, 5m, 1h
        #[arg(long, value_name = "DURATION", value_parser = parse_idle_secs)]
        idle_timeout: Option<u64>,
    },

    /// Start a dictation session and stream its results
    Start {
        /// Path to Unix socket (default: $XDG_RUNTIME_DIR/dictad.sock)
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,
    },

    /// Stop capturing; the session finalizes and prints its transcript
    Stop {
        /// Path to Unix socket (default: $XDG_RUNTIME_DIR/dictad.sock)
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,

        /// Only stop this session (default: whatever session is active)
        #[arg(long, value_name = "UUID")]
        session: Option<Uuid>,
    },

    /// Cancel the active session, discarding its audio and results
    Cancel {
        /// Path to Unix socket (default: $XDG_RUNTIME_DIR/dictad.sock)
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,

        /// Only cancel this session (default: whatever session is active)
        #[arg(long, value_name = "UUID")]
        session: Option<Uuid>,
    },

    /// Get daemon status via IPC
    Status {
        /// Path to Unix socket (default: $XDG_RUNTIME_DIR/dictad.sock)
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,
    },

    /// Follow daemon events (session state, partial and final transcripts)
    Listen {
        /// Path to Unix socket (default: $XDG_RUNTIME_DIR/dictad.sock)
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,
    },

    /// Shut the daemon down cleanly
    Shutdown {
        /// Path to Unix socket (default: $XDG_RUNTIME_DIR/dictad.sock)
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,
    },

    /// List available audio input devices
    Devices,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}
