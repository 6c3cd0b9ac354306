use crate::defaults;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub model: ModelConfig,
    pub daemon: DaemonConfig,
}

/// Audio capture and segmentation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub device: Option<String>,
    pub sample_rate: u32,
    pub vad_threshold: f32,
    pub silence_duration_ms: u32,
    pub chunk_max_ms: u32,
}

/// Model lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub path: Option<PathBuf>,
    pub language: String,
    pub load_timeout_secs: u64,
    pub infer_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Daemon process configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket: Option<PathBuf>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: defaults::SAMPLE_RATE,
            vad_threshold: defaults::VAD_THRESHOLD,
            silence_duration_ms: defaults::SILENCE_DURATION_MS,
            chunk_max_ms: defaults::CHUNK_MAX_MS,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: None,
            language: defaults::DEFAULT_LANGUAGE.to_string(),
            load_timeout_secs: defaults::LOAD_TIMEOUT_SECS,
            infer_timeout_secs: defaults::INFER_TIMEOUT_SECS,
            idle_timeout_secs: defaults::IDLE_TIMEOUT_SECS,
        }
    }
}

impl ModelConfig {
    /// Resolve the model file path.
    ///
    /// An explicit `model.path` wins; otherwise the default model file under
    /// the XDG data directory (~/.local/share/dictad/models/) is used.
    pub fn resolved_path(&self) -> PathBuf {
        match &self.path {
            Some(path) => path.clone(),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("dictad")
                .join("models")
                .join(defaults::DEFAULT_MODEL_FILE),
        }
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    pub fn infer_timeout(&self) -> Duration {
        Duration::from_secs(self.infer_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Missing fields fall back to their defaults; unreadable files and
    /// invalid TOML are errors.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from a file, or defaults if the file does not exist.
    ///
    /// Only a missing file is forgiven; invalid TOML still panics with the
    /// parse error.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                let missing = e
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound);
                if missing {
                    Self::default()
                } else {
                    panic!("Failed to load config from {}: {}", path.display(), e);
                }
            }
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - DICTAD_MODEL → model.path
    /// - DICTAD_LANGUAGE → model.language
    /// - DICTAD_AUDIO_DEVICE → audio.device
    /// - DICTAD_SOCKET → daemon.socket
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(model) = std::env::var("DICTAD_MODEL")
            && !model.is_empty()
        {
            self.model.path = Some(PathBuf::from(model));
        }

        if let Ok(language) = std::env::var("DICTAD_LANGUAGE")
            && !language.is_empty()
        {
            self.model.language = language;
        }

        if let Ok(device) = std::env::var("DICTAD_AUDIO_DEVICE")
            && !device.is_empty()
        {
            self.audio.device = Some(device);
        }

        if let Ok(socket) = std::env::var("DICTAD_SOCKET")
            && !socket.is_empty()
        {
            self.daemon.socket = Some(PathBuf::from(socket));
        }

        self
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/dictad/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .expect("Could not determine config directory")
            .join("dictad")
            .join("config.toml")
    }
}
