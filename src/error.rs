//! Error types for dictad.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DictadError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Audio capture errors
    #[error("Audio device not found: {device}")]
    AudioDeviceNotFound { device: String },

    #[error("Audio format mismatch: expected {expected}, got {actual}")]
    AudioFormatMismatch { expected: String, actual: String },

    #[error("Audio device failed: {message}")]
    Device { message: String },

    // Model lifecycle errors
    #[error("Model not found at {path}")]
    ModelNotFound { path: String },

    #[error("Model load timed out after {secs}s")]
    LoadTimeout { secs: u64 },

    #[error("Model load failed: {message}")]
    LoadFailed { message: String },

    #[error("Model unload failed: {message}")]
    UnloadFailed { message: String },

    // Inference errors
    #[error("Inference timed out after {secs}s")]
    InferTimeout { secs: u64 },

    #[error("Inference failed: {message}")]
    InferFailed { message: String },

    // Session errors
    #[error("Another session is active")]
    Busy,

    #[error("Session cancelled")]
    Cancelled,

    // IPC errors
    #[error("IPC socket error: {message}")]
    IpcSocket { message: String },

    #[error("IPC protocol error: {message}")]
    IpcProtocol { message: String },

    #[error("IPC connection failed: {message}")]
    IpcConnection { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, DictadError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_file_not_found_display() {
        let error = DictadError::ConfigFileNotFound {
            path: "/path/to/config.toml".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Configuration file not found at /path/to/config.toml"
        );
    }

    #[test]
    fn test_config_invalid_value_display() {
        let error = DictadError::ConfigInvalidValue {
            key: "sample_rate".to_string(),
            message: "must be positive".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid configuration value for sample_rate: must be positive"
        );
    }

    #[test]
    fn test_audio_device_not_found_display() {
        let error = DictadError::AudioDeviceNotFound {
            device: "default".to_string(),
        };
        assert_eq!(error.to_string(), "Audio device not found: default");
    }

    #[test]
    fn test_audio_format_mismatch_display() {
        let error = DictadError::AudioFormatMismatch {
            expected: "16kHz mono".to_string(),
            actual: "44.1kHz stereo".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Audio format mismatch: expected 16kHz mono, got 44.1kHz stereo"
        );
    }

    #[test]
    fn test_device_display() {
        let error = DictadError::Device {
            message: "stream disconnected".to_string(),
        };
        assert_eq!(error.to_string(), "Audio device failed: stream disconnected");
    }

    #[test]
    fn test_model_not_found_display() {
        let error = DictadError::ModelNotFound {
            path: "/models/whisper.bin".to_string(),
        };
        assert_eq!(error.to_string(), "Model not found at /models/whisper.bin");
    }

    #[test]
    fn test_load_timeout_display() {
        let error = DictadError::LoadTimeout { secs: 30 };
        assert_eq!(error.to_string(), "Model load timed out after 30s");
    }

    #[test]
    fn test_load_failed_display() {
        let error = DictadError::LoadFailed {
            message: "out of memory".to_string(),
        };
        assert_eq!(error.to_string(), "Model load failed: out of memory");
    }

    #[test]
    fn test_unload_failed_display() {
        let error = DictadError::UnloadFailed {
            message: "engine busy".to_string(),
        };
        assert_eq!(error.to_string(), "Model unload failed: engine busy");
    }

    #[test]
    fn test_infer_timeout_display() {
        let error = DictadError::InferTimeout { secs: 30 };
        assert_eq!(error.to_string(), "Inference timed out after 30s");
    }

    #[test]
    fn test_infer_failed_display() {
        let error = DictadError::InferFailed {
            message: "decode error".to_string(),
        };
        assert_eq!(error.to_string(), "Inference failed: decode error");
    }

    #[test]
    fn test_busy_display() {
        assert_eq!(DictadError::Busy.to_string(), "Another session is active");
    }

    #[test]
    fn test_cancelled_display() {
        assert_eq!(DictadError::Cancelled.to_string(), "Session cancelled");
    }

    #[test]
    fn test_ipc_socket_display() {
        let error = DictadError::IpcSocket {
            message: "bind failed".to_string(),
        };
        assert_eq!(error.to_string(), "IPC socket error: bind failed");
    }

    #[test]
    fn test_ipc_protocol_display() {
        let error = DictadError::IpcProtocol {
            message: "invalid message format".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "IPC protocol error: invalid message format"
        );
    }

    #[test]
    fn test_ipc_connection_display() {
        let error = DictadError::IpcConnection {
            message: "timeout".to_string(),
        };
        assert_eq!(error.to_string(), "IPC connection failed: timeout");
    }

    #[test]
    fn test_other_display() {
        let error = DictadError::Other("unexpected error".to_string());
        assert_eq!(error.to_string(), "unexpected error");
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: DictadError = io_error.into();
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_toml_error() {
        let toml_str = "invalid = toml = syntax";
        let toml_error = toml::from_str::<toml::Value>(toml_str).unwrap_err();
        let error: DictadError = toml_error.into();
        assert!(error.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<i32> {
            Ok(42)
        }
        assert_eq!(returns_result().unwrap(), 42);

        fn returns_error() -> Result<i32> {
            Err(DictadError::Other("test error".to_string()))
        }
        assert!(returns_error().is_err());
    }

    #[test]
    fn test_error_source_chain_io() {
        let io_error = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let error: DictadError = io_error.into();

        let error_trait: &dyn std::error::Error = &error;
        assert!(error_trait.source().is_some());
    }

    #[test]
    fn test_error_source_chain_toml() {
        let toml_str = "key = 'unclosed string";
        let toml_error = toml::from_str::<toml::Value>(toml_str).unwrap_err();
        let error: DictadError = toml_error.into();

        let error_trait: &dyn std::error::Error = &error;
        assert!(error_trait.source().is_some());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<DictadError>();
        assert_sync::<DictadError>();
    }

    #[test]
    fn test_error_debug_format() {
        let error = DictadError::ConfigFileNotFound {
            path: "/test/path".to_string(),
        };
        let debug_str = format!("{:?}", error);
        assert!(debug_str.contains("ConfigFileNotFound"));
        assert!(debug_str.contains("/test/path"));
    }
}
