//! Default configuration constants for dictad.
//!
//! This module provides shared constants used across different configuration types
//! to ensure consistency and eliminate duplication.

/// Default audio sample rate in Hz.
///
/// 16kHz is the standard for speech recognition and provides a good balance
/// between quality and computational efficiency for voice applications.
pub const SAMPLE_RATE: u32 = 16000;

/// Default Voice Activity Detection (VAD) threshold.
///
/// This RMS-based threshold (0.0 to 1.0) determines when audio is considered speech.
/// A value of 0.02 is tuned for typical microphone input levels and provides
/// good sensitivity while filtering out background noise.
pub const VAD_THRESHOLD: f32 = 0.02;

/// Default trailing-silence duration in milliseconds before an utterance is
/// considered finished.
///
/// 800ms ends a dictation promptly after the speaker stops while still
/// tolerating short mid-sentence pauses.
pub const SILENCE_DURATION_MS: u32 = 800;

/// Default maximum chunk duration in milliseconds.
///
/// Long utterances are cut into chunks of at most this duration so partial
/// results keep flowing and no single inference call sees unbounded audio.
pub const CHUNK_MAX_MS: u32 = 3000;

/// Pre-roll duration in milliseconds.
///
/// Silence samples kept in a ring buffer while waiting for speech, prepended
/// when a chunk opens. Captures soft onsets (plosives, fricatives) that occur
/// before energy crosses the VAD threshold.
pub const PRE_ROLL_MS: u32 = 300;

/// Capture frame duration in milliseconds.
///
/// The capture thread slices incoming audio into frames of this length.
/// 100ms keeps VAD reaction snappy without flooding the pipeline.
pub const CAPTURE_FRAME_MS: u32 = 100;

/// Default model file name, relative to the model directory.
///
/// "ggml-base.bin" (multilingual base) supports auto-detection of any language.
/// Use "ggml-base.en.bin" for English-only optimized transcription.
pub const DEFAULT_MODEL_FILE: &str = "ggml-base.bin";

/// Default language code for transcription.
///
/// "auto" lets the engine detect the spoken language automatically.
/// Set to a specific code (e.g., "en", "de") to force a language.
pub const DEFAULT_LANGUAGE: &str = "auto";

/// Language value that triggers automatic language detection.
pub const AUTO_LANGUAGE: &str = "auto";

/// Default model load timeout in seconds.
///
/// Covers reading several hundred MB of weights from disk on first use.
/// A load exceeding this aborts the requesting session with a load error.
pub const LOAD_TIMEOUT_SECS: u64 = 30;

/// Default per-chunk inference timeout in seconds.
///
/// A single chunk is at most a few seconds of audio; inference taking this
/// long means the engine is wedged, not slow.
pub const INFER_TIMEOUT_SECS: u64 = 30;

/// Default idle-unload timeout in seconds.
///
/// The model stays resident this long after its last use before the idle
/// sweep unloads it, so back-to-back dictations never pay the load cost.
pub const IDLE_TIMEOUT_SECS: u64 = 300;

/// Interval between idle-sweep checks in seconds.
pub const SWEEP_INTERVAL_SECS: u64 = 30;

/// Report the GPU backend compiled into this build.
///
/// Returns a human-readable name based on the compile-time feature flags.
/// Only one GPU backend can be active at a time; if none is enabled, returns "CPU".
pub fn gpu_backend() -> &'static str {
    if cfg!(feature = "cuda") {
        "CUDA"
    } else if cfg!(feature = "vulkan") {
        "Vulkan"
    } else if cfg!(feature = "hipblas") {
        "HipBLAS (AMD)"
    } else if cfg!(feature = "openblas") {
        "OpenBLAS"
    } else {
        "CPU"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_backend_matches_compiled_feature() {
        let expected = if cfg!(feature = "cuda") {
            "CUDA"
        } else if cfg!(feature = "vulkan") {
            "Vulkan"
        } else if cfg!(feature = "hipblas") {
            "HipBLAS (AMD)"
        } else if cfg!(feature = "openblas") {
            "OpenBLAS"
        } else {
            "CPU"
        };
        assert_eq!(gpu_backend(), expected);
    }

    #[test]
    fn silence_shorter_than_chunk_cap() {
        // A final chunk must be reachable before the duration cap forces a cut.
        assert!(u64::from(SILENCE_DURATION_MS) < u64::from(CHUNK_MAX_MS));
    }
}
