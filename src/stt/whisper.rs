//! Whisper-based speech engine.
//!
//! This module implements [`SpeechEngine`] and [`LoadedModel`] on top of
//! whisper-rs.
//!
//! # Feature Gate
//!
//! This module requires the `whisper` feature to be enabled and cmake to be
//! installed. To build with Whisper support:
//!
//! ```bash
//! cargo build --features whisper
//! ```

use crate::error::{DictadError, Result};
use crate::stt::engine::{LoadedModel, SpeechEngine, Transcription};
use std::path::Path;

#[cfg(feature = "whisper")]
use crate::defaults;
#[cfg(feature = "whisper")]
use std::sync::{Mutex, Once};
#[cfg(feature = "whisper")]
use tracing::debug;
#[cfg(feature = "whisper")]
use whisper_rs::{
    FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters, install_logging_hooks,
};

#[cfg(feature = "whisper")]
static LOGGING_HOOKS_INSTALLED: Once = Once::new();

/// Convert i16 audio samples to f32 normalized to [-1.0, 1.0].
///
/// Whisper expects audio in f32 format normalized to the range [-1.0, 1.0].
/// Input is 16-bit PCM audio where samples range from -32768 to 32767.
fn convert_audio(samples: &[i16]) -> Vec<f32> {
    samples
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Extract a model name from the weights path.
fn model_name_from_path(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string()
}

/// Whisper-based speech engine.
///
/// Each [`SpeechEngine::load`] call produces an independent [`WhisperModel`]
/// holding its own `WhisperContext`.
#[derive(Debug, Clone, Default)]
pub struct WhisperEngine {
    /// Number of threads for inference (None = auto-detect).
    threads: Option<usize>,
}

impl WhisperEngine {
    /// Create a new Whisper engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of inference threads.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Configured thread count, if any.
    pub fn threads(&self) -> Option<usize> {
        self.threads
    }
}

#[cfg(feature = "whisper")]
impl SpeechEngine for WhisperEngine {
    fn load(&self, path: &Path, language: &str) -> Result<Box<dyn LoadedModel>> {
        // Install logging hooks to suppress whisper.cpp output (only once)
        LOGGING_HOOKS_INSTALLED.call_once(|| {
            install_logging_hooks();
        });

        if !path.exists() {
            return Err(DictadError::ModelNotFound {
                path: path.to_string_lossy().to_string(),
            });
        }

        let mut context_params = WhisperContextParameters::default();
        // Enable flash attention: uses fused attention kernels that avoid the standalone
        // softmax CUDA kernel, which crashes on Blackwell GPUs (sm_120) with ggml <= 1.7.6
        context_params.flash_attn(true);
        let context = WhisperContext::new_with_params(
            path.to_str().ok_or_else(|| DictadError::LoadFailed {
                message: "Invalid UTF-8 in model path".to_string(),
            })?,
            context_params,
        )
        .map_err(|e| DictadError::LoadFailed {
            message: format!("Failed to load Whisper model: {}", e),
        })?;

        Ok(Box::new(WhisperModel {
            context: Mutex::new(context),
            language: language.to_string(),
            threads: self.threads,
            model_name: model_name_from_path(path),
        }))
    }
}

/// A Whisper model resident in memory.
///
/// The WhisperContext is wrapped in a Mutex to ensure thread safety.
#[cfg(feature = "whisper")]
pub struct WhisperModel {
    context: Mutex<WhisperContext>,
    language: String,
    threads: Option<usize>,
    model_name: String,
}

#[cfg(feature = "whisper")]
impl std::fmt::Debug for WhisperModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhisperModel")
            .field("language", &self.language)
            .field("threads", &self.threads)
            .field("model_name", &self.model_name)
            .field("context", &"<WhisperContext>")
            .finish()
    }
}

#[cfg(feature = "whisper")]
impl LoadedModel for WhisperModel {
    fn infer(&self, audio: &[i16]) -> Result<Transcription> {
        // Convert audio format from i16 to f32
        let audio_f32 = convert_audio(audio);

        // Lock the context for thread-safe access
        let context = self.context.lock().map_err(|e| DictadError::InferFailed {
            message: format!("Failed to acquire context lock: {}", e),
        })?;

        // Create a new state for this transcription
        let mut state = context.create_state().map_err(|e| DictadError::InferFailed {
            message: format!("Failed to create Whisper state: {}", e),
        })?;

        // Configure transcription parameters
        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });

        // Set language
        if self.language == defaults::AUTO_LANGUAGE {
            params.set_language(None);
        } else {
            params.set_language(Some(&self.language));
        }

        // Set number of threads if specified
        if let Some(threads) = self.threads {
            params.set_n_threads(threads as i32);
        }

        // Disable printing to stdout/stderr
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        // Run inference
        state
            .full(params, &audio_f32)
            .map_err(|e| DictadError::InferFailed {
                message: format!("Whisper inference failed: {}", e),
            })?;

        if self.language == defaults::AUTO_LANGUAGE {
            let lang_id = state.full_lang_id_from_state();
            let detected = whisper_rs::get_lang_str(lang_id).unwrap_or("");
            debug!(language = detected, "whisper language detection");
        }

        // Extract transcribed text and compute confidence from segment probabilities
        let mut text = String::new();
        let mut confidence_sum = 0.0_f32;
        let mut segment_count = 0u32;
        for segment in state.as_iter() {
            text.push_str(&segment.to_string());
            // no_speech_probability is 0.0..1.0; confidence = 1 - no_speech_prob
            confidence_sum += 1.0 - segment.no_speech_probability();
            segment_count += 1;
        }

        let confidence = if segment_count > 0 {
            Some((confidence_sum / segment_count as f32).clamp(0.0, 1.0))
        } else {
            None
        };

        Ok(Transcription {
            text: text.trim().to_string(),
            confidence,
        })
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn unload(&self) -> Result<()> {
        // whisper.cpp frees the context when the model is dropped
        Ok(())
    }
}

#[cfg(not(feature = "whisper"))]
impl SpeechEngine for WhisperEngine {
    fn load(&self, path: &Path, _language: &str) -> Result<Box<dyn LoadedModel>> {
        if !path.exists() {
            return Err(DictadError::ModelNotFound {
                path: path.to_string_lossy().to_string(),
            });
        }

        Err(DictadError::LoadFailed {
            message: concat!(
                "Whisper feature not enabled. This binary was built without speech recognition.\n",
                "To fix: cargo build --release (whisper is enabled by default)\n",
                "If build fails with cmake errors, install: sudo apt install cmake"
            )
            .to_string(),
        })
    }
}
