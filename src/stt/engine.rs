//! Speech engine traits.
//!
//! [`SpeechEngine`] loads model weights; [`LoadedModel`] runs inference on
//! them. Both are synchronous because the underlying libraries block; the
//! model manager and the engine adapter wrap calls in blocking tasks and
//! apply timeouts.

use crate::error::{DictadError, Result};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Raw engine output for one audio chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    pub text: String,
    /// Engine confidence in the range 0.0 to 1.0, when available.
    pub confidence: Option<f32>,
}

/// Factory for loading speech models into memory.
///
/// This trait allows swapping implementations (real Whisper vs mock).
pub trait SpeechEngine: Send + Sync {
    /// Load model weights from disk.
    ///
    /// # Arguments
    /// * `path` - Path to the model file
    /// * `language` - Language code, or "auto" for detection
    ///
    /// Blocks until the model is resident. The caller is responsible for
    /// enforcing a timeout.
    fn load(&self, path: &Path, language: &str) -> Result<Box<dyn LoadedModel>>;
}

/// A model resident in memory.
pub trait LoadedModel: Send + Sync {
    /// Transcribe audio samples to text.
    ///
    /// # Arguments
    /// * `audio` - Audio samples as 16-bit PCM at 16kHz mono
    fn infer(&self, audio: &[i16]) -> Result<Transcription>;

    /// Get the name of the loaded model.
    fn model_name(&self) -> &str;

    /// Release engine-side resources.
    ///
    /// Fallible so a failed unload can be retried on the next idle sweep.
    /// Memory is reclaimed when the model is dropped after this succeeds.
    fn unload(&self) -> Result<()>;
}

/// Mock engine for testing.
///
/// Clones share all counters and scripted state, so a test can keep one
/// clone for assertions while the manager owns another.
#[derive(Debug, Clone)]
pub struct MockEngine {
    transcripts: Arc<Mutex<VecDeque<String>>>,
    default_transcript: String,
    confidence: Option<f32>,
    load_delay: Option<Duration>,
    infer_delay: Option<Duration>,
    should_fail_load: bool,
    should_fail_infer: bool,
    unload_failures: Arc<AtomicUsize>,
    loads: Arc<AtomicUsize>,
    infers: Arc<AtomicUsize>,
    unloads: Arc<AtomicUsize>,
    last_language: Arc<Mutex<Option<String>>>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    /// Create a new mock engine with default settings.
    pub fn new() -> Self {
        Self {
            transcripts: Arc::new(Mutex::new(VecDeque::new())),
            default_transcript: "mock transcription".to_string(),
            confidence: None,
            load_delay: None,
            infer_delay: None,
            should_fail_load: false,
            should_fail_infer: false,
            unload_failures: Arc::new(AtomicUsize::new(0)),
            loads: Arc::new(AtomicUsize::new(0)),
            infers: Arc::new(AtomicUsize::new(0)),
            unloads: Arc::new(AtomicUsize::new(0)),
            last_language: Arc::new(Mutex::new(None)),
        }
    }

    /// Configure the mock to return a specific transcript on every inference.
    pub fn with_transcript(self, transcript: &str) -> Self {
        Self {
            default_transcript: transcript.to_string(),
            ..self
        }
    }

    /// Configure the mock to return these transcripts in order, then fall
    /// back to the default transcript.
    pub fn with_transcripts(self, transcripts: &[&str]) -> Self {
        if let Ok(mut queue) = self.transcripts.lock() {
            queue.clear();
            queue.extend(transcripts.iter().map(|t| t.to_string()));
        }
        self
    }

    /// Configure the mock to attach a confidence to every transcription.
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Configure the mock to sleep this long before completing a load.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    /// Configure the mock to sleep this long before completing an inference.
    pub fn with_infer_delay(mut self, delay: Duration) -> Self {
        self.infer_delay = Some(delay);
        self
    }

    /// Configure the mock to fail on load.
    pub fn with_load_failure(mut self) -> Self {
        self.should_fail_load = true;
        self
    }

    /// Configure the mock to fail on inference.
    pub fn with_infer_failure(mut self) -> Self {
        self.should_fail_infer = true;
        self
    }

    /// Configure the mock to fail the next `count` unload calls.
    pub fn with_unload_failures(self, count: usize) -> Self {
        self.unload_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Number of load calls, including failed ones.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of inference calls, including failed ones.
    pub fn infer_count(&self) -> usize {
        self.infers.load(Ordering::SeqCst)
    }

    /// Number of successful unloads.
    pub fn unload_count(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    /// Language passed to the most recent load call.
    pub fn last_language(&self) -> Option<String> {
        self.last_language.lock().ok().and_then(|l| l.clone())
    }
}

impl SpeechEngine for MockEngine {
    fn load(&self, path: &Path, language: &str) -> Result<Box<dyn LoadedModel>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_language.lock() {
            *last = Some(language.to_string());
        }

        if let Some(delay) = self.load_delay {
            std::thread::sleep(delay);
        }

        if self.should_fail_load {
            return Err(DictadError::LoadFailed {
                message: "mock load failure".to_string(),
            });
        }

        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("mock-model")
            .to_string();

        Ok(Box::new(MockModel {
            engine: self.clone(),
            name,
        }))
    }
}

/// Model handle produced by [`MockEngine::load`].
#[derive(Debug)]
pub struct MockModel {
    engine: MockEngine,
    name: String,
}

impl LoadedModel for MockModel {
    fn infer(&self, _audio: &[i16]) -> Result<Transcription> {
        self.engine.infers.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.engine.infer_delay {
            std::thread::sleep(delay);
        }

        if self.engine.should_fail_infer {
            return Err(DictadError::InferFailed {
                message: "mock inference failure".to_string(),
            });
        }

        let text = self
            .engine
            .transcripts
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
            .unwrap_or_else(|| self.engine.default_transcript.clone());

        Ok(Transcription {
            text,
            confidence: self.engine.confidence,
        })
    }

    fn model_name(&self) -> &str {
        &self.name
    }

    fn unload(&self) -> Result<()> {
        let remaining = self.engine.unload_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.engine
                .unload_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(DictadError::UnloadFailed {
                message: "mock unload failure".to_string(),
            });
        }

        self.engine.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
