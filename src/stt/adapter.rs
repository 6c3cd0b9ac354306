//! Async adapter over the blocking engine.
//!
//! Inference runs on the blocking thread pool with a per-call timeout.
//! There is no retry here: a timed-out or failed inference is reported to
//! the session, which decides what happens to the session as a whole.

use crate::error::{DictadError, Result};
use crate::stt::engine::{LoadedModel, Transcription};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Runs blocking inference calls with a timeout.
#[derive(Debug, Clone)]
pub struct EngineAdapter {
    infer_timeout: Duration,
}

impl EngineAdapter {
    /// Create an adapter with the given per-call inference timeout.
    pub fn new(infer_timeout: Duration) -> Self {
        Self { infer_timeout }
    }

    /// Transcribe one chunk of audio.
    ///
    /// The call is moved onto the blocking pool so the async runtime stays
    /// responsive during inference. On timeout the blocking call is left to
    /// finish in the background and its result is dropped; the engine stays
    /// usable for the next call because each inference uses its own state.
    pub async fn transcribe(
        &self,
        model: &Arc<dyn LoadedModel>,
        samples: Vec<i16>,
    ) -> Result<Transcription> {
        trace!(samples = samples.len(), "inference start");

        let model = Arc::clone(model);
        let task = tokio::task::spawn_blocking(move || model.infer(&samples));

        match tokio::time::timeout(self.infer_timeout, task).await {
            Err(_) => Err(DictadError::InferTimeout {
                secs: self.infer_timeout.as_secs(),
            }),
            Ok(Err(join_err)) => Err(DictadError::InferFailed {
                message: format!("Inference task failed: {}", join_err),
            }),
            Ok(Ok(result)) => result,
        }
    }
}
