//! Model lifecycle management.
//!
//! The manager owns the single loaded model and its reference count.
//! Sessions call [`ModelManager::acquire`] before inference and hand the
//! lease back with [`ModelManager::release`] when done. The model is not
//! unloaded on release; a periodic sweep unloads it once it has been idle
//! past the configured timeout, so back-to-back dictations never pay the
//! load cost twice.
//!
//! All state lives behind one async mutex that is held across the load
//! await, so concurrent acquires cannot race a load and the sweep cannot
//! observe a half-initialized model.

use crate::clock::{Clock, SystemClock};
use crate::config::ModelConfig;
use crate::error::{DictadError, Result};
use crate::stt::engine::{LoadedModel, SpeechEngine};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A counted reference to the loaded model.
///
/// Obtained from [`ModelManager::acquire`] and consumed by
/// [`ModelManager::release`], so a lease cannot be released twice.
pub struct ModelLease {
    model: Arc<dyn LoadedModel>,
}

impl ModelLease {
    /// The model this lease holds in memory.
    pub fn model(&self) -> &Arc<dyn LoadedModel> {
        &self.model
    }
}

impl std::fmt::Debug for ModelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLease")
            .field("model", &self.model.model_name())
            .finish()
    }
}

/// What the manager currently holds.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelStatus {
    /// No model in memory.
    Unloaded,
    /// A load is in progress.
    Loading,
    /// Model resident, with the number of sessions using it.
    Loaded { name: String, active_uses: u32 },
}

struct LoadedState {
    model: Arc<dyn LoadedModel>,
    loaded_at: Instant,
    /// Updated when the use count drops to zero; the idle clock starts here.
    last_used: Instant,
    active_uses: u32,
}

/// Owns the loaded model and decides when to load and unload it.
pub struct ModelManager<C: Clock = SystemClock> {
    engine: Arc<dyn SpeechEngine>,
    model_path: PathBuf,
    language: String,
    load_timeout: Duration,
    idle_timeout: Duration,
    state: Mutex<Option<LoadedState>>,
    clock: C,
}

impl<C: Clock> ModelManager<C> {
    /// Creates a manager with the given clock.
    pub fn with_clock(engine: Arc<dyn SpeechEngine>, config: &ModelConfig, clock: C) -> Self {
        Self {
            engine,
            model_path: config.resolved_path(),
            language: config.language.clone(),
            load_timeout: config.load_timeout(),
            idle_timeout: config.idle_timeout(),
            state: Mutex::new(None),
            clock,
        }
    }

    /// Get a lease on the model, loading it first if necessary.
    ///
    /// The internal lock is held across the load, so concurrent callers
    /// queue up and reuse the one load instead of racing. A failed or
    /// timed-out load leaves the manager empty; the next acquire retries
    /// from scratch.
    pub async fn acquire(&self) -> Result<ModelLease> {
        let mut state = self.state.lock().await;

        if let Some(loaded) = state.as_mut() {
            loaded.active_uses += 1;
            loaded.last_used = self.clock.now();
            debug!(active_uses = loaded.active_uses, "model lease acquired");
            return Ok(ModelLease {
                model: Arc::clone(&loaded.model),
            });
        }

        let engine = Arc::clone(&self.engine);
        let path = self.model_path.clone();
        let language = self.language.clone();

        info!(path = %path.display(), "loading model");
        let started = Instant::now();
        let task = tokio::task::spawn_blocking(move || engine.load(&path, &language));

        let model = match tokio::time::timeout(self.load_timeout, task).await {
            // The abandoned load finishes in the background; its result is
            // dropped with the join handle, leaving nothing resident.
            Err(_) => {
                warn!(secs = self.load_timeout.as_secs(), "model load timed out");
                return Err(DictadError::LoadTimeout {
                    secs: self.load_timeout.as_secs(),
                });
            }
            Ok(Err(join_err)) => {
                return Err(DictadError::LoadFailed {
                    message: format!("Load task failed: {}", join_err),
                });
            }
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Ok(Ok(model))) => model,
        };

        let model: Arc<dyn LoadedModel> = Arc::from(model);
        let now = self.clock.now();
        info!(
            model = model.model_name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model loaded"
        );

        *state = Some(LoadedState {
            model: Arc::clone(&model),
            loaded_at: now,
            last_used: now,
            active_uses: 1,
        });

        Ok(ModelLease { model })
    }

    /// Return a lease.
    ///
    /// When the last lease comes back the idle clock starts; the model
    /// itself stays resident until the sweep decides otherwise.
    pub async fn release(&self, lease: ModelLease) {
        drop(lease.model);

        let mut state = self.state.lock().await;
        match state.as_mut() {
            Some(loaded) => {
                loaded.active_uses = loaded.active_uses.saturating_sub(1);
                if loaded.active_uses == 0 {
                    loaded.last_used = self.clock.now();
                }
                debug!(active_uses = loaded.active_uses, "model lease released");
            }
            None => warn!("lease released but no model is loaded"),
        }
    }

    /// Unload the model if it has been idle past the timeout.
    ///
    /// Returns `Ok(true)` if a model was unloaded. A model with active
    /// leases is never touched. An unload failure leaves the model in
    /// place for the next sweep to retry.
    pub async fn sweep(&self) -> Result<bool> {
        let mut state = self.state.lock().await;

        let Some(loaded) = state.as_ref() else {
            return Ok(false);
        };
        if loaded.active_uses > 0 {
            return Ok(false);
        }

        let idle = self.clock.now().duration_since(loaded.last_used);
        if idle < self.idle_timeout {
            return Ok(false);
        }

        let model = Arc::clone(&loaded.model);
        let resident = self.clock.now().duration_since(loaded.loaded_at);
        tokio::task::spawn_blocking(move || model.unload())
            .await
            .map_err(|join_err| DictadError::UnloadFailed {
                message: format!("Unload task failed: {}", join_err),
            })??;

        *state = None;
        info!(
            idle_secs = idle.as_secs(),
            resident_secs = resident.as_secs(),
            "model unloaded after idle timeout"
        );
        Ok(true)
    }

    /// Current model status without waiting on the lifecycle lock.
    ///
    /// If the lock is held (a load or sweep in progress) this reports
    /// `Loading` rather than blocking the caller.
    pub fn status(&self) -> ModelStatus {
        match self.state.try_lock() {
            Ok(state) => match state.as_ref() {
                Some(loaded) => ModelStatus::Loaded {
                    name: loaded.model.model_name().to_string(),
                    active_uses: loaded.active_uses,
                },
                None => ModelStatus::Unloaded,
            },
            Err(_) => ModelStatus::Loading,
        }
    }
}

impl<C: Clock + 'static> ModelManager<C> {
    /// Run the idle sweep on a fixed period until the task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep().await {
                    warn!("Model unload failed, will retry: {}", e);
                }
            }
        })
    }
}

impl ModelManager<SystemClock> {
    /// Creates a manager using the system clock.
    pub fn new(engine: Arc<dyn SpeechEngine>, config: &ModelConfig) -> Self {
        Self::with_clock(engine, config, SystemClock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::stt::engine::MockEngine;

    fn test_config() -> ModelConfig {
        ModelConfig {
            path: Some(PathBuf::from("/models/ggml-base.bin")),
            language: "auto".to_string(),
            load_timeout_secs: 30,
            infer_timeout_secs: 30,
            idle_timeout_secs: 300,
        }
    }

    fn manager_with(engine: &MockEngine, clock: MockClock) -> ModelManager<MockClock> {
        ModelManager::with_clock(Arc::new(engine.clone()), &test_config(), clock)
    }

    #[tokio::test]
    async fn acquire_loads_once_and_shares() {
        let engine = MockEngine::new();
        let manager = manager_with(&engine, MockClock::new());

        let first = manager.acquire().await.unwrap();
        let second = manager.acquire().await.unwrap();

        assert_eq!(engine.load_count(), 1);
        assert_eq!(
            manager.status(),
            ModelStatus::Loaded {
                name: "ggml-base".to_string(),
                active_uses: 2
            }
        );

        manager.release(first).await;
        manager.release(second).await;
    }

    #[tokio::test]
    async fn release_keeps_model_resident() {
        let engine = MockEngine::new();
        let manager = manager_with(&engine, MockClock::new());

        let lease = manager.acquire().await.unwrap();
        manager.release(lease).await;

        assert_eq!(engine.unload_count(), 0);
        assert_eq!(
            manager.status(),
            ModelStatus::Loaded {
                name: "ggml-base".to_string(),
                active_uses: 0
            }
        );
    }

    #[tokio::test]
    async fn sweep_unloads_only_after_idle_timeout() {
        let engine = MockEngine::new();
        let clock = MockClock::new();
        let manager = manager_with(&engine, clock.clone());

        let lease = manager.acquire().await.unwrap();
        manager.release(lease).await;

        clock.advance(Duration::from_secs(100));
        assert!(!manager.sweep().await.unwrap());

        clock.advance(Duration::from_secs(250));
        assert!(manager.sweep().await.unwrap());
        assert_eq!(engine.unload_count(), 1);
        assert_eq!(manager.status(), ModelStatus::Unloaded);

        // Nothing left to unload
        assert!(!manager.sweep().await.unwrap());
        assert_eq!(engine.unload_count(), 1);
    }

    #[tokio::test]
    async fn sweep_never_unloads_while_leased() {
        let engine = MockEngine::new();
        let clock = MockClock::new();
        let manager = manager_with(&engine, clock.clone());

        let lease = manager.acquire().await.unwrap();
        clock.advance(Duration::from_secs(3600));

        assert!(!manager.sweep().await.unwrap());
        assert_eq!(engine.unload_count(), 0);

        manager.release(lease).await;
    }

    #[tokio::test]
    async fn release_restarts_the_idle_clock() {
        let engine = MockEngine::new();
        let clock = MockClock::new();
        let manager = manager_with(&engine, clock.clone());

        let first = manager.acquire().await.unwrap();
        let second = manager.acquire().await.unwrap();
        manager.release(first).await;

        // Plenty of idle time passes, but the second lease is still out
        clock.advance(Duration::from_secs(500));
        assert!(!manager.sweep().await.unwrap());

        // Idle measurement starts when the last lease comes back
        manager.release(second).await;
        assert!(!manager.sweep().await.unwrap());

        clock.advance(Duration::from_secs(301));
        assert!(manager.sweep().await.unwrap());
    }

    #[tokio::test]
    async fn load_failure_leaves_no_state() {
        let engine = MockEngine::new().with_load_failure();
        let manager = manager_with(&engine, MockClock::new());

        match manager.acquire().await {
            Err(DictadError::LoadFailed { .. }) => {}
            other => panic!("Expected LoadFailed, got {other:?}"),
        }
        assert_eq!(manager.status(), ModelStatus::Unloaded);

        // The next acquire retries the load instead of reusing anything
        assert!(manager.acquire().await.is_err());
        assert_eq!(engine.load_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn load_timeout_leaves_no_state() {
        // Real blocking delay outlives the virtual 30s timeout
        let engine = MockEngine::new().with_load_delay(Duration::from_millis(100));
        let manager = manager_with(&engine, MockClock::new());

        match manager.acquire().await {
            Err(DictadError::LoadTimeout { secs }) => assert_eq!(secs, 30),
            other => panic!("Expected LoadTimeout, got {other:?}"),
        }
        assert_eq!(manager.status(), ModelStatus::Unloaded);
    }

    #[tokio::test]
    async fn acquire_after_unload_reloads() {
        let engine = MockEngine::new();
        let clock = MockClock::new();
        let manager = manager_with(&engine, clock.clone());

        let lease = manager.acquire().await.unwrap();
        manager.release(lease).await;
        clock.advance(Duration::from_secs(301));
        assert!(manager.sweep().await.unwrap());

        let lease = manager.acquire().await.unwrap();
        assert_eq!(engine.load_count(), 2);
        manager.release(lease).await;
    }

    #[tokio::test]
    async fn failed_unload_is_retried_next_sweep() {
        let engine = MockEngine::new().with_unload_failures(1);
        let clock = MockClock::new();
        let manager = manager_with(&engine, clock.clone());

        let lease = manager.acquire().await.unwrap();
        manager.release(lease).await;
        clock.advance(Duration::from_secs(301));

        assert!(manager.sweep().await.is_err());
        assert!(matches!(manager.status(), ModelStatus::Loaded { .. }));

        assert!(manager.sweep().await.unwrap());
        assert_eq!(engine.unload_count(), 1);
        assert_eq!(manager.status(), ModelStatus::Unloaded);
    }

    #[tokio::test]
    async fn lease_runs_inference() {
        let engine = MockEngine::new().with_transcript("leased inference");
        let manager = manager_with(&engine, MockClock::new());

        let lease = manager.acquire().await.unwrap();
        let result = lease.model().infer(&[0i16; 100]).unwrap();
        assert_eq!(result.text, "leased inference");

        manager.release(lease).await;
    }

    #[tokio::test]
    async fn sweeper_task_unloads_in_background() {
        let engine = MockEngine::new();
        let clock = MockClock::new();
        let manager = Arc::new(manager_with(&engine, clock.clone()));

        let lease = manager.acquire().await.unwrap();
        manager.release(lease).await;
        clock.advance(Duration::from_secs(301));

        let sweeper = Arc::clone(&manager).spawn_sweeper(Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        sweeper.abort();

        assert_eq!(manager.status(), ModelStatus::Unloaded);
        assert_eq!(engine.unload_count(), 1);
    }
}
