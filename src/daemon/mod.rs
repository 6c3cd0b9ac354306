//! Daemon runtime: the session slot, the model manager, and the IPC server.
//!
//! The daemon owns exactly one session slot. Each `start` opens a capture
//! source, wires it through the chunker into a fresh [`Session`], and
//! parks the source here so `stop` and `cancel` can end the frame stream
//! without reaching into the session task.
//!
//! [`Session`]: crate::session::Session

pub mod handler;

use crate::audio::AudioSource;
use crate::config::{AudioConfig, Config};
use crate::error::Result;
use crate::ipc::protocol::Event;
use crate::model::ModelManager;
use crate::session::SessionHandle;
use crate::stt::EngineAdapter;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};
use uuid::Uuid;

/// Events kept for slow `listen` subscribers before they start lagging.
const BROADCAST_CAP: usize = 256;

/// Builds a capture source for each new session.
pub type SourceFactory =
    Box<dyn Fn(&AudioConfig) -> Result<Box<dyn AudioSource>> + Send + Sync>;

/// The one live session and the capture source feeding it.
pub struct ActiveSession {
    pub handle: SessionHandle,
    /// Present while capture runs; taken when `stop`/`cancel` closes it.
    pub source: Option<Box<dyn AudioSource>>,
}

/// Daemon state shared by all client connections.
pub struct DaemonState {
    /// Configuration, fixed at startup.
    pub config: Config,
    /// Model lifecycle manager shared across sessions.
    pub manager: Arc<ModelManager>,
    /// Inference adapter handed to each session.
    pub adapter: EngineAdapter,
    /// Session slot (`None` = idle).
    pub active: Mutex<Option<ActiveSession>>,
    /// Fan-out feed for `listen` subscribers.
    pub events: broadcast::Sender<Event>,
    /// Builds the capture source for each session.
    pub source_factory: SourceFactory,
    started_at: Instant,
}

impl DaemonState {
    pub fn new(
        config: Config,
        manager: Arc<ModelManager>,
        adapter: EngineAdapter,
        source_factory: SourceFactory,
    ) -> Self {
        let (events, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            config,
            manager,
            adapter,
            active: Mutex::new(None),
            events,
            source_factory,
            started_at: Instant::now(),
        }
    }

    /// True while the slot holds a session that has not reached a
    /// terminal state. Covers the acquire window before `Recording` too.
    pub async fn is_session_active(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|session| !session.handle.is_finished())
    }

    /// Seconds since the daemon started.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Close the capture source of `session_id`, ending its frame stream.
    ///
    /// The session keeps running until the chunker flushes; closing the
    /// source is how `stop` turns into a final chunk.
    pub async fn close_session_source(&self, session_id: Uuid) {
        let source = {
            let mut active = self.active.lock().await;
            match active.as_mut() {
                Some(session) if session.handle.id() == session_id => session.source.take(),
                _ => None,
            }
        };
        close_source(source).await;
    }

    /// Drop the slot once `session_id`'s terminal event has gone out.
    pub async fn clear_session(&self, session_id: Uuid) {
        let taken = {
            let mut active = self.active.lock().await;
            match active.as_ref() {
                Some(session) if session.handle.id() == session_id => active.take(),
                _ => None,
            }
        };
        if let Some(session) = taken {
            close_source(session.source).await;
        }
    }

    /// Cancel the live session, if any, and close its capture source.
    pub async fn shutdown_session(&self) {
        let source = {
            let mut active = self.active.lock().await;
            match active.as_mut() {
                Some(session) if !session.handle.is_finished() => {
                    info!(session_id = %session.handle.id(), "cancelling session for shutdown");
                    session.handle.cancel();
                    session.source.take()
                }
                _ => None,
            }
        };
        close_source(source).await;
    }
}

/// Close a capture source on the blocking pool; device teardown can stall.
pub(crate) async fn close_source(source: Option<Box<dyn AudioSource>>) {
    let Some(mut source) = source else {
        return;
    };
    match tokio::task::spawn_blocking(move || source.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Failed to close audio source: {}", e),
        Err(e) => warn!("Audio source close task failed: {}", e),
    }
}

/// Run the daemon: bind the socket, serve commands, wait for shutdown.
///
/// Returns after SIGINT, SIGTERM, or an IPC `shutdown` command; all three
/// paths cancel a live session, stop the accept loop, and remove the
/// socket file.
#[cfg(all(feature = "whisper", feature = "cpal-audio"))]
pub async fn run_daemon(config: Config, socket_path: Option<std::path::PathBuf>) -> Result<()> {
    use crate::audio::suppress_audio_warnings;
    use crate::defaults;
    use crate::error::DictadError;
    use crate::ipc::server::IpcServer;
    use crate::stt::{SpeechEngine, WhisperEngine};
    use std::time::Duration;

    suppress_audio_warnings();

    let engine = Arc::new(WhisperEngine::new()) as Arc<dyn SpeechEngine>;
    let manager = Arc::new(ModelManager::new(engine, &config.model));
    let adapter = EngineAdapter::new(config.model.infer_timeout());
    let sweeper = Arc::clone(&manager)
        .spawn_sweeper(Duration::from_secs(defaults::SWEEP_INTERVAL_SECS));

    info!(
        model = %config.model.resolved_path().display(),
        language = %config.model.language,
        "daemon starting"
    );

    let socket_path = socket_path
        .or_else(|| config.daemon.socket.clone())
        .unwrap_or_else(IpcServer::default_socket_path);

    let source_factory: SourceFactory = Box::new(|audio: &AudioConfig| {
        use crate::audio::CpalAudioSource;
        let source = CpalAudioSource::new(audio.device.as_deref())?;
        Ok(Box::new(source) as Box<dyn AudioSource>)
    });

    let state = Arc::new(DaemonState::new(config, manager, adapter, source_factory));
    let command_handler = handler::DaemonCommandHandler::new(Arc::clone(&state));

    let server = Arc::new(IpcServer::new(socket_path));
    info!(socket = %server.socket_path().display(), "daemon ready");

    let server_clone = Arc::clone(&server);
    let mut server_task = tokio::spawn(async move { server_clone.start(command_handler).await });

    let server_result = tokio::select! {
        res = &mut server_task => Some(res),
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
            None
        }
        res = wait_for_sigterm() => {
            if let Err(e) = res {
                warn!("Signal handler setup failed: {}", e);
            }
            info!("received SIGTERM, shutting down");
            None
        }
    };

    state.shutdown_session().await;
    server.stop().await?;
    sweeper.abort();

    let joined = match server_result {
        Some(res) => res,
        None => server_task.await,
    };
    match joined {
        Ok(result) => result?,
        Err(e) => {
            return Err(DictadError::Other(format!("Server task failed: {}", e)));
        }
    }

    info!("daemon stopped");
    Ok(())
}

/// Wait for SIGTERM (systemd's stop signal).
#[cfg(all(feature = "whisper", feature = "cpal-audio", unix))]
async fn wait_for_sigterm() -> Result<()> {
    use crate::error::DictadError;
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| DictadError::Other(format!("Failed to register SIGTERM handler: {}", e)))?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(all(feature = "whisper", feature = "cpal-audio", not(unix)))]
async fn wait_for_sigterm() -> Result<()> {
    // Ctrl+C still works; there is nothing else to wait for here
    std::future::pending::<()>().await
}
