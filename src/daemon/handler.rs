//! Command handler implementation for the daemon.
//!
//! Translates IPC commands into session lifecycle operations. The busy
//! gate lives here: one live session at a time, a second `start` is
//! rejected immediately instead of queued.

use crate::audio::{AudioChunker, ChunkerConfig};
use crate::daemon::{ActiveSession, DaemonState, close_source};
use crate::ipc::protocol::{Command, ErrorCode, Event};
use crate::ipc::server::{CommandHandler, Dispatch};
use crate::model::ModelStatus;
use crate::session::{Session, SessionEvent, SessionHandle, SessionState};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

/// Events buffered per client connection.
const EVENT_CHANNEL_CAP: usize = 64;

/// Command handler for daemon IPC commands.
pub struct DaemonCommandHandler {
    state: Arc<DaemonState>,
}

impl DaemonCommandHandler {
    pub fn new(state: Arc<DaemonState>) -> Self {
        Self { state }
    }

    /// Start a session and stream its events back on the connection.
    async fn start_session(&self) -> Dispatch {
        let mut active = self.state.active.lock().await;

        if let Some(session) = active.as_ref() {
            if !session.handle.is_finished() {
                return Dispatch::Reply(Event::Error {
                    session_id: Some(session.handle.id()),
                    error_code: Some(ErrorCode::Busy),
                    message: "Another session is active".to_string(),
                });
            }
            // The previous session reached a terminal state; reclaim the slot.
        }

        // Capture starts before the model acquire so speech during a slow
        // load queues up in the chunk channel instead of being lost.
        let mut source = match (self.state.source_factory)(&self.state.config.audio) {
            Ok(source) => source,
            Err(e) => return Dispatch::Reply(session_error(&e)),
        };
        let frames = match source.open() {
            Ok(frames) => frames,
            Err(e) => return Dispatch::Reply(session_error(&e)),
        };

        let chunker = AudioChunker::new(ChunkerConfig::from_audio(&self.state.config.audio));
        let (chunk_tx, chunk_rx) = mpsc::channel(EVENT_CHANNEL_CAP);
        tokio::spawn(chunker.run(frames, chunk_tx));

        let (session_tx, session_rx) = mpsc::channel(EVENT_CHANNEL_CAP);
        let (session, handle) = Session::new(
            Arc::clone(&self.state.manager),
            self.state.adapter.clone(),
            session_tx,
        );
        info!(session_id = %session.id(), "session started");
        tokio::spawn(session.run(chunk_rx));

        *active = Some(ActiveSession {
            handle: handle.clone(),
            source: Some(source),
        });
        drop(active);

        let (client_tx, client_rx) = mpsc::channel(EVENT_CHANNEL_CAP);
        tokio::spawn(forward_session_events(
            Arc::clone(&self.state),
            handle,
            session_rx,
            client_tx,
        ));

        Dispatch::Stream(client_rx)
    }

    /// Close the capture source so the session finalizes and delivers.
    async fn stop_session(&self, session_id: Option<Uuid>) -> Dispatch {
        let (id, source) = {
            let mut active = self.state.active.lock().await;
            let Some(session) = live_session(&mut active) else {
                return Dispatch::Reply(no_active_session());
            };
            if let Some(event) = check_session_id(&session.handle, session_id) {
                return Dispatch::Reply(event);
            }
            (session.handle.id(), session.source.take())
        };

        close_source(source).await;
        info!(session_id = %id, "stop requested, finalizing");
        Dispatch::Reply(Event::Ok)
    }

    /// Cancel the session; buffered audio and in-flight results are dropped.
    async fn cancel_session(&self, session_id: Option<Uuid>) -> Dispatch {
        let (id, source) = {
            let mut active = self.state.active.lock().await;
            let Some(session) = live_session(&mut active) else {
                return Dispatch::Reply(no_active_session());
            };
            if let Some(event) = check_session_id(&session.handle, session_id) {
                return Dispatch::Reply(event);
            }
            session.handle.cancel();
            (session.handle.id(), session.source.take())
        };

        close_source(source).await;
        info!(session_id = %id, "session cancelled by client");
        Dispatch::Reply(Event::Ok)
    }

    async fn status(&self) -> Dispatch {
        let (state, session_id) = {
            let active = self.state.active.lock().await;
            match active.as_ref() {
                Some(session) if !session.handle.is_finished() => {
                    (session.handle.state(), Some(session.handle.id()))
                }
                // A finished session reads as idle until its slot is reused
                _ => (SessionState::Idle, None),
            }
        };

        let (model_loaded, model_name) = match self.state.manager.status() {
            ModelStatus::Loaded { name, .. } => (true, Some(name)),
            ModelStatus::Loading | ModelStatus::Unloaded => (false, None),
        };

        let audio = &self.state.config.audio;
        Dispatch::Reply(Event::Status {
            version: crate::version_string(),
            state,
            session_id,
            model_loaded,
            model_name,
            uptime_secs: self.state.uptime_secs(),
            device: audio.device.clone(),
            sample_rate: audio.sample_rate,
            vad_threshold: audio.vad_threshold,
        })
    }

    /// Subscribe this connection to the daemon-wide event feed.
    fn listen(&self) -> Dispatch {
        let mut feed = self.state.events.subscribe();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAP);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = feed.recv() => match received {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "listen subscriber lagging, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = tx.closed() => break,
                }
            }
        });

        Dispatch::Stream(rx)
    }

    async fn shutdown(&self) -> Dispatch {
        info!("shutdown requested over ipc");
        self.state.shutdown_session().await;
        Dispatch::Shutdown(Event::Ok)
    }
}

#[async_trait::async_trait]
impl CommandHandler for DaemonCommandHandler {
    async fn handle(&self, command: Command) -> Dispatch {
        match command {
            Command::Start => self.start_session().await,
            Command::Stop { session_id } => self.stop_session(session_id).await,
            Command::Cancel { session_id } => self.cancel_session(session_id).await,
            Command::Status => self.status().await,
            Command::Listen => self.listen(),
            Command::Shutdown => self.shutdown().await,
        }
    }
}

/// Pump one session's events to the owning client and the broadcast feed.
///
/// The owning client hanging up counts as an implicit cancel; `listen`
/// subscribers still see the session through to its terminal event. Once
/// the terminal state change is out, the session slot is cleared.
async fn forward_session_events(
    state: Arc<DaemonState>,
    handle: SessionHandle,
    mut session_rx: mpsc::Receiver<SessionEvent>,
    client_tx: mpsc::Sender<Event>,
) {
    let mut client_gone = false;
    let mut saw_terminal = false;

    loop {
        tokio::select! {
            maybe_event = session_rx.recv() => {
                let Some(event) = maybe_event else { break };
                let terminal = matches!(
                    event,
                    SessionEvent::StateChanged { state, .. } if state.is_terminal()
                );
                let event = Event::from(event);

                // No listen subscribers is the normal case, not an error
                let _ = state.events.send(event.clone());

                if !client_gone && client_tx.send(event).await.is_err() {
                    client_gone = true;
                    if !terminal {
                        info!(session_id = %handle.id(), "client disconnected, cancelling session");
                        handle.cancel();
                        state.close_session_source(handle.id()).await;
                    }
                }

                if terminal {
                    saw_terminal = true;
                    state.clear_session(handle.id()).await;
                }
            }
            // Fires even while the session is quiet, so a hangup during
            // silence still cancels promptly.
            _ = client_tx.closed(), if !client_gone && !saw_terminal => {
                client_gone = true;
                info!(session_id = %handle.id(), "client disconnected, cancelling session");
                handle.cancel();
                state.close_session_source(handle.id()).await;
            }
        }
    }

    if !saw_terminal {
        // The session task ended without reporting a terminal state; free
        // the slot anyway so the daemon does not stay busy forever.
        warn!(session_id = %handle.id(), "session event stream ended without a terminal state");
        state.clear_session(handle.id()).await;
    }
}

/// The slot's session if it has not finished, clearing guards for the
/// common "nothing running" reply.
fn live_session(
    active: &mut Option<ActiveSession>,
) -> Option<&mut ActiveSession> {
    active
        .as_mut()
        .filter(|session| !session.handle.is_finished())
}

/// Reject commands aimed at a session other than the live one.
fn check_session_id(handle: &SessionHandle, requested: Option<Uuid>) -> Option<Event> {
    match requested {
        Some(id) if id != handle.id() => Some(Event::Error {
            session_id: Some(id),
            error_code: None,
            message: format!("No session {}", id),
        }),
        _ => None,
    }
}

fn no_active_session() -> Event {
    Event::Error {
        session_id: None,
        error_code: None,
        message: "No active session".to_string(),
    }
}

fn session_error(err: &crate::error::DictadError) -> Event {
    Event::Error {
        session_id: None,
        error_code: ErrorCode::from_error(err),
        message: err.to_string(),
    }
}
