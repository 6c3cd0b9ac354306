//! One dictation session from first audio frame to terminal state.
//!
//! A [`Session`] owns the model lease and the state machine for a single
//! dictation. It consumes segmented audio from the chunker, runs each
//! segment through the engine adapter, and reports everything that happens
//! as [`SessionEvent`]s on a single channel, in order. The audio source
//! itself belongs to the daemon; the session only sees the chunk stream,
//! so speech captured while the model is still loading queues up in the
//! channel instead of being lost.

pub mod state;

pub use state::SessionState;

use crate::audio::ChunkerEvent;
use crate::clock::{Clock, SystemClock};
use crate::error::DictadError;
use crate::ipc::protocol::ErrorCode;
use crate::model::{ModelLease, ModelManager};
use crate::stt::{EngineAdapter, Transcription};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Text produced for one segment, or the whole session on the final result.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionResult {
    pub session_id: Uuid,
    /// Position in the session's event stream, strictly increasing.
    pub sequence: u64,
    /// Segment text for partials; the full joined transcript on the final.
    pub text: String,
    pub confidence: Option<f32>,
    pub is_final: bool,
}

/// Everything a session reports while it runs.
///
/// Events arrive in the order they happened. The last event of every
/// session is a `StateChanged` to a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        session_id: Uuid,
        state: SessionState,
    },
    Result(TranscriptionResult),
    Failed {
        session_id: Uuid,
        code: Option<ErrorCode>,
        message: String,
    },
}

impl SessionEvent {
    /// The session this event belongs to.
    pub fn session_id(&self) -> Uuid {
        match self {
            SessionEvent::StateChanged { session_id, .. }
            | SessionEvent::Failed { session_id, .. } => *session_id,
            SessionEvent::Result(result) => result.session_id,
        }
    }
}

/// Shared view of a running session.
///
/// The daemon keeps the handle after spawning [`Session::run`] so status
/// queries and cancel requests work without touching the session task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Uuid,
    state: Arc<Mutex<SessionState>>,
    cancel: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current state, as last written by the session task.
    pub fn state(&self) -> SessionState {
        read_state(&self.state)
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Ask the session to stop without delivering further results.
    ///
    /// The flag is honored at the next loop turn, so a result from an
    /// inference already in flight is discarded rather than delivered.
    /// The caller should also close the audio source so the chunker ends
    /// its stream promptly.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

/// How the chunk loop ended. `run` turns this into the terminal events.
enum Outcome {
    Completed,
    Cancelled,
    Failed(DictadError),
}

/// A single dictation session.
pub struct Session<C: Clock = SystemClock> {
    id: Uuid,
    state: Arc<Mutex<SessionState>>,
    cancel: Arc<AtomicBool>,
    manager: Arc<ModelManager<C>>,
    adapter: EngineAdapter,
    events: mpsc::Sender<SessionEvent>,
    sequence: u64,
    transcript: Vec<String>,
    confidences: Vec<f32>,
}

impl<C: Clock> Session<C> {
    /// Create a session in `Idle` and the handle the daemon keeps for it.
    pub fn new(
        manager: Arc<ModelManager<C>>,
        adapter: EngineAdapter,
        events: mpsc::Sender<SessionEvent>,
    ) -> (Self, SessionHandle) {
        let id = Uuid::new_v4();
        let state = Arc::new(Mutex::new(SessionState::Idle));
        let cancel = Arc::new(AtomicBool::new(false));

        let handle = SessionHandle {
            id,
            state: Arc::clone(&state),
            cancel: Arc::clone(&cancel),
        };
        let session = Self {
            id,
            state,
            cancel,
            manager,
            adapter,
            events,
            sequence: 0,
            transcript: Vec::new(),
            confidences: Vec::new(),
        };
        (session, handle)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Run the session to a terminal state.
    ///
    /// Acquires the model, drives the chunk loop, then releases the lease
    /// before the terminal event goes out. A receiver that sees `Done` or
    /// `Error` can rely on the model use count already being dropped.
    pub async fn run(mut self, mut chunks: mpsc::Receiver<ChunkerEvent>) {
        let lease = match self.manager.acquire().await {
            Ok(lease) => lease,
            Err(e) => {
                self.fail(e).await;
                return;
            }
        };

        let outcome = self.drive(&mut chunks, &lease).await;

        // Chunks still queued after the loop ends are discarded.
        drop(chunks);
        self.manager.release(lease).await;

        match outcome {
            Outcome::Completed => self.transition(SessionState::Done).await,
            Outcome::Cancelled => self.fail(DictadError::Cancelled).await,
            Outcome::Failed(e) => self.fail(e).await,
        }
    }

    /// Consume chunker events until the session is over, one way or another.
    ///
    /// Segments are processed strictly in order; the next chunk waits in
    /// the channel while the current one is being transcribed.
    async fn drive(
        &mut self,
        chunks: &mut mpsc::Receiver<ChunkerEvent>,
        lease: &ModelLease,
    ) -> Outcome {
        if self.cancelled() {
            return Outcome::Cancelled;
        }
        self.transition(SessionState::Recording).await;

        while let Some(event) = chunks.recv().await {
            if self.cancelled() {
                return Outcome::Cancelled;
            }

            match event {
                ChunkerEvent::Chunk(chunk) => {
                    let next = if chunk.is_final {
                        SessionState::Finalizing
                    } else {
                        SessionState::Transcribing
                    };
                    self.transition(next).await;

                    // A final chunk flushed during silence can be empty;
                    // skip the engine call instead of transcribing nothing.
                    let inferred = if chunk.samples.is_empty() {
                        Ok(Transcription {
                            text: String::new(),
                            confidence: None,
                        })
                    } else {
                        self.adapter.transcribe(lease.model(), chunk.samples).await
                    };

                    // A cancel that landed during inference wins over the
                    // result and over any inference error.
                    if self.cancelled() {
                        return Outcome::Cancelled;
                    }
                    let transcription = match inferred {
                        Ok(transcription) => transcription,
                        Err(e) => return Outcome::Failed(e),
                    };

                    if let Some(confidence) = transcription.confidence {
                        self.confidences.push(confidence);
                    }
                    let text = transcription.text.trim().to_string();
                    if !text.is_empty() {
                        self.transcript.push(text.clone());
                    }

                    if chunk.is_final {
                        let full = self.transcript.join(" ");
                        let confidence = self.mean_confidence();
                        self.emit_result(full, confidence, true).await;
                        return Outcome::Completed;
                    }
                    self.emit_result(text, transcription.confidence, false).await;
                    self.transition(SessionState::Recording).await;
                }
                ChunkerEvent::NoSpeech => {
                    self.transition(SessionState::Finalizing).await;
                    self.emit_result(String::new(), None, true).await;
                    return Outcome::Completed;
                }
                ChunkerEvent::Fatal { message } => {
                    return Outcome::Failed(DictadError::Device { message });
                }
            }
        }

        if self.cancelled() {
            Outcome::Cancelled
        } else {
            // The chunker task ended without a final chunk or a fatal
            // event, so the capture side must have been torn down.
            Outcome::Failed(DictadError::Device {
                message: "Audio pipeline ended unexpectedly".to_string(),
            })
        }
    }

    /// Report the failure, then move to `Error`.
    async fn fail(&mut self, err: DictadError) {
        warn!(session_id = %self.id, "session failed: {}", err);
        self.emit(SessionEvent::Failed {
            session_id: self.id,
            code: ErrorCode::from_error(&err),
            message: err.to_string(),
        })
        .await;
        self.transition(SessionState::Error).await;
    }

    async fn transition(&mut self, next: SessionState) {
        let current = read_state(&self.state);
        debug_assert!(
            current.can_transition_to(next),
            "invalid session transition {current} -> {next}"
        );
        write_state(&self.state, next);
        debug!(session_id = %self.id, from = %current, to = %next, "session state");
        self.emit(SessionEvent::StateChanged {
            session_id: self.id,
            state: next,
        })
        .await;
    }

    async fn emit_result(&mut self, text: String, confidence: Option<f32>, is_final: bool) {
        let result = TranscriptionResult {
            session_id: self.id,
            sequence: self.sequence,
            text,
            confidence,
            is_final,
        };
        self.sequence += 1;
        self.emit(SessionEvent::Result(result)).await;
    }

    /// Send an event; a dropped receiver is logged, not fatal. The session
    /// still has to finish so the lease goes back to the manager.
    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            debug!(session_id = %self.id, "event receiver dropped, session continues");
        }
    }

    fn mean_confidence(&self) -> Option<f32> {
        if self.confidences.is_empty() {
            return None;
        }
        Some(self.confidences.iter().sum::<f32>() / self.confidences.len() as f32)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// The state value stays readable even if a writer panicked mid-update;
/// `SessionState` is plain data, so the poisoned value is still the last
/// one written.
fn read_state(cell: &Mutex<SessionState>) -> SessionState {
    match cell.lock() {
        Ok(state) => *state,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

fn write_state(cell: &Mutex<SessionState>, next: SessionState) {
    match cell.lock() {
        Ok(mut state) => *state = next,
        Err(poisoned) => *poisoned.into_inner() = next,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioChunk;
    use crate::config::ModelConfig;
    use crate::model::ModelStatus;
    use crate::stt::{MockEngine, SpeechEngine};
    use std::path::PathBuf;
    use std::time::Duration;

    fn test_config() -> ModelConfig {
        ModelConfig {
            path: Some(PathBuf::from("/models/ggml-base.bin")),
            language: "auto".to_string(),
            load_timeout_secs: 30,
            infer_timeout_secs: 30,
            idle_timeout_secs: 300,
        }
    }

    struct TestSession {
        chunk_tx: mpsc::Sender<ChunkerEvent>,
        events_rx: mpsc::Receiver<SessionEvent>,
        handle: SessionHandle,
        task: tokio::task::JoinHandle<()>,
        manager: Arc<ModelManager>,
        engine: MockEngine,
    }

    fn spawn_session(engine: MockEngine) -> TestSession {
        spawn_session_with_config(engine, test_config())
    }

    fn spawn_session_with_config(engine: MockEngine, config: ModelConfig) -> TestSession {
        let manager = Arc::new(ModelManager::new(
            Arc::new(engine.clone()) as Arc<dyn SpeechEngine>,
            &config,
        ));
        let adapter = EngineAdapter::new(config.infer_timeout());
        let (events_tx, events_rx) = mpsc::channel(32);
        let (chunk_tx, chunk_rx) = mpsc::channel(32);

        let (session, handle) = Session::new(Arc::clone(&manager), adapter, events_tx);
        let task = tokio::spawn(session.run(chunk_rx));

        TestSession {
            chunk_tx,
            events_rx,
            handle,
            task,
            manager,
            engine,
        }
    }

    fn speech_chunk(chunk_id: u64, is_final: bool) -> ChunkerEvent {
        ChunkerEvent::Chunk(AudioChunk {
            chunk_id,
            start_sequence: chunk_id * 10,
            end_sequence: chunk_id * 10 + 9,
            sample_rate: 16_000,
            samples: vec![2000i16; 1600],
            is_final,
        })
    }

    /// Drain the event stream; returns once the session task has finished
    /// and dropped its sender.
    async fn collect_events(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn states(events: &[SessionEvent]) -> Vec<SessionState> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    fn results(events: &[SessionEvent]) -> Vec<&TranscriptionResult> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Result(result) => Some(result),
                _ => None,
            })
            .collect()
    }

    fn failure_code(events: &[SessionEvent]) -> Option<Option<ErrorCode>> {
        events.iter().find_map(|e| match e {
            SessionEvent::Failed { code, .. } => Some(*code),
            _ => None,
        })
    }

    #[tokio::test]
    async fn three_partials_then_final() {
        let engine = MockEngine::new()
            .with_transcripts(&["one", "two", "three", "four"])
            .with_confidence(0.5);
        let mut t = spawn_session(engine);

        for i in 0..3 {
            t.chunk_tx.send(speech_chunk(i, false)).await.unwrap();
        }
        t.chunk_tx.send(speech_chunk(3, true)).await.unwrap();
        drop(t.chunk_tx);

        let events = collect_events(&mut t.events_rx).await;
        t.task.await.unwrap();

        assert_eq!(
            states(&events),
            vec![
                SessionState::Recording,
                SessionState::Transcribing,
                SessionState::Recording,
                SessionState::Transcribing,
                SessionState::Recording,
                SessionState::Transcribing,
                SessionState::Recording,
                SessionState::Finalizing,
                SessionState::Done,
            ]
        );

        let results = results(&events);
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].text, "one");
        assert!(!results[0].is_final);
        assert_eq!(results[0].confidence, Some(0.5));
        assert_eq!(results[3].text, "one two three four");
        assert!(results[3].is_final);
        assert_eq!(results[3].confidence, Some(0.5));
        for pair in results.windows(2) {
            assert!(pair[0].sequence < pair[1].sequence);
        }

        match events.last() {
            Some(SessionEvent::StateChanged { state, .. }) => {
                assert_eq!(*state, SessionState::Done)
            }
            other => panic!("Expected terminal state change, got {other:?}"),
        }

        assert_eq!(t.handle.state(), SessionState::Done);
        assert!(t.handle.is_finished());
        assert_eq!(t.engine.infer_count(), 4);
        assert_eq!(
            t.manager.status(),
            ModelStatus::Loaded {
                name: "ggml-base".to_string(),
                active_uses: 0
            }
        );
    }

    #[tokio::test]
    async fn no_speech_emits_empty_final() {
        let mut t = spawn_session(MockEngine::new());

        t.chunk_tx.send(ChunkerEvent::NoSpeech).await.unwrap();
        drop(t.chunk_tx);

        let events = collect_events(&mut t.events_rx).await;
        t.task.await.unwrap();

        let results = results(&events);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "");
        assert!(results[0].is_final);
        assert_eq!(results[0].confidence, None);
        assert_eq!(t.engine.infer_count(), 0);
        assert_eq!(t.handle.state(), SessionState::Done);
    }

    #[tokio::test]
    async fn load_failure_goes_straight_to_error() {
        let mut t = spawn_session(MockEngine::new().with_load_failure());
        drop(t.chunk_tx);

        let events = collect_events(&mut t.events_rx).await;
        t.task.await.unwrap();

        // No Recording state was ever reached
        assert_eq!(states(&events), vec![SessionState::Error]);
        assert_eq!(events.len(), 2);
        match &events[0] {
            SessionEvent::Failed { code, message, .. } => {
                assert_eq!(*code, Some(ErrorCode::LoadFailed));
                assert!(message.contains("mock load failure"), "message: {message}");
            }
            other => panic!("Expected Failed, got {other:?}"),
        }
        assert_eq!(t.handle.state(), SessionState::Error);
        assert_eq!(t.manager.status(), ModelStatus::Unloaded);
    }

    #[tokio::test]
    async fn load_timeout_fails_the_session() {
        let engine = MockEngine::new().with_load_delay(Duration::from_millis(200));
        let mut config = test_config();
        config.load_timeout_secs = 0;
        let mut t = spawn_session_with_config(engine, config);
        drop(t.chunk_tx);

        let events = collect_events(&mut t.events_rx).await;
        t.task.await.unwrap();

        assert_eq!(failure_code(&events), Some(Some(ErrorCode::LoadTimeout)));
        assert_eq!(t.handle.state(), SessionState::Error);
    }

    #[tokio::test]
    async fn infer_failure_fails_the_session_but_keeps_the_model() {
        let mut t = spawn_session(MockEngine::new().with_infer_failure());

        t.chunk_tx.send(speech_chunk(0, false)).await.unwrap();
        drop(t.chunk_tx);

        let events = collect_events(&mut t.events_rx).await;
        t.task.await.unwrap();

        assert!(results(&events).is_empty());
        assert_eq!(failure_code(&events), Some(Some(ErrorCode::InferFailed)));
        assert_eq!(t.handle.state(), SessionState::Error);
        // The lease came back even though the session failed
        assert_eq!(
            t.manager.status(),
            ModelStatus::Loaded {
                name: "ggml-base".to_string(),
                active_uses: 0
            }
        );
    }

    #[tokio::test]
    async fn capture_failure_reports_device_error() {
        let mut t = spawn_session(MockEngine::new());

        t.chunk_tx
            .send(ChunkerEvent::Fatal {
                message: "ALSA buffer underrun".to_string(),
            })
            .await
            .unwrap();
        drop(t.chunk_tx);

        let events = collect_events(&mut t.events_rx).await;
        t.task.await.unwrap();

        assert_eq!(states(&events), vec![SessionState::Recording, SessionState::Error]);
        match &events[events.len() - 2] {
            SessionEvent::Failed { code, message, .. } => {
                assert_eq!(*code, Some(ErrorCode::DeviceError));
                assert!(message.contains("ALSA buffer underrun"), "message: {message}");
            }
            other => panic!("Expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_mid_inference_discards_the_result() {
        let engine = MockEngine::new()
            .with_transcript("should never be delivered")
            .with_infer_delay(Duration::from_millis(500));
        let mut t = spawn_session(engine);

        t.chunk_tx.send(speech_chunk(0, false)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        t.handle.cancel();
        drop(t.chunk_tx);

        let events = collect_events(&mut t.events_rx).await;
        t.task.await.unwrap();

        assert!(results(&events).is_empty());
        assert_eq!(failure_code(&events), Some(Some(ErrorCode::Cancelled)));
        assert_eq!(t.engine.infer_count(), 1);
        assert_eq!(t.handle.state(), SessionState::Error);
    }

    #[tokio::test]
    async fn cancel_before_a_chunk_skips_inference() {
        let mut t = spawn_session(MockEngine::new());

        tokio::time::sleep(Duration::from_millis(20)).await;
        t.handle.cancel();
        t.chunk_tx.send(speech_chunk(0, false)).await.unwrap();
        drop(t.chunk_tx);

        let events = collect_events(&mut t.events_rx).await;
        t.task.await.unwrap();

        assert!(results(&events).is_empty());
        assert_eq!(failure_code(&events), Some(Some(ErrorCode::Cancelled)));
        assert_eq!(t.engine.infer_count(), 0);
    }

    #[tokio::test]
    async fn empty_final_chunk_skips_inference() {
        let engine = MockEngine::new().with_transcript("hello world").with_confidence(0.5);
        let mut t = spawn_session(engine);

        t.chunk_tx.send(speech_chunk(0, false)).await.unwrap();
        t.chunk_tx
            .send(ChunkerEvent::Chunk(AudioChunk {
                chunk_id: 1,
                start_sequence: 10,
                end_sequence: 10,
                sample_rate: 16_000,
                samples: Vec::new(),
                is_final: true,
            }))
            .await
            .unwrap();
        drop(t.chunk_tx);

        let events = collect_events(&mut t.events_rx).await;
        t.task.await.unwrap();

        let results = results(&events);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].text, "hello world");
        assert_eq!(results[1].text, "hello world");
        assert!(results[1].is_final);
        assert_eq!(results[1].confidence, Some(0.5));
        assert_eq!(t.engine.infer_count(), 1);
        assert_eq!(t.handle.state(), SessionState::Done);
    }

    #[test]
    fn handle_reports_idle_before_run() {
        let manager = Arc::new(ModelManager::new(
            Arc::new(MockEngine::new()) as Arc<dyn SpeechEngine>,
            &test_config(),
        ));
        let (events_tx, _events_rx) = mpsc::channel(32);
        let adapter = EngineAdapter::new(Duration::from_secs(30));

        let (session, handle) = Session::new(manager, adapter, events_tx);

        assert_eq!(handle.id(), session.id());
        assert_eq!(handle.state(), SessionState::Idle);
        assert!(!handle.is_active());
        assert!(!handle.is_finished());
    }

    #[tokio::test]
    async fn chunk_stream_closing_early_fails_the_session() {
        let mut t = spawn_session(MockEngine::new());
        drop(t.chunk_tx);

        let events = collect_events(&mut t.events_rx).await;
        t.task.await.unwrap();

        match events.iter().find(|e| matches!(e, SessionEvent::Failed { .. })) {
            Some(SessionEvent::Failed { code, message, .. }) => {
                assert_eq!(*code, Some(ErrorCode::DeviceError));
                assert!(message.contains("ended unexpectedly"), "message: {message}");
            }
            other => panic!("Expected Failed, got {other:?}"),
        }
        assert_eq!(t.handle.state(), SessionState::Error);
    }

    #[tokio::test]
    async fn session_finishes_after_event_receiver_dropped() {
        let mut t = spawn_session(MockEngine::new().with_transcript("logged anyway"));
        drop(t.events_rx);

        t.chunk_tx.send(speech_chunk(0, true)).await.unwrap();
        drop(t.chunk_tx);
        t.task.await.unwrap();

        assert!(t.handle.is_finished());
        assert_eq!(t.handle.state(), SessionState::Done);
        // The lease was still released with nobody listening
        assert_eq!(
            t.manager.status(),
            ModelStatus::Loaded {
                name: "ggml-base".to_string(),
                active_uses: 0
            }
        );
    }

    #[tokio::test]
    async fn session_ids_are_unique() {
        let t1 = spawn_session(MockEngine::new());
        let t2 = spawn_session(MockEngine::new());
        assert_ne!(t1.handle.id(), t2.handle.id());
    }
}
