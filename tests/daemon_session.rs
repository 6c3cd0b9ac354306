//! End-to-end daemon tests: a real Unix socket server wired to mock audio
//! and a mock engine, exercised through the IPC client the CLI uses.

use dictad::audio::{AudioSource, MockAudioSource};
use dictad::config::{Config, ModelConfig};
use dictad::daemon::handler::DaemonCommandHandler;
use dictad::daemon::{DaemonState, SourceFactory};
use dictad::error::DictadError;
use dictad::ipc::client::{EventStream, send_command, stream_command};
use dictad::ipc::protocol::{Command, ErrorCode, Event};
use dictad::ipc::server::IpcServer;
use dictad::model::ModelManager;
use dictad::session::SessionState;
use dictad::stt::{EngineAdapter, MockEngine, SpeechEngine};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

/// A daemon on a throwaway socket, serving until the test ends.
struct TestDaemon {
    socket_path: PathBuf,
    server: JoinHandle<dictad::error::Result<()>>,
    _workdir: TempDir,
}

/// Hands out the given sources one start at a time.
fn scripted_sources(sources: Vec<MockAudioSource>) -> SourceFactory {
    let sources = std::sync::Mutex::new(sources.into_iter());
    Box::new(move |_| match sources.lock() {
        Ok(mut iter) => match iter.next() {
            Some(source) => Ok(Box::new(source) as Box<dyn AudioSource>),
            None => Err(DictadError::Device {
                message: "No scripted source left".to_string(),
            }),
        },
        Err(_) => Err(DictadError::Device {
            message: "Source factory poisoned".to_string(),
        }),
    })
}

async fn spawn_daemon(engine: MockEngine, sources: Vec<MockAudioSource>) -> TestDaemon {
    let workdir = TempDir::new().expect("temp dir");
    let socket_path = workdir.path().join("dictad.sock");

    let config = Config {
        model: ModelConfig {
            path: Some(PathBuf::from("/models/ggml-base.bin")),
            ..ModelConfig::default()
        },
        ..Config::default()
    };
    let manager = Arc::new(ModelManager::new(
        Arc::new(engine) as Arc<dyn SpeechEngine>,
        &config.model,
    ));
    let adapter = EngineAdapter::new(config.model.infer_timeout());
    let state = Arc::new(DaemonState::new(
        config,
        manager,
        adapter,
        scripted_sources(sources),
    ));
    let handler = DaemonCommandHandler::new(state);

    let server = Arc::new(IpcServer::new(socket_path.clone()));
    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            server.start(handler).await?;
            server.stop().await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestDaemon {
        socket_path,
        server: server_task,
        _workdir: workdir,
    }
}

/// Three loud frames then end of stream: one final chunk, no partials.
fn speech_source() -> MockAudioSource {
    MockAudioSource::new().with_frames(vec![vec![2000i16; 1600]; 3])
}

/// Speech frames, then the stream stays open until the daemon closes it.
fn held_speech_source() -> MockAudioSource {
    MockAudioSource::new()
        .with_frames(vec![vec![2000i16; 1600]; 3])
        .with_hold_open()
}

/// Silent source that stays open until the daemon closes it.
fn open_ended_source() -> MockAudioSource {
    MockAudioSource::new().with_hold_open()
}

async fn next_event(stream: &mut EventStream) -> Event {
    match timeout(Duration::from_secs(5), stream.next_event()).await {
        Ok(Ok(Some(event))) => event,
        other => panic!("Expected an event, got {:?}", other),
    }
}

/// Read events until the session reports `Recording`; returns its id.
async fn await_recording(stream: &mut EventStream) -> Uuid {
    loop {
        match next_event(stream).await {
            Event::StateChange { session_id, state } if state == SessionState::Recording => {
                return session_id;
            }
            Event::StateChange { .. } => {}
            other => panic!("Expected a state change, got {:?}", other),
        }
    }
}

/// Collect the rest of the stream until the daemon closes it.
async fn drain_stream(mut stream: EventStream) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        match timeout(Duration::from_secs(5), stream.next_event()).await {
            Ok(Ok(Some(event))) => events.push(event),
            Ok(Ok(None)) => return events,
            Ok(Err(e)) => panic!("Event stream failed: {}", e),
            Err(_) => panic!("Timed out draining the stream, got: {:?}", events),
        }
    }
}

fn final_texts(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::FinalResult { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

fn last_state(events: &[Event]) -> SessionState {
    match events.last() {
        Some(Event::StateChange { state, .. }) => *state,
        other => panic!("Expected a trailing state change, got {:?}", other),
    }
}

#[tokio::test]
async fn status_round_trip_when_idle() {
    let daemon = spawn_daemon(MockEngine::new(), vec![]).await;

    let event = send_command(&daemon.socket_path, Command::Status)
        .await
        .unwrap();
    match event {
        Event::Status {
            version,
            state,
            session_id,
            model_loaded,
            model_name,
            uptime_secs,
            device,
            sample_rate,
            vad_threshold,
        } => {
            assert_eq!(version, dictad::version_string());
            assert_eq!(state, SessionState::Idle);
            assert_eq!(session_id, None);
            assert!(!model_loaded);
            assert_eq!(model_name, None);
            assert!(uptime_secs < 5);
            assert_eq!(device, None);
            assert_eq!(sample_rate, 16_000);
            assert!((vad_threshold - 0.02).abs() < f32::EPSILON);
        }
        other => panic!("Expected Status, got {:?}", other),
    }
}

#[tokio::test]
async fn dictation_session_runs_start_to_done_over_the_socket() {
    let engine = MockEngine::new()
        .with_transcript("the quick brown fox")
        .with_confidence(0.5);
    let daemon = spawn_daemon(engine, vec![speech_source()]).await;

    let mut stream = stream_command(&daemon.socket_path, Command::Start)
        .await
        .unwrap();
    let session_id = await_recording(&mut stream).await;
    let events = drain_stream(stream).await;

    assert_eq!(final_texts(&events), vec!["the quick brown fox".to_string()]);
    let final_confidence = events.iter().find_map(|e| match e {
        Event::FinalResult { confidence, .. } => Some(*confidence),
        _ => None,
    });
    assert_eq!(final_confidence, Some(Some(0.5)));
    assert_eq!(last_state(&events), SessionState::Done);
    assert!(
        events.iter().all(|e| match e {
            Event::StateChange { session_id: id, .. }
            | Event::FinalResult { session_id: id, .. }
            | Event::PartialResult { session_id: id, .. } => *id == session_id,
            _ => true,
        }),
        "every event belongs to the session, got: {:?}",
        events
    );

    // The model stays warm for the next session
    let status = send_command(&daemon.socket_path, Command::Status)
        .await
        .unwrap();
    match status {
        Event::Status {
            state,
            session_id,
            model_loaded,
            model_name,
            ..
        } => {
            assert_eq!(state, SessionState::Idle);
            assert_eq!(session_id, None);
            assert!(model_loaded);
            assert_eq!(model_name, Some("ggml-base".to_string()));
        }
        other => panic!("Expected Status, got {:?}", other),
    }
}

#[tokio::test]
async fn second_start_is_rejected_while_busy() {
    let daemon = spawn_daemon(MockEngine::new(), vec![open_ended_source()]).await;

    let mut stream = stream_command(&daemon.socket_path, Command::Start)
        .await
        .unwrap();
    let live_id = await_recording(&mut stream).await;

    let event = send_command(&daemon.socket_path, Command::Start)
        .await
        .unwrap();
    match event {
        Event::Error {
            session_id,
            error_code,
            message,
        } => {
            assert_eq!(session_id, Some(live_id));
            assert_eq!(error_code, Some(ErrorCode::Busy));
            assert_eq!(message, "Another session is active");
        }
        other => panic!("Expected busy error, got {:?}", other),
    }

    let reply = send_command(&daemon.socket_path, Command::Cancel { session_id: None })
        .await
        .unwrap();
    assert!(matches!(reply, Event::Ok));
    let events = drain_stream(stream).await;
    assert!(last_state(&events).is_terminal());
}

#[tokio::test]
async fn stop_finalizes_and_delivers_buffered_speech() {
    let engine = MockEngine::new().with_transcript("stopped mid sentence");
    let daemon = spawn_daemon(engine, vec![held_speech_source()]).await;

    let mut stream = stream_command(&daemon.socket_path, Command::Start)
        .await
        .unwrap();
    await_recording(&mut stream).await;

    let reply = send_command(&daemon.socket_path, Command::Stop { session_id: None })
        .await
        .unwrap();
    assert!(matches!(reply, Event::Ok));

    let events = drain_stream(stream).await;
    assert_eq!(final_texts(&events), vec!["stopped mid sentence".to_string()]);
    assert_eq!(last_state(&events), SessionState::Done);
}

#[tokio::test]
async fn cancel_discards_buffered_speech() {
    let engine = MockEngine::new().with_transcript("must not appear");
    let daemon = spawn_daemon(engine, vec![held_speech_source()]).await;

    let mut stream = stream_command(&daemon.socket_path, Command::Start)
        .await
        .unwrap();
    await_recording(&mut stream).await;

    let reply = send_command(&daemon.socket_path, Command::Cancel { session_id: None })
        .await
        .unwrap();
    assert!(matches!(reply, Event::Ok));

    let events = drain_stream(stream).await;
    assert!(
        events
            .iter()
            .all(|e| !matches!(e, Event::FinalResult { .. } | Event::PartialResult { .. })),
        "cancel must not deliver results, got: {:?}",
        events
    );
    assert!(
        events.iter().any(|e| matches!(
            e,
            Event::Error {
                error_code: Some(ErrorCode::Cancelled),
                ..
            }
        )),
        "events: {:?}",
        events
    );

    let status = send_command(&daemon.socket_path, Command::Status)
        .await
        .unwrap();
    match status {
        Event::Status { state, .. } => assert_eq!(state, SessionState::Idle),
        other => panic!("Expected Status, got {:?}", other),
    }
}

#[tokio::test]
async fn stop_with_a_stale_id_leaves_the_session_running() {
    let daemon = spawn_daemon(MockEngine::new(), vec![open_ended_source()]).await;

    let mut stream = stream_command(&daemon.socket_path, Command::Start)
        .await
        .unwrap();
    let live_id = await_recording(&mut stream).await;

    let stale = Uuid::new_v4();
    assert_ne!(stale, live_id);
    let event = send_command(
        &daemon.socket_path,
        Command::Stop {
            session_id: Some(stale),
        },
    )
    .await
    .unwrap();
    match event {
        Event::Error {
            session_id,
            message,
            ..
        } => {
            assert_eq!(session_id, Some(stale));
            assert!(message.contains("No session"), "message: {}", message);
        }
        other => panic!("Expected error, got {:?}", other),
    }

    let status = send_command(&daemon.socket_path, Command::Status)
        .await
        .unwrap();
    match status {
        Event::Status {
            state, session_id, ..
        } => {
            assert_eq!(state, SessionState::Recording);
            assert_eq!(session_id, Some(live_id));
        }
        other => panic!("Expected Status, got {:?}", other),
    }

    let reply = send_command(&daemon.socket_path, Command::Stop { session_id: None })
        .await
        .unwrap();
    assert!(matches!(reply, Event::Ok));
    let events = drain_stream(stream).await;
    assert_eq!(last_state(&events), SessionState::Done);
}

#[tokio::test]
async fn listen_feed_matches_the_owning_stream() {
    let engine = MockEngine::new().with_transcript("observed");
    let daemon = spawn_daemon(engine, vec![speech_source()]).await;

    let mut feed = stream_command(&daemon.socket_path, Command::Listen)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stream = stream_command(&daemon.socket_path, Command::Start)
        .await
        .unwrap();
    let own = drain_stream(stream).await;
    assert_eq!(last_state(&own), SessionState::Done);

    let mut observed = Vec::new();
    while observed.len() < own.len() {
        observed.push(next_event(&mut feed).await);
    }
    assert_eq!(observed, own);
}

#[tokio::test]
async fn client_hangup_cancels_the_running_session() {
    let daemon = spawn_daemon(MockEngine::new(), vec![open_ended_source()]).await;

    let mut feed = stream_command(&daemon.socket_path, Command::Listen)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut stream = stream_command(&daemon.socket_path, Command::Start)
        .await
        .unwrap();
    await_recording(&mut stream).await;
    drop(stream);

    // The feed still reports the session's end
    let mut saw_cancelled = false;
    for _ in 0..10 {
        match next_event(&mut feed).await {
            Event::Error {
                error_code: Some(ErrorCode::Cancelled),
                ..
            } => saw_cancelled = true,
            Event::StateChange { state, .. } if state.is_terminal() => break,
            _ => {}
        }
    }
    assert!(saw_cancelled);

    let status = send_command(&daemon.socket_path, Command::Status)
        .await
        .unwrap();
    match status {
        Event::Status {
            state, session_id, ..
        } => {
            assert_eq!(state, SessionState::Idle);
            assert_eq!(session_id, None);
        }
        other => panic!("Expected Status, got {:?}", other),
    }
}

#[tokio::test]
async fn shutdown_ends_a_live_session_and_removes_the_socket() {
    let daemon = spawn_daemon(MockEngine::new(), vec![open_ended_source()]).await;

    let mut stream = stream_command(&daemon.socket_path, Command::Start)
        .await
        .unwrap();
    await_recording(&mut stream).await;

    let reply = send_command(&daemon.socket_path, Command::Shutdown)
        .await
        .unwrap();
    assert!(matches!(reply, Event::Ok));

    // The owning client still sees its session through to the end
    let events = drain_stream(stream).await;
    assert!(last_state(&events).is_terminal());

    timeout(Duration::from_secs(2), daemon.server)
        .await
        .expect("server should stop after a shutdown command")
        .expect("server task panicked")
        .expect("server returned an error");
    assert!(!daemon.socket_path.exists());

    let result = send_command(&daemon.socket_path, Command::Status).await;
    assert!(matches!(result, Err(DictadError::IpcConnection { .. })));
}
