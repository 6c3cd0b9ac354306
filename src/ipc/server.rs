//! Async Unix socket server for the daemon's control protocol.
//!
//! Each connection carries one command: the client writes a single JSON
//! line and gets either one event back or, for streaming commands, a
//! sequence of event lines that ends when the stream closes or the client
//! hangs up. What a command streams is the handler's decision; the server
//! only pumps.

use crate::error::{DictadError, Result};
use crate::ipc::protocol::{Command, Event};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

/// What the server should do with a handled command.
#[derive(Debug)]
pub enum Dispatch {
    /// Write one event and close the connection.
    Reply(Event),
    /// Forward events from this channel until it closes or the client
    /// disconnects. A disconnect drops the receiver, which the sending
    /// side observes as its cue to stop.
    Stream(mpsc::Receiver<Event>),
    /// Write one event, then stop accepting connections.
    Shutdown(Event),
}

/// Handler trait for processing IPC commands.
#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle a command and decide what goes back to the client.
    async fn handle(&self, command: Command) -> Dispatch;
}

/// State for managing server shutdown.
#[derive(Debug, Clone)]
struct ServerState {
    shutdown: Arc<Mutex<bool>>,
}

impl ServerState {
    fn new() -> Self {
        Self {
            shutdown: Arc::new(Mutex::new(false)),
        }
    }

    async fn is_shutdown(&self) -> bool {
        *self.shutdown.lock().await
    }

    async fn set_shutdown(&self) {
        *self.shutdown.lock().await = true;
    }
}

/// IPC server handling daemon control commands over a Unix socket.
pub struct IpcServer {
    socket_path: PathBuf,
    state: ServerState,
}

impl IpcServer {
    /// Create a server that will bind to the given socket path.
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            state: ServerState::new(),
        }
    }

    /// The socket path this server is using.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Default socket path based on XDG_RUNTIME_DIR, with a /tmp fallback.
    pub fn default_socket_path() -> PathBuf {
        if let Ok(xdg_runtime) = std::env::var("XDG_RUNTIME_DIR") {
            PathBuf::from(xdg_runtime).join("dictad.sock")
        } else {
            let uid = unsafe { libc::getuid() };
            PathBuf::from(format!("/tmp/dictad-{}.sock", uid))
        }
    }

    /// Bind the socket and accept connections until shutdown.
    ///
    /// A leftover socket file from a previous run is removed before
    /// binding. Returns once a `shutdown` command was handled or
    /// [`IpcServer::stop`] was called.
    pub async fn start<H>(&self, handler: H) -> Result<()>
    where
        H: CommandHandler + 'static,
    {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| DictadError::IpcSocket {
                message: format!("Failed to remove existing socket: {}", e),
            })?;
        }

        let listener =
            UnixListener::bind(&self.socket_path).map_err(|e| DictadError::IpcSocket {
                message: format!("Failed to bind to socket: {}", e),
            })?;
        debug!(path = %self.socket_path.display(), "ipc server listening");

        let handler = Arc::new(handler);

        loop {
            if self.state.is_shutdown().await {
                break;
            }

            // Accept with a timeout so the shutdown flag gets re-checked
            let accept_result =
                tokio::time::timeout(tokio::time::Duration::from_millis(100), listener.accept())
                    .await;

            match accept_result {
                Ok(Ok((stream, _))) => {
                    let handler = Arc::clone(&handler);
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, handler, state).await {
                            warn!("Error handling client: {}", e);
                        }
                    });
                }
                Ok(Err(e)) => {
                    return Err(DictadError::IpcConnection {
                        message: format!("Failed to accept connection: {}", e),
                    });
                }
                Err(_) => continue,
            }
        }

        Ok(())
    }

    /// Stop the server and clean up the socket file.
    pub async fn stop(&self) -> Result<()> {
        self.state.set_shutdown().await;

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| DictadError::IpcSocket {
                message: format!("Failed to remove socket file: {}", e),
            })?;
        }

        Ok(())
    }
}

/// Handle a single client connection.
async fn handle_client<H>(stream: UnixStream, handler: Arc<H>, state: ServerState) -> Result<()>
where
    H: CommandHandler,
{
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    reader
        .read_line(&mut line)
        .await
        .map_err(|e| DictadError::IpcConnection {
            message: format!("Failed to read from client: {}", e),
        })?;

    let line = line.trim();
    if line.is_empty() {
        // Connected and left without sending anything
        return Ok(());
    }

    let command = match Command::from_json(line) {
        Ok(command) => command,
        Err(e) => {
            let reply = Event::Error {
                session_id: None,
                error_code: None,
                message: format!("Invalid command: {}", e),
            };
            return write_event(&mut writer, &reply).await;
        }
    };

    debug!(?command, "client command");

    match handler.handle(command).await {
        Dispatch::Reply(event) => write_event(&mut writer, &event).await,
        Dispatch::Stream(mut events) => {
            // The read half goes quiet after the command line, so EOF
            // there is the client hanging up. Watching for it ends the
            // stream promptly even when no events are flowing.
            let mut hangup = [0u8; 8];
            loop {
                tokio::select! {
                    maybe_event = events.recv() => match maybe_event {
                        Some(event) => {
                            if write_event(&mut writer, &event).await.is_err() {
                                debug!("client disconnected mid-stream");
                                break;
                            }
                        }
                        None => break,
                    },
                    read = reader.read(&mut hangup) => match read {
                        Ok(0) | Err(_) => {
                            debug!("client hung up mid-stream");
                            break;
                        }
                        // Stray bytes on a streaming connection are ignored
                        Ok(_) => {}
                    },
                }
            }
            Ok(())
        }
        Dispatch::Shutdown(event) => {
            let result = write_event(&mut writer, &event).await;
            state.set_shutdown().await;
            result
        }
    }
}

/// Write one event as a JSON line and flush it out immediately, so
/// streamed events reach the client as they happen.
async fn write_event<W>(writer: &mut W, event: &Event) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let json = event.to_json().map_err(|e| DictadError::IpcProtocol {
        message: format!("Failed to serialize event: {}", e),
    })?;

    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| DictadError::IpcConnection {
            message: format!("Failed to write to client: {}", e),
        })?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| DictadError::IpcConnection {
            message: format!("Failed to write newline to client: {}", e),
        })?;
    writer
        .flush()
        .await
        .map_err(|e| DictadError::IpcConnection {
            message: format!("Failed to flush writer: {}", e),
        })?;

    Ok(())
}
