//! IPC client for sending commands to the daemon.
//!
//! One-shot commands use [`send_command`]; commands that answer with an
//! event stream (`start`, `listen`) use [`stream_command`] and read events
//! until the daemon closes the connection.

use crate::error::{DictadError, Result};
use crate::ipc::protocol::{Command, Event};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

/// Connect to the daemon and write one command line.
///
/// The write half comes back alongside the reader: dropping it half-closes
/// the connection, which the daemon takes as the client leaving, so callers
/// keep it alive for as long as they want events.
async fn connect_and_send(
    socket_path: &Path,
    command: &Command,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| DictadError::IpcConnection {
            message: format!("Failed to connect to daemon: {}", e),
        })?;

    let (reader, mut writer) = stream.into_split();

    let command_json = command.to_json().map_err(|e| DictadError::IpcProtocol {
        message: format!("Failed to serialize command: {}", e),
    })?;

    writer
        .write_all(command_json.as_bytes())
        .await
        .map_err(|e| DictadError::IpcConnection {
            message: format!("Failed to write command: {}", e),
        })?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| DictadError::IpcConnection {
            message: format!("Failed to write newline: {}", e),
        })?;
    writer
        .flush()
        .await
        .map_err(|e| DictadError::IpcConnection {
            message: format!("Failed to flush writer: {}", e),
        })?;

    Ok((BufReader::new(reader), writer))
}

/// Send a command to the daemon and read its single-event reply.
///
/// A rejected command comes back as `Ok(Event::Error { .. })`; an `Err`
/// here means the daemon could not be reached or spoke garbage.
pub async fn send_command(socket_path: &Path, command: Command) -> Result<Event> {
    let (mut reader, _writer) = connect_and_send(socket_path, &command).await?;

    let mut response_line = String::new();
    reader
        .read_line(&mut response_line)
        .await
        .map_err(|e| DictadError::IpcConnection {
            message: format!("Failed to read response: {}", e),
        })?;

    if response_line.trim().is_empty() {
        return Err(DictadError::IpcConnection {
            message: "Daemon closed the connection without replying".to_string(),
        });
    }

    Event::from_json(response_line.trim()).map_err(|e| DictadError::IpcProtocol {
        message: format!("Failed to deserialize response: {}", e),
    })
}

/// Send a command and keep the connection open for its event stream.
pub async fn stream_command(socket_path: &Path, command: Command) -> Result<EventStream> {
    let (reader, writer) = connect_and_send(socket_path, &command).await?;
    Ok(EventStream {
        lines: reader.lines(),
        _writer: writer,
    })
}

/// Events as the daemon writes them, one JSON line each.
///
/// Dropping the stream closes the connection, which the daemon treats as
/// the client walking away.
pub struct EventStream {
    lines: Lines<BufReader<OwnedReadHalf>>,
    // Held open so the daemon only sees EOF when the stream is dropped
    _writer: OwnedWriteHalf,
}

impl EventStream {
    /// Next event, or `Ok(None)` once the daemon closes the stream.
    pub async fn next_event(&mut self) -> Result<Option<Event>> {
        loop {
            let Some(line) =
                self.lines
                    .next_line()
                    .await
                    .map_err(|e| DictadError::IpcConnection {
                        message: format!("Failed to read event: {}", e),
                    })?
            else {
                return Ok(None);
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return Event::from_json(line)
                .map(Some)
                .map_err(|e| DictadError::IpcProtocol {
                    message: format!("Failed to deserialize event: {}", e),
                });
        }
    }
}
