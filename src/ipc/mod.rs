//! Unix socket IPC: the wire protocol plus the daemon-side server and
//! client-side helpers built on it.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{EventStream, send_command, stream_command};
pub use protocol::{Command, ErrorCode, Event};
pub use server::{CommandHandler, Dispatch, IpcServer};
