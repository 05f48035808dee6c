//! MPV client error types.

use std::path::PathBuf;

use thiserror::Error;

use super::codec::DecodeError;
use super::protocol::Reply;

/// Errors that can occur while supervising or talking to MPV.
#[derive(Debug, Error)]
pub enum MpvError {
  #[error("Failed to spawn MPV ({}): {source}", .binary.display())]
  Spawn {
    binary: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("Failed to connect to {}: {source}", .path.display())]
  Connect {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("Failed to decode frame: {0}")]
  Decode(#[from] DecodeError),

  #[error("IPC I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("JSON serialization error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("MPV command failed: {}", .0.error)]
  CommandFailed(Box<Reply>),

  #[error("Connection to MPV lost")]
  Disconnected,

  #[error("Client terminated")]
  Terminated,

  #[error("Invalid configuration: {0}")]
  InvalidConfig(String),

  #[error("No Tokio runtime available")]
  NoRuntime,
}
