//! Client configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::mpv::MpvError;

/// Line MPV prints on stdout once its IPC server is listening.
pub const DEFAULT_READY_MARKER: &str = "[ipc] Starting IPC master";

/// MPV client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MpvConfig {
  /// IPC socket path (None = allocate a fresh one).
  #[serde(default)]
  pub endpoint_path: Option<PathBuf>,

  /// Additional MPV command-line arguments, appended after the required ones.
  #[serde(default)]
  pub extra_args: Vec<String>,

  /// Custom MPV executable path (None = look up `mpv` on PATH).
  #[serde(default)]
  pub binary_path: Option<PathBuf>,

  /// Relaunch MPV when it exits on its own.
  #[serde(default)]
  pub auto_respawn: bool,

  /// Stdout line that signals the IPC server is ready.
  #[serde(default = "default_ready_marker")]
  pub ready_marker: String,
}

fn default_ready_marker() -> String {
  DEFAULT_READY_MARKER.to_string()
}

impl Default for MpvConfig {
  fn default() -> Self {
    Self {
      endpoint_path: None,
      extra_args: Vec::new(),
      binary_path: None,
      auto_respawn: false,
      ready_marker: default_ready_marker(),
    }
  }
}

impl MpvConfig {
  /// Parse a configuration from JSON, then validate it.
  pub fn from_json(json: &str) -> Result<Self, MpvError> {
    let config: Self = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
  }

  /// Validate configuration values.
  pub fn validate(&self) -> Result<(), MpvError> {
    let invalid = |msg: &str| Err(MpvError::InvalidConfig(msg.to_string()));

    if self.ready_marker.trim().is_empty() {
      return invalid("Ready marker cannot be empty");
    }
    if matches!(&self.endpoint_path, Some(p) if p.as_os_str().is_empty()) {
      return invalid("Endpoint path cannot be empty");
    }
    if matches!(&self.binary_path, Some(p) if p.as_os_str().is_empty()) {
      return invalid("Binary path cannot be empty");
    }
    if self.extra_args.iter().any(|arg| arg.trim().is_empty()) {
      return invalid("Extra arguments cannot be empty");
    }
    if self
      .extra_args
      .iter()
      .any(|arg| arg.starts_with("--input-ipc-server") || arg.starts_with("--input-unix-socket"))
    {
      return invalid("Extra arguments cannot override the IPC endpoint");
    }
    Ok(())
  }
}
