//! MPV process spawning and supervision.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_channel::Sender;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::MpvError;
use crate::config::MpvConfig;

/// Lifecycle signal from a supervised process.
///
/// `generation` identifies the launch so signals from a replaced process can
/// be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessSignal {
  /// The readiness marker appeared on stdout.
  Ready { generation: u64 },
  /// The process is gone.
  Exited { generation: u64, code: Option<i32> },
}

/// Find the MPV executable on `PATH`, falling back to the bare name.
pub fn find_mpv() -> PathBuf {
  which::which("mpv").unwrap_or_else(|_| PathBuf::from("mpv"))
}

/// Required flags followed by the user's extra arguments.
pub fn launch_args(config: &MpvConfig, endpoint: &Path) -> Vec<String> {
  let mut args = vec![
    "--no-config".to_string(),
    format!("--input-ipc-server={}", endpoint.display()),
    "--idle".to_string(),
    "--msg-level=ipc=v".to_string(),
  ];
  args.extend(config.extra_args.iter().cloned());
  args
}

struct RunningProcess {
  pid: Option<u32>,
  cancel: CancellationToken,
  watcher: JoinHandle<()>,
}

/// Spawns MPV and reports readiness and exit over a channel.
pub(crate) struct ProcessSupervisor {
  signals: Sender<ProcessSignal>,
  generation: u64,
  current: Option<RunningProcess>,
}

impl ProcessSupervisor {
  pub fn new(signals: Sender<ProcessSignal>) -> Self {
    Self {
      signals,
      generation: 0,
      current: None,
    }
  }

  /// Generation of the most recent launch.
  pub fn generation(&self) -> u64 {
    self.generation
  }

  /// Spawn a new MPV process. Spawn failures are returned, never retried.
  ///
  /// The child is killed if its handle is dropped, so a host shutting down
  /// takes MPV with it. That guard goes away with the handle once the child
  /// has been reaped.
  pub fn launch(&mut self, config: &MpvConfig, endpoint: &Path) -> Result<u64, MpvError> {
    let binary = config.binary_path.clone().unwrap_or_else(find_mpv);
    let args = launch_args(config, endpoint);

    log::info!("Spawning MPV: {:?} with IPC: {}", binary, endpoint.display());
    if !config.extra_args.is_empty() {
      log::info!("Extra MPV args: {:?}", config.extra_args);
    }

    let mut child = Command::new(&binary)
      .args(&args)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::null())
      .kill_on_drop(true)
      .spawn()
      .map_err(|source| MpvError::Spawn {
        binary: binary.clone(),
        source,
      })?;

    let stdout = child.stdout.take();
    self.generation += 1;
    let generation = self.generation;
    let pid = child.id();
    let cancel = CancellationToken::new();

    let watcher = tokio::spawn(watch_process(
      child,
      stdout,
      config.ready_marker.clone(),
      generation,
      self.signals.clone(),
      cancel.clone(),
    ));

    if let Some(previous) = self.current.replace(RunningProcess {
      pid,
      cancel,
      watcher,
    }) {
      previous.cancel.cancel();
    }

    log::info!("MPV started (pid: {:?}, generation {})", pid, generation);
    Ok(generation)
  }

  /// Kill the current process and wait for its watcher to finish.
  pub async fn shutdown(&mut self) {
    let Some(process) = self.current.take() else {
      return;
    };

    log::info!("Killing MPV process (pid: {:?})", process.pid);
    process.cancel.cancel();
    if tokio::time::timeout(std::time::Duration::from_secs(2), process.watcher)
      .await
      .is_err()
    {
      log::warn!("MPV watcher did not finish within 2 seconds");
    }
  }
}

enum WatchStep {
  Cancelled,
  Line(std::io::Result<Option<String>>),
  Exited(std::io::Result<std::process::ExitStatus>),
}

/// Scan stdout for the readiness marker until the process exits or is killed.
async fn watch_process(
  mut child: Child,
  stdout: Option<ChildStdout>,
  marker: String,
  generation: u64,
  signals: Sender<ProcessSignal>,
  cancel: CancellationToken,
) {
  let mut lines = stdout.map(|out| BufReader::new(out).lines());
  let mut ready = false;

  let code = loop {
    let step = tokio::select! {
      _ = cancel.cancelled() => WatchStep::Cancelled,
      line = next_line(&mut lines) => WatchStep::Line(line),
      status = child.wait() => WatchStep::Exited(status),
    };

    match step {
      WatchStep::Cancelled => {
        if let Err(e) = child.kill().await {
          log::error!("kill() failed: {}", e);
        }
        break child.try_wait().ok().flatten().and_then(|s| s.code());
      }
      WatchStep::Line(Ok(Some(line))) => {
        log::trace!("mpv: {}", line);
        if !ready && line.trim_end() == marker {
          ready = true;
          log::info!("MPV IPC ready (generation {})", generation);
          // The driver may already be gone.
          let _ = signals.send(ProcessSignal::Ready { generation }).await;
        }
      }
      WatchStep::Line(Ok(None)) => lines = None,
      WatchStep::Line(Err(e)) => {
        log::warn!("Failed to read MPV stdout: {}", e);
        lines = None;
      }
      WatchStep::Exited(status) => match status {
        Ok(status) => {
          log::info!("MPV process exited with: {}", status);
          break status.code();
        }
        Err(e) => {
          log::error!("wait() failed: {}", e);
          break None;
        }
      },
    }
  };

  // The driver may already be gone.
  let _ = signals.send(ProcessSignal::Exited { generation, code }).await;
}

/// Next stdout line, or never once stdout is closed.
async fn next_line(
  lines: &mut Option<tokio::io::Lines<BufReader<ChildStdout>>>,
) -> std::io::Result<Option<String>> {
  match lines.as_mut() {
    Some(lines) => lines.next_line().await,
    None => std::future::pending().await,
  }
}
