//! The control task behind an [`super::MpvClient`].
//!
//! One task owns the connection, the supervisor and the dispatcher, and
//! handles one input at a time: shutdown, requests, process signals and
//! inbound frames. Reply slots are only ever touched here, which keeps
//! FIFO correlation intact.

use std::path::PathBuf;
use std::sync::Arc;

use async_channel::Receiver;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::client::{ClientState, CommandSender};
use super::codec::DecodedFrame;
use super::dispatch::{ClientEvent, Dispatcher};
use super::error::MpvError;
use super::ipc::{ConnectionManager, Outgoing};
use super::process::{ProcessSignal, ProcessSupervisor};
use crate::config::MpvConfig;

pub(crate) type ReadyCallback = Box<dyn FnOnce() + Send>;
pub(crate) type ReconfigureHook = Arc<dyn Fn(&CommandSender) + Send + Sync>;

/// Messages from client handles to the driver.
pub(crate) enum Request {
  Send(Outgoing),
  SetRespawn(bool),
  SetReconfigure(Option<ReconfigureHook>),
}

enum Step {
  Shutdown,
  Request(Request),
  Signal(ProcessSignal),
  Frame(Option<std::io::Result<DecodedFrame>>),
}

pub(crate) struct Driver {
  pub config: MpvConfig,
  pub endpoint: PathBuf,
  pub conn: ConnectionManager,
  pub supervisor: ProcessSupervisor,
  pub dispatcher: Dispatcher,
  pub requests: Receiver<Request>,
  pub signals: Receiver<ProcessSignal>,
  pub commands: CommandSender,
  pub shutdown: CancellationToken,
  pub state: watch::Sender<ClientState>,
  pub on_ready: Option<ReadyCallback>,
  pub reconfigure: Option<ReconfigureHook>,
  pub respawn: bool,
  pub terminated: bool,
}

impl Driver {
  pub async fn run(mut self) {
    if self.launch() {
      while !self.terminated {
        let step = tokio::select! {
          biased;
          _ = self.shutdown.cancelled() => Step::Shutdown,
          Ok(request) = self.requests.recv() => Step::Request(request),
          Ok(signal) = self.signals.recv() => Step::Signal(signal),
          frame = self.conn.next_frame() => Step::Frame(frame),
        };

        match step {
          Step::Shutdown => {
            log::info!("MPV client terminate requested");
            break;
          }
          Step::Request(request) => self.handle_request(request),
          Step::Signal(signal) => self.handle_signal(signal).await,
          Step::Frame(frame) => self.handle_frame(frame),
        }
      }
    }

    self.terminate().await;
  }

  fn set_state(&self, state: ClientState) {
    log::debug!("MPV client state: {:?}", state);
    self.state.send_replace(state);
  }

  /// Spawn MPV. A spawn failure is fatal for the client.
  fn launch(&mut self) -> bool {
    self.set_state(ClientState::Launching);
    match self.supervisor.launch(&self.config, &self.endpoint) {
      Ok(_) => {
        self.set_state(ClientState::WaitingForReady);
        true
      }
      Err(e) => {
        log::error!("{}", e);
        self.dispatcher.bus().emit_error(e);
        self.terminated = true;
        false
      }
    }
  }

  fn handle_request(&mut self, request: Request) {
    match request {
      Request::Send(outgoing) => {
        self.conn.send(outgoing);
        log::debug!(
          "MPV messages: {} buffered, {} awaiting reply",
          self.conn.buffered_len(),
          self.conn.pending_len()
        );
      }
      Request::SetRespawn(enabled) => self.respawn = enabled,
      Request::SetReconfigure(hook) => self.reconfigure = hook,
    }
  }

  async fn handle_signal(&mut self, signal: ProcessSignal) {
    match signal {
      ProcessSignal::Ready { generation } if generation == self.supervisor.generation() => {
        self.set_state(ClientState::Connecting);
        match self.conn.connect().await {
          Ok(flushed) => {
            log::info!("MPV client connected ({} buffered commands sent)", flushed);
            self.set_state(ClientState::Connected);
            self.dispatcher.bus().emit(ClientEvent::Started);
            if let Some(callback) = self.on_ready.take() {
              callback();
            }
          }
          Err(e) => {
            log::error!("{}", e);
            self.set_state(ClientState::WaitingForReady);
            self.dispatcher.bus().emit_error(e);
          }
        }
      }
      ProcessSignal::Exited { generation, code } if generation == self.supervisor.generation() => {
        self.dispatcher.bus().emit(ClientEvent::ProcessExited { code });
        self.conn.disconnect(|| MpvError::Disconnected);

        if !self.respawn || self.shutdown.is_cancelled() {
          log::info!("MPV exited (code {:?}), not respawning", code);
          self.terminated = true;
          return;
        }

        log::info!("MPV exited (code {:?}), respawning", code);
        if self.launch() {
          if let Some(hook) = self.reconfigure.clone() {
            hook(&self.commands);
          }
        }
      }
      stale => log::debug!("Ignoring signal from replaced MPV process: {:?}", stale),
    }
  }

  fn handle_frame(&mut self, frame: Option<std::io::Result<DecodedFrame>>) {
    match frame {
      Some(Ok(Ok(value))) => {
        if let Some(pending) = self.conn.pending_mut() {
          self.dispatcher.on_frame(value, pending);
        }
      }
      Some(Ok(Err(e))) => {
        log::warn!("Failed to parse MPV message: {}", e);
        self.dispatcher.bus().emit_error(e.into());
      }
      Some(Err(e)) => {
        log::error!("MPV IPC read error: {}", e);
        self.conn.disconnect(|| MpvError::Disconnected);
        self.set_state(ClientState::WaitingForReady);
        self.dispatcher.bus().emit_error(e.into());
        self.dispatcher.bus().emit(ClientEvent::Disconnected);
      }
      None => {
        log::info!("MPV IPC connection closed");
        self.conn.disconnect(|| MpvError::Disconnected);
        self.set_state(ClientState::WaitingForReady);
        self.dispatcher.bus().emit(ClientEvent::Disconnected);
      }
    }
  }

  /// Kill MPV and fail everything still waiting. Absorbing.
  async fn terminate(&mut self) {
    self.terminated = true;
    self.supervisor.shutdown().await;

    // The watcher reports the kill after the loop has stopped reading signals.
    while let Ok(signal) = self.signals.try_recv() {
      if let ProcessSignal::Exited { generation, code } = signal {
        if generation == self.supervisor.generation() {
          self.dispatcher.bus().emit(ClientEvent::ProcessExited { code });
        }
      }
    }
    if self.conn.is_connected() {
      log::info!("Closing IPC connection");
    }
    self.conn.close(|| MpvError::Terminated);

    self.requests.close();
    while let Ok(request) = self.requests.try_recv() {
      if let Request::Send(outgoing) = request {
        outgoing.fail(MpvError::Terminated);
      }
    }

    self.set_state(ClientState::Terminated);
    log::info!("MPV client stopped");
  }
}
