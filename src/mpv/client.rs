//! High-level MPV client with command methods.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_channel::{Receiver, Sender};
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::{CancellationToken, DropGuard};

use super::dispatch::{ClientEvent, Dispatcher, EventBus, HandlerId, Topic};
use super::driver::{Driver, Request};
use super::error::MpvError;
use super::ipc::{ConnectionManager, Outgoing};
use super::process::ProcessSupervisor;
use super::protocol::{Command, Reply};
use crate::config::MpvConfig;

/// Lifecycle of a client. `Terminated` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
  Created,
  AllocatingEndpoint,
  Launching,
  WaitingForReady,
  Connecting,
  Connected,
  Terminated,
}

/// Deferred result of a submitted command.
///
/// Resolves with the reply's `data` (or `null`) when MPV reports success and
/// rejects with [`MpvError::CommandFailed`] otherwise. Dropping it does not
/// cancel the command.
#[must_use = "the command is sent either way; await this to see its result"]
pub struct PendingCommand {
  rx: oneshot::Receiver<Result<Reply, MpvError>>,
}

impl Future for PendingCommand {
  type Output = Result<Value, MpvError>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    Pin::new(&mut self.rx).poll(cx).map(|result| match result {
      Ok(Ok(reply)) => reply.into_result(),
      Ok(Err(e)) => Err(e),
      Err(_) => Err(MpvError::Terminated),
    })
  }
}

/// Cloneable handle for submitting commands.
///
/// Unlike [`MpvClient`] it does not keep MPV alive; this is what the
/// reconfiguration hook receives.
#[derive(Clone)]
pub struct CommandSender {
  requests: Sender<Request>,
}

impl CommandSender {
  /// Send `{"command": [name, args...]}`.
  pub fn send_command<I, A>(&self, name: &str, args: I) -> PendingCommand
  where
    I: IntoIterator<Item = A>,
    A: Into<Value>,
  {
    self.send(Command::new(name, args))
  }

  /// Send a prepared command.
  pub fn send(&self, command: Command) -> PendingCommand {
    self.send_message(command.to_value())
  }

  /// Send an arbitrary JSON message. MPV still answers it, so it takes a reply slot.
  pub fn send_message(&self, message: Value) -> PendingCommand {
    let (tx, rx) = oneshot::channel();
    // A closed channel drops the responder, which resolves as `Terminated`.
    let _ = self
      .requests
      .try_send(Request::Send(Outgoing::new(message, Some(tx))));
    PendingCommand { rx }
  }
}

struct ClientInner {
  commands: CommandSender,
  bus: EventBus,
  state: watch::Receiver<ClientState>,
  endpoint: PathBuf,
  shutdown: CancellationToken,
  _guard: DropGuard,
}

/// High-level MPV client.
///
/// Construction spawns MPV and connects in the background; commands sent
/// before the connection exists are buffered and flushed in order. Clones
/// share the same process. When the last clone is dropped MPV is killed.
#[derive(Clone)]
pub struct MpvClient {
  inner: Arc<ClientInner>,
}

impl MpvClient {
  /// Start MPV with the given configuration.
  pub fn new(config: MpvConfig) -> Result<Self, MpvError> {
    Self::spawn(config, None)
  }

  /// Start MPV and run `on_ready` once, after the first successful connection.
  pub fn with_ready<F>(config: MpvConfig, on_ready: F) -> Result<Self, MpvError>
  where
    F: FnOnce() + Send + 'static,
  {
    Self::spawn(config, Some(Box::new(on_ready)))
  }

  fn spawn(
    config: MpvConfig,
    on_ready: Option<Box<dyn FnOnce() + Send>>,
  ) -> Result<Self, MpvError> {
    config.validate()?;
    let runtime = tokio::runtime::Handle::try_current().map_err(|_| MpvError::NoRuntime)?;

    let (state_tx, state_rx) = watch::channel(ClientState::Created);
    state_tx.send_replace(ClientState::AllocatingEndpoint);
    let mut conn = ConnectionManager::new(config.endpoint_path.clone());
    let endpoint = conn.resolve_endpoint_path().to_path_buf();

    let (requests_tx, requests_rx) = async_channel::unbounded();
    let (signals_tx, signals_rx) = async_channel::unbounded();
    let commands = CommandSender {
      requests: requests_tx,
    };
    let bus = EventBus::default();
    let shutdown = CancellationToken::new();

    let driver = Driver {
      respawn: config.auto_respawn,
      config,
      endpoint: endpoint.clone(),
      conn,
      supervisor: ProcessSupervisor::new(signals_tx),
      dispatcher: Dispatcher::new(bus.clone()),
      requests: requests_rx,
      signals: signals_rx,
      commands: commands.clone(),
      shutdown: shutdown.clone(),
      state: state_tx,
      on_ready,
      reconfigure: None,
      terminated: false,
    };
    runtime.spawn(driver.run());

    Ok(Self {
      inner: Arc::new(ClientInner {
        commands,
        bus,
        state: state_rx,
        endpoint,
        _guard: shutdown.clone().drop_guard(),
        shutdown,
      }),
    })
  }

  /// IPC socket path used by this client.
  pub fn endpoint_path(&self) -> &Path {
    &self.inner.endpoint
  }

  /// Current lifecycle state.
  pub fn state(&self) -> ClientState {
    *self.inner.state.borrow()
  }

  /// Wait until connected. Fails if the client terminates first.
  pub async fn wait_started(&self) -> Result<(), MpvError> {
    let mut state = self.inner.state.clone();
    let reached = state
      .wait_for(|s| matches!(s, ClientState::Connected | ClientState::Terminated))
      .await
      .map(|s| *s)
      .unwrap_or(ClientState::Terminated);

    match reached {
      ClientState::Terminated => Err(MpvError::Terminated),
      _ => Ok(()),
    }
  }

  /// Handle for submitting commands that does not keep MPV alive.
  pub fn commands(&self) -> CommandSender {
    self.inner.commands.clone()
  }

  /// Send `{"command": [name, args...]}`.
  pub fn send_command<I, A>(&self, name: &str, args: I) -> PendingCommand
  where
    I: IntoIterator<Item = A>,
    A: Into<Value>,
  {
    self.inner.commands.send_command(name, args)
  }

  /// Send a prepared command.
  pub fn send(&self, command: Command) -> PendingCommand {
    self.inner.commands.send(command)
  }

  /// Send an arbitrary JSON message.
  pub fn send_message(&self, message: Value) -> PendingCommand {
    self.inner.commands.send_message(message)
  }

  /// Register a handler. Accepts a [`Topic`] or a name: `"event"` for any
  /// MPV event, `"message"` for every frame, otherwise an event name.
  pub fn on<T, F>(&self, topic: T, handler: F) -> HandlerId
  where
    T: Into<Topic>,
    F: Fn(&ClientEvent) + Send + Sync + 'static,
  {
    self.inner.bus.on(topic.into(), handler)
  }

  /// Remove a handler. Returns false if it was already gone.
  pub fn off(&self, id: HandlerId) -> bool {
    self.inner.bus.off(id)
  }

  /// Receive every [`ClientEvent`] on a channel.
  pub fn subscribe(&self) -> Receiver<ClientEvent> {
    self.inner.bus.subscribe()
  }

  /// Enable or disable relaunching MPV after it exits.
  pub fn set_respawn(&self, enabled: bool) {
    // Ignored once terminated.
    let _ = self
      .inner
      .commands
      .requests
      .try_send(Request::SetRespawn(enabled));
  }

  /// Run `hook` after every respawn, e.g. to re-observe properties.
  ///
  /// Commands sent from the hook are buffered until the new connection is up.
  pub fn set_reconfigure<F>(&self, hook: F)
  where
    F: Fn(&CommandSender) + Send + Sync + 'static,
  {
    // Ignored once terminated.
    let _ = self
      .inner
      .commands
      .requests
      .try_send(Request::SetReconfigure(Some(Arc::new(hook))));
  }

  /// Stop for good: no respawn, MPV is killed, waiting commands fail with
  /// [`MpvError::Terminated`].
  pub async fn terminate(&self) {
    log::info!("terminate() called");
    self.inner.shutdown.cancel();
    let mut state = self.inner.state.clone();
    let _ = state.wait_for(|s| *s == ClientState::Terminated).await;
  }

  /// Load a file for playback.
  pub fn loadfile(&self, url: &str) -> PendingCommand {
    log::info!("Loading file: {}", url);
    self.send(Command::loadfile(url))
  }

  /// Seek to absolute position in seconds.
  pub fn seek(&self, time: f64) -> PendingCommand {
    self.send(Command::seek(time))
  }

  /// Set pause state.
  pub fn set_pause(&self, paused: bool) -> PendingCommand {
    self.send(Command::set_pause(paused))
  }

  /// Get a property value.
  pub fn get_property(&self, name: &str) -> PendingCommand {
    self.send(Command::get_property(name))
  }

  /// Set a property value.
  pub fn set_property(&self, name: &str, value: impl Into<Value>) -> PendingCommand {
    self.send(Command::set_property(name, value))
  }

  /// Observe a property for changes.
  /// Changes arrive as "property-change" events.
  pub fn observe_property(&self, observer_id: i64, property: &str) -> PendingCommand {
    self.send(Command::observe_property(observer_id, property))
  }

  /// Stop observing a property.
  pub fn unobserve_property(&self, observer_id: i64) -> PendingCommand {
    self.send(Command::unobserve_property(observer_id))
  }

  /// Cycle (toggle) a property.
  pub fn cycle(&self, property: &str) -> PendingCommand {
    self.send(Command::cycle(property))
  }

  /// Stop playback.
  pub fn stop(&self) -> PendingCommand {
    self.send(Command::stop())
  }

  /// Ask MPV to quit. This is an ordinary command; with respawn enabled MPV
  /// is started again, use [`Self::terminate`] to stop for good.
  pub fn quit(&self) -> PendingCommand {
    self.send(Command::quit())
  }
}
