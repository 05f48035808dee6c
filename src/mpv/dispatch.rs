//! Routing of decoded frames to reply slots and event subscribers.

use std::sync::Arc;

use async_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde_json::Value;

use super::error::MpvError;
use super::ipc::PendingQueue;
use super::protocol::{Incoming, MpvEvent};

/// Everything observable on a client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
  /// Every decoded frame, before routing.
  Message(Value),
  /// An MPV event.
  Event(MpvEvent),
  /// A connection was established and buffered commands were flushed.
  Started,
  /// The supervised process exited.
  ProcessExited { code: Option<i32> },
  /// The socket closed or failed.
  Disconnected,
  /// Transport-level error (spawn, connect, decode, socket I/O).
  Error(Arc<MpvError>),
  /// A reply arrived with no command waiting for it.
  Desync(Value),
}

/// What a handler subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
  Message,
  AnyEvent,
  Event(String),
  Started,
  ProcessExited,
  Disconnected,
  Error,
  Desync,
}

impl Topic {
  pub fn matches(&self, event: &ClientEvent) -> bool {
    match (self, event) {
      (Topic::Message, ClientEvent::Message(_)) => true,
      (Topic::AnyEvent, ClientEvent::Event(_)) => true,
      (Topic::Event(name), ClientEvent::Event(e)) => *name == e.name,
      (Topic::Started, ClientEvent::Started) => true,
      (Topic::ProcessExited, ClientEvent::ProcessExited { .. }) => true,
      (Topic::Disconnected, ClientEvent::Disconnected) => true,
      (Topic::Error, ClientEvent::Error(_)) => true,
      (Topic::Desync, ClientEvent::Desync(_)) => true,
      _ => false,
    }
  }
}

/// `"message"` and `"event"` are the catch-all topics, lifecycle topics use
/// their camelCase names, anything else is an MPV event name.
impl From<&str> for Topic {
  fn from(name: &str) -> Self {
    match name {
      "message" => Topic::Message,
      "event" => Topic::AnyEvent,
      "started" => Topic::Started,
      "processExited" => Topic::ProcessExited,
      "disconnected" => Topic::Disconnected,
      "error" => Topic::Error,
      "desync" => Topic::Desync,
      other => Topic::Event(other.to_string()),
    }
  }
}

impl From<String> for Topic {
  fn from(name: String) -> Self {
    Topic::from(name.as_str())
  }
}

/// Registration handle returned by [`EventBus::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

#[derive(Default)]
struct BusState {
  next_id: u64,
  handlers: Vec<(HandlerId, Topic, Handler)>,
  subscribers: Vec<Sender<ClientEvent>>,
}

/// Handler registry plus channel subscribers.
///
/// Handlers run on the driver task, in registration order, before channel
/// subscribers are notified. They must not block.
#[derive(Clone, Default)]
pub(crate) struct EventBus {
  state: Arc<Mutex<BusState>>,
}

impl EventBus {
  pub fn on<F>(&self, topic: Topic, handler: F) -> HandlerId
  where
    F: Fn(&ClientEvent) + Send + Sync + 'static,
  {
    let mut state = self.state.lock();
    state.next_id += 1;
    let id = HandlerId(state.next_id);
    state.handlers.push((id, topic, Arc::new(handler)));
    id
  }

  pub fn off(&self, id: HandlerId) -> bool {
    let mut state = self.state.lock();
    let before = state.handlers.len();
    state.handlers.retain(|(handler_id, _, _)| *handler_id != id);
    state.handlers.len() != before
  }

  pub fn subscribe(&self) -> Receiver<ClientEvent> {
    let (tx, rx) = async_channel::unbounded();
    self.state.lock().subscribers.push(tx);
    rx
  }

  pub fn emit(&self, event: ClientEvent) {
    // Call out without holding the lock so handlers may (un)register.
    let (handlers, subscribers): (Vec<Handler>, Vec<Sender<ClientEvent>>) = {
      let mut state = self.state.lock();
      state.subscribers.retain(|tx| !tx.is_closed());
      let handlers = state
        .handlers
        .iter()
        .filter(|(_, topic, _)| topic.matches(&event))
        .map(|(_, _, handler)| handler.clone())
        .collect();
      (handlers, state.subscribers.clone())
    };

    for handler in handlers {
      handler(&event);
    }
    for tx in subscribers {
      let _ = tx.try_send(event.clone());
    }
  }

  pub fn emit_error(&self, error: MpvError) {
    self.emit(ClientEvent::Error(Arc::new(error)));
  }
}

/// Routes frames: events to the bus, replies to the oldest slot.
pub(crate) struct Dispatcher {
  bus: EventBus,
}

impl Dispatcher {
  pub fn new(bus: EventBus) -> Self {
    Self { bus }
  }

  pub fn bus(&self) -> &EventBus {
    &self.bus
  }

  pub fn on_frame(&self, frame: Value, pending: &mut PendingQueue) {
    self.bus.emit(ClientEvent::Message(frame.clone()));

    match Incoming::classify(frame) {
      Incoming::Event(event) => {
        log::debug!("MPV event: {}", event.name);
        self.bus.emit(ClientEvent::Event(event));
      }
      Incoming::Reply(reply) => match pending.pop() {
        Some(Some(responder)) => {
          log::debug!("MPV reply: {}", reply.raw);
          let _ = responder.send(Ok(reply));
        }
        Some(None) => {
          log::debug!("MPV reply for unobserved command: {}", reply.raw);
        }
        None => {
          log::warn!("MPV reply with no pending command: {}", reply.raw);
          self.bus.emit(ClientEvent::Desync(reply.raw));
        }
      },
    }
  }
}
