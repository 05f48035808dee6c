//! MPV JSON IPC protocol types.
//!
//! Reference: https://mpv.io/manual/master/#json-ipc
//!
//! Commands carry no `request_id`. Replies are matched to commands purely by
//! arrival order, see [`super::dispatch`].

use serde::Serialize;
use serde_json::Value;

use super::error::MpvError;

/// Status string MPV puts in `error` when a command succeeded.
pub const SUCCESS: &str = "success";

/// Command sent to MPV via IPC, serialized as `{"command": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
  command: Vec<Value>,
}

impl Command {
  /// Create a command from a name and its arguments.
  pub fn new<I, A>(name: &str, args: I) -> Self
  where
    I: IntoIterator<Item = A>,
    A: Into<Value>,
  {
    let mut command = vec![Value::from(name)];
    command.extend(args.into_iter().map(Into::into));
    Self { command }
  }

  /// Command name (first token).
  pub fn name(&self) -> Option<&str> {
    self.command.first().and_then(Value::as_str)
  }

  /// All tokens, name first.
  pub fn tokens(&self) -> &[Value] {
    &self.command
  }

  /// JSON value written on the wire.
  pub fn to_value(&self) -> Value {
    serde_json::json!({ "command": self.command })
  }

  /// Load a file for playback.
  pub fn loadfile(url: &str) -> Self {
    Self::new("loadfile", [url])
  }

  /// Seek to absolute position in seconds.
  pub fn seek(time: f64) -> Self {
    Self::new("seek", [Value::from(time), Value::from("absolute")])
  }

  /// Set pause state.
  pub fn set_pause(paused: bool) -> Self {
    Self::set_property("pause", paused)
  }

  /// Set any property.
  pub fn set_property(name: &str, value: impl Into<Value>) -> Self {
    Self::new("set_property", [Value::from(name), value.into()])
  }

  /// Get a property value.
  pub fn get_property(name: &str) -> Self {
    Self::new("get_property", [name])
  }

  /// Observe a property for changes.
  pub fn observe_property(id: i64, name: &str) -> Self {
    Self::new("observe_property", [Value::from(id), Value::from(name)])
  }

  /// Stop observing a property.
  pub fn unobserve_property(id: i64) -> Self {
    Self::new("unobserve_property", [id])
  }

  /// Cycle (toggle) a property.
  pub fn cycle(property: &str) -> Self {
    Self::new("cycle", [property])
  }

  /// Stop playback and clear the playlist.
  pub fn stop() -> Self {
    Self::new("stop", Vec::<Value>::new())
  }

  /// Quit MPV.
  pub fn quit() -> Self {
    Self::new("quit", Vec::<Value>::new())
  }
}

/// Response from MPV for a command.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
  /// "success" or error message.
  pub error: String,
  /// Response data (command-specific).
  pub data: Option<Value>,
  /// The full frame as received.
  pub raw: Value,
}

impl Reply {
  /// Build a reply from a decoded frame. A missing `error` field counts as failure.
  pub fn from_value(raw: Value) -> Self {
    let error = raw
      .get("error")
      .and_then(Value::as_str)
      .unwrap_or_default()
      .to_string();
    let data = raw.get("data").cloned();
    Self { error, data, raw }
  }

  /// Check if the command succeeded.
  pub fn is_success(&self) -> bool {
    self.error == SUCCESS
  }

  /// Resolve to the reply's `data` on success, or reject with the whole reply.
  pub fn into_result(self) -> Result<Value, MpvError> {
    if self.is_success() {
      Ok(self.data.unwrap_or(Value::Null))
    } else {
      Err(MpvError::CommandFailed(Box::new(self)))
    }
  }
}

/// Event sent by MPV (property changes, playback events, etc.).
#[derive(Debug, Clone, PartialEq)]
pub struct MpvEvent {
  /// Event name (e.g., "property-change", "end-file", "pause").
  pub name: String,
  /// The full frame as received.
  pub payload: Value,
}

impl MpvEvent {
  /// Observer ID for property-change events.
  pub fn id(&self) -> Option<i64> {
    self.payload.get("id").and_then(Value::as_i64)
  }

  /// Property name for property-change events.
  pub fn property(&self) -> Option<&str> {
    self.payload.get("name").and_then(Value::as_str)
  }

  /// Event data.
  pub fn data(&self) -> Option<&Value> {
    self.payload.get("data")
  }

  /// Reason for end-file events (e.g., "eof", "stop", "quit", "error").
  pub fn reason(&self) -> Option<&str> {
    self.payload.get("reason").and_then(Value::as_str)
  }
}

/// Frame received from MPV IPC (either reply or event).
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
  Reply(Reply),
  Event(MpvEvent),
}

impl Incoming {
  /// Frames with a string `event` field are events, everything else is a reply.
  pub fn classify(frame: Value) -> Self {
    match frame.get("event").and_then(Value::as_str) {
      Some(name) => Incoming::Event(MpvEvent {
        name: name.to_string(),
        payload: frame,
      }),
      None => Incoming::Reply(Reply::from_value(frame)),
    }
  }
}
