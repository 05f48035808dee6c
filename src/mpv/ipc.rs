//! Socket side of the MPV connection.
//!
//! Owns the Unix socket, the buffer of messages submitted before the socket
//! exists, and the FIFO queue of reply slots.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use uuid::Uuid;

use super::codec::{DecodedFrame, FrameDecoder};
use super::error::MpvError;
use super::protocol::Reply;

/// Completion side of a submitted command.
pub(crate) type Responder = oneshot::Sender<Result<Reply, MpvError>>;

/// A message on its way to MPV.
pub(crate) struct Outgoing {
  pub message: Value,
  pub responder: Option<Responder>,
}

impl Outgoing {
  pub fn new(message: Value, responder: Option<Responder>) -> Self {
    Self { message, responder }
  }

  pub fn fail(self, error: MpvError) {
    if let Some(tx) = self.responder {
      let _ = tx.send(Err(error));
    }
  }
}

/// Reply slots in transmission order.
///
/// MPV answers every command, so each transmitted message takes a slot even
/// when nobody waits for the answer.
#[derive(Default)]
pub(crate) struct PendingQueue {
  slots: VecDeque<Option<Responder>>,
}

impl PendingQueue {
  pub fn push(&mut self, responder: Option<Responder>) {
    self.slots.push_back(responder);
  }

  /// Oldest slot, or `None` when no reply is expected.
  pub fn pop(&mut self) -> Option<Option<Responder>> {
    self.slots.pop_front()
  }

  pub fn len(&self) -> usize {
    self.slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.slots.is_empty()
  }

  /// Fail every slot with a fresh error.
  pub fn fail_all(&mut self, error: impl Fn() -> MpvError) {
    for tx in self.slots.drain(..).flatten() {
      let _ = tx.send(Err(error()));
    }
  }
}

/// Writer channel message.
enum WriteMessage {
  Frame(Vec<u8>),
  Close,
}

/// One established connection. Re-created on every connect.
struct Session {
  frames: FramedRead<OwnedReadHalf, FrameDecoder>,
  write_tx: async_channel::Sender<WriteMessage>,
  pending: PendingQueue,
  _writer_handle: JoinHandle<()>,
}

impl Session {
  fn new(stream: UnixStream) -> Self {
    let (reader, writer) = stream.into_split();
    let (write_tx, write_rx) = async_channel::unbounded::<WriteMessage>();

    let writer_handle = tokio::spawn(async move {
      writer_loop(writer, write_rx).await;
    });

    Self {
      frames: FramedRead::new(reader, FrameDecoder::new()),
      write_tx,
      pending: PendingQueue::default(),
      _writer_handle: writer_handle,
    }
  }

  fn transmit(&mut self, outgoing: Outgoing) {
    let mut data = match serde_json::to_vec(&outgoing.message) {
      Ok(data) => data,
      Err(e) => return outgoing.fail(e.into()),
    };
    data.push(b'\n');

    log::debug!("Sending MPV message: {}", outgoing.message);
    if self.write_tx.try_send(WriteMessage::Frame(data)).is_err() {
      return outgoing.fail(MpvError::Disconnected);
    }
    self.pending.push(outgoing.responder);
  }
}

impl Drop for Session {
  fn drop(&mut self) {
    let _ = self.write_tx.try_send(WriteMessage::Close);
  }
}

async fn writer_loop(mut writer: OwnedWriteHalf, write_rx: async_channel::Receiver<WriteMessage>) {
  log::debug!("MPV IPC writer loop started");

  while let Ok(msg) = write_rx.recv().await {
    match msg {
      WriteMessage::Frame(data) => {
        if let Err(e) = writer.write_all(&data).await {
          log::error!("MPV IPC write error: {}", e);
          break;
        }
        if let Err(e) = writer.flush().await {
          log::error!("MPV IPC flush error: {}", e);
          break;
        }
      }
      WriteMessage::Close => {
        log::debug!("MPV IPC writer closing");
        break;
      }
    }
  }
}

/// Owns the socket and both outbound buffers.
pub(crate) struct ConnectionManager {
  endpoint: Option<PathBuf>,
  allocated: bool,
  session: Option<Session>,
  buffered: VecDeque<Outgoing>,
}

impl ConnectionManager {
  pub fn new(endpoint: Option<PathBuf>) -> Self {
    Self {
      endpoint,
      allocated: false,
      session: None,
      buffered: VecDeque::new(),
    }
  }

  /// Configured endpoint, or a fresh unique socket path allocated once.
  pub fn resolve_endpoint_path(&mut self) -> &Path {
    let allocated = &mut self.allocated;
    self.endpoint.get_or_insert_with(|| {
      let dir = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
      let path = dir.join(format!("mpv-ipc-{}.sock", Uuid::new_v4()));
      log::debug!("Allocated IPC endpoint {}", path.display());
      *allocated = true;
      path
    })
  }

  /// Connect to the endpoint and flush buffered messages in order.
  ///
  /// Returns the number of flushed messages. Not retried on failure.
  pub async fn connect(&mut self) -> Result<usize, MpvError> {
    let path = self.resolve_endpoint_path().to_path_buf();
    let stream = UnixStream::connect(&path)
      .await
      .map_err(|source| MpvError::Connect {
        path: path.clone(),
        source,
      })?;

    log::info!("Connected to MPV IPC at {}", path.display());
    let mut session = Session::new(stream);
    let flushed = self.buffered.len();
    while let Some(outgoing) = self.buffered.pop_front() {
      session.transmit(outgoing);
    }
    self.session = Some(session);
    Ok(flushed)
  }

  /// Transmit now if connected, otherwise buffer until [`Self::connect`].
  pub fn send(&mut self, outgoing: Outgoing) {
    match self.session.as_mut() {
      Some(session) => session.transmit(outgoing),
      None => self.buffered.push_back(outgoing),
    }
  }

  pub fn is_connected(&self) -> bool {
    self.session.is_some()
  }

  pub fn buffered_len(&self) -> usize {
    self.buffered.len()
  }

  pub fn pending_len(&self) -> usize {
    self.session.as_ref().map_or(0, |s| s.pending.len())
  }

  pub fn pending_mut(&mut self) -> Option<&mut PendingQueue> {
    self.session.as_mut().map(|s| &mut s.pending)
  }

  /// Next inbound frame. Never resolves while disconnected.
  pub async fn next_frame(&mut self) -> Option<std::io::Result<DecodedFrame>> {
    match self.session.as_mut() {
      Some(session) => session.frames.next().await,
      None => std::future::pending().await,
    }
  }

  /// Drop the session, failing every reply slot it still holds.
  pub fn disconnect(&mut self, error: impl Fn() -> MpvError) {
    if let Some(mut session) = self.session.take() {
      if !session.pending.is_empty() {
        log::info!("Failing {} pending MPV commands", session.pending.len());
      }
      session.pending.fail_all(error);
    }
  }

  /// Disconnect, fail buffered messages and remove an allocated socket file.
  pub fn close(&mut self, error: impl Fn() -> MpvError) {
    self.disconnect(&error);
    for outgoing in self.buffered.drain(..) {
      outgoing.fail(error());
    }
    if self.allocated {
      if let Some(path) = &self.endpoint {
        let _ = std::fs::remove_file(path);
      }
    }
  }
}
