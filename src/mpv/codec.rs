//! Newline-delimited JSON framing for the MPV IPC socket.
//!
//! Every complete line is one frame. A frame that fails to parse is reported
//! as a [`DecodeError`] item and never stops the frames behind it.

use std::borrow::Cow;
use std::fmt::Write as _;

use bytes::BytesMut;
use serde_json::Value;
use thiserror::Error;
use tokio_util::codec::Decoder;

/// A frame that could not be parsed as JSON.
#[derive(Debug, Error)]
#[error("{source} in frame {frame:?}")]
pub struct DecodeError {
  /// Sanitized frame text.
  pub frame: String,
  #[source]
  pub source: serde_json::Error,
}

/// One decoded frame, or the reason it could not be decoded.
pub type DecodedFrame = Result<Value, DecodeError>;

/// Incremental frame extractor.
///
/// Used either through [`FrameDecoder::feed`] with its own buffer, or as a
/// [`Decoder`] driving a `FramedRead`. Don't mix the two on one instance.
#[derive(Debug, Default)]
pub struct FrameDecoder {
  buffer: BytesMut,
  /// Bytes before this offset are known to contain no newline.
  next_index: usize,
}

impl FrameDecoder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Append bytes and iterate the frames that are now complete.
  ///
  /// Frames not pulled from the iterator stay buffered and are yielded by the
  /// next call.
  pub fn feed(&mut self, bytes: &[u8]) -> Frames<'_> {
    self.buffer.extend_from_slice(bytes);
    Frames { decoder: self }
  }

  /// Bytes of the trailing partial frame.
  pub fn pending_bytes(&self) -> usize {
    self.buffer.len()
  }
}

/// Lazy iterator over buffered complete frames, see [`FrameDecoder::feed`].
pub struct Frames<'a> {
  decoder: &'a mut FrameDecoder,
}

impl Iterator for Frames<'_> {
  type Item = DecodedFrame;

  fn next(&mut self) -> Option<Self::Item> {
    let FrameDecoder { buffer, next_index } = &mut *self.decoder;
    next_frame(buffer, next_index)
  }
}

impl Decoder for FrameDecoder {
  type Item = DecodedFrame;
  type Error = std::io::Error;

  fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
    Ok(next_frame(src, &mut self.next_index))
  }

  fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
    if let Some(frame) = self.decode(src)? {
      return Ok(Some(frame));
    }
    if !src.is_empty() {
      log::debug!("Dropping {} bytes of incomplete frame at end of stream", src.len());
      src.clear();
      self.next_index = 0;
    }
    Ok(None)
  }
}

/// Split the next complete frame off the front of `buf`.
fn next_frame(buf: &mut BytesMut, next_index: &mut usize) -> Option<DecodedFrame> {
  loop {
    let start = (*next_index).min(buf.len());
    let Some(offset) = buf[start..].iter().position(|b| *b == b'\n') else {
      *next_index = buf.len();
      return None;
    };

    let line = buf.split_to(start + offset + 1);
    *next_index = 0;

    let text = String::from_utf8_lossy(&line[..line.len() - 1]);
    let text = text.trim();
    if text.is_empty() {
      continue;
    }
    return Some(parse_frame(text));
  }
}

fn parse_frame(text: &str) -> DecodedFrame {
  let text = sanitize(text);
  serde_json::from_str(&text).map_err(|source| DecodeError {
    frame: text.into_owned(),
    source,
  })
}

/// Escape raw control characters inside JSON string literals.
///
/// MPV passes some strings (filenames, metadata) through unescaped, which
/// strict JSON parsers reject.
pub fn sanitize(text: &str) -> Cow<'_, str> {
  if !text.chars().any(char::is_control) {
    return Cow::Borrowed(text);
  }

  let mut out = String::with_capacity(text.len() + 8);
  let mut in_string = false;
  let mut escaped = false;
  for c in text.chars() {
    if in_string {
      if escaped {
        escaped = false;
      } else if c == '\\' {
        escaped = true;
      } else if c == '"' {
        in_string = false;
      } else if c.is_control() {
        let _ = write!(out, "\\u{:04x}", c as u32);
        continue;
      }
    } else if c == '"' {
      in_string = true;
    }
    out.push(c);
  }
  Cow::Owned(out)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn decode_all(decoder: &mut FrameDecoder, bytes: &[u8]) -> Vec<Result<Value, String>> {
    decoder
      .feed(bytes)
      .map(|frame| frame.map_err(|e| e.frame))
      .collect()
  }

  #[test]
  fn test_single_frame() {
    let mut decoder = FrameDecoder::new();
    let frames = decode_all(&mut decoder, b"{\"error\":\"success\",\"data\":50}\n");
    assert_eq!(frames, vec![Ok(json!({"error": "success", "data": 50}))]);
    assert_eq!(decoder.pending_bytes(), 0);
  }

  #[test]
  fn test_partial_frame_is_retained() {
    let mut decoder = FrameDecoder::new();
    let frames = decode_all(&mut decoder, b"{\"event\":\"pause\"}\n{\"err");
    assert_eq!(frames, vec![Ok(json!({"event": "pause"}))]);
    assert_eq!(decoder.pending_bytes(), b"{\"err".len());

    let frames = decode_all(&mut decoder, b"or\":\"success\"}\n");
    assert_eq!(frames, vec![Ok(json!({"error": "success"}))]);
    assert_eq!(decoder.pending_bytes(), 0);
  }

  #[test]
  fn test_chunk_boundaries_do_not_change_output() {
    let stream: &[u8] = b"{\"event\":\"start-file\",\"playlist_entry_id\":1}\n\
{\"error\":\"success\",\"data\":\"caf\xc3\xa9\"}\r\n\
not json\n\
\n\
{\"event\":\"property-change\",\"id\":1,\"name\":\"volume\",\"data\":42.5}\n\
{\"error\":\"success\"";

    let mut whole = FrameDecoder::new();
    let expected = decode_all(&mut whole, stream);
    assert_eq!(expected.len(), 4);

    for chunk_size in 1..stream.len() {
      let mut decoder = FrameDecoder::new();
      let mut frames = Vec::new();
      for chunk in stream.chunks(chunk_size) {
        frames.extend(decode_all(&mut decoder, chunk));
      }
      assert_eq!(frames, expected, "chunk size {}", chunk_size);
    }

    for split in 0..stream.len() {
      let mut decoder = FrameDecoder::new();
      let mut frames = decode_all(&mut decoder, &stream[..split]);
      frames.extend(decode_all(&mut decoder, &stream[split..]));
      assert_eq!(frames, expected, "split at {}", split);
    }
  }

  #[test]
  fn test_invalid_frame_does_not_block_later_frames() {
    let mut decoder = FrameDecoder::new();
    let frames = decode_all(&mut decoder, b"{\"error\":\n{\"event\":\"idle\"}\n");
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0], Err("{\"error\":".to_string()));
    assert_eq!(frames[1], Ok(json!({"event": "idle"})));
  }

  #[test]
  fn test_iteration_is_restartable() {
    let mut decoder = FrameDecoder::new();
    let first = decoder.feed(b"{\"a\":1}\n{\"b\":2}\n{\"c\":3}\n").next();
    assert_eq!(first.unwrap().unwrap(), json!({"a": 1}));

    let rest = decode_all(&mut decoder, b"");
    assert_eq!(rest, vec![Ok(json!({"b": 2})), Ok(json!({"c": 3}))]);
  }

  #[test]
  fn test_raw_control_characters_are_escaped() {
    let mut decoder = FrameDecoder::new();
    let frames = decode_all(&mut decoder, b"{\"data\":\"a\tb\x01c\"}\n");
    assert_eq!(frames, vec![Ok(json!({"data": "a\tb\u{1}c"}))]);
  }

  #[test]
  fn test_sanitize_leaves_structure_alone() {
    assert!(matches!(sanitize(r#"{"a": "b"}"#), Cow::Borrowed(_)));
    assert_eq!(sanitize("{\t\"a\":\"x\\\"\ty\"}"), "{\t\"a\":\"x\\\"\\u0009y\"}");
  }

  #[test]
  fn test_codec_eof_drops_partial_frame() {
    let mut decoder = FrameDecoder::new();
    let mut src = BytesMut::from(&b"{\"event\":\"idle\"}\n{\"par"[..]);
    let frame = decoder.decode_eof(&mut src).unwrap().unwrap().unwrap();
    assert_eq!(frame, json!({"event": "idle"}));
    assert!(decoder.decode_eof(&mut src).unwrap().is_none());
    assert!(src.is_empty());
  }
}
