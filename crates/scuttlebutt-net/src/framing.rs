//! Message framing for network transport
//!
//! One JSON value per line. Updates are arrays, digests are objects and the
//! sync marker is the string `"SYNC"`. Lines holding a malformed update or
//! an unknown value are dropped; a line that is not JSON at all is fatal.

use bytes::{BufMut, BytesMut};
use scuttlebutt_core::{Digest, Message, SYNC_MARKER};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// Maximum line size (16 MB)
const MAX_LINE_SIZE: usize = 16 * 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_LINE_SIZE})")]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Turn a decoded JSON value into a protocol message.
///
/// Returns `None` for values that should be ignored. An object that does not
/// decode as a digest is passed on as a digest without a clock so the
/// session can reject it as a protocol violation.
pub fn classify<P: DeserializeOwned>(value: Value) -> Option<Message<P>> {
    match value {
        Value::Array(_) => match serde_json::from_value(value) {
            Ok(update) => Some(Message::Update(update)),
            Err(e) => {
                debug!("Dropping malformed update: {}", e);
                None
            }
        },
        Value::Object(_) => match serde_json::from_value::<Digest>(value) {
            Ok(digest) => Some(Message::Digest(digest)),
            Err(e) => {
                debug!("Malformed digest: {}", e);
                Some(Message::Digest(Digest::default()))
            }
        },
        Value::String(ref s) if s == SYNC_MARKER => Some(Message::Sync),
        other => {
            debug!("Ignoring unknown message: {}", other);
            None
        }
    }
}

/// Codec for newline-delimited JSON messages
pub struct MessageCodec<P> {
    /// Bytes already scanned for a newline
    next_index: usize,
    _payload: PhantomData<fn() -> P>,
}

impl<P> MessageCodec<P> {
    pub fn new() -> Self {
        Self {
            next_index: 0,
            _payload: PhantomData,
        }
    }
}

impl<P> Default for MessageCodec<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: DeserializeOwned> MessageCodec<P> {
    fn decode_line(line: &[u8]) -> Result<Option<Message<P>>, FrameError> {
        if line.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let value: Value = serde_json::from_slice(line)?;
        Ok(classify(value))
    }
}

impl<P: DeserializeOwned> Decoder for MessageCodec<P> {
    type Item = Message<P>;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') else {
                self.next_index = src.len();
                if src.len() > MAX_LINE_SIZE {
                    return Err(FrameError::TooLarge(src.len()));
                }
                return Ok(None);
            };

            let line = src.split_to(self.next_index + offset + 1);
            self.next_index = 0;

            if let Some(message) = Self::decode_line(&line[..line.len() - 1])? {
                return Ok(Some(message));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }

        // Final line without a trailing newline
        self.next_index = 0;
        if src.is_empty() {
            return Ok(None);
        }
        let line = src.split_to(src.len());
        Self::decode_line(&line)
    }
}

impl<P: Serialize> Encoder<Message<P>> for MessageCodec<P> {
    type Error = FrameError;

    fn encode(&mut self, item: Message<P>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = serde_json::to_vec(&item)?;
        if bytes.len() > MAX_LINE_SIZE {
            return Err(FrameError::TooLarge(bytes.len()));
        }

        dst.reserve(bytes.len() + 1);
        dst.put_slice(&bytes);
        dst.put_u8(b'\n');

        Ok(())
    }
}
