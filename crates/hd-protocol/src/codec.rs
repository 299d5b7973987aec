//! Tokio codec for newline-delimited JSON messages
//!
//! Decoding yields raw lines so a connection can change which message
//! type it expects (a control connection becomes a session channel after
//! `open_session`). Use [`decode_message`] to turn a line into a typed
//! message. Encoding accepts any `Serialize` value.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Maximum length of a single line (8 MiB)
pub const MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

/// Codec splitting a byte stream into JSON lines
#[derive(Debug, Clone)]
pub struct JsonLineCodec {
    /// Index already scanned for a newline, so partial reads are not rescanned
    next_index: usize,
    /// Maximum accepted line length
    max_length: usize,
}

impl JsonLineCodec {
    /// Create a new codec with the default line limit
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    /// Create a codec with a custom line limit
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            next_index: 0,
            max_length,
        }
    }

    /// The configured line limit
    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for JsonLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(|b| b.is_ascii_whitespace())
}

impl Decoder for JsonLineCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let read_to = src.len();
            let newline = src[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            let Some(offset) = newline else {
                if read_to > self.max_length {
                    return Err(ProtocolError::LineTooLong {
                        size: read_to,
                        max: self.max_length,
                    });
                }
                // Need more data
                self.next_index = read_to;
                return Ok(None);
            };

            let newline_index = self.next_index + offset;
            self.next_index = 0;

            let mut line = src.split_to(newline_index + 1);
            line.truncate(newline_index);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            if line.len() > self.max_length {
                return Err(ProtocolError::LineTooLong {
                    size: line.len(),
                    max: self.max_length,
                });
            }

            if is_blank(&line) {
                continue;
            }

            return Ok(Some(line.freeze()));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }

        // Final line without a trailing newline
        self.next_index = 0;
        if src.is_empty() || is_blank(src) {
            src.clear();
            return Ok(None);
        }
        Ok(Some(src.split_to(src.len()).freeze()))
    }
}

impl<T: Serialize> Encoder<T> for JsonLineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;

        if payload.len() > self.max_length {
            return Err(ProtocolError::LineTooLong {
                size: payload.len(),
                max: self.max_length,
            });
        }

        dst.reserve(payload.len() + 1);
        dst.extend_from_slice(&payload);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Decode one line into a typed message
pub fn decode_message<T: DeserializeOwned>(line: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(line)?)
}
