//! RecordIO framing: each record is preceded by its byte count as ASCII
//! decimal digits and a newline. The decoder is an incremental state machine
//! over `(pending size, buffer)` and is purely functional over that state.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// No well-formed length prefix is longer than this many digits; a buffer
/// that accumulates more without a newline is a malformed stream and is
/// rejected early rather than grown without bound.
const MAX_PREFIX_DIGITS: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("no record length prefix within {MAX_PREFIX_DIGITS} bytes")]
    PrefixTooLong,
    #[error("malformed record length prefix: {0:?}")]
    BadPrefix(String),
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    size: Option<usize>,
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; return every complete frame it closes over.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, FrameError> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            match self.size {
                None => match self.buf.iter().position(|b| *b == b'\n') {
                    Some(pos) => {
                        let prefix = self.buf.split_to(pos + 1);
                        let prefix = &prefix[..pos];
                        if prefix.len() > MAX_PREFIX_DIGITS {
                            return Err(FrameError::PrefixTooLong);
                        }
                        self.size = Some(parse_prefix(prefix)?);
                    }
                    None if self.buf.len() > MAX_PREFIX_DIGITS => {
                        return Err(FrameError::PrefixTooLong);
                    }
                    None => break,
                },
                Some(size) if self.buf.len() >= size => {
                    frames.push(self.buf.split_to(size).freeze());
                    self.size = None;
                }
                Some(_) => break,
            }
        }
        Ok(frames)
    }
}

fn parse_prefix(prefix: &[u8]) -> Result<usize, FrameError> {
    std::str::from_utf8(prefix)
        .ok()
        .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| FrameError::BadPrefix(String::from_utf8_lossy(prefix).into_owned()))
}

/// Encode one record. The inverse of the decoder; the mock master in the
/// tests speaks through this.
pub fn encode(frame: &[u8]) -> Vec<u8> {
    let mut out = format!("{}\n", frame.len()).into_bytes();
    out.extend_from_slice(frame);
    out
}
