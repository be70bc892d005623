//! Chunked transfer coding.
//!
//! # States
//! ```text
//! Size ──hex──▶ Size ──;/SP──▶ SizeExt ──CR──▶ SizeLf ──LF──▶ Data | Last
//! Data ──payload──▶ DataCrlf ──CR──▶ DataLf ──LF──▶ Size
//! Last ──CR LF──▶ Done
//! Last ──field──▶ Trailer ──LF──▶ Last
//! ```
//!
//! # Design Decisions
//! - The decoder never buffers payload; `decode` hands back a slice of the
//!   caller's input so the caller decides where the bytes go
//! - A bare LF is accepted wherever CRLF is expected
//! - Declared sizes above the configured maximum are rejected before any
//!   payload is read

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Terminating chunk with an empty trailer section.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Longest size line, extension or trailer line we accept.
const MAX_LINE: usize = 4096;

/// Decoder state; persists between `decode` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkedState {
    Size,
    SizeExt,
    SizeLf,
    Data,
    DataCrlf,
    DataLf,
    Last,
    LastLf,
    Trailer,
    Done,
}

/// Framing errors. All of them are fatal for the response.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkedError {
    #[error("invalid byte {0:#04x} in chunk size")]
    InvalidSize(u8),

    #[error("missing chunk size")]
    EmptySize,

    #[error("chunk size exceeds limit of {max} bytes")]
    ChunkTooLarge { max: u64 },

    #[error("chunk data exceeds its declared size (found {0:#04x})")]
    DataOverrun(u8),

    #[error("invalid byte {0:#04x} after last chunk")]
    InvalidTrailer(u8),

    #[error("chunk framing line longer than {MAX_LINE} bytes")]
    LineTooLong,

    #[error("stream ended in state {0:?}")]
    UnexpectedEof(ChunkedState),
}

/// Result of one `decode` step.
#[derive(Debug, PartialEq, Eq)]
pub struct Decoded<'a> {
    /// Bytes of input consumed, framing and payload together.
    pub consumed: usize,
    /// Payload bytes; always the tail of the consumed range.
    pub data: &'a [u8],
    /// State after this step.
    pub state: ChunkedState,
}

/// Incremental chunked body decoder.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkedState,
    remaining: u64,
    total: u64,
    digits: usize,
    line_len: usize,
    max_chunk_size: u64,
}

impl ChunkedDecoder {
    pub fn new(max_chunk_size: u64) -> Self {
        Self {
            state: ChunkedState::Size,
            remaining: 0,
            total: 0,
            digits: 0,
            line_len: 0,
            max_chunk_size,
        }
    }

    pub fn state(&self) -> ChunkedState {
        self.state
    }

    /// Payload bytes left in the current chunk.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Payload bytes decoded so far.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkedState::Done
    }

    /// Consume framing bytes and at most one run of payload.
    ///
    /// Returns with `consumed < input.len()` only when payload was produced
    /// or the terminating chunk has been seen; callers loop until their input
    /// is exhausted.
    pub fn decode<'a>(&mut self, input: &'a [u8]) -> Result<Decoded<'a>, ChunkedError> {
        let mut pos = 0;

        while pos < input.len() {
            match self.state {
                ChunkedState::Done => break,
                ChunkedState::Data => {
                    let available = (input.len() - pos) as u64;
                    let take = self.remaining.min(available) as usize;
                    let data = &input[pos..pos + take];
                    self.remaining -= take as u64;
                    self.total += take as u64;
                    if self.remaining == 0 {
                        self.state = ChunkedState::DataCrlf;
                    }
                    return Ok(Decoded { consumed: pos + take, data, state: self.state });
                }
                _ => {
                    self.step(input[pos])?;
                    pos += 1;
                }
            }
        }

        Ok(Decoded { consumed: pos, data: &[], state: self.state })
    }

    /// Give back the last `n` payload bytes returned by `decode`.
    ///
    /// `n` must not exceed the length of the most recent `data` slice.
    pub fn rewind(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.remaining += n as u64;
        self.total -= n as u64;
        self.state = ChunkedState::Data;
    }

    /// Called at end of stream; anything short of `Done` is a framing error.
    pub fn finish(&self) -> Result<(), ChunkedError> {
        match self.state {
            ChunkedState::Done => Ok(()),
            state => Err(ChunkedError::UnexpectedEof(state)),
        }
    }

    fn step(&mut self, b: u8) -> Result<(), ChunkedError> {
        self.line_len += 1;
        if self.line_len > MAX_LINE {
            return Err(ChunkedError::LineTooLong);
        }

        match self.state {
            ChunkedState::Size => match b {
                b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => self.push_digit(b)?,
                b';' | b' ' | b'\t' => {
                    self.require_digits()?;
                    self.state = ChunkedState::SizeExt;
                }
                b'\r' => {
                    self.require_digits()?;
                    self.state = ChunkedState::SizeLf;
                }
                b'\n' => {
                    self.require_digits()?;
                    self.end_size_line();
                }
                _ => return Err(ChunkedError::InvalidSize(b)),
            },
            ChunkedState::SizeExt => match b {
                b'\r' => self.state = ChunkedState::SizeLf,
                b'\n' => self.end_size_line(),
                _ => {}
            },
            ChunkedState::SizeLf => match b {
                b'\n' => self.end_size_line(),
                _ => return Err(ChunkedError::InvalidSize(b)),
            },
            ChunkedState::DataCrlf => match b {
                b'\r' => self.state = ChunkedState::DataLf,
                b'\n' => self.next_chunk(),
                _ => return Err(ChunkedError::DataOverrun(b)),
            },
            ChunkedState::DataLf => match b {
                b'\n' => self.next_chunk(),
                _ => return Err(ChunkedError::DataOverrun(b)),
            },
            ChunkedState::Last => match b {
                b'\r' => self.state = ChunkedState::LastLf,
                b'\n' => self.state = ChunkedState::Done,
                _ => self.state = ChunkedState::Trailer,
            },
            ChunkedState::LastLf => match b {
                b'\n' => self.state = ChunkedState::Done,
                _ => return Err(ChunkedError::InvalidTrailer(b)),
            },
            ChunkedState::Trailer => {
                if b == b'\n' {
                    self.line_len = 0;
                    self.state = ChunkedState::Last;
                }
            }
            ChunkedState::Data | ChunkedState::Done => unreachable!("handled by decode"),
        }
        Ok(())
    }

    fn push_digit(&mut self, b: u8) -> Result<(), ChunkedError> {
        let value = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            _ => b - b'A' + 10,
        };
        let max = self.max_chunk_size;
        self.remaining = self
            .remaining
            .checked_mul(16)
            .and_then(|v| v.checked_add(u64::from(value)))
            .filter(|&v| v <= max)
            .ok_or(ChunkedError::ChunkTooLarge { max })?;
        self.digits += 1;
        Ok(())
    }

    fn require_digits(&self) -> Result<(), ChunkedError> {
        if self.digits == 0 {
            return Err(ChunkedError::EmptySize);
        }
        Ok(())
    }

    fn end_size_line(&mut self) {
        self.digits = 0;
        self.line_len = 0;
        self.state = if self.remaining == 0 {
            ChunkedState::Last
        } else {
            ChunkedState::Data
        };
    }

    fn next_chunk(&mut self) {
        self.line_len = 0;
        self.remaining = 0;
        self.state = ChunkedState::Size;
    }
}

/// Frame `data` as one chunk. Empty input writes nothing, since an empty
/// chunk would terminate the body.
pub fn encode_chunk(data: &[u8], out: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    out.reserve(data.len() + 20);
    out.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.put_slice(data);
    out.put_slice(b"\r\n");
}

/// Terminate a chunked body.
pub fn encode_last_chunk(out: &mut BytesMut) {
    out.put_slice(LAST_CHUNK);
}
