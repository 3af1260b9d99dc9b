//! Content-Length framing for the caller-facing RPC stream.
//!
//! Every message on the wire is:
//! ```text
//! Content-Length: <decimal byte length of body>\r\n
//! \r\n
//! <body>
//! ```
//!
//! Decoding is an explicit state machine (`Head` -> `Body` or `Skip` -> `Head`).
//! A header that cannot be parsed is discarded through its separator and scanning
//! resumes on the following bytes, so one bad header never stops the stream.

use std::io;

use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const SEPARATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "content-length";

/// Largest body accepted before a frame is skipped.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Largest header block scanned before its bytes are discarded.
pub const DEFAULT_MAX_HEADER_LEN: usize = 8 * 1024;

/// Why a header block was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("header block is not valid UTF-8")]
    NotUtf8,
    #[error("no Content-Length header")]
    MissingLength,
    #[error("invalid Content-Length value {0:?}")]
    InvalidLength(String),
    #[error("conflicting Content-Length headers")]
    ConflictingLength,
    #[error("header block of {0} bytes exceeds the limit")]
    TooLong(usize),
}

/// Extract the declared body length from a header block (separator excluded).
///
/// The header name is matched case-insensitively. Lines that are not
/// `name: value` pairs and headers other than Content-Length are ignored.
pub fn parse_content_length(header: &[u8]) -> Result<usize, HeaderError> {
    let text = std::str::from_utf8(header).map_err(|_| HeaderError::NotUtf8)?;

    let mut length = None;
    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            continue;
        }

        let value = value.trim();
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(HeaderError::InvalidLength(value.to_string()));
        }
        let parsed: usize = value
            .parse()
            .map_err(|_| HeaderError::InvalidLength(value.to_string()))?;

        match length {
            Some(existing) if existing != parsed => return Err(HeaderError::ConflictingLength),
            _ => length = Some(parsed),
        }
    }

    length.ok_or(HeaderError::MissingLength)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Searching for the header separator. `scanned` bytes are known not to
    /// start a separator.
    Head { scanned: usize },
    /// Header parsed, waiting for `len` body bytes.
    Body { len: usize },
    /// Declared body exceeds the frame limit; dropping it byte-exactly.
    Skip { remaining: usize },
}

impl DecodeState {
    const START: Self = Self::Head { scanned: 0 };
}

/// Codec for Content-Length framed messages.
///
/// Decodes into complete bodies only; a partial frame is never yielded.
/// Encoding writes header and body into the destination buffer in one go so a
/// frame is flushed as a unit.
#[derive(Debug)]
pub struct ContentLengthCodec {
    state: DecodeState,
    max_frame_len: usize,
    max_header_len: usize,
}

impl Default for ContentLengthCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentLengthCodec {
    pub fn new() -> Self {
        Self {
            state: DecodeState::START,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_header_len: DEFAULT_MAX_HEADER_LEN,
        }
    }

    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    pub fn with_max_header_len(mut self, max: usize) -> Self {
        self.max_header_len = max;
        self
    }

    fn read_header(&mut self, src: &mut BytesMut, scanned: usize) -> Option<DecodeState> {
        let Some(at) = find_separator(src, scanned) else {
            if src.len() > self.max_header_len {
                // Keep a possible separator prefix at the tail.
                let dropped = src.len().saturating_sub(SEPARATOR.len() - 1);
                src.advance(dropped);
                tracing::warn!(dropped, "Discarding header bytes with no separator in sight");
                self.state = DecodeState::START;
            } else {
                self.state = DecodeState::Head {
                    scanned: src.len().saturating_sub(SEPARATOR.len() - 1),
                };
            }
            return None;
        };

        let block = src.split_to(at + SEPARATOR.len());
        let header = &block[..at];

        let parsed = if at > self.max_header_len {
            Err(HeaderError::TooLong(at))
        } else {
            parse_content_length(header)
        };

        let next = match parsed {
            Ok(len) if len > self.max_frame_len => {
                tracing::warn!(
                    len,
                    max = self.max_frame_len,
                    "Skipping frame larger than the maximum frame length"
                );
                DecodeState::Skip { remaining: len }
            }
            Ok(len) => DecodeState::Body { len },
            Err(error) => {
                tracing::warn!(
                    %error,
                    header = %String::from_utf8_lossy(header),
                    "Discarding malformed frame header"
                );
                DecodeState::START
            }
        };
        Some(next)
    }
}

fn find_separator(src: &[u8], from: usize) -> Option<usize> {
    src.get(from..)?
        .windows(SEPARATOR.len())
        .position(|window| window == SEPARATOR)
        .map(|pos| pos + from)
}

impl Decoder for ContentLengthCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::Head { scanned } => match self.read_header(src, scanned) {
                    Some(next) => self.state = next,
                    None => return Ok(None),
                },
                DecodeState::Body { len } => {
                    if src.len() < len {
                        src.reserve(len - src.len());
                        return Ok(None);
                    }
                    let body = src.split_to(len).freeze();
                    self.state = DecodeState::START;
                    return Ok(Some(body));
                }
                DecodeState::Skip { remaining } => {
                    let n = remaining.min(src.len());
                    src.advance(n);
                    if n < remaining {
                        self.state = DecodeState::Skip {
                            remaining: remaining - n,
                        };
                        return Ok(None);
                    }
                    self.state = DecodeState::START;
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        let dangling = !src.is_empty() || !matches!(self.state, DecodeState::Head { .. });
        if dangling {
            tracing::warn!(
                trailing_bytes = src.len(),
                "Discarding incomplete frame at end of stream"
            );
        }
        src.clear();
        self.state = DecodeState::START;
        Ok(None)
    }
}

impl Encoder<Bytes> for ContentLengthCodec {
    type Error = io::Error;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        dst.reserve(header.len() + body.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&body);
        Ok(())
    }
}
