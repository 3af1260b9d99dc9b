//! Newline-delimited codecs for the worker pipes.
//!
//! Wraps `LinesCodec` for framing. Decoding never fails on bad content: an
//! unparsable or oversized line is surfaced as a [`Line`] variant so the drain
//! reading the pipe can log it and keep going.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Longest line accepted from a worker pipe.
pub const DEFAULT_MAX_LINE_LEN: usize = 16 * 1024 * 1024;

/// One decoded line from a worker pipe.
#[derive(Debug, Clone, PartialEq)]
pub enum Line<T> {
    Message(T),
    /// Complete line that could not be decoded into `T`.
    Malformed { text: String, error: String },
    /// Line exceeded the length limit and was dropped.
    Oversized,
}

enum RawLine {
    Text(String),
    InvalidUtf8(String),
    Oversized,
}

fn read_line(inner: &mut LinesCodec, src: &mut BytesMut, eof: bool) -> io::Result<Option<RawLine>> {
    let decoded = if eof {
        inner.decode_eof(src)
    } else {
        inner.decode(src)
    };

    match decoded {
        Ok(Some(text)) => Ok(Some(RawLine::Text(text))),
        Ok(None) => Ok(None),
        Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(RawLine::Oversized)),
        Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
            Ok(Some(RawLine::InvalidUtf8(e.to_string())))
        }
        Err(LinesCodecError::Io(e)) => Err(e),
    }
}

/// JSON-per-line codec. Blank lines are skipped.
pub struct JsonLinesCodec<T> {
    inner: LinesCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LEN)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> JsonLinesCodec<T> {
    fn decode_line(&mut self, src: &mut BytesMut, eof: bool) -> io::Result<Option<Line<T>>> {
        loop {
            let Some(raw) = read_line(&mut self.inner, src, eof)? else {
                return Ok(None);
            };
            let line = match raw {
                RawLine::Text(text) if text.trim().is_empty() => continue,
                RawLine::Text(text) => match serde_json::from_str(&text) {
                    Ok(message) => Line::Message(message),
                    Err(e) => Line::Malformed {
                        text,
                        error: e.to_string(),
                    },
                },
                RawLine::InvalidUtf8(error) => Line::Malformed {
                    text: String::new(),
                    error,
                },
                RawLine::Oversized => Line::Oversized,
            };
            return Ok(Some(line));
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = Line<T>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode_line(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode_line(src, true)
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // Compact serde_json output never contains a raw newline.
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding worker line");
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Plain text lines, used for the worker's diagnostic stream.
pub struct TextLinesCodec {
    inner: LinesCodec,
}

impl Default for TextLinesCodec {
    fn default() -> Self {
        Self::with_max_length(64 * 1024)
    }
}

impl TextLinesCodec {
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
        }
    }

    fn decode_line(&mut self, src: &mut BytesMut, eof: bool) -> io::Result<Option<Line<String>>> {
        let line = read_line(&mut self.inner, src, eof)?.map(|raw| match raw {
            RawLine::Text(text) => Line::Message(text),
            RawLine::InvalidUtf8(error) => Line::Malformed {
                text: String::new(),
                error,
            },
            RawLine::Oversized => Line::Oversized,
        });
        Ok(line)
    }
}

impl Decoder for TextLinesCodec {
    type Item = Line<String>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode_line(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode_line(src, true)
    }
}
