//! Incremental readers that cut a byte stream into individual CoT messages.
//!
//! Neither wire format carries a length up front that a generic framer could
//! use, so each gets its own reader:
//!
//! - [`TagReader`] – markup.  Scans for one complete top-level element
//!   (`<event ...>...</event>` or `<event .../>`) and returns its bytes.
//! - [`FrameReader`] – binary.  Each message is
//!
//!   ```text
//!   [0xBF][varint payload_len][payload: payload_len bytes]
//!   ```
//!
//! Both readers wrap any [`AsyncBufRead`], so a session can hand the same
//! buffered socket reader to a `TagReader` before the protocol upgrade and to
//! a `FrameReader` after it without losing bytes that were already buffered.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncReadExt};

use crate::protocol::varint::{encode_varint, encoded_len, VarintDecoder, VarintError};

/// First byte of every binary frame.
pub const MAGIC: u8 = 0xBF;

/// Default ceiling for one markup tag, in bytes.
pub const DEFAULT_MAX_TAG_LEN: usize = 8 * 1024;

/// Default ceiling for one binary payload, in bytes.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Errors produced while cutting the stream into messages.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed the stream.
    #[error("end of stream")]
    Eof,

    /// The underlying reader failed.
    #[error("read error: {0}")]
    Io(io::Error),

    /// A markup tag grew past the configured ceiling without completing.
    #[error("tag exceeds {limit} bytes")]
    TagTooLong { limit: usize },

    /// A closing tag arrived with no open element.
    #[error("unexpected closing tag </{0}>")]
    ClosedTag(String),

    /// The length prefix of a binary frame was not a valid varint.
    #[error("malformed frame length: {0}")]
    MalformedVarint(#[from] VarintError),

    /// A binary frame announced more bytes than the configured ceiling.
    #[error("frame of {len} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { len: u64, limit: usize },
}

impl FrameError {
    /// True for errors after which the stream cannot be read any further.
    ///
    /// An oversized binary frame counts as fatal because skipping it would
    /// mean trusting a length that is already known to be bogus.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FrameError::Eof | FrameError::Io(_) | FrameError::FrameTooLarge { .. }
        )
    }
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::Eof
        } else {
            FrameError::Io(e)
        }
    }
}

/// One complete markup element as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTag {
    /// Element name, e.g. `event`, `?xml` or `auth`.
    pub name: String,
    /// Every byte from the opening `<` to the final `>`.
    pub data: Vec<u8>,
}

// ── TagReader ─────────────────────────────────────────────────────────────────

/// Reads one complete markup element at a time.
#[derive(Debug)]
pub struct TagReader<R> {
    inner: R,
    max_len: usize,
}

impl<R: AsyncBufRead + Unpin> TagReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            max_len: DEFAULT_MAX_TAG_LEN,
        }
    }

    /// Overrides the per-tag byte ceiling.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Reads the next element.
    ///
    /// Bytes before the first `<` are discarded.  Declarations (`<?..?>`),
    /// comments (`<!..>`) and self-closing elements are returned as soon as
    /// their `>` arrives; any other element is returned once its exact
    /// `</name>` has been read.
    ///
    /// # Errors
    ///
    /// - [`FrameError::Eof`] / [`FrameError::Io`] when the source ends or fails.
    /// - [`FrameError::TagTooLong`] when the element passes the ceiling; the
    ///   consumed bytes are dropped and the next call resynchronises on the
    ///   following `<`.
    /// - [`FrameError::ClosedTag`] for a stray `</name>`.
    pub async fn read_tag(&mut self) -> Result<RawTag, FrameError> {
        let mut data = self.read_open_tag().await?;
        let name = tag_name(&data);

        if data.starts_with(b"</") {
            return Err(FrameError::ClosedTag(name));
        }
        if name.starts_with('?') || name.starts_with('!') || data.ends_with(b"/>") {
            return Ok(RawTag { name, data });
        }

        let closing = format!("</{name}>").into_bytes();
        // Bytes of the tag currently being scanned, from its `<`.
        let mut piece: Vec<u8> = Vec::new();

        loop {
            let byte = self.inner.read_u8().await?;
            data.push(byte);
            if data.len() > self.max_len {
                return Err(FrameError::TagTooLong {
                    limit: self.max_len,
                });
            }

            if byte == b'<' {
                piece.clear();
            }
            piece.push(byte);
            if byte == b'>' {
                if piece == closing {
                    return Ok(RawTag { name, data });
                }
                piece.clear();
            }
        }
    }

    /// Reads from the next `<` through the matching `>`.  A second `<` before
    /// the `>` abandons the partial tag and starts over from it.
    async fn read_open_tag(&mut self) -> Result<Vec<u8>, FrameError> {
        while self.inner.read_u8().await? != b'<' {}

        let mut buf = vec![b'<'];
        loop {
            let byte = self.inner.read_u8().await?;
            match byte {
                b'<' => {
                    buf.clear();
                    buf.push(b'<');
                }
                b'>' => {
                    buf.push(byte);
                    return Ok(buf);
                }
                _ => {
                    buf.push(byte);
                    if buf.len() > self.max_len {
                        return Err(FrameError::TagTooLong {
                            limit: self.max_len,
                        });
                    }
                }
            }
        }
    }
}

/// Extracts the element name: the text between `<` and `>`, stripped of
/// slashes and cut at the first whitespace.
fn tag_name(tag: &[u8]) -> String {
    let text = String::from_utf8_lossy(tag);
    text.trim_matches(|c| c == '<' || c == '>' || c == '/')
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string()
}

// ── FrameReader ───────────────────────────────────────────────────────────────

/// Reads one magic-prefixed, length-delimited binary payload at a time.
///
/// There is no checksum: after a corrupted length the reader stays out of
/// step until it happens to land on another [`MAGIC`] byte.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    max_len: usize,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            max_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Overrides the per-frame payload ceiling.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Reads the next payload, skipping any bytes before the magic byte.
    ///
    /// # Errors
    ///
    /// - [`FrameError::Eof`] / [`FrameError::Io`] when the source ends or fails,
    ///   including a short payload.
    /// - [`FrameError::MalformedVarint`] for a bad length prefix.
    /// - [`FrameError::FrameTooLarge`] when the length passes the ceiling.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>, FrameError> {
        while self.inner.read_u8().await? != MAGIC {}

        let mut decoder = VarintDecoder::default();
        let len = loop {
            let byte = self.inner.read_u8().await?;
            if let Some(len) = decoder.push(byte)? {
                break len;
            }
        };

        if len > self.max_len as u64 {
            return Err(FrameError::FrameTooLarge {
                len,
                limit: self.max_len,
            });
        }

        let mut payload = vec![0u8; len as usize];
        self.inner.read_exact(&mut payload).await?;
        Ok(payload)
    }
}

/// Wraps `payload` in a binary frame: magic byte, varint length, payload.
pub fn make_frame(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u64;
    let mut buf = Vec::with_capacity(1 + encoded_len(len) + payload.len());
    buf.push(MAGIC);
    encode_varint(len, &mut buf);
    buf.extend_from_slice(payload);
    buf
}

// ── Tests ─────────────────────────────────────────────────────────────────────
