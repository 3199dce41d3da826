//! Length-prefixed text framing for TCP streams.
//!
//! Every message on the wire looks like:
//!
//! ```text
//!  <length>: <TYPE> <payload>
//! ```
//!
//! A leading blank, the ASCII decimal `length`, the `": "` separator, then
//! exactly `length` bytes holding the message type token, one blank and the
//! payload. The length is counted in UTF-8 encoded bytes, one byte per unit;
//! the encoder never emits any other unit.
//!
//! [`FrameDecoder`] re-assembles frames from arbitrarily split reads. It never
//! loses or duplicates bytes: an incomplete frame leaves the read cursor in
//! front of its length marker until more input arrives.

use tokio::io::AsyncWriteExt;

/// Separator between the declared length and the frame body.
const SEPARATOR: &[u8] = b": ";

/// Longest header text accepted in front of the separator. A peer that sends
/// more than this without a separator is resynchronised, not buffered.
pub const MAX_HEADER_LEN: usize = 32;

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed body size in bytes. Default: 1 MB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }
}

/// One decoded frame: the type token and the raw payload behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// ASCII message type token, e.g. `MOVE`.
    pub kind: String,
    /// Payload bytes following the type token and its blank.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame from a type token and payload.
    pub fn new(kind: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
        }
    }

    /// Declared length of this frame on the wire.
    pub fn wire_len(&self) -> usize {
        self.kind.len() + 1 + self.payload.len()
    }

    /// Encode the frame including its length header.
    pub fn encode(&self) -> Vec<u8> {
        encode_frame(&self.kind, &self.payload)
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The text in front of `": "` holds no decimal length.
    #[error("malformed frame header {header:?}")]
    MalformedHeader {
        /// The offending header text, lossily decoded.
        header: String,
    },

    /// The declared size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The declared size.
        size: usize,
        /// The configured maximum.
        max: u32,
    },

    /// The message could not be turned into a frame.
    #[error("encode failed: {0}")]
    Encode(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode `kind` and `payload` into one wire frame.
pub fn encode_frame(kind: &str, payload: &[u8]) -> Vec<u8> {
    let length = kind.len() + 1 + payload.len();
    let header = format!(" {length}: {kind} ");
    let mut out = Vec::with_capacity(header.len() + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Write already encoded frame bytes and flush.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    encoded: &[u8],
) -> Result<(), FrameError> {
    writer.write_all(encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Incremental frame re-assembly over an append-only byte buffer.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    consumed: usize,
    max_payload_size: u32,
    /// Body bytes of a rejected oversized frame still to be discarded.
    skip_remaining: usize,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new(config: &FrameConfig) -> Self {
        Self {
            buf: Vec::new(),
            consumed: 0,
            max_payload_size: config.max_payload_size,
            skip_remaining: 0,
        }
    }

    /// Append freshly read bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet consumed by a decoded frame.
    pub fn pending(&self) -> usize {
        self.buf.len() - self.consumed
    }

    /// Drop the consumed prefix of the buffer.
    pub fn compact(&mut self) {
        if self.consumed > 0 {
            self.buf.drain(..self.consumed);
            self.consumed = 0;
        }
    }

    /// Decode the next complete frame.
    ///
    /// Returns `None` when more input is needed. A malformed header is
    /// reported once and skipped so the caller can keep reading. The body of
    /// an oversized frame is discarded as it arrives and never scanned for
    /// headers.
    pub fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        if self.discard_skipped() {
            return None;
        }

        let rest = &self.buf[self.consumed..];
        let window = &rest[..rest.len().min(MAX_HEADER_LEN + SEPARATOR.len())];
        let Some(sep) = find_separator(window) else {
            if window.len() < MAX_HEADER_LEN + SEPARATOR.len() {
                return None;
            }
            // No separator can start inside the first MAX_HEADER_LEN + 1 bytes.
            let dropped = MAX_HEADER_LEN + 1;
            let header = String::from_utf8_lossy(&rest[..dropped]).into_owned();
            self.consumed += dropped;
            return Some(Err(FrameError::MalformedHeader { header }));
        };
        let body_start = self.consumed + sep + SEPARATOR.len();

        let length = match parse_length(&rest[..sep]) {
            Some(length) => length,
            None => {
                let header = String::from_utf8_lossy(&rest[..sep]).into_owned();
                self.consumed = body_start;
                return Some(Err(FrameError::MalformedHeader { header }));
            }
        };

        if length > self.max_payload_size as usize {
            self.consumed = body_start;
            self.skip_remaining = length;
            self.discard_skipped();
            return Some(Err(FrameError::PayloadTooLarge {
                size: length,
                max: self.max_payload_size,
            }));
        }

        if self.buf.len() - body_start < length {
            // Incomplete: leave the cursor in front of the length marker.
            return None;
        }

        let body = &self.buf[body_start..body_start + length];
        let frame = split_body(body);
        self.consumed = body_start + length;
        Some(Ok(frame))
    }

    /// Consume what is buffered of a rejected body. Returns `true` while more
    /// of it is still expected.
    fn discard_skipped(&mut self) -> bool {
        let take = self.skip_remaining.min(self.pending());
        self.consumed += take;
        self.skip_remaining -= take;
        self.skip_remaining > 0
    }

    /// The stream is closed: hand out whatever follows the last header as the
    /// final frame, regardless of its declared length.
    pub fn finish(&mut self) -> Option<Frame> {
        if self.discard_skipped() {
            self.consumed = self.buf.len();
            self.skip_remaining = 0;
            return None;
        }
        let rest = &self.buf[self.consumed..];
        let sep = find_separator(rest)?;
        let body = &rest[sep + SEPARATOR.len()..];
        if body.is_empty() {
            return None;
        }
        let frame = split_body(body);
        self.consumed = self.buf.len();
        Some(frame)
    }
}

fn find_separator(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(SEPARATOR.len())
        .position(|window| window == SEPARATOR)
}

/// Leading blanks are ignored and any non-digit suffix is stripped.
fn parse_length(header: &[u8]) -> Option<usize> {
    let digits: Vec<u8> = header
        .iter()
        .skip_while(|b| b.is_ascii_whitespace())
        .take_while(|b| b.is_ascii_digit())
        .copied()
        .collect();
    if digits.is_empty() {
        return None;
    }
    std::str::from_utf8(&digits).ok()?.parse().ok()
}

fn split_body(body: &[u8]) -> Frame {
    match body.iter().position(|b| *b == b' ') {
        Some(blank) => Frame {
            kind: String::from_utf8_lossy(&body[..blank]).into_owned(),
            payload: body[blank + 1..].to_vec(),
        },
        None => Frame {
            kind: String::from_utf8_lossy(body).into_owned(),
            payload: Vec::new(),
        },
    }
}
