//! Frame codec for the Content-Length framed transport.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `Header`: looking for the CRLFCRLF header terminator
//! - `Body`: header parsed, need N more payload bytes
//!
//! The declared content length is carried in the state across calls, so a
//! header is never re-parsed once its body length is known.
//!
//! # Wire format
//!
//! ```text
//! Content-Length: <decimal> CRLF
//! [<other header lines, ignored> CRLF ...]
//! CRLF
//! <payload bytes, UTF-8 JSON>
//! ```
//!
//! The field name is matched case-insensitively and unknown header lines are
//! skipped, so a `Content-Type` line does not disturb parsing.
//!
//! # Example
//!
//! ```
//! use markup_bridge::protocol::FrameCodec;
//! use serde_json::json;
//!
//! let mut codec = FrameCodec::new();
//! let bytes = FrameCodec::encode_message(&json!({"id": 1}));
//!
//! let payloads = codec.push(&bytes).unwrap();
//! assert_eq!(payloads, vec![json!({"id": 1})]);
//! ```

use bytes::{Bytes, BytesMut};
use serde_json::Value;

use crate::error::{BridgeError, Result};

/// Maximum bytes we will buffer while looking for the header terminator.
///
/// A peer that never sends CRLFCRLF must not make us buffer forever.
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "content-length";

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for a complete header block.
    Header,
    /// Header consumed, waiting for `length` payload bytes.
    Body { length: usize },
}

/// Stateful parser/encoder for Content-Length framed JSON payloads.
///
/// Bytes are appended incrementally as they arrive from the transport; the
/// codec extracts complete frames and leaves partial trailing data buffered
/// for the next call. Payload size has no fixed ceiling; memory use is
/// O(buffered bytes).
pub struct FrameCodec {
    /// Accumulated bytes from transport reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
}

impl FrameCodec {
    /// Create a new codec with an empty buffer.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::Header,
        }
    }

    /// Append transport bytes without attempting to decode.
    pub fn append(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Append data and extract all complete frames.
    ///
    /// Returns the decoded payloads (may be empty if still waiting for data).
    /// Fragmented trailing data stays buffered for the next push.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Framing`] on a header block without a valid
    /// Content-Length field, or when the header terminator is still absent
    /// after [`MAX_HEADER_SIZE`] buffered bytes.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Value>> {
        self.append(data);

        let mut payloads = Vec::new();
        while let Some(payload) = self.try_decode()? {
            payloads.push(payload);
        }
        Ok(payloads)
    }

    /// Try to extract a single frame from the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(payload))` if a complete frame was consumed
    /// - `Ok(None)` if more data is needed (buffer left unchanged)
    /// - `Err(...)` on a framing violation
    pub fn try_decode(&mut self) -> Result<Option<Value>> {
        match self.state {
            State::Header => {
                let Some(header_end) = find_terminator(&self.buffer) else {
                    if self.buffer.len() > MAX_HEADER_SIZE {
                        return Err(BridgeError::Framing(format!(
                            "no header terminator within {} bytes",
                            MAX_HEADER_SIZE
                        )));
                    }
                    return Ok(None);
                };

                let length = parse_content_length(&self.buffer[..header_end]).ok_or_else(
                    || BridgeError::Framing("header block has no Content-Length field".into()),
                )?;

                // Consume header + terminator; the declared length survives in
                // the state so partial bodies never cause a re-parse.
                let _ = self.buffer.split_to(header_end + HEADER_TERMINATOR.len());
                self.state = State::Body { length };

                // Body bytes may already be buffered.
                self.try_decode()
            }

            State::Body { length } => {
                if self.buffer.len() < length {
                    return Ok(None);
                }

                let body = self.buffer.split_to(length);
                self.state = State::Header;

                let payload = serde_json::from_slice(&body)?;
                Ok(Some(payload))
            }
        }
    }

    /// Encode a payload with its framing header.
    ///
    /// The declared length is the UTF-8 byte length of the serialized JSON,
    /// not its character count.
    pub fn encode_message(payload: &Value) -> Bytes {
        let body = payload.to_string();
        let mut out = BytesMut::with_capacity(body.len() + 32);
        out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
        out.extend_from_slice(body.as_bytes());
        out.freeze()
    }

    /// Get the number of buffered bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the offset of the CRLFCRLF header terminator, if present.
fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
}

/// Scan header lines for the first valid Content-Length field.
///
/// Field name is matched case-insensitively; the value is trimmed before
/// being parsed as a non-negative integer. Lines that do not match are
/// ignored for forward compatibility.
fn parse_content_length(header: &[u8]) -> Option<usize> {
    let header = std::str::from_utf8(header).ok()?;

    for line in header.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            continue;
        }
        if let Ok(length) = value.trim().parse::<usize>() {
            return Some(length);
        }
    }
    None
}
