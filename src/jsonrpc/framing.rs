//! Content-Length message framing for JSON-RPC over byte streams.
//!
//! This module implements the HTTP-style framing used by the SQL Tools
//! Service (the same protocol as the Language Server Protocol).
//!
//! # Wire Format
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <message-body>
//! ```
//!
//! Header names are matched case-insensitively, unknown headers are ignored,
//! and both CRLF and LF line endings are accepted on the read side.

use std::io::{BufRead, Read};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Maximum message size (100MB) to prevent OOM from a misbehaving engine.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

const CONTENT_LENGTH: &str = "Content-Length";

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum FramingError {
    /// A header line had no `name: value` shape or was not UTF-8.
    #[error("Malformed header line: {0:?}")]
    MalformedHeader(String),

    /// The header block ended without a Content-Length header.
    #[error("Content-Length was not found in headers received")]
    MissingContentLength,

    /// The Content-Length value was not a decimal byte count.
    #[error("Invalid Content-Length value: {0}")]
    InvalidContentLength(String),

    /// The declared body is larger than [`MAX_MESSAGE_SIZE`].
    #[error("Message size {size} exceeds maximum {max} bytes")]
    TooLarge {
        /// Declared body length.
        size: usize,
        /// Configured upper bound.
        max: usize,
    },

    /// The stream ended in the middle of the header block.
    #[error("Stream ended while reading frame headers")]
    TruncatedHeaders,

    /// The stream ended before the declared number of body bytes arrived.
    #[error("Stream ended after {received} of {expected} body bytes")]
    TruncatedBody {
        /// Declared body length.
        expected: usize,
        /// Bytes actually read before end-of-stream.
        received: usize,
    },

    /// The body was not a valid JSON document.
    #[error("Message body is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// The outgoing value could not be serialized.
    #[error("Failed to serialize message: {0}")]
    Encode(#[source] serde_json::Error),

    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// JSON-RPC 2.0 request envelope as written on the wire.
#[derive(Debug, Serialize)]
struct RequestEnvelope<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: &'a Value,
    id: u64,
}

/// Frame an arbitrary JSON value.
///
/// The header carries the byte length of the serialized body, so multi-byte
/// characters are counted in bytes rather than characters.
pub fn encode_message(message: &Value) -> Result<Vec<u8>, FramingError> {
    let body = serde_json::to_vec(message).map_err(FramingError::Encode)?;
    Ok(frame_body(&body))
}

/// Frame a JSON-RPC request `{jsonrpc, method, params, id}`.
pub fn encode_request(method: &str, params: &Value, id: u64) -> Result<Vec<u8>, FramingError> {
    let envelope = RequestEnvelope {
        jsonrpc: "2.0",
        method,
        params,
        id,
    };
    let body = serde_json::to_vec(&envelope).map_err(FramingError::Encode)?;
    Ok(frame_body(&body))
}

fn frame_body(body: &[u8]) -> Vec<u8> {
    let header = format!("{}: {}\r\n\r\n", CONTENT_LENGTH, body.len());
    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Read one Content-Length framed JSON message from the stream.
///
/// # Protocol
///
/// 1. Read headers until an empty line (handles both CRLF and LF)
/// 2. Extract Content-Length header (case-insensitive)
/// 3. Read exactly that many bytes for the body and parse them as JSON
///
/// Returns `Ok(None)` when the stream ends cleanly before the first header
/// byte of a frame.
///
/// # Errors
///
/// Returns an error if:
/// - A header line is malformed or the header block is cut short
/// - No Content-Length header is found, or its value is not numeric
/// - Content-Length exceeds [`MAX_MESSAGE_SIZE`]
/// - The body is shorter than declared or is not valid JSON
pub fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<Value>, FramingError> {
    let Some(size) = read_headers(reader)? else {
        return Ok(None);
    };

    let mut body = Vec::with_capacity(size);
    reader.by_ref().take(size as u64).read_to_end(&mut body)?;
    if body.len() < size {
        return Err(FramingError::TruncatedBody {
            expected: size,
            received: body.len(),
        });
    }

    serde_json::from_slice(&body)
        .map(Some)
        .map_err(FramingError::InvalidJson)
}

/// Read the header block and return the declared body length.
fn read_headers<R: BufRead>(reader: &mut R) -> Result<Option<usize>, FramingError> {
    let mut content_length: Option<usize> = None;
    let mut first_line = true;

    loop {
        let mut raw = Vec::new();
        let bytes_read = reader.read_until(b'\n', &mut raw)?;

        if bytes_read == 0 {
            if first_line {
                return Ok(None);
            }
            return Err(FramingError::TruncatedHeaders);
        }
        first_line = false;

        if raw.last() != Some(&b'\n') {
            return Err(FramingError::TruncatedHeaders);
        }

        let line = String::from_utf8(raw).map_err(|e| {
            FramingError::MalformedHeader(String::from_utf8_lossy(e.as_bytes()).into_owned())
        })?;
        let trimmed = line.trim();

        // Empty line signals end of headers
        if trimmed.is_empty() {
            break;
        }

        let Some((key, value)) = trimmed.split_once(':') else {
            return Err(FramingError::MalformedHeader(trimmed.to_string()));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(FramingError::MalformedHeader(trimmed.to_string()));
        }

        if key.eq_ignore_ascii_case(CONTENT_LENGTH) {
            let value = value.trim();
            let size: usize = value
                .parse()
                .map_err(|_| FramingError::InvalidContentLength(value.to_string()))?;
            content_length = Some(size);
        }
        // Ignore other headers (e.g., Content-Type)
    }

    let size = content_length.ok_or(FramingError::MissingContentLength)?;
    if size > MAX_MESSAGE_SIZE {
        return Err(FramingError::TooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }

    Ok(Some(size))
}

/// Lazy sequence of decoded frames.
///
/// Each call to `next` decodes exactly one frame. The iterator ends after a
/// clean end-of-stream and after yielding the first error.
pub struct FrameDecoder<R> {
    reader: R,
    finished: bool,
}

impl<R: BufRead> FrameDecoder<R> {
    /// Wrap a buffered reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            finished: false,
        }
    }
}

impl<R: BufRead> Iterator for FrameDecoder<R> {
    type Item = Result<Value, FramingError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match read_message(&mut self.reader) {
            Ok(Some(message)) => Some(Ok(message)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

impl<R: BufRead> std::iter::FusedIterator for FrameDecoder<R> {}
