//! Length-prefixed chunk framing of batch responses.
//!
//! A response body looks like this:
//!
//! ```text
//! )]}'
//!
//! 104
//! [["wrb.fr","wXbhsf","[[\"a\"]]",null,null,null,"generic"]]
//! 25
//! [["e",4,null,null,140]]
//! ```
//!
//! The first line is an anti-XSSI guard. Each chunk is a decimal byte count
//! on its own line followed by that many bytes of JSON. A chunk body that
//! ends mid-value is continued by the next chunk.

use serde_json::Value;
use tracing::{debug, trace};

use crate::MAX_CHUNK_SIZE;
use crate::error::{DecodeError, DecodeResult};

/// Anti-XSSI guard preceding the first chunk.
pub const XSSI_PREFIX: &str = ")]}'";

/// Frames one chunk body with its length line.
pub fn encode_chunk(body: &str) -> String {
    format!("{}\n{}\n", body.len(), body)
}

/// Incremental decoder for the chunk stream.
///
/// Bytes may be fed in pieces of any size; the decoded chunks do not depend
/// on where the pieces were split.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    buffer: Vec<u8>,
    prefix_checked: bool,
    /// Declared length of the chunk whose body is still incomplete.
    pending: Option<usize>,
    /// Body text of a value that spans several chunks.
    carry: Vec<u8>,
    decoded: usize,
    trailing: bool,
    bytes_fed: usize,
    /// Overrides [`MAX_CHUNK_SIZE`].
    max_size: Option<usize>,
}

impl ChunkDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: cap both a single chunk and a value carried across chunks
    /// at `max` bytes instead of [`MAX_CHUNK_SIZE`].
    pub fn with_max_chunk_size(mut self, max: usize) -> Self {
        self.max_size = Some(max);
        self
    }

    fn max_size(&self) -> usize {
        self.max_size.unwrap_or(MAX_CHUNK_SIZE)
    }

    /// Total bytes fed so far.
    pub fn bytes_fed(&self) -> usize {
        self.bytes_fed
    }

    /// Number of chunk values decoded so far.
    pub fn chunks_decoded(&self) -> usize {
        self.decoded
    }

    /// Feeds more bytes, returning every chunk value completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> DecodeResult<Vec<Value>> {
        self.bytes_fed += bytes.len();
        if self.trailing {
            return Ok(Vec::new());
        }
        self.buffer.extend_from_slice(bytes);
        self.drain(false)
    }

    /// Signals end of stream, returning any chunk values still buffered.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Truncated`] if a declared chunk is incomplete
    /// and [`DecodeError::MalformedChunk`] if a value spanning chunks was
    /// never closed.
    pub fn finish(mut self) -> DecodeResult<Vec<Value>> {
        let chunks = self.drain(true)?;
        if !self.carry.is_empty() {
            return Err(DecodeError::MalformedChunk {
                reason: format!("unterminated value ({} bytes)", self.carry.len()),
            });
        }
        Ok(chunks)
    }

    fn drain(&mut self, eof: bool) -> DecodeResult<Vec<Value>> {
        let mut chunks = Vec::new();
        if !self.prefix_checked && !self.strip_prefix(eof) {
            return Ok(chunks);
        }
        while !self.trailing {
            match self.next_chunk(eof)? {
                Some(chunk) => chunks.push(chunk),
                None => break,
            }
        }
        Ok(chunks)
    }

    /// Returns false while the buffer could still turn into the prefix.
    fn strip_prefix(&mut self, eof: bool) -> bool {
        let prefix = XSSI_PREFIX.as_bytes();
        if !eof && self.buffer.len() < prefix.len() && prefix.starts_with(&self.buffer) {
            return false;
        }
        if self.buffer.starts_with(prefix) {
            self.buffer.drain(..prefix.len());
        }
        self.prefix_checked = true;
        true
    }

    fn next_chunk(&mut self, eof: bool) -> DecodeResult<Option<Value>> {
        loop {
            let len = match self.pending {
                Some(len) => len,
                None => match self.length_line(eof)? {
                    Some(len) => len,
                    None => return Ok(None),
                },
            };

            if self.buffer.len() < len {
                self.pending = Some(len);
                if eof {
                    return Err(DecodeError::Truncated {
                        expected: len,
                        available: self.buffer.len(),
                    });
                }
                return Ok(None);
            }
            self.pending = None;

            self.carry.extend(self.buffer.drain(..len));
            if self.carry.len() > self.max_size() {
                return Err(DecodeError::ChunkTooLarge {
                    size: self.carry.len(),
                    max: self.max_size(),
                });
            }
            if self.carry.iter().all(u8::is_ascii_whitespace) {
                self.carry.clear();
                continue;
            }

            match serde_json::from_slice::<Value>(&self.carry) {
                Ok(value @ Value::Array(_)) => {
                    self.carry.clear();
                    self.decoded += 1;
                    trace!(chunk = self.decoded, "decoded chunk");
                    return Ok(Some(value));
                }
                Ok(other) => {
                    return Err(DecodeError::MalformedChunk {
                        reason: format!("expected a JSON array, got {}", kind(&other)),
                    });
                }
                Err(e) if e.is_eof() => {
                    debug!(bytes = self.carry.len(), "chunk continues in next chunk");
                    continue;
                }
                Err(e) => {
                    return Err(DecodeError::MalformedChunk {
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// Reads the next length line, consuming it once complete.
    fn length_line(&mut self, eof: bool) -> DecodeResult<Option<usize>> {
        let Some(start) = self.buffer.iter().position(|b| !b.is_ascii_whitespace()) else {
            self.buffer.clear();
            return Ok(None);
        };
        self.buffer.drain(..start);

        let newline = self.buffer.iter().position(|&b| b == b'\n');
        let line_end = newline.unwrap_or(self.buffer.len());
        let line = self.buffer[..line_end].trim_ascii();
        let numeric = line.iter().all(u8::is_ascii_digit);

        if newline.is_none() && !eof && numeric {
            // The rest of the number may still be on its way.
            return Ok(None);
        }

        let parsed = if numeric {
            std::str::from_utf8(line).ok().and_then(|s| s.parse::<usize>().ok())
        } else {
            None
        };

        let Some(len) = parsed else {
            let line = String::from_utf8_lossy(line).chars().take(64).collect::<String>();
            return self.invalid_length(line);
        };

        if len > self.max_size() {
            return Err(DecodeError::ChunkTooLarge {
                size: len,
                max: self.max_size(),
            });
        }

        let consumed = newline.map_or(line_end, |n| n + 1);
        self.buffer.drain(..consumed);
        Ok(Some(len))
    }

    /// Garbage after at least one chunk is trailing noise; before that it
    /// means the body is not a chunk stream at all.
    fn invalid_length(&mut self, line: String) -> DecodeResult<Option<usize>> {
        if self.decoded > 0 && self.carry.is_empty() {
            debug!(line = %line, "ignoring trailing data after last chunk");
            self.trailing = true;
            self.buffer.clear();
            return Ok(None);
        }
        Err(DecodeError::InvalidLength { line })
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
