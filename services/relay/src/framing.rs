//! Framed-transport parser.
//!
//! Every byte transport feeding the node (wired TCP, peer radio, upload
//! bodies) carries one of two frame shapes:
//! - An 8-ASCII-digit zero-padded decimal length prefix followed by exactly
//!   that many JSON payload bytes, or
//! - A bare JSON object starting with `{` (no prefix), emitted chunk-whole.
//!
//! The parser is a two-state machine fed arbitrary chunk sizes; it owns its
//! prefix and payload staging buffers, so each ingress task gets its own
//! instance.  Malformed input never propagates: the frame is discarded, the
//! state resets, and parsing re-synchronizes at the next chunk.

use tracing::warn;

/// Largest accepted payload, in bytes.  Anything larger is malformed.
pub const MAX_PAYLOAD_SIZE: usize = 8192;

/// Length of the zero-padded decimal prefix.
pub const PREFIX_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    AwaitingPrefix,
    Accumulating,
}

/// Incremental frame decoder.  One instance per ingress task.
pub struct FrameParser {
    state: ParserState,
    prefix: [u8; PREFIX_LEN],
    prefix_len: usize,
    payload: Vec<u8>,
    expected: usize,
}

impl FrameParser {
    pub fn new() -> Self {
        FrameParser {
            state: ParserState::AwaitingPrefix,
            prefix: [0; PREFIX_LEN],
            prefix_len: 0,
            payload: Vec::with_capacity(MAX_PAYLOAD_SIZE),
            expected: 0,
        }
    }

    /// Feed one transport chunk; returns the complete payloads it finished,
    /// in arrival order.  Never fails — malformed prefixes are logged, the
    /// remainder of the offending chunk is discarded, and the parser is
    /// ready for the next chunk.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut pos = 0;

        while pos < chunk.len() {
            match self.state {
                ParserState::AwaitingPrefix => {
                    // Raw-JSON short-circuit: a `{` with no prefix bytes
                    // buffered means the rest of the chunk IS the frame.
                    if self.prefix_len == 0 && chunk[pos] == b'{' {
                        frames.push(chunk[pos..].to_vec());
                        pos = chunk.len();
                        continue;
                    }

                    let want = PREFIX_LEN - self.prefix_len;
                    let take = want.min(chunk.len() - pos);
                    self.prefix[self.prefix_len..self.prefix_len + take]
                        .copy_from_slice(&chunk[pos..pos + take]);
                    self.prefix_len += take;
                    pos += take;

                    if self.prefix_len < PREFIX_LEN {
                        continue;
                    }

                    match parse_prefix(&self.prefix) {
                        Some(len) => {
                            self.expected = len;
                            self.payload.clear();
                            self.state = ParserState::Accumulating;
                        }
                        None => {
                            warn!(
                                prefix = %String::from_utf8_lossy(&self.prefix),
                                "invalid frame prefix, discarding and re-syncing"
                            );
                            self.reset();
                            // Re-sync boundary: consume no further bytes of
                            // this chunk.
                            return frames;
                        }
                    }
                }
                ParserState::Accumulating => {
                    let want = self.expected - self.payload.len();
                    let take = want.min(chunk.len() - pos);
                    self.payload.extend_from_slice(&chunk[pos..pos + take]);
                    pos += take;

                    if self.payload.len() == self.expected {
                        frames.push(std::mem::take(&mut self.payload));
                        self.reset();
                    }
                }
            }
        }

        frames
    }

    fn reset(&mut self) {
        self.state = ParserState::AwaitingPrefix;
        self.prefix_len = 0;
        self.payload = Vec::with_capacity(MAX_PAYLOAD_SIZE);
        self.expected = 0;
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate and parse an 8-digit prefix.  Returns `None` when any byte is
/// not an ASCII digit or the length is out of `(0, MAX_PAYLOAD_SIZE]`.
fn parse_prefix(prefix: &[u8; PREFIX_LEN]) -> Option<usize> {
    let mut len: usize = 0;
    for &b in prefix {
        if !b.is_ascii_digit() {
            return None;
        }
        len = len * 10 + usize::from(b - b'0');
    }
    if len == 0 || len > MAX_PAYLOAD_SIZE {
        return None;
    }
    Some(len)
}

/// Wrap a payload in the length-prefixed frame shape for writing back to a
/// framed transport.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PREFIX_LEN + payload.len());
    out.extend_from_slice(format!("{:08}", payload.len()).as_bytes());
    out.extend_from_slice(payload);
    out
}
