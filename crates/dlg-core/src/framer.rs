//! Newline framing over a chunked byte stream.
//!
//! Splitting happens on raw bytes and only complete lines are decoded, so a
//! multi-byte character split across two chunks is reassembled before it is
//! turned into text (`\n` never occurs inside a UTF-8 sequence).

use std::collections::VecDeque;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::warn;

use crate::error::Error;

/// Incremental line splitter. Carries the incomplete tail between chunks.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every line it completed, without the
    /// terminator (`\n` or `\r\n`).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            lines.push(decode_line(&self.buffer[start..end]));
            start = end + 1;
        }
        self.buffer.drain(..start);
        lines
    }

    /// Bytes received after the last newline.
    pub fn remainder(&self) -> &[u8] {
        &self.buffer
    }

    /// Flush the unterminated tail at end of data.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let tail = decode_line(&self.buffer);
        self.buffer.clear();
        Some(tail)
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    match std::str::from_utf8(raw) {
        Ok(s) => s.to_string(),
        Err(e) => {
            warn!("Invalid UTF-8 in stream line: {}", e);
            String::from_utf8_lossy(raw).into_owned()
        }
    }
}

/// One framed line. `terminated` is false only for a tail flushed at end of
/// data without its newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub text: String,
    pub terminated: bool,
}

impl Line {
    fn complete(text: String) -> Self {
        Self {
            text,
            terminated: true,
        }
    }
}

struct FrameState<S> {
    bytes: S,
    framer: LineFramer,
    pending: VecDeque<Line>,
    done: bool,
}

/// Turn a byte stream into a lazy, finite stream of lines. A transport error
/// is yielded once and ends the stream.
pub fn frame_lines<S>(bytes: S) -> impl Stream<Item = Result<Line, Error>>
where
    S: Stream<Item = Result<Bytes, Error>> + Unpin,
{
    let state = FrameState {
        bytes,
        framer: LineFramer::new(),
        pending: VecDeque::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.pending.pop_front() {
                return Some((Ok(line), state));
            }
            if state.done {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let lines = state.framer.push(&chunk);
                    state.pending.extend(lines.into_iter().map(Line::complete));
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
                None => {
                    state.done = true;
                    if let Some(text) = state.framer.finish() {
                        state.pending.push_back(Line {
                            text,
                            terminated: false,
                        });
                    }
                }
            }
        }
    })
}
