//! Bounded, sequence-numbered scrollback for one session.
//!
//! Every non-empty append gets the next sequence number (the first append is
//! 1, an empty buffer reports 0). Retained content is always a suffix of what
//! was appended since the last [`OutputBuffer::reset`]. Eviction is FIFO and
//! bounded by both a byte cap and a line cap, whichever is hit first.

use std::collections::VecDeque;

use serde::Serialize;
use thiserror::Error;

/// The requested catch-up point is no longer (or not yet) in the buffer; the
/// caller must fall back to a full [`Snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("sequence {requested} is outside the retained window")]
pub struct BufferGap {
    pub requested: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub content: String,
    /// Sequence number of the last retained append (0 when nothing was appended).
    pub sequence: u64,
}

/// One append as it sits in the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub sequence: u64,
    pub text: String,
}

#[derive(Debug)]
pub struct OutputBuffer {
    chunks: VecDeque<Chunk>,
    bytes: usize,
    lines: usize,
    max_bytes: usize,
    max_lines: usize,
    last_sequence: u64,
    /// Highest sequence whose text is no longer fully retained. A reader that
    /// has seen everything up to and including this sequence can still catch
    /// up incrementally.
    evicted_through: u64,
}

impl OutputBuffer {
    pub fn new(max_bytes: usize, max_lines: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            lines: 0,
            max_bytes: max_bytes.max(1),
            max_lines: max_lines.max(1),
            last_sequence: 0,
            evicted_through: 0,
        }
    }

    /// Append new output. Returns the assigned sequence number, or `None` for
    /// empty input (which never consumes a sequence number).
    pub fn append(&mut self, text: &str) -> Option<u64> {
        if text.is_empty() {
            return None;
        }
        self.last_sequence += 1;
        self.bytes += text.len();
        self.lines += count_lines(text);
        self.chunks.push_back(Chunk {
            sequence: self.last_sequence,
            text: text.to_string(),
        });
        self.evict();
        Some(self.last_sequence)
    }

    /// Replace the whole retained content (used when a polled screen was
    /// rewritten rather than extended). Readers positioned before the returned
    /// sequence can no longer catch up incrementally.
    pub fn reset(&mut self, content: &str) -> u64 {
        self.chunks.clear();
        self.bytes = 0;
        self.lines = 0;
        self.last_sequence += 1;
        if !content.is_empty() {
            self.bytes = content.len();
            self.lines = count_lines(content);
            self.chunks.push_back(Chunk {
                sequence: self.last_sequence,
                text: content.to_string(),
            });
            self.evict();
        }
        self.evicted_through = self.last_sequence;
        self.last_sequence
    }

    /// Full retained content and the sequence of its last append.
    pub fn snapshot(&self) -> Snapshot {
        let mut content = String::with_capacity(self.bytes);
        for chunk in &self.chunks {
            content.push_str(&chunk.text);
        }
        Snapshot {
            content,
            sequence: self.last_sequence,
        }
    }

    /// Everything appended after `sequence`, concatenated, tagged with the
    /// current last sequence.
    pub fn tail_since(&self, sequence: u64) -> Result<Snapshot, BufferGap> {
        if sequence > self.last_sequence || sequence < self.evicted_through {
            return Err(BufferGap {
                requested: sequence,
            });
        }
        let mut content = String::new();
        for chunk in self.chunks.iter().filter(|c| c.sequence > sequence) {
            content.push_str(&chunk.text);
        }
        Ok(Snapshot {
            content,
            sequence: self.last_sequence,
        })
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    #[cfg(test)]
    fn len_bytes(&self) -> usize {
        self.bytes
    }

    #[cfg(test)]
    fn len_lines(&self) -> usize {
        self.lines
    }

    fn evict(&mut self) {
        while self.bytes > self.max_bytes || self.lines > self.max_lines {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };

            let mut cut = 0;
            if self.bytes > self.max_bytes {
                cut = self.bytes - self.max_bytes;
            }
            if self.lines > self.max_lines {
                let excess = self.lines - self.max_lines;
                let by_lines = front
                    .text
                    .match_indices('\n')
                    .nth(excess - 1)
                    .map(|(i, _)| i + 1)
                    .unwrap_or(front.text.len());
                cut = cut.max(by_lines);
            }
            while cut < front.text.len() && !front.text.is_char_boundary(cut) {
                cut += 1;
            }

            self.evicted_through = front.sequence;
            if cut >= front.text.len() {
                if let Some(removed) = self.chunks.pop_front() {
                    self.bytes -= removed.text.len();
                    self.lines -= count_lines(&removed.text);
                }
            } else {
                let removed: String = front.text.drain(..cut).collect();
                self.bytes -= removed.len();
                self.lines -= count_lines(&removed);
            }
        }
    }
}

fn count_lines(text: &str) -> usize {
    text.bytes().filter(|b| *b == b'\n').count()
}

// ---------------------------------------------------------------------------
// Utf8Decoder
// ---------------------------------------------------------------------------

/// Turns raw PTY reads into text without mangling multi-byte characters that
/// straddle read boundaries. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            // Incomplete trailing sequence; wait for more bytes.
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
        out
    }
}
