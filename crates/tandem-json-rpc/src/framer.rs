//! Incremental extraction of JSON documents from a byte stream.
//!
//! Messages arrive back-to-back with no delimiter or length prefix; a
//! document ends where its outermost `{`/`[` is balanced. The framer tracks
//! nesting and string/escape state byte by byte, remembers how far it has
//! scanned, and only hands a complete span to [`Message::parse`].

use bytes::{Buf, BytesMut};
use tracing::warn;

use crate::message::Message;

/// Splits a byte stream into [`Message`]s.
///
/// Each connection owns its own framer; partial documents stay buffered
/// until the rest of their bytes arrive.
#[derive(Debug, Default)]
pub struct Framer {
    buffer: BytesMut,
    /// Offset of the next byte to examine
    scan: usize,
    /// Offset of the opening token of the document being scanned
    start: Option<usize>,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk read from the stream
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Move every byte out of `src` into the framer
    pub fn extend_from(&mut self, src: &mut BytesMut) {
        if self.buffer.is_empty() {
            std::mem::swap(&mut self.buffer, src);
        } else {
            self.buffer.extend_from_slice(src);
            src.clear();
        }
    }

    /// Number of bytes held but not yet emitted as a message
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether a document has been opened but not yet closed
    pub fn is_partial(&self) -> bool {
        self.start.is_some()
    }

    /// Next complete document, if one is fully buffered.
    ///
    /// Balanced spans that fail to decode still produce a message
    /// ([`Message::Invalid`]), so every balanced value surfaces exactly once.
    pub fn next_message(&mut self) -> Option<Message> {
        let mut discarded = 0usize;

        while self.scan < self.buffer.len() {
            let byte = self.buffer[self.scan];
            self.scan += 1;

            let Some(start) = self.start else {
                match byte {
                    b'{' | b'[' => {
                        self.start = Some(self.scan - 1);
                        self.depth = 1;
                    }
                    b if b.is_ascii_whitespace() => {}
                    _ => discarded += 1,
                }
                continue;
            };

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => self.depth -= 1,
                _ => {}
            }

            if self.depth == 0 {
                let end = self.scan;
                self.buffer.advance(start);
                let document = self.buffer.split_to(end - start).freeze();
                self.scan = 0;
                self.start = None;
                report_discarded(discarded);
                return Some(Message::parse(&document));
            }
        }

        report_discarded(discarded);
        self.compact();
        None
    }

    /// Iterate over every message that is currently complete
    pub fn messages(&mut self) -> Messages<'_> {
        Messages { framer: self }
    }

    /// Drop bytes that can no longer belong to any document
    fn compact(&mut self) {
        let keep_from = self.start.unwrap_or(self.scan);
        if keep_from > 0 {
            self.buffer.advance(keep_from);
            self.scan -= keep_from;
            if let Some(start) = self.start.as_mut() {
                *start = 0;
            }
        }
    }
}

fn report_discarded(discarded: usize) {
    if discarded > 0 {
        warn!(discarded, "Discarding bytes outside of any JSON document");
    }
}

/// Iterator returned by [`Framer::messages`]
pub struct Messages<'a> {
    framer: &'a mut Framer,
}

impl Iterator for Messages<'_> {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        self.framer.next_message()
    }
}
