// SPDX-License-Identifier: Apache-2.0

use bytes::{Buf, BytesMut};

/// Hard cap, in bytes, on one emitted log record.
pub const MAX_LENGTH: usize = 1024;

/// Appended to every segment of an over-long line except its final segment.
pub const CONTINUED_TEXT: &str = " (truncated, continued)";

/// One complete, already-segmented log record ready to hand to an observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub source: String,
    pub line: Vec<u8>,
}

/// Splits an unbounded byte stream from a child's stdout/stderr into
/// newline-delimited records capped at [`MAX_LENGTH`] bytes, segmenting
/// over-long lines and marking every non-final segment with
/// [`CONTINUED_TEXT`].
///
/// One `LineRelay` owns exactly one logical stream (stdout or stderr of one
/// child); `source` tags every record it emits.
pub struct LineRelay {
    source: String,
    buffer: BytesMut,
    /// `true` once the line currently being accumulated has already had a
    /// forced segment emitted for it; the segment that finally reaches a
    /// newline closes out that line without adding the continuation suffix.
    in_continuation: bool,
}

impl LineRelay {
    pub fn new(source: impl Into<String>) -> Self {
        LineRelay {
            source: source.into(),
            buffer: BytesMut::new(),
            in_continuation: false,
        }
    }

    /// Feeds a chunk of raw child output and returns every record the chunk
    /// completed. A chunk may complete zero, one, or many records.
    pub fn feed(&mut self, data: &[u8]) -> Vec<LogRecord> {
        self.buffer.extend_from_slice(data);
        let mut records = Vec::new();
        loop {
            let newline_at = self.buffer.iter().position(|&b| b == b'\n');
            match newline_at {
                Some(pos) if pos < MAX_LENGTH => {
                    let mut line = self.buffer.split_to(pos).to_vec();
                    self.buffer.advance(1); // drop the newline itself
                    self.in_continuation = false;
                    records.push(self.emit(&mut line, false));
                }
                Some(_) => {
                    // Newline exists but lies beyond the cap: force a segment.
                    let mut segment = self.buffer.split_to(MAX_LENGTH).to_vec();
                    self.in_continuation = true;
                    records.push(self.emit(&mut segment, true));
                }
                None if self.buffer.len() >= MAX_LENGTH => {
                    let mut segment = self.buffer.split_to(MAX_LENGTH).to_vec();
                    self.in_continuation = true;
                    records.push(self.emit(&mut segment, true));
                }
                None => break,
            }
        }
        records
    }

    fn emit(&self, segment: &mut Vec<u8>, truncated: bool) -> LogRecord {
        if truncated {
            segment.extend_from_slice(CONTINUED_TEXT.as_bytes());
        }
        LogRecord {
            source: self.source.clone(),
            line: std::mem::take(segment),
        }
    }

    /// Whether a line is mid-segmentation, i.e. more data is expected before
    /// the current logical line closes.
    pub fn in_continuation(&self) -> bool {
        self.in_continuation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_lines_pass_through_unsegmented() {
        let mut relay = LineRelay::new("child");
        let records = relay.feed(b"hello\nworld\n");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].line, b"hello");
        assert_eq!(records[1].line, b"world");
    }

    #[test]
    fn partial_line_waits_for_newline() {
        let mut relay = LineRelay::new("child");
        assert!(relay.feed(b"partial").is_empty());
        let records = relay.feed(b" line\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].line, b"partial line");
    }

    #[test]
    fn long_line_splits_into_exactly_the_expected_segments() {
        let mut input = vec![b'A'; 2500];
        input.push(b'\n');
        input.extend_from_slice(b"B\n");

        let mut relay = LineRelay::new("child");
        let records = relay.feed(&input);

        assert_eq!(records.len(), 4);

        let mut expected_first = vec![b'A'; MAX_LENGTH];
        expected_first.extend_from_slice(CONTINUED_TEXT.as_bytes());
        assert_eq!(records[0].line, expected_first);
        assert_eq!(records[1].line, expected_first);

        let expected_third = vec![b'A'; 2500 - 2 * MAX_LENGTH];
        assert_eq!(records[2].line, expected_third);

        assert_eq!(records[3].line, b"B");
    }

    #[test]
    fn long_line_split_across_feed_calls_still_segments_correctly() {
        let mut relay = LineRelay::new("child");
        let first_chunk = vec![b'A'; 1500];
        let records = relay.feed(&first_chunk);
        assert_eq!(records.len(), 1);
        let mut expected = vec![b'A'; MAX_LENGTH];
        expected.extend_from_slice(CONTINUED_TEXT.as_bytes());
        assert_eq!(records[0].line, expected);
        assert!(relay.in_continuation());

        let mut rest = vec![b'A'; 1500 - MAX_LENGTH];
        rest.push(b'\n');
        let records = relay.feed(&rest);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].line, vec![b'A'; 1500 - MAX_LENGTH]);
        assert!(!relay.in_continuation());
    }
}
