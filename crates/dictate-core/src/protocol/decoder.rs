//! Incremental decoder for the newline-delimited JSON stream.
//!
//! Data arrives from the pipe in arbitrary chunks. A chunk might be:
//! - a complete line: `{"status":"info","message":"x"}\n`
//! - a partial line: `{"status":"sta` (the rest comes later)
//! - several lines at once, possibly ending in a partial one
//!
//! The decoder buffers raw bytes and only releases segments terminated by
//! `\n`. Splitting happens on bytes, so a multi-byte UTF-8 character split
//! across two chunks is reassembled before it is decoded.

use thiserror::Error;

use super::types::ChildProcessUpdate;

/// A line that could not be turned into a [`ChildProcessUpdate`].
#[derive(Error, Debug)]
#[error("invalid protocol line {line:?}: {source}")]
pub struct DecodeError {
    pub line: String,
    #[source]
    pub source: serde_json::Error,
}

/// Parse one complete protocol line.
pub fn parse_line(line: &str) -> Result<ChildProcessUpdate, DecodeError> {
    serde_json::from_str(line).map_err(|source| DecodeError {
        line: line.to_string(),
        source,
    })
}

/// Buffer of undecoded output for one session.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and iterate over the complete lines now available.
    ///
    /// Lines are trimmed and whitespace-only lines are skipped. The iterator
    /// is lazy: lines it has not yielded yet stay buffered and come out of the
    /// next call to `feed` or [`LineDecoder::lines`].
    pub fn feed(&mut self, chunk: &[u8]) -> Lines<'_> {
        self.buffer.extend_from_slice(chunk);
        self.lines()
    }

    /// Iterate over complete lines already in the buffer.
    pub fn lines(&mut self) -> Lines<'_> {
        Lines { decoder: self }
    }

    /// Append a chunk and collect every complete line.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<String> {
        self.feed(chunk).collect()
    }

    /// Number of buffered bytes not yet released as a line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Take the unterminated tail, leaving the buffer empty.
    ///
    /// Returns `None` when the tail is empty or whitespace only.
    pub fn take_remainder(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&rest);
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    fn next_line(&mut self) -> Option<String> {
        loop {
            let newline = self.buffer.iter().position(|&b| b == b'\n')?;
            let segment: Vec<u8> = self.buffer.drain(..=newline).collect();
            let text = String::from_utf8_lossy(&segment[..newline]);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
}

/// Lazy sequence of complete lines drained from a [`LineDecoder`].
pub struct Lines<'a> {
    decoder: &'a mut LineDecoder,
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.decoder.next_line()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LoadingState;

    const LISTENING: &str = r#"{"status":"state_change","state":"listening"}"#;
    const READY: &str = r#"{"status":"state_change","state":"ready","payload":"hello world"}"#;

    #[test]
    fn complete_line_in_one_chunk() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.decode(format!("{LISTENING}\n").as_bytes());
        assert_eq!(lines, vec![LISTENING.to_string()]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn partial_line_is_held_back() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.decode(br#"{"status":"info""#).is_empty());
        assert!(decoder.pending() > 0);

        let lines = decoder.decode(b",\"message\":\"x\"}\n");
        assert_eq!(lines, vec![r#"{"status":"info","message":"x"}"#.to_string()]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn message_split_across_two_chunks() {
        let mut decoder = LineDecoder::new();
        let first = decoder.decode(format!("{LISTENING}\n{{\"sta").as_bytes());
        assert_eq!(first, vec![LISTENING.to_string()]);

        let second = decoder
            .decode(b"tus\":\"state_change\",\"state\":\"ready\",\"payload\":\"hello world\"}\n");
        assert_eq!(second, vec![READY.to_string()]);

        let update = parse_line(&second[0]).unwrap();
        assert_eq!(update.transcript().as_deref(), Some("hello world"));
    }

    #[test]
    fn multiple_messages_in_one_chunk() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.decode(format!("{LISTENING}\n{READY}\n").as_bytes());
        assert_eq!(lines, vec![LISTENING.to_string(), READY.to_string()]);
    }

    #[test]
    fn same_lines_for_every_split_point() {
        let payload = format!("{LISTENING}\n\n  {READY}  \r\n{LISTENING}\n");
        let bytes = payload.as_bytes();
        let expected = vec![LISTENING.to_string(), READY.to_string(), LISTENING.to_string()];

        for first in 0..=bytes.len() {
            for second in first..=bytes.len() {
                let mut decoder = LineDecoder::new();
                let mut lines = decoder.decode(&bytes[..first]);
                lines.extend(decoder.decode(&bytes[first..second]));
                lines.extend(decoder.decode(&bytes[second..]));
                assert_eq!(lines, expected, "split at {first}/{second}");
                assert_eq!(decoder.pending(), 0);
            }
        }
    }

    #[test]
    fn byte_at_a_time() {
        let payload = format!("{LISTENING}\n{READY}\n");
        let mut decoder = LineDecoder::new();
        let mut lines = Vec::new();
        for byte in payload.as_bytes() {
            lines.extend(decoder.decode(std::slice::from_ref(byte)));
        }
        assert_eq!(lines, vec![LISTENING.to_string(), READY.to_string()]);
    }

    #[test]
    fn whitespace_lines_are_dropped() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.decode(b"\n   \n\t\r\n");
        assert!(lines.is_empty());
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn split_utf8_character_is_reassembled() {
        let line = r#"{"status":"state_change","state":"ready","payload":"zażółć"}"#;
        let bytes = format!("{line}\n").into_bytes();
        // Split inside the two-byte encoding of 'ż'.
        let cut = line.find('ż').unwrap() + 1;

        let mut decoder = LineDecoder::new();
        assert!(decoder.decode(&bytes[..cut]).is_empty());
        let lines = decoder.decode(&bytes[cut..]);
        assert_eq!(lines, vec![line.to_string()]);
        assert_eq!(
            parse_line(&lines[0]).unwrap().transcript().as_deref(),
            Some("zażółć")
        );
    }

    #[test]
    fn unconsumed_lines_survive_until_next_pass() {
        let mut decoder = LineDecoder::new();
        let mut lines = decoder.feed(format!("{LISTENING}\n{READY}\n").as_bytes());
        assert_eq!(lines.next().as_deref(), Some(LISTENING));
        drop(lines);

        let rest: Vec<String> = decoder.lines().collect();
        assert_eq!(rest, vec![READY.to_string()]);
        assert!(decoder.lines().next().is_none());
    }

    #[test]
    fn take_remainder_returns_unterminated_tail() {
        let mut decoder = LineDecoder::new();
        decoder.decode(b"{\"status\":\"in");
        assert_eq!(decoder.take_remainder().as_deref(), Some("{\"status\":\"in"));
        assert_eq!(decoder.pending(), 0);
        assert_eq!(decoder.take_remainder(), None);
    }

    #[test]
    fn parse_line_reports_offending_line() {
        let err = parse_line("not json").unwrap_err();
        assert_eq!(err.line, "not json");
        assert!(err.to_string().contains("not json"));
    }

    #[test]
    fn parse_line_accepts_listening() {
        let update = parse_line(LISTENING).unwrap();
        assert!(matches!(
            update,
            crate::protocol::ChildProcessUpdate::StateChange {
                state: LoadingState::Listening,
                ..
            }
        ));
    }
}
