//! Incremental JSONL stream parsing.
//!
//! The agent CLI writes one JSON object per line on stdout, but the broker
//! reads it in arbitrary byte chunks. The parser keeps the trailing partial
//! line between chunks so records are never split or duplicated, whatever the
//! chunk boundaries.

use log::debug;
use serde_json::Value;

/// Stateful line-oriented JSON parser.
#[derive(Debug, Default)]
pub struct JsonlParser {
    /// Bytes after the last newline of the previous chunk.
    carry: Vec<u8>,
}

impl JsonlParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of bytes; returns the events completed by this chunk,
    /// in stream order. Malformed lines are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut start = 0;
        for (i, byte) in buf.iter().enumerate() {
            if *byte == b'\n' {
                if let Some(event) = parse_line(&buf[start..i]) {
                    events.push(event);
                }
                start = i + 1;
            }
        }
        self.carry = buf.split_off(start);
        events
    }

    /// Flush the buffered partial line at end of stream.
    pub fn finish(&mut self) -> Vec<Value> {
        let rest = std::mem::take(&mut self.carry);
        parse_line(&rest).into_iter().collect()
    }
}

fn parse_line(line: &[u8]) -> Option<Value> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str(text) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!("Dropping malformed JSONL line: {}", err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn single_chunk_multiple_lines() {
        let mut parser = JsonlParser::new();
        let events = parser.push(b"{\"a\":1}\n{\"b\":2}\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["a"], 1);
        assert_eq!(events[1]["b"], 2);
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn line_split_across_chunks() {
        let mut parser = JsonlParser::new();
        assert!(parser.push(b"{\"message\":\"hel").is_empty());
        let events = parser.push(b"lo\"}\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["message"], "hello");
    }

    #[test]
    fn malformed_line_is_dropped_without_blocking() {
        let mut parser = JsonlParser::new();
        let events = parser.push(b"{\"ok\":true}\nthis is not valid json\n{\"ok\":false}\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["ok"], true);
        assert_eq!(events[1]["ok"], false);
    }

    #[test]
    fn blank_lines_are_skipped() {
        let mut parser = JsonlParser::new();
        let events = parser.push(b"\n  \n{\"x\":1}\n\n");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn finish_parses_unterminated_final_line() {
        let mut parser = JsonlParser::new();
        assert!(parser.push(b"{\"tail\":true}").is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["tail"], true);
    }

    #[test]
    fn multibyte_char_split_across_chunks() {
        let mut parser = JsonlParser::new();
        let line = "{\"text\":\"héllo\"}\n".as_bytes();
        // Split inside the two-byte 'é'.
        let split = line.iter().position(|b| *b == 0xc3).unwrap() + 1;
        assert!(parser.push(&line[..split]).is_empty());
        let events = parser.push(&line[split..]);
        assert_eq!(events[0]["text"], "héllo");
    }

    proptest! {
        /// Chunk boundaries never change what the parser yields.
        #[test]
        fn chunking_is_invisible(
            values in proptest::collection::vec(
                proptest::collection::hash_map("[a-z]{1,4}", 0i64..1000, 1..4),
                1..20,
            ),
            boundaries in proptest::collection::vec(1usize..10, 0..30),
        ) {
            let stream: String = values
                .iter()
                .map(|m| format!("{}\n", serde_json::to_string(m).unwrap()))
                .collect();
            let bytes = stream.as_bytes();

            let mut parser = JsonlParser::new();
            let mut events = Vec::new();
            let mut pos = 0;
            for step in boundaries {
                if pos >= bytes.len() {
                    break;
                }
                let end = (pos + step).min(bytes.len());
                events.extend(parser.push(&bytes[pos..end]));
                pos = end;
            }
            if pos < bytes.len() {
                events.extend(parser.push(&bytes[pos..]));
            }
            events.extend(parser.finish());

            let expected: Vec<Value> = values
                .iter()
                .map(|m| serde_json::to_value(m).unwrap())
                .collect();
            prop_assert_eq!(events, expected);
        }
    }
}
