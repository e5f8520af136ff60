//! Companion data and address streams
//!
//! One record per line, whitespace-separated hex tokens with or without a
//! `0x` prefix. Blank lines and lines starting with `#` are skipped.

use std::fmt;
use std::io::{BufRead, Write};

use crate::error::{CompileError, CompileResult};

/// Which companion file a record comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Data,
    Address,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Data => write!(f, "data"),
            StreamKind::Address => write!(f, "address"),
        }
    }
}

/// Parse one hex token
pub fn parse_hex(token: &str) -> Option<u64> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u64::from_str_radix(digits, 16).ok()
}

/// Lazy reader over one companion stream
pub struct CompanionReader<R> {
    kind: StreamKind,
    source: Option<R>,
    /// Lines read from the source so far
    line: usize,
    consumed: usize,
}

impl<R: BufRead> CompanionReader<R> {
    pub fn new(kind: StreamKind, source: R) -> Self {
        Self {
            kind,
            source: Some(source),
            line: 0,
            consumed: 0,
        }
    }

    /// A stream with no backing file; every read is exhausted
    pub fn missing(kind: StreamKind) -> Self {
        Self {
            kind,
            source: None,
            line: 0,
            consumed: 0,
        }
    }

    /// Records handed out so far
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Next record, required by assembly line `asm_line`
    pub fn next_record(&mut self, asm_line: usize) -> CompileResult<Vec<u64>> {
        let Some(source) = self.source.as_mut() else {
            return Err(CompileError::exhausted(asm_line, self.kind.to_string()));
        };

        let mut text = String::new();
        loop {
            text.clear();
            if source.read_line(&mut text)? == 0 {
                return Err(CompileError::exhausted(asm_line, self.kind.to_string()));
            }
            self.line += 1;

            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let record = trimmed
                .split_whitespace()
                .map(|token| {
                    parse_hex(token).ok_or_else(|| CompileError::BadRecord {
                        stream: self.kind.to_string(),
                        line: self.line,
                        token: token.to_string(),
                    })
                })
                .collect::<CompileResult<Vec<u64>>>()?;
            self.consumed += 1;
            return Ok(record);
        }
    }

    /// Next record holding exactly one word
    pub fn next_word(&mut self, asm_line: usize) -> CompileResult<u64> {
        let record = self.next_record(asm_line)?;
        match record.as_slice() {
            [word] => Ok(*word),
            _ => Err(CompileError::grammar(
                asm_line,
                format!(
                    "{} record {} holds {} words, expected 1",
                    self.kind,
                    self.consumed,
                    record.len()
                ),
            )),
        }
    }
}

/// The two companion streams of one assembly run
pub struct Streams<D, A> {
    pub data: CompanionReader<D>,
    pub addresses: CompanionReader<A>,
}

impl<D: BufRead, A: BufRead> Streams<D, A> {
    pub fn new(data: CompanionReader<D>, addresses: CompanionReader<A>) -> Self {
        Self { data, addresses }
    }
}

impl<'a> Streams<&'a [u8], &'a [u8]> {
    /// Streams over in-memory text
    pub fn from_text(data: &'a str, addresses: &'a str) -> Self {
        Self::new(
            CompanionReader::new(StreamKind::Data, data.as_bytes()),
            CompanionReader::new(StreamKind::Address, addresses.as_bytes()),
        )
    }
}

/// Write records in the companion format
pub fn write_records<W: Write>(out: &mut W, records: &[Vec<u64>]) -> std::io::Result<()> {
    for record in records {
        let tokens: Vec<String> = record.iter().map(|w| format!("{:#x}", w)).collect();
        writeln!(out, "{}", tokens.join(" "))?;
    }
    Ok(())
}

/// Write one single-word record per address
pub fn write_addresses<W: Write>(out: &mut W, addresses: &[u64]) -> std::io::Result<()> {
    for address in addresses {
        writeln!(out, "{:#x}", address)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_skips_blank_and_comment_lines() {
        let text = "# header\n\n0x10 20\n   \n# more\nff\n";
        let mut reader = CompanionReader::new(StreamKind::Data, text.as_bytes());
        assert_eq!(reader.next_record(1).unwrap(), vec![0x10, 0x20]);
        assert_eq!(reader.next_word(2).unwrap(), 0xff);
        assert_eq!(reader.consumed(), 2);

        let err = reader.next_record(7).unwrap_err();
        assert!(matches!(err, CompileError::StreamExhausted { line: 7, .. }));
    }

    #[test]
    fn test_bad_token_reports_stream_line() {
        let mut reader = CompanionReader::new(StreamKind::Address, "0x1\n0xzz\n".as_bytes());
        reader.next_word(1).unwrap();
        match reader.next_word(2).unwrap_err() {
            CompileError::BadRecord { line, token, .. } => {
                assert_eq!(line, 2);
                assert_eq!(token, "0xzz");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_missing_stream_is_exhausted() {
        let mut reader: CompanionReader<&[u8]> = CompanionReader::missing(StreamKind::Address);
        assert!(matches!(
            reader.next_word(3),
            Err(CompileError::StreamExhausted { line: 3, .. })
        ));
    }

    #[test]
    fn test_writer_output_reads_back() {
        let records = vec![vec![0xabc, 0x1], vec![0xffff_ffff_ffff]];
        let mut buf = Vec::new();
        write_records(&mut buf, &records).unwrap();
        assert_eq!(String::from_utf8(buf.clone()).unwrap(), "0xabc 0x1\n0xffffffffffff\n");

        let mut reader = CompanionReader::new(StreamKind::Data, buf.as_slice());
        assert_eq!(reader.next_record(1).unwrap(), records[0]);
        assert_eq!(reader.next_record(1).unwrap(), records[1]);
    }
}
