// Incremental instruction parser (zero-copy)
//
// `scan` works on a raw byte buffer and either yields a complete
// instruction borrowing from that buffer, or reports that more data is
// needed. CR/LF is tolerated between instructions only; inside an
// instruction every byte is significant because argument bodies are
// length-delimited.

use std::str;
use thiserror::Error;

/// Hard cap on a single instruction, preventing memory exhaustion from a
/// malformed or hostile peer.
pub const MAX_INSTRUCTION_SIZE: usize = 64 * 1024;

/// A parsed instruction borrowing from the scan buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction<'a> {
    pub opcode: &'a str,
    pub args: Vec<&'a str>,
}

impl<'a> Instruction<'a> {
    /// Parse exactly one instruction from a string slice.
    ///
    /// Fails if the slice does not contain a complete instruction.
    pub fn parse(text: &'a str) -> Result<Instruction<'a>, FrameError> {
        match scan(text.as_bytes())? {
            ScanOutcome::Complete { instruction, .. } => Ok(instruction),
            ScanOutcome::Incomplete => Err(FrameError::MissingTerminator),
        }
    }

    pub fn to_frame(&self) -> Frame {
        Frame {
            opcode: self.opcode.to_string(),
            args: self.args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// An owned instruction, produced by the streaming decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub opcode: String,
    pub args: Vec<String>,
}

impl Frame {
    pub fn new(opcode: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            opcode: opcode.into(),
            args,
        }
    }

    pub fn encode(&self) -> String {
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        crate::encode_instruction(&self.opcode, &args)
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("instruction missing ';' terminator")]
    MissingTerminator,

    #[error("non-numeric argument length")]
    InvalidLength,

    #[error("argument length does not match body")]
    LengthMismatch,

    #[error("instruction is not valid UTF-8")]
    InvalidUtf8,

    #[error("instruction exceeds {MAX_INSTRUCTION_SIZE} bytes")]
    Oversized,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of scanning a buffer for the next instruction.
#[derive(Debug)]
pub enum ScanOutcome<'a> {
    /// The buffer holds a prefix of an instruction; read more data.
    Incomplete,
    /// One complete instruction; `consumed` counts leading CR/LF too.
    Complete {
        instruction: Instruction<'a>,
        consumed: usize,
    },
}

/// Scan `buf` for the next complete instruction.
///
/// Leading CR/LF bytes are skipped. A buffer holding only CR/LF is
/// reported as `Incomplete` (there is nothing to parse yet).
pub fn scan(buf: &[u8]) -> Result<ScanOutcome<'_>, FrameError> {
    let mut pos = 0;
    while pos < buf.len() && (buf[pos] == b'\r' || buf[pos] == b'\n') {
        pos += 1;
    }
    let start = pos;

    // Opcode runs to the first ',' or ';'.
    let opcode_end = loop {
        if pos >= buf.len() {
            return incomplete_or_oversized(buf.len() - start);
        }
        match buf[pos] {
            b',' | b';' => break pos,
            _ => pos += 1,
        }
    };
    let opcode = as_utf8(&buf[start..opcode_end])?;

    let mut args = Vec::new();
    while buf[pos] == b',' {
        pos += 1;

        // <len> digits up to '.'
        let len_start = pos;
        loop {
            if pos >= buf.len() {
                return incomplete_or_oversized(buf.len() - start);
            }
            match buf[pos] {
                b'0'..=b'9' => pos += 1,
                b'.' => break,
                _ => return Err(FrameError::InvalidLength),
            }
        }
        if pos == len_start {
            return Err(FrameError::InvalidLength);
        }
        let len: usize = as_utf8(&buf[len_start..pos])?
            .parse()
            .map_err(|_| FrameError::InvalidLength)?;
        if len > MAX_INSTRUCTION_SIZE {
            return Err(FrameError::Oversized);
        }
        pos += 1; // '.'

        // <arg> body of exactly `len` bytes, then ',' or ';'
        if pos + len + 1 > buf.len() {
            return incomplete_or_oversized(buf.len() - start);
        }
        let body = &buf[pos..pos + len];
        pos += len;
        match buf[pos] {
            b',' | b';' => args.push(as_utf8(body)?),
            _ => return Err(FrameError::LengthMismatch),
        }
    }

    // pos now sits on ';'
    let consumed = pos + 1;
    if consumed - start > MAX_INSTRUCTION_SIZE {
        return Err(FrameError::Oversized);
    }
    Ok(ScanOutcome::Complete {
        instruction: Instruction { opcode, args },
        consumed,
    })
}

fn incomplete_or_oversized(pending: usize) -> Result<ScanOutcome<'static>, FrameError> {
    if pending > MAX_INSTRUCTION_SIZE {
        Err(FrameError::Oversized)
    } else {
        Ok(ScanOutcome::Incomplete)
    }
}

fn as_utf8(bytes: &[u8]) -> Result<&str, FrameError> {
    str::from_utf8(bytes).map_err(|_| FrameError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(text: &str) -> Instruction<'_> {
        Instruction::parse(text).unwrap()
    }

    #[test]
    fn test_parse_select() {
        let instr = parse_ok("select,3.rdp;");
        assert_eq!(instr.opcode, "select");
        assert_eq!(instr.args, vec!["rdp"]);
    }

    #[test]
    fn test_parse_size() {
        let instr = parse_ok("size,4.1024,3.768,2.96;");
        assert_eq!(instr.opcode, "size");
        assert_eq!(instr.args, vec!["1024", "768", "96"]);
    }

    #[test]
    fn test_parse_no_args() {
        let instr = parse_ok("disconnect;");
        assert_eq!(instr.opcode, "disconnect");
        assert!(instr.args.is_empty());
    }

    #[test]
    fn test_parse_empty_arg() {
        let instr = parse_ok("audio,0.;");
        assert_eq!(instr.args, vec![""]);
    }

    #[test]
    fn test_arg_may_contain_separators() {
        // length delimiting makes ',' ';' '.' legal inside a body
        let instr = parse_ok("connect,7.a,b;c.d;");
        assert_eq!(instr.args, vec!["a,b;c.d"]);
    }

    #[test]
    fn test_missing_terminator() {
        let err = Instruction::parse("select,3.rdp").unwrap_err();
        assert!(matches!(err, FrameError::MissingTerminator));
    }

    #[test]
    fn test_non_numeric_length() {
        let err = Instruction::parse("select,x.rdp;").unwrap_err();
        assert!(matches!(err, FrameError::InvalidLength));
    }

    #[test]
    fn test_length_body_mismatch() {
        let err = Instruction::parse("select,2.rdp;").unwrap_err();
        assert!(matches!(err, FrameError::LengthMismatch));
    }

    #[test]
    fn test_scan_skips_interleaved_crlf() {
        let buf = b"\r\nselect,3.rdp;";
        match scan(buf).unwrap() {
            ScanOutcome::Complete {
                instruction,
                consumed,
            } => {
                assert_eq!(instruction.opcode, "select");
                assert_eq!(consumed, buf.len());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_scan_incomplete() {
        assert!(matches!(
            scan(b"connect,5.ab").unwrap(),
            ScanOutcome::Incomplete
        ));
        assert!(matches!(scan(b"\r\n").unwrap(), ScanOutcome::Incomplete));
    }

    #[test]
    fn test_roundtrip_arbitrary_utf8() {
        let cases: Vec<(&str, Vec<&str>)> = vec![
            ("key", vec!["65507", "1"]),
            ("clipboard", vec!["héllo wörld", ""]),
            ("error", vec!["c2VjcmV0IG1lc3NhZ2U=", "519"]),
            ("mouse", vec!["0", "10", "20", "1"]),
            ("sync", vec![]),
        ];
        for (opcode, args) in cases {
            let encoded = crate::encode_instruction(opcode, &args);
            let decoded = parse_ok(&encoded);
            assert_eq!(decoded.opcode, opcode);
            assert_eq!(decoded.args, args);
        }
    }
}
