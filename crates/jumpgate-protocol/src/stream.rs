// Async streaming decoder
//
// Wraps an AsyncRead and yields owned instructions one at a time. The
// internal buffer is compacted after every decoded instruction, so memory
// use stays bounded by MAX_INSTRUCTION_SIZE plus one read chunk.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::parser::{scan, Frame, FrameError, ScanOutcome};

const READ_CHUNK: usize = 4096;

/// Lazy sequence of instructions decoded from a byte stream.
pub struct InstructionStream<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> InstructionStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Recover the reader and any bytes buffered past the last decoded
    /// instruction. Used when a handshake ends and the remaining stream
    /// should be relayed raw.
    pub fn into_parts(self) -> (R, BytesMut) {
        (self.reader, self.buf)
    }

    /// Decode the next instruction.
    ///
    /// Returns `None` on clean EOF (only CR/LF, or nothing, left in the
    /// buffer). EOF in the middle of an instruction is a
    /// `MissingTerminator` error.
    pub async fn next(&mut self) -> Option<Result<Frame, FrameError>> {
        loop {
            match scan(&self.buf) {
                Ok(ScanOutcome::Complete {
                    instruction,
                    consumed,
                }) => {
                    let frame = instruction.to_frame();
                    self.buf.advance(consumed);
                    return Some(Ok(frame));
                }
                Ok(ScanOutcome::Incomplete) => {}
                Err(e) => return Some(Err(e)),
            }

            let mut chunk = [0u8; READ_CHUNK];
            match self.reader.read(&mut chunk).await {
                Ok(0) => {
                    if self.buf.iter().all(|b| *b == b'\r' || *b == b'\n') {
                        return None;
                    }
                    return Some(Err(FrameError::MissingTerminator));
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) => return Some(Err(FrameError::Io(e))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_decodes_sequence() {
        let data = b"select,3.rdp;\r\nsize,4.1024,3.768,2.96;ready,4.$abc;".to_vec();
        let mut stream = InstructionStream::new(std::io::Cursor::new(data));

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.opcode, "select");
        assert_eq!(first.args, vec!["rdp"]);

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.opcode, "size");
        assert_eq!(second.args, vec!["1024", "768", "96"]);

        let third = stream.next().await.unwrap().unwrap();
        assert_eq!(third.opcode, "ready");
        assert_eq!(third.args, vec!["$abc"]);

        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_split_across_reads() {
        // Cursor delivers everything at once, so simulate fragmentation by
        // chaining two half-instruction readers.
        let head = std::io::Cursor::new(b"connect,13.VERSION".to_vec());
        let tail = std::io::Cursor::new(b"_1_5".to_vec());
        let term = std::io::Cursor::new(b"_0,4.host;".to_vec());
        let reader = tokio::io::AsyncReadExt::chain(
            tokio::io::AsyncReadExt::chain(head, tail),
            term,
        );
        let mut stream = InstructionStream::new(reader);

        let frame = stream.next().await.unwrap().unwrap();
        assert_eq!(frame.opcode, "connect");
        assert_eq!(frame.args, vec!["VERSION_1_5_0", "host"]);
    }

    #[tokio::test]
    async fn test_stream_eof_mid_instruction() {
        let mut stream = InstructionStream::new(std::io::Cursor::new(b"select,3.rd".to_vec()));
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, FrameError::MissingTerminator));
    }

    #[tokio::test]
    async fn test_stream_trailing_crlf_is_clean_eof() {
        let mut stream = InstructionStream::new(std::io::Cursor::new(b"sync;\r\n".to_vec()));
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_error_payload_passthrough() {
        // base64 body must come through untouched
        let data = b"error,20.c2VjcmV0IG1lc3NhZ2U=,3.519;".to_vec();
        let mut stream = InstructionStream::new(std::io::Cursor::new(data));
        let frame = stream.next().await.unwrap().unwrap();
        assert_eq!(frame.opcode, "error");
        assert_eq!(frame.args, vec!["c2VjcmV0IG1lc3NhZ2U=", "519"]);
    }
}
