// jumpgate-recording: asciicast v2 session recorder
//
// Records terminal output in asciicast v2 format (newline-delimited JSON),
// playable with asciinema.
//
// # Format
//
// Line 1: header (JSON object)
// Line 2+: frames (JSON arrays: [elapsed_seconds, "o", payload])
//
// The recorder is append-only and never rewinds. A failed write disables
// the recorder for the rest of the session instead of killing it; the
// session itself must keep running even when disk space runs out.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Asciicast v2 header, written as the first line of the file.
#[derive(Debug, Serialize, Deserialize)]
pub struct CastHeader {
    pub version: u8,
    pub width: u16,
    pub height: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
}

/// Streaming session recorder.
pub struct SessionRecorder {
    writer: Option<BufWriter<File>>,
    start: Instant,
}

impl SessionRecorder {
    /// Create a recorder writing to `path`, emitting the header eagerly so
    /// even an empty session leaves a valid cast file.
    pub fn create(
        path: &Path,
        width: u16,
        height: u16,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, RecordingError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let header = CastHeader {
            version: 2,
            width,
            height,
            timestamp: Some(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
            ),
            env,
        };
        serde_json::to_writer(&mut writer, &header)?;
        writeln!(writer)?;
        writer.flush()?;

        Ok(Self {
            writer: Some(writer),
            start: Instant::now(),
        })
    }

    /// Append an output frame.
    ///
    /// Errors are absorbed: the first failure logs and drops the writer so
    /// later calls become no-ops.
    pub fn write_output(&mut self, data: &[u8]) {
        if self.writer.is_none() || data.is_empty() {
            return;
        }
        if let Err(e) = self.write_frame(data) {
            warn!("recording disabled after write failure: {}", e);
            self.writer = None;
        }
    }

    fn write_frame(&mut self, data: &[u8]) -> Result<(), RecordingError> {
        let elapsed = self.start.elapsed().as_secs_f64();
        let payload = String::from_utf8_lossy(data);
        let writer = self.writer.as_mut().expect("checked by caller");
        write!(writer, "[{:.6},\"o\",", elapsed)?;
        serde_json::to_writer(&mut *writer, payload.as_ref())?;
        writeln!(writer, "]")?;
        Ok(())
    }

    /// Whether writes are still reaching the file.
    pub fn is_active(&self) -> bool {
        self.writer.is_some()
    }

    /// Flush and sync the recording to disk.
    pub fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                warn!("failed to flush recording: {}", e);
                return;
            }
            if let Err(e) = writer.get_ref().sync_all() {
                warn!("failed to sync recording: {}", e);
            }
        }
    }
}

// Flush on drop so an early-returning session still leaves a usable file.
impl Drop for SessionRecorder {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_then_frames() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("session.cast");

        let mut rec = SessionRecorder::create(&path, 80, 24, None).unwrap();
        rec.write_output(b"$ ");
        rec.write_output(b"ls\r\n");
        rec.close();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);

        let header: CastHeader = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(header.version, 2);
        assert_eq!(header.width, 80);
        assert_eq!(header.height, 24);
        assert!(lines[1].contains("\"o\""));
    }

    #[test]
    fn test_replay_concatenation_matches_stream() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("replay.cast");

        let chunks: &[&[u8]] = &[b"file1 file2\r\n", b"$ ", b"echo hi\r\nhi\r\n$ "];
        let mut rec = SessionRecorder::create(&path, 120, 40, None).unwrap();
        for chunk in chunks {
            rec.write_output(chunk);
        }
        rec.close();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut replayed = String::new();
        for line in content.lines().skip(1) {
            let frame: (f64, String, String) = serde_json::from_str(line).unwrap();
            assert_eq!(frame.1, "o");
            replayed.push_str(&frame.2);
        }
        let expected: Vec<u8> = chunks.concat();
        assert_eq!(replayed.as_bytes(), expected.as_slice());
    }

    #[test]
    fn test_empty_writes_are_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("empty.cast");

        let mut rec = SessionRecorder::create(&path, 80, 24, None).unwrap();
        rec.write_output(b"");
        rec.close();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1); // header only
    }

    #[test]
    fn test_frame_times_are_monotonic() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mono.cast");

        let mut rec = SessionRecorder::create(&path, 80, 24, None).unwrap();
        rec.write_output(b"a");
        rec.write_output(b"b");
        rec.write_output(b"c");
        rec.close();

        let content = std::fs::read_to_string(&path).unwrap();
        let times: Vec<f64> = content
            .lines()
            .skip(1)
            .map(|l| serde_json::from_str::<(f64, String, String)>(l).unwrap().0)
            .collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_env_recorded_in_header() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("env.cast");

        let mut env = HashMap::new();
        env.insert("TERM".to_string(), "xterm-256color".to_string());
        let rec = SessionRecorder::create(&path, 80, 24, Some(env)).unwrap();
        drop(rec);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.lines().next().unwrap().contains("xterm-256color"));
    }
}
