// Observer sinks
//
// An observer is an administrative attachment receiving the same output
// stream as the client. Sinks are polymorphic (websocket or in-process
// byte sink) behind one object-safe interface; the session does not
// distinguish.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Key for an observer entry: `uid-sessionId-nanos`.
pub fn observer_key(uid: i64, session_id: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{}-{}-{}", uid, session_id, nanos)
}

#[async_trait]
pub trait ObserverSink: Send + Sync {
    /// Deliver a chunk of session output. Returns false once the sink is
    /// broken; the session drops it on the next flush.
    async fn write(&self, data: &[u8]) -> bool;

    /// Close the sink, delivering `notice` first when one is given
    /// (localized end-of-session message).
    async fn close(&self, notice: Option<&str>);
}

/// In-process byte sink, used by native observers and tests.
#[derive(Default)]
pub struct BufferSink {
    chunks: Mutex<Vec<Bytes>>,
    closed: Mutex<bool>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.chunks
            .lock()
            .iter()
            .flat_map(|c| c.iter().copied())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

#[async_trait]
impl ObserverSink for BufferSink {
    async fn write(&self, data: &[u8]) -> bool {
        if *self.closed.lock() {
            return false;
        }
        self.chunks.lock().push(Bytes::copy_from_slice(data));
        true
    }

    async fn close(&self, notice: Option<&str>) {
        if let Some(msg) = notice {
            self.chunks.lock().push(Bytes::copy_from_slice(msg.as_bytes()));
        }
        *self.closed.lock() = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observer_key_shape() {
        let key = observer_key(42, "abc");
        let parts: Vec<&str> = key.splitn(3, '-').collect();
        assert_eq!(parts[0], "42");
        assert_eq!(parts[1], "abc");
        assert!(parts[2].parse::<u64>().is_ok());
    }

    #[tokio::test]
    async fn test_buffer_sink_accumulates_in_order() {
        let sink = BufferSink::new();
        assert!(sink.write(b"one").await);
        assert!(sink.write(b"two").await);
        assert_eq!(sink.contents(), b"onetwo");
    }

    #[tokio::test]
    async fn test_closed_sink_rejects_writes() {
        let sink = BufferSink::new();
        sink.close(Some("session ended")).await;
        assert!(!sink.write(b"late").await);
        assert_eq!(sink.contents(), b"session ended");
    }
}
