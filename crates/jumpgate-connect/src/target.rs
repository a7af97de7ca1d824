// Channel-backed target endpoint
//
// Every connector runs an adapter task that owns the protocol handle and
// bridges it to the session channels. The multiplexer talks to that task
// through this command pipe, which is what makes the TargetIo interface
// uniform across protocols.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use jumpgate_session::{ApiError, TargetIo, WindowSize};

pub const TARGET_CMD_CAPACITY: usize = 64;

#[derive(Debug)]
pub enum TargetCmd {
    Data(Bytes),
    Resize(WindowSize),
    Shutdown,
}

/// TargetIo backed by an adapter task's command channel.
pub struct PipedTarget {
    cmd_tx: mpsc::Sender<TargetCmd>,
}

impl PipedTarget {
    pub fn new() -> (Self, mpsc::Receiver<TargetCmd>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(TARGET_CMD_CAPACITY);
        (Self { cmd_tx }, cmd_rx)
    }
}

#[async_trait]
impl TargetIo for PipedTarget {
    async fn write_stdin(&self, data: &[u8]) -> Result<(), ApiError> {
        self.cmd_tx
            .send(TargetCmd::Data(Bytes::copy_from_slice(data)))
            .await
            .map_err(|_| ApiError::internal("target adapter is gone"))
    }

    async fn resize(&self, size: WindowSize) -> Result<(), ApiError> {
        self.cmd_tx
            .send(TargetCmd::Resize(size))
            .await
            .map_err(|_| ApiError::internal("target adapter is gone"))
    }

    async fn shutdown(&self) {
        let _ = self.cmd_tx.send(TargetCmd::Shutdown).await;
    }
}
