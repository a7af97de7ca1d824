// Per-session channel bundle
//
// Producers (reader task, connector adapter, observers, admin close) hold
// the send halves; the multiplexer exclusively owns the receive halves.
// Channels are bounded so a slow multiplexer backpressures the client and
// a slow target backpressures the session.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;

const IN_CAPACITY: usize = 64;
const OUT_CAPACITY: usize = 256;
const ERR_CAPACITY: usize = 8;
const WINDOW_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub width: u32,
    pub height: u32,
}

/// Send halves, shared by every producer through the session.
#[derive(Clone)]
pub struct ChannelHandles {
    pub in_tx: mpsc::Sender<Bytes>,
    pub out_tx: mpsc::Sender<Bytes>,
    pub close_tx: mpsc::Sender<String>,
    pub err_tx: mpsc::Sender<ApiError>,
    pub window_tx: mpsc::Sender<WindowSize>,
    /// One-shot teardown broadcast. CancellationToken is idempotent, which
    /// is exactly the latch semantics every exit path relies on.
    pub away: CancellationToken,
}

/// Receive halves, owned solely by the multiplexer.
pub struct ChannelReceivers {
    pub in_rx: mpsc::Receiver<Bytes>,
    pub out_rx: mpsc::Receiver<Bytes>,
    pub close_rx: mpsc::Receiver<String>,
    pub err_rx: mpsc::Receiver<ApiError>,
    pub window_rx: mpsc::Receiver<WindowSize>,
}

pub fn session_channels() -> (ChannelHandles, ChannelReceivers) {
    let (in_tx, in_rx) = mpsc::channel(IN_CAPACITY);
    let (out_tx, out_rx) = mpsc::channel(OUT_CAPACITY);
    let (close_tx, close_rx) = mpsc::channel(1);
    let (err_tx, err_rx) = mpsc::channel(ERR_CAPACITY);
    let (window_tx, window_rx) = mpsc::channel(WINDOW_CAPACITY);

    (
        ChannelHandles {
            in_tx,
            out_tx,
            close_tx,
            err_tx,
            window_tx,
            away: CancellationToken::new(),
        },
        ChannelReceivers {
            in_rx,
            out_rx,
            close_rx,
            err_rx,
            window_rx,
        },
    )
}
