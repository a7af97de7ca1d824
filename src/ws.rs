// Websocket plumbing
//
// Adapts an axum websocket to the session core's transport and observer
// interfaces. Outbound frames are text; a zero-length frame is a
// keepalive. The send half lives behind a mutex because the multiplexer
// and teardown both need `&self` access.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::debug;
use std::sync::Arc;
use tokio::sync::Mutex;

use jumpgate_session::{ApiError, ClientTransport, ObserverSink, Session};

pub struct WsTransport {
    sender: Mutex<SplitSink<WebSocket, Message>>,
}

impl WsTransport {
    pub fn new(sender: SplitSink<WebSocket, Message>) -> Arc<Self> {
        Arc::new(Self {
            sender: Mutex::new(sender),
        })
    }

    async fn send_text(&self, data: &[u8]) -> Result<(), ApiError> {
        let text = String::from_utf8_lossy(data).into_owned();
        self.sender
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(ApiError::internal)
    }
}

#[async_trait]
impl ClientTransport for WsTransport {
    async fn send(&self, data: &[u8]) -> Result<(), ApiError> {
        self.send_text(data).await
    }

    async fn close(&self) {
        let _ = self.sender.lock().await.send(Message::Close(None)).await;
    }
}

#[async_trait]
impl ObserverSink for WsTransport {
    async fn write(&self, data: &[u8]) -> bool {
        self.send_text(data).await.is_ok()
    }

    async fn close(&self, notice: Option<&str>) {
        if let Some(msg) = notice {
            let _ = self.send_text(msg.as_bytes()).await;
        }
        let _ = self.sender.lock().await.send(Message::Close(None)).await;
    }
}

/// Client reader: forwards inbound text frames into the session's input
/// channel until the peer or the session goes away. Peer disconnect
/// cancels the away token, which is how the multiplexer learns of it.
pub fn spawn_client_reader(session: &Arc<Session>, mut receiver: SplitStream<WebSocket>) {
    let in_tx = session.chans.in_tx.clone();
    let away = session.chans.away.clone();
    let session_id = session.id.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = away.cancelled() => break,

                frame = receiver.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if text.is_empty() {
                            continue;
                        }
                        if in_tx.send(Bytes::from(text.into_bytes())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if !data.is_empty() && in_tx.send(Bytes::from(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("session {}: client disconnected", session_id);
                        away.cancel();
                        break;
                    }
                    Some(Ok(_)) => {} // ping/pong handled by axum
                    Some(Err(e)) => {
                        debug!("session {}: client read error: {}", session_id, e);
                        away.cancel();
                        break;
                    }
                },
            }
        }
    });
}

/// Observer reader: inbound bytes from an admin observer are forwarded
/// into the session only for guacd sessions (control instructions);
/// terminal observers are read-only.
pub fn spawn_observer_reader(
    session: &Arc<Session>,
    observer_key: String,
    mut receiver: SplitStream<WebSocket>,
) -> tokio::task::JoinHandle<()> {
    let in_tx = session.chans.in_tx.clone();
    let away = session.chans.away.clone();
    let session = Arc::clone(session);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = away.cancelled() => break,

                frame = receiver.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if session.is_guacd()
                            && !text.is_empty()
                            && in_tx.send(Bytes::from(text.into_bytes())).await.is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                },
            }
        }
        session.detach_observer(&observer_key);
        debug!("observer {} detached", observer_key);
    })
}
