// Telnet connector
//
// Raw TCP with just enough option negotiation (ECHO, SGA) to get a sane
// interactive stream. IAC sequences are answered and stripped; everything
// else passes through untouched.

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use jumpgate_session::{ApiError, Asset, Gateway, Session, TargetIo, WindowSize};

use crate::gateway::GatewayTunnel;
use crate::ssh::CONNECT_TIMEOUT;
use crate::target::{PipedTarget, TargetCmd};

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

const OPT_ECHO: u8 = 1;
const OPT_SGA: u8 = 3;

struct TelnetTarget {
    piped: PipedTarget,
    tunnel: Option<GatewayTunnel>,
}

#[async_trait]
impl TargetIo for TelnetTarget {
    async fn write_stdin(&self, data: &[u8]) -> Result<(), ApiError> {
        self.piped.write_stdin(data).await
    }

    async fn resize(&self, _size: WindowSize) -> Result<(), ApiError> {
        // no NAWS; telnet targets here are fixed-size consoles
        Ok(())
    }

    async fn shutdown(&self) {
        self.piped.shutdown().await;
        if let Some(tunnel) = &self.tunnel {
            tunnel.close().await;
        }
    }
}

pub async fn connect_telnet(
    session: &Arc<Session>,
    asset: &Asset,
    gateway: Option<&Gateway>,
) -> Result<Arc<dyn TargetIo>, ApiError> {
    let port = asset.port_for("telnet");
    info!("session {}: telnet {}:{}", session.id, asset.ip, port);

    let (piped, cmd_rx) = PipedTarget::new();
    let tunnel = match gateway {
        Some(gw) => {
            let tunnel = GatewayTunnel::open(gw).await?;
            let stream = tunnel.stream_to(&asset.ip, port).await?;
            spawn_telnet_adapter(session, stream, cmd_rx);
            Some(tunnel)
        }
        None => {
            let stream = tokio::time::timeout(
                CONNECT_TIMEOUT,
                TcpStream::connect((asset.ip.as_str(), port)),
            )
            .await
            .map_err(|_| ApiError::connect_server("telnet connect timed out"))?
            .map_err(ApiError::connect_server)?;
            spawn_telnet_adapter(session, stream, cmd_rx);
            None
        }
    };

    Ok(Arc::new(TelnetTarget { piped, tunnel }))
}

#[derive(Clone, Copy, PartialEq)]
enum IacState {
    Data,
    Iac,
    Negotiate(u8),
    Sub,
    SubIac,
}

/// Strip and answer IAC negotiation, forwarding clean bytes.
struct Negotiator {
    state: IacState,
}

impl Negotiator {
    fn new() -> Self {
        Self {
            state: IacState::Data,
        }
    }

    /// Process one inbound chunk: returns (clean payload, replies to send).
    fn process(&mut self, input: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut clean = Vec::with_capacity(input.len());
        let mut reply = Vec::new();
        for &b in input {
            match self.state {
                IacState::Data => {
                    if b == IAC {
                        self.state = IacState::Iac;
                    } else {
                        clean.push(b);
                    }
                }
                IacState::Iac => match b {
                    WILL | WONT | DO | DONT => self.state = IacState::Negotiate(b),
                    SB => self.state = IacState::Sub,
                    IAC => {
                        // escaped 0xff data byte
                        clean.push(IAC);
                        self.state = IacState::Data;
                    }
                    _ => self.state = IacState::Data,
                },
                IacState::Negotiate(verb) => {
                    match (verb, b) {
                        // accept the server driving echo and suppress-go-ahead
                        (WILL, OPT_ECHO) | (WILL, OPT_SGA) => reply.extend([IAC, DO, b]),
                        (WILL, _) => reply.extend([IAC, DONT, b]),
                        (DO, OPT_SGA) => reply.extend([IAC, WILL, b]),
                        (DO, _) => reply.extend([IAC, WONT, b]),
                        // WONT/DONT acknowledgements need no answer
                        _ => {}
                    }
                    self.state = IacState::Data;
                }
                IacState::Sub => {
                    if b == IAC {
                        self.state = IacState::SubIac;
                    }
                }
                IacState::SubIac => {
                    self.state = if b == SE { IacState::Data } else { IacState::Sub };
                }
            }
        }
        (clean, reply)
    }
}

fn spawn_telnet_adapter<S>(session: &Arc<Session>, stream: S, mut cmd_rx: mpsc::Receiver<TargetCmd>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let out_tx = session.chans.out_tx.clone();
    let err_tx = session.chans.err_tx.clone();
    let away = session.chans.away.clone();
    let session_id = session.id.clone();

    tokio::spawn(async move {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut negotiator = Negotiator::new();

        // open negotiation: ask the server to echo and suppress go-ahead
        let opening = [IAC, DO, OPT_ECHO, IAC, DO, OPT_SGA];
        if let Err(e) = writer.write_all(&opening).await {
            let _ = err_tx.send(ApiError::connect_server(e)).await;
            return;
        }

        let mut buf = vec![0u8; 4096];
        loop {
            tokio::select! {
                _ = away.cancelled() => break,

                cmd = cmd_rx.recv() => match cmd {
                    Some(TargetCmd::Data(data)) => {
                        if let Err(e) = writer.write_all(&data).await {
                            let _ = err_tx.send(ApiError::connect_server(e)).await;
                            break;
                        }
                    }
                    Some(TargetCmd::Resize(_)) => {}
                    Some(TargetCmd::Shutdown) | None => break,
                },

                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!("session {}: telnet closed by target", session_id);
                        away.cancel();
                        break;
                    }
                    Ok(n) => {
                        let (clean, reply) = negotiator.process(&buf[..n]);
                        if !reply.is_empty() {
                            if let Err(e) = writer.write_all(&reply).await {
                                let _ = err_tx.send(ApiError::connect_server(e)).await;
                                break;
                            }
                        }
                        if !clean.is_empty()
                            && out_tx.send(Bytes::from(clean)).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = err_tx.send(ApiError::connect_server(e)).await;
                        break;
                    }
                },
            }
        }
        debug!("session {}: telnet adapter exit", session_id);
    });
}
