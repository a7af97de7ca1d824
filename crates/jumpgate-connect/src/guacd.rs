// Guacd connector (rdp, vnc)
//
// Opens a TCP connection to the guacd daemon and drives the client-side
// handshake: select, size/audio/video/image, then connect with the values
// guacd asked for, answering its `args` list positionally. Clipboard
// restrictions from the session's permission set ride along as
// disable-copy / disable-paste. After `ready` the instruction stream is
// relayed raw in both directions.

use base64::Engine;
use bytes::Bytes;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use jumpgate_protocol::{encode_instruction, Frame, InstructionStream};
use jumpgate_session::{
    ApiError, Account, Asset, ErrorCode, Gateway, Session, TargetIo, WindowSize,
};

use crate::gateway::{local_forward, GatewayTunnel};
use crate::ssh::CONNECT_TIMEOUT;
use crate::target::{PipedTarget, TargetCmd};

const GUACD_VERSION: &str = "VERSION_1_5_0";
const DEFAULT_DPI: &str = "96";

#[derive(Debug, Clone)]
pub struct GuacdConfig {
    pub addr: String,
}

struct GuacdTarget {
    piped: PipedTarget,
    tunnel: Option<Arc<GatewayTunnel>>,
}

#[async_trait::async_trait]
impl TargetIo for GuacdTarget {
    async fn write_stdin(&self, data: &[u8]) -> Result<(), ApiError> {
        self.piped.write_stdin(data).await
    }

    async fn resize(&self, _size: WindowSize) -> Result<(), ApiError> {
        // guacd clients negotiate size through their own size instruction
        Ok(())
    }

    async fn shutdown(&self) {
        self.piped.shutdown().await;
        if let Some(tunnel) = &self.tunnel {
            tunnel.close().await;
        }
    }
}

pub async fn connect_guacd(
    session: &Arc<Session>,
    asset: &Asset,
    account: &Account,
    gateway: Option<&Gateway>,
    size: WindowSize,
    config: &GuacdConfig,
) -> Result<Arc<dyn TargetIo>, ApiError> {
    let protocol = session.protocol.clone();
    let target_port = asset.port_for(&protocol);

    let (host, port, tunnel) = match gateway {
        Some(gw) => {
            let tunnel = Arc::new(GatewayTunnel::open(gw).await?);
            let addr = local_forward(
                Arc::clone(&tunnel),
                asset.ip.clone(),
                target_port,
                session.chans.away.clone(),
            )
            .await?;
            (addr.ip().to_string(), addr.port(), Some(tunnel))
        }
        None => (asset.ip.clone(), target_port, None),
    };

    info!(
        "session {}: {} via guacd {} -> {}:{}",
        session.id, protocol, config.addr, host, port
    );

    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&config.addr))
        .await
        .map_err(|_| ApiError::connect_server("guacd connect timed out"))?
        .map_err(ApiError::connect_server)?;
    let (read_half, mut writer) = stream.into_split();
    let mut frames = InstructionStream::new(read_half);

    let params = build_params(session, asset, account, &host, port, size);

    // select,<protocol>;
    send(&mut writer, &encode_instruction("select", &[&protocol])).await?;

    let args = expect(&mut frames, "args").await?;
    let version = args
        .args
        .first()
        .cloned()
        .unwrap_or_else(|| GUACD_VERSION.to_string());
    if version != GUACD_VERSION {
        warn!(
            "session {}: guacd version {} (expected {})",
            session.id, version, GUACD_VERSION
        );
    }

    let width = size.width.max(1).to_string();
    let height = size.height.max(1).to_string();
    send(
        &mut writer,
        &encode_instruction("size", &[&width, &height, DEFAULT_DPI]),
    )
    .await?;
    send(&mut writer, &encode_instruction("audio", &[])).await?;
    send(&mut writer, &encode_instruction("video", &[])).await?;
    send(&mut writer, &encode_instruction("image", &[])).await?;

    // answer guacd's requested arguments positionally
    let normalized: HashMap<String, String> = params
        .iter()
        .map(|(k, v)| (normalize_param(k), v.clone()))
        .collect();
    let mut connect_args: Vec<String> = vec![version];
    for name in args.args.iter().skip(1) {
        connect_args.push(
            normalized
                .get(&normalize_param(name))
                .cloned()
                .unwrap_or_default(),
        );
    }
    let borrowed: Vec<&str> = connect_args.iter().map(String::as_str).collect();
    send(&mut writer, &encode_instruction("connect", &borrowed)).await?;

    let ready = expect(&mut frames, "ready").await?;
    debug!(
        "session {}: guacd ready, connection id {:?}",
        session.id,
        ready.args.first()
    );

    let (piped, cmd_rx) = PipedTarget::new();
    spawn_guacd_adapter(session, frames, writer, cmd_rx);
    Ok(Arc::new(GuacdTarget { piped, tunnel }))
}

fn build_params(
    session: &Arc<Session>,
    _asset: &Asset,
    account: &Account,
    host: &str,
    port: u16,
    size: WindowSize,
) -> HashMap<String, String> {
    let perms = session.permissions();
    let mut params = HashMap::new();
    params.insert("hostname".to_string(), host.to_string());
    params.insert("port".to_string(), port.to_string());
    params.insert("username".to_string(), account.account.clone());
    params.insert("password".to_string(), account.password.clone());
    params.insert("width".to_string(), size.width.max(1).to_string());
    params.insert("height".to_string(), size.height.max(1).to_string());
    params.insert("dpi".to_string(), DEFAULT_DPI.to_string());
    params.insert("ignore-cert".to_string(), "true".to_string());
    // guacamole booleans: "true" enables, empty disables
    params.insert(
        "disable-copy".to_string(),
        if perms.copy { String::new() } else { "true".to_string() },
    );
    params.insert(
        "disable-paste".to_string(),
        if perms.paste { String::new() } else { "true".to_string() },
    );
    params
}

fn normalize_param(name: &str) -> String {
    name.replace(['-', '_'], "").to_ascii_lowercase()
}

async fn send(
    writer: &mut (impl AsyncWriteExt + Unpin),
    instruction: &str,
) -> Result<(), ApiError> {
    writer
        .write_all(instruction.as_bytes())
        .await
        .map_err(ApiError::connect_server)?;
    writer.flush().await.map_err(ApiError::connect_server)
}

/// Read the next instruction, failing on `error` and on opcode mismatch.
async fn expect<R: tokio::io::AsyncRead + Unpin>(
    frames: &mut InstructionStream<R>,
    opcode: &str,
) -> Result<Frame, ApiError> {
    let frame = match frames.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => return Err(ApiError::connect_server(e)),
        None => {
            return Err(ApiError::connect_server(format!(
                "guacd closed the connection while waiting for '{}'",
                opcode
            )))
        }
    };
    if frame.opcode == "error" {
        return Err(decode_guacd_error(&frame));
    }
    if frame.opcode != opcode {
        return Err(ApiError::connect_server(format!(
            "expected guacd '{}', got '{}'",
            opcode, frame.opcode
        )));
    }
    Ok(frame)
}

/// `error,<base64 message>,<code>;` from guacd.
fn decode_guacd_error(frame: &Frame) -> ApiError {
    let raw = frame.args.first().map(String::as_str).unwrap_or_default();
    let message = base64::engine::general_purpose::STANDARD
        .decode(raw)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| raw.to_string());
    let code = frame.args.get(1).map(String::as_str).unwrap_or_default();
    ApiError::with(
        ErrorCode::ConnectServer,
        "err",
        format!("{} (code {})", message, code),
    )
}

/// Relay raw instruction bytes both ways after the handshake.
fn spawn_guacd_adapter<R>(
    session: &Arc<Session>,
    frames: InstructionStream<R>,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut cmd_rx: mpsc::Receiver<TargetCmd>,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let out_tx = session.chans.out_tx.clone();
    let err_tx = session.chans.err_tx.clone();
    let away = session.chans.away.clone();
    let session_id = session.id.clone();

    tokio::spawn(async move {
        let (mut reader, leftover) = frames.into_parts();
        if !leftover.is_empty() && out_tx.send(leftover.freeze()).await.is_err() {
            return;
        }

        let mut buf = vec![0u8; 8192];
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
                        debug!("session {}: guacd closed", session_id);
                        away.cancel();
                        break;
                    }
                    Ok(n) => {
                        if out_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
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
        debug!("session {}: guacd adapter exit", session_id);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use jumpgate_session::{PermissionSet, SessionMeta};

    #[test]
    fn test_clipboard_restrictions_ride_the_connect_params() {
        let (session, _rx) = Session::new(SessionMeta {
            session_id: "g".to_string(),
            protocol: "rdp".to_string(),
            ..SessionMeta::default()
        });
        session.set_permissions(PermissionSet {
            connect: true,
            copy: false,
            paste: false,
            ..PermissionSet::default()
        });

        let account = Account {
            account: "admin".to_string(),
            password: "pw".to_string(),
            ..Account::default()
        };
        let params = build_params(
            &session,
            &Asset::default(),
            &account,
            "10.0.0.9",
            3389,
            WindowSize {
                width: 1024,
                height: 768,
            },
        );

        assert_eq!(params.get("disable-copy").unwrap(), "true");
        assert_eq!(params.get("disable-paste").unwrap(), "true");
        assert_eq!(params.get("hostname").unwrap(), "10.0.0.9");
        assert_eq!(params.get("port").unwrap(), "3389");
    }

    #[test]
    fn test_allowed_clipboard_leaves_flags_empty() {
        let (session, _rx) = Session::new(SessionMeta {
            session_id: "g2".to_string(),
            protocol: "vnc".to_string(),
            ..SessionMeta::default()
        });
        session.set_permissions(PermissionSet {
            connect: true,
            copy: true,
            paste: true,
            ..PermissionSet::default()
        });

        let params = build_params(
            &session,
            &Asset::default(),
            &Account::default(),
            "10.0.0.9",
            5900,
            WindowSize {
                width: 800,
                height: 600,
            },
        );
        assert_eq!(params.get("disable-copy").unwrap(), "");
        assert_eq!(params.get("disable-paste").unwrap(), "");
    }

    #[test]
    fn test_normalize_param() {
        assert_eq!(normalize_param("disable-copy"), "disablecopy");
        assert_eq!(normalize_param("DISABLE_PASTE"), "disablepaste");
        assert_eq!(normalize_param("hostname"), "hostname");
    }

    #[test]
    fn test_decode_guacd_error_base64() {
        let frame = Frame::new(
            "error",
            vec!["c2VjcmV0IG1lc3NhZ2U=".to_string(), "519".to_string()],
        );
        let err = decode_guacd_error(&frame);
        assert_eq!(err.code, ErrorCode::ConnectServer);
        assert!(err.to_string().contains("secret message"));
        assert!(err.to_string().contains("519"));
    }

    #[test]
    fn test_decode_guacd_error_plain_fallback() {
        let frame = Frame::new("error", vec!["not base64!!".to_string(), "512".to_string()]);
        let err = decode_guacd_error(&frame);
        assert!(err.to_string().contains("not base64!!"));
    }
}
