// SSH connector
//
// Dials the asset (directly or from the gateway), authenticates with the
// account's method, requests a PTY at the client's size, and opens a
// shell. When the session has any file permission an SFTP subsystem is
// opened alongside; SFTP failure downgrades the session instead of
// killing it.

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use russh::client;
use russh_keys::key;
use russh_sftp::client::SftpSession;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use jumpgate_session::{
    ApiError, Account, Asset, AuthMethod, Gateway, Session, TargetIo, WindowSize,
};

use crate::gateway::GatewayTunnel;
use crate::target::{PipedTarget, TargetCmd};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TERM_TYPE: &str = "xterm-256color";

/// Host keys are not pinned at the gateway layer; asset reachability is
/// governed by the directory, not trust-on-first-use prompts.
#[derive(Default)]
pub struct SshClientHandler;

#[async_trait]
impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Authenticate `handle` using the account's configured method.
pub async fn authenticate(
    handle: &mut client::Handle<SshClientHandler>,
    user: &str,
    password: &str,
    private_key: &str,
    passphrase: &str,
    method: AuthMethod,
) -> Result<(), ApiError> {
    let ok = match method {
        AuthMethod::Password => handle
            .authenticate_password(user, password)
            .await
            .map_err(ApiError::connect_server)?,
        AuthMethod::PrivateKey => {
            let passphrase = if passphrase.is_empty() {
                None
            } else {
                Some(passphrase)
            };
            let key_pair = russh_keys::decode_secret_key(private_key, passphrase)
                .map_err(ApiError::connect_server)?;
            handle
                .authenticate_publickey(user, Arc::new(key_pair))
                .await
                .map_err(ApiError::connect_server)?
        }
    };
    if !ok {
        return Err(ApiError::connect_server("ssh authentication failed"));
    }
    Ok(())
}

/// TargetIo for an SSH shell, closing SFTP ahead of the transport.
struct SshTarget {
    piped: PipedTarget,
    sftp: Mutex<Option<SftpSession>>,
    tunnel: Option<GatewayTunnel>,
}

#[async_trait]
impl TargetIo for SshTarget {
    async fn write_stdin(&self, data: &[u8]) -> Result<(), ApiError> {
        self.piped.write_stdin(data).await
    }

    async fn resize(&self, size: WindowSize) -> Result<(), ApiError> {
        self.piped.resize(size).await
    }

    async fn shutdown(&self) {
        if let Some(sftp) = self.sftp.lock().await.take() {
            if let Err(e) = sftp.close().await {
                debug!("sftp close: {}", e);
            }
        }
        self.piped.shutdown().await;
        if let Some(tunnel) = &self.tunnel {
            tunnel.close().await;
        }
    }
}

/// Connect the session to its SSH asset.
pub async fn connect_ssh(
    session: &Arc<Session>,
    asset: &Asset,
    account: &Account,
    gateway: Option<&Gateway>,
    size: WindowSize,
) -> Result<Arc<dyn TargetIo>, ApiError> {
    let port = asset.port_for("ssh");
    info!(
        "session {}: ssh {}@{}:{}",
        session.id, account.account, asset.ip, port
    );

    let config = Arc::new(client::Config::default());

    let (mut handle, tunnel) = match gateway {
        Some(gw) => {
            let tunnel = GatewayTunnel::open(gw).await?;
            let stream = tunnel.stream_to(&asset.ip, port).await?;
            let handle = tokio::time::timeout(
                CONNECT_TIMEOUT,
                client::connect_stream(config, stream, SshClientHandler::default()),
            )
            .await
            .map_err(|_| ApiError::connect_server("ssh connect timed out"))?
            .map_err(ApiError::connect_server)?;
            (handle, Some(tunnel))
        }
        None => {
            let handle = tokio::time::timeout(
                CONNECT_TIMEOUT,
                client::connect(config, (asset.ip.as_str(), port), SshClientHandler::default()),
            )
            .await
            .map_err(|_| ApiError::connect_server("ssh connect timed out"))?
            .map_err(ApiError::connect_server)?;
            (handle, None)
        }
    };

    authenticate(
        &mut handle,
        &account.account,
        &account.password,
        &account.private_key,
        &account.passphrase,
        account.method,
    )
    .await?;

    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(ApiError::connect_server)?;
    channel
        .request_pty(
            false,
            TERM_TYPE,
            size.width.max(1),
            size.height.max(1),
            0,
            0,
            &[],
        )
        .await
        .map_err(ApiError::connect_server)?;
    channel
        .request_shell(false)
        .await
        .map_err(ApiError::connect_server)?;
    debug!("session {}: shell established", session.id);

    let perms = session.permissions();
    let sftp = if perms.file_upload || perms.file_download {
        match open_sftp(&handle).await {
            Ok(sftp) => {
                info!("session {}: sftp subsystem opened", session.id);
                Some(sftp)
            }
            Err(e) => {
                // degrade to a session without file transfer
                warn!("session {}: sftp unavailable: {}", session.id, e);
                None
            }
        }
    } else {
        None
    };

    let (piped, cmd_rx) = PipedTarget::new();
    spawn_shell_adapter(session, channel, cmd_rx);

    Ok(Arc::new(SshTarget {
        piped,
        sftp: Mutex::new(sftp),
        tunnel,
    }))
}

async fn open_sftp(handle: &client::Handle<SshClientHandler>) -> Result<SftpSession, ApiError> {
    let channel = handle
        .channel_open_session()
        .await
        .map_err(ApiError::connect_server)?;
    channel
        .request_subsystem(false, "sftp")
        .await
        .map_err(ApiError::connect_server)?;
    SftpSession::new(channel.into_stream())
        .await
        .map_err(ApiError::connect_server)
}

/// Bridge the shell channel to the session: channel data feeds the output
/// channel, command-pipe writes feed channel stdin, resizes become
/// window-change requests.
fn spawn_shell_adapter(
    session: &Arc<Session>,
    mut channel: russh::Channel<client::Msg>,
    mut cmd_rx: mpsc::Receiver<TargetCmd>,
) {
    let out_tx = session.chans.out_tx.clone();
    let err_tx = session.chans.err_tx.clone();
    let away = session.chans.away.clone();
    let session_id = session.id.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = away.cancelled() => break,

                cmd = cmd_rx.recv() => match cmd {
                    Some(TargetCmd::Data(data)) => {
                        if let Err(e) = channel.data(&data[..]).await {
                            let _ = err_tx.send(ApiError::connect_server(e)).await;
                            break;
                        }
                    }
                    Some(TargetCmd::Resize(size)) => {
                        if let Err(e) = channel
                            .window_change(size.width, size.height, 0, 0)
                            .await
                        {
                            debug!("session {}: window change failed: {}", session_id, e);
                        }
                    }
                    Some(TargetCmd::Shutdown) | None => break,
                },

                msg = channel.wait() => match msg {
                    Some(russh::ChannelMsg::Data { ref data }) => {
                        if out_tx.send(Bytes::copy_from_slice(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(russh::ChannelMsg::ExtendedData { ref data, .. }) => {
                        if out_tx.send(Bytes::copy_from_slice(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(russh::ChannelMsg::Eof)
                    | Some(russh::ChannelMsg::Close)
                    | None => {
                        debug!("session {}: shell closed by target", session_id);
                        away.cancel();
                        break;
                    }
                    Some(russh::ChannelMsg::ExitStatus { exit_status }) => {
                        debug!("session {}: exit status {}", session_id, exit_status);
                    }
                    Some(_) => {}
                },
            }
        }
        debug!("session {}: ssh adapter exit", session_id);
    });
}
