// SSH gateway tunneling
//
// When an asset carries a gateway id, the gateway is dialed first with
// its own credentials and the target dial is made from the gateway host
// over a direct-tcpip channel. The tunnel belongs to the session and is
// torn down with it.

use log::{debug, info, warn};
use russh::client;
use russh::ChannelStream;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use jumpgate_session::{ApiError, Gateway};

use crate::ssh::{authenticate, SshClientHandler, CONNECT_TIMEOUT};

pub struct GatewayTunnel {
    handle: client::Handle<SshClientHandler>,
    label: String,
}

impl GatewayTunnel {
    /// Dial the gateway and authenticate with its own account.
    pub async fn open(gateway: &Gateway) -> Result<Self, ApiError> {
        info!("dialing gateway {}({})", gateway.name, gateway.host);
        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            ..client::Config::default()
        });

        let mut handle = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client::connect(
                config,
                (gateway.host.as_str(), gateway.port),
                SshClientHandler::default(),
            ),
        )
        .await
        .map_err(|_| ApiError::connect_server("gateway connect timed out"))?
        .map_err(ApiError::connect_server)?;

        authenticate(
            &mut handle,
            &gateway.account,
            &gateway.password,
            &gateway.private_key,
            &gateway.passphrase,
            gateway.method,
        )
        .await?;

        Ok(Self {
            handle,
            label: format!("{}({})", gateway.name, gateway.host),
        })
    }

    /// Open a stream to `host:port` originating from the gateway.
    pub async fn stream_to(
        &self,
        host: &str,
        port: u16,
    ) -> Result<ChannelStream<client::Msg>, ApiError> {
        debug!("tunnel {} -> {}:{}", self.label, host, port);
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(ApiError::connect_server)?;
        Ok(channel.into_stream())
    }

    /// Close the tunnel. Safe to call while streams are still open; they
    /// fail fast afterwards, which is what session teardown wants.
    pub async fn close(&self) {
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
    }
}

/// Expose `host:port` (as seen from the gateway) on a loopback listener.
///
/// Vendor database clients dial by address, so tunneled targets get a
/// local port whose accepted connections are piped over direct-tcpip
/// channels. The forwarder lives until the session's away token fires.
pub async fn local_forward(
    tunnel: Arc<GatewayTunnel>,
    host: String,
    port: u16,
    away: CancellationToken,
) -> Result<SocketAddr, ApiError> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(ApiError::internal)?;
    let addr = listener.local_addr().map_err(ApiError::internal)?;
    debug!("forwarding {} -> {}:{}", addr, host, port);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = away.cancelled() => break,

                accepted = listener.accept() => {
                    let Ok((mut sock, _)) = accepted else { break };
                    match tunnel.stream_to(&host, port).await {
                        Ok(mut stream) => {
                            tokio::spawn(async move {
                                let _ = tokio::io::copy_bidirectional(&mut sock, &mut stream).await;
                            });
                        }
                        Err(e) => {
                            warn!("forward to {}:{} failed: {}", host, port, e);
                            break;
                        }
                    }
                }
            }
        }
    });

    Ok(addr)
}
