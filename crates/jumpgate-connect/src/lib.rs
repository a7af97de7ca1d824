// jumpgate-connect: protocol connectors
//
// Resolves how to reach an asset (directly or through its gateway), dials
// with the protocol-specific client, and attaches a uniform TargetIo
// endpoint plus an adapter task to the session. The multiplexer never
// sees protocol differences beyond the capability interface.

mod db;
mod gateway;
mod guacd;
mod ssh;
mod target;
mod telnet;

pub use gateway::{local_forward, GatewayTunnel};
pub use guacd::GuacdConfig;
pub use target::{PipedTarget, TargetCmd};

use log::error;
use std::sync::Arc;

use jumpgate_session::{
    ApiError, Account, Asset, ErrorCode, Gateway, Session, TargetIo, WindowSize,
};

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub guacd: GuacdConfig,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            guacd: GuacdConfig {
                addr: "127.0.0.1:4822".to_string(),
            },
        }
    }
}

/// Dial the session's target and attach a TargetIo endpoint.
///
/// `gateway` must be the asset's gateway when `asset.gateway_id != 0`.
/// Secrets in `account`/`gateway` are expected to be decrypted already.
pub async fn connect(
    session: &Arc<Session>,
    asset: &Asset,
    account: &Account,
    gateway: Option<&Gateway>,
    size: WindowSize,
    config: &ConnectorConfig,
) -> Result<Arc<dyn TargetIo>, ApiError> {
    match session.protocol.as_str() {
        "ssh" => ssh::connect_ssh(session, asset, account, gateway, size).await,
        "telnet" => telnet::connect_telnet(session, asset, gateway).await,
        "redis" | "mysql" | "mongodb" | "postgresql" => {
            db::connect_db(session, asset, account, gateway).await
        }
        "rdp" | "vnc" => {
            guacd::connect_guacd(session, asset, account, gateway, size, &config.guacd).await
        }
        "http" | "https" => Err(ApiError::with(
            ErrorCode::ConnectServer,
            "err",
            "web assets are served by the web proxy, not interactive sessions",
        )),
        other => {
            error!("session {}: unknown protocol {}", session.id, other);
            Err(ApiError::with(ErrorCode::InvalidArgument, "err", other))
        }
    }
}
