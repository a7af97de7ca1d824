// Asset / account / gateway records and the persisted session row
//
// These are the narrow shapes the core reads from the external store; the
// CRUD surface managing them lives elsewhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionKind {
    /// Browser client over websocket; inbound frames carry a type prefix.
    Web,
    /// Native client over a raw byte stream.
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Online,
    Offline,
}

/// A target host reachable through the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Asset {
    pub id: i64,
    pub name: String,
    pub ip: String,
    /// Entries like "ssh:22"; port may be omitted for protocol defaults.
    pub protocols: Vec<String>,
    pub gateway_id: i64,
    pub access_auth: AccessAuth,
    pub cmd_ids: Vec<i64>,
}

impl Asset {
    /// Resolve the port for a protocol from the asset's protocol list,
    /// falling back to the protocol's well-known default.
    pub fn port_for(&self, protocol: &str) -> u16 {
        for entry in &self.protocols {
            let mut parts = entry.splitn(2, ':');
            if parts.next() == Some(protocol) {
                if let Some(port) = parts.next().and_then(|p| p.parse().ok()) {
                    return port;
                }
            }
        }
        match protocol {
            "ssh" => 22,
            "telnet" => 23,
            "redis" => 6379,
            "mysql" => 3306,
            "mongodb" => 27017,
            "postgresql" => 5432,
            "rdp" => 3389,
            "vnc" => 5900,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethod {
    Password,
    PrivateKey,
}

impl Default for AuthMethod {
    fn default() -> Self {
        AuthMethod::Password
    }
}

/// Credential bundle usable against an asset. Secret fields arrive
/// encrypted and go through the vault before use.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub account: String,
    pub password: String,
    pub private_key: String,
    pub passphrase: String,
    pub method: AuthMethod,
}

/// SSH jump host for assets that are not directly routable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Gateway {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub account: String,
    pub password: String,
    pub private_key: String,
    pub passphrase: String,
    pub method: AuthMethod,
}

/// Weekly schedule plus date range bounding asset access.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessAuth {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub ranges: Vec<AccessRange>,
    /// true: ranges whitelist access; false: ranges blacklist it.
    pub allow: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRange {
    /// 0 = Monday … 6 = Sunday.
    pub week: u8,
    /// "hh:mm~hh:mm" entries.
    pub times: Vec<String>,
}

/// The row written to persistence for every session. Status transitions
/// are monotonic online -> offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: i64,
    pub session_id: String,
    pub session_type: SessionKind,
    pub uid: i64,
    pub username: String,
    pub client_ip: String,
    pub asset_id: i64,
    pub asset_info: String,
    pub account_id: i64,
    pub account_info: String,
    pub gateway_id: i64,
    pub gateway_info: String,
    pub protocol: String,
    pub status: SessionStatus,
    pub share_id: i64,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}
