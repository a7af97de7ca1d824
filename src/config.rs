// Server configuration
//
// A TOML file probed from JUMPGATE_CONFIG, ./jumpgate.toml, then
// /etc/jumpgate/config.toml; every field has a default so a bare binary
// still starts. The seeded directory tables exist so a standalone
// deployment has assets to talk to; a real deployment replaces them by
// wiring its own Directory implementation.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use jumpgate_session::{Account, Asset, Gateway};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JumpgateConfig {
    /// HTTP listen address.
    pub listen: String,
    /// Guacd daemon address for rdp/vnc sessions.
    pub guacd_addr: String,
    /// Seconds without client activity before a session is closed.
    pub idle_timeout_secs: u64,
    /// Directory receiving .cast recording files.
    pub recording_dir: String,
    /// Fallback language for client-visible messages.
    pub default_lang: String,
    /// Uids treated as administrators by the built-in gate.
    pub admin_uids: Vec<i64>,

    pub assets: Vec<Asset>,
    pub accounts: Vec<Account>,
    pub gateways: Vec<Gateway>,
}

impl Default for JumpgateConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8686".to_string(),
            guacd_addr: "127.0.0.1:4822".to_string(),
            idle_timeout_secs: 1800,
            recording_dir: "./replays".to_string(),
            default_lang: "en".to_string(),
            admin_uids: vec![],
            assets: vec![],
            accounts: vec![],
            gateways: vec![],
        }
    }
}

impl JumpgateConfig {
    /// Load the first config file found, or defaults when none exists.
    pub fn load() -> Self {
        for path in Self::candidate_paths() {
            match std::fs::read_to_string(&path) {
                Ok(raw) => match toml::from_str(&raw) {
                    Ok(config) => {
                        log::info!("loaded config from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        log::error!("bad config {}: {}", path.display(), e);
                    }
                },
                Err(_) => continue,
            }
        }
        log::info!("no config file found, using defaults");
        Self::default()
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(p) = std::env::var("JUMPGATE_CONFIG") {
            paths.push(PathBuf::from(p));
        }
        paths.push(PathBuf::from("./jumpgate.toml"));
        paths.push(PathBuf::from("/etc/jumpgate/config.toml"));
        paths
    }

    pub fn idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.idle_timeout_secs)
    }
}
