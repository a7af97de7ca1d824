// App state and the built-in collaborator implementations
//
// The session core consumes the directory, gate, store, and vault through
// traits. The built-ins here are the standalone-deployment versions: a
// config-seeded directory, an allow-all gate with a configured admin
// list, in-memory persistence, and a passthrough vault. Production
// deployments swap these for their own implementations when constructing
// AppState.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use jumpgate_connect::ConnectorConfig;
use jumpgate_session::{
    AccessGate, Account, ApiError, Asset, AuthAction, AuthResult, Directory, ErrorCode, Gateway,
    MemoryStore, Registry, SecretVault, Session, SessionStore,
};
use jumpgate_terminal::CommandRule;

use crate::config::JumpgateConfig;

/// User identity attached by the fronting auth layer.
#[derive(Debug, Clone, Default)]
pub struct CurrentUser {
    pub uid: i64,
    pub username: String,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<JumpgateConfig>,
    pub registry: Arc<Registry>,
    pub store: Arc<dyn SessionStore>,
    pub directory: Arc<dyn Directory>,
    pub gate: Arc<dyn AccessGate>,
    pub vault: Arc<dyn SecretVault>,
    pub connector: ConnectorConfig,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn standalone(config: JumpgateConfig) -> Self {
        let connector = ConnectorConfig {
            guacd: jumpgate_connect::GuacdConfig {
                addr: config.guacd_addr.clone(),
            },
        };
        let directory = Arc::new(ConfigDirectory::new(&config));
        let gate = Arc::new(ConfigGate {
            admin_uids: config.admin_uids.clone(),
        });
        Self {
            config: Arc::new(config),
            registry: Registry::global(),
            store: Arc::new(MemoryStore::new()),
            directory,
            gate,
            vault: Arc::new(PlainVault),
            connector,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Directory backed by the config file's seeded tables.
pub struct ConfigDirectory {
    assets: Vec<Asset>,
    accounts: Vec<Account>,
    gateways: Vec<Gateway>,
}

impl ConfigDirectory {
    pub fn new(config: &JumpgateConfig) -> Self {
        Self {
            assets: config.assets.clone(),
            accounts: config.accounts.clone(),
            gateways: config.gateways.clone(),
        }
    }
}

#[async_trait]
impl Directory for ConfigDirectory {
    async fn asset(&self, id: i64) -> Result<Asset, ApiError> {
        self.assets
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| ApiError::with(ErrorCode::InvalidArgument, "err", "unknown asset"))
    }

    async fn account(&self, id: i64) -> Result<Account, ApiError> {
        self.accounts
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| ApiError::with(ErrorCode::InvalidArgument, "err", "unknown account"))
    }

    async fn gateway(&self, id: i64) -> Result<Gateway, ApiError> {
        self.gateways
            .iter()
            .find(|g| g.id == id)
            .cloned()
            .ok_or_else(|| ApiError::with(ErrorCode::InvalidArgument, "err", "unknown gateway"))
    }

    async fn command_rules(&self, _ids: &[i64]) -> Result<Vec<CommandRule>, ApiError> {
        Ok(vec![])
    }
}

/// Allow-all gate with a configured admin list. Real deployments plug in
/// the access-control authority here.
pub struct ConfigGate {
    pub admin_uids: Vec<i64>,
}

#[async_trait]
impl AccessGate for ConfigGate {
    async fn evaluate(
        &self,
        _session: &Session,
        actions: &[AuthAction],
    ) -> Result<AuthResult, ApiError> {
        Ok(AuthResult::allowing(actions.iter().copied()))
    }

    fn is_admin(&self, uid: i64) -> bool {
        self.admin_uids.contains(&uid)
    }
}

/// Secrets stored in the clear, for standalone use.
pub struct PlainVault;

impl SecretVault for PlainVault {
    fn decrypt(&self, ciphertext: &str) -> String {
        ciphertext.to_string()
    }
}
