// External collaborator contracts: authorization, persistence, secrets
//
// The access-control authority, the persistent store, and secret
// decryption are consumed through these seams; the core never implements
// policy itself. Access-window evaluation is the one piece of policy math
// the core owns, because the multiplexer polls it every minute.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Local, Timelike};
use dashmap::DashMap;
use std::collections::HashSet;

use crate::error::ApiError;
use crate::model::{AccessAuth, Account, Asset, Gateway, SessionRecord};
use crate::session::Session;
use jumpgate_terminal::CommandRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthAction {
    Connect,
    FileUpload,
    FileDownload,
    Copy,
    Paste,
    Share,
}

/// Union of allowed actions returned by the gate for one evaluation.
#[derive(Debug, Clone, Default)]
pub struct AuthResult {
    allowed: HashSet<AuthAction>,
}

impl AuthResult {
    pub fn allowing(actions: impl IntoIterator<Item = AuthAction>) -> Self {
        Self {
            allowed: actions.into_iter().collect(),
        }
    }

    pub fn allow(&mut self, action: AuthAction) {
        self.allowed.insert(action);
    }

    pub fn is_allowed(&self, action: AuthAction) -> bool {
        self.allowed.contains(&action)
    }
}

/// The access-control authority: maps (user, resource, action) to a
/// decision, combining direct grants, node-ancestor grants, role grants,
/// and global admin.
#[async_trait]
pub trait AccessGate: Send + Sync {
    async fn evaluate(
        &self,
        session: &Session,
        actions: &[AuthAction],
    ) -> Result<AuthResult, ApiError>;

    fn is_admin(&self, uid: i64) -> bool;
}

/// Read access to asset/account/gateway records and command rules.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn asset(&self, id: i64) -> Result<Asset, ApiError>;
    async fn account(&self, id: i64) -> Result<Account, ApiError>;
    async fn gateway(&self, id: i64) -> Result<Gateway, ApiError>;
    async fn command_rules(&self, ids: &[i64]) -> Result<Vec<CommandRule>, ApiError>;
}

/// Persistence for session rows.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn upsert(&self, record: &SessionRecord) -> Result<(), ApiError>;
}

/// In-memory store used by tests and as a default when persistence is
/// wired externally.
#[derive(Default)]
pub struct MemoryStore {
    rows: DashMap<String, SessionRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.rows.get(session_id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn upsert(&self, record: &SessionRecord) -> Result<(), ApiError> {
        self.rows.insert(record.session_id.clone(), record.clone());
        Ok(())
    }
}

/// Secret decryption seam; at-rest encryption lives outside the core.
pub trait SecretVault: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> String;
}

/// Whether `auth` permits access right now (local time).
pub fn check_access_window(auth: &AccessAuth) -> bool {
    check_access_window_at(auth, Local::now())
}

/// Access-window evaluation against an explicit clock.
///
/// Date bounds are checked first. Weekday ranges are then matched by
/// "hh:mm" comparison; the `allow` flag decides whether a match means
/// permitted (whitelist) or denied (blacklist). No ranges at all means
/// access is permitted.
pub fn check_access_window_at(auth: &AccessAuth, now: DateTime<Local>) -> bool {
    let now_utc = now.with_timezone(&chrono::Utc);
    if let Some(start) = auth.start {
        if now_utc < start {
            return false;
        }
    }
    if let Some(end) = auth.end {
        if now_utc > end {
            return false;
        }
    }

    let weekday = now.weekday().num_days_from_sunday(); // Sunday = 0
    let hm = format!("{:02}:{:02}", now.hour(), now.minute());

    let mut has_ranges = false;
    let mut matched = false;
    for range in &auth.ranges {
        has_ranges = has_ranges || !range.times.is_empty();
        if u32::from(range.week + 1) % 7 != weekday {
            continue;
        }
        for window in &range.times {
            if let Some((from, to)) = window.split_once('~') {
                if hm.as_str() >= from && hm.as_str() <= to {
                    matched = true;
                }
            }
        }
    }

    !has_ranges || matched == auth.allow
}
