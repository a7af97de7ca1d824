// The session object
//
// One per live connection. The multiplexer exclusively owns the channel
// receive halves; everything here is the shared view producers hold. The
// permission set is frozen at connect time: policy edits only affect
// future sessions.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::channels::{session_channels, ChannelHandles, ChannelReceivers};
use crate::model::{SessionKind, SessionRecord, SessionStatus};
use crate::observer::ObserverSink;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PermissionSet {
    pub connect: bool,
    pub file_upload: bool,
    pub file_download: bool,
    pub copy: bool,
    pub paste: bool,
    pub share: bool,
}

/// Connection-time facts a session is built from.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub session_id: String,
    pub kind: SessionKind,
    pub protocol: String,
    pub uid: i64,
    pub username: String,
    pub client_ip: String,
    pub asset_id: i64,
    pub asset_info: String,
    pub account_id: i64,
    pub account_info: String,
    pub gateway_id: i64,
    pub gateway_info: String,
    pub share_id: i64,
    pub share_end: Option<DateTime<Utc>>,
    pub idle_timeout: Duration,
}

impl Default for SessionMeta {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            kind: SessionKind::Web,
            protocol: "ssh".to_string(),
            uid: 0,
            username: String::new(),
            client_ip: String::new(),
            asset_id: 0,
            asset_info: String::new(),
            account_id: 0,
            account_info: String::new(),
            gateway_id: 0,
            gateway_info: String::new(),
            share_id: 0,
            share_end: None,
            idle_timeout: Duration::from_secs(1800),
        }
    }
}

pub struct Session {
    pub id: String,
    pub kind: SessionKind,
    pub protocol: String,
    pub uid: i64,
    pub username: String,
    pub client_ip: String,
    pub asset_id: i64,
    pub asset_info: String,
    pub account_id: i64,
    pub account_info: String,
    pub gateway_id: i64,
    pub gateway_info: String,
    pub share_id: i64,
    pub share_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub idle_timeout: Duration,

    pub chans: ChannelHandles,
    pub observers: DashMap<String, Arc<dyn ObserverSink>>,

    status: RwLock<SessionStatus>,
    closed_at: RwLock<Option<DateTime<Utc>>>,
    permissions: OnceCell<PermissionSet>,
    idle_deadline: Mutex<Instant>,
}

impl Session {
    /// Build a session and its channel bundle. The receivers go to the
    /// multiplexer; everyone else shares the `Arc`.
    pub fn new(meta: SessionMeta) -> (Arc<Session>, ChannelReceivers) {
        let (handles, receivers) = session_channels();
        let idle_timeout = meta.idle_timeout;
        let session = Arc::new(Session {
            id: meta.session_id,
            kind: meta.kind,
            protocol: meta.protocol,
            uid: meta.uid,
            username: meta.username,
            client_ip: meta.client_ip,
            asset_id: meta.asset_id,
            asset_info: meta.asset_info,
            account_id: meta.account_id,
            account_info: meta.account_info,
            gateway_id: meta.gateway_id,
            gateway_info: meta.gateway_info,
            share_id: meta.share_id,
            share_end: meta.share_end,
            created_at: Utc::now(),
            idle_timeout,
            chans: handles,
            observers: DashMap::new(),
            status: RwLock::new(SessionStatus::Online),
            closed_at: RwLock::new(None),
            permissions: OnceCell::new(),
            idle_deadline: Mutex::new(Instant::now() + effective_idle(idle_timeout)),
        });
        (session, receivers)
    }

    /// rdp/vnc sessions speak guacd instructions instead of raw terminal
    /// bytes; several multiplexer branches differ on this.
    pub fn is_guacd(&self) -> bool {
        matches!(self.protocol.as_str(), "rdp" | "vnc")
    }

    /// Freeze the permission set. May succeed only once.
    pub fn set_permissions(&self, perms: PermissionSet) -> bool {
        self.permissions.set(perms).is_ok()
    }

    pub fn permissions(&self) -> PermissionSet {
        self.permissions.get().copied().unwrap_or_default()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.read()
    }

    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        *self.closed_at.read()
    }

    /// Mark offline and stamp the close time (monotonic; first call wins).
    pub fn set_offline(&self) {
        *self.status.write() = SessionStatus::Offline;
        let mut closed = self.closed_at.write();
        if closed.is_none() {
            *closed = Some(Utc::now());
        }
    }

    /// Push the idle deadline out by the configured timeout.
    pub fn set_idle(&self) {
        *self.idle_deadline.lock() = Instant::now() + effective_idle(self.idle_timeout);
    }

    pub fn idle_deadline(&self) -> Instant {
        *self.idle_deadline.lock()
    }

    pub fn attach_observer(&self, key: String, sink: Arc<dyn ObserverSink>) {
        self.observers.insert(key, sink);
    }

    pub fn detach_observer(&self, key: &str) {
        self.observers.remove(key);
    }

    /// The row persisted for this session.
    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            id: 0,
            session_id: self.id.clone(),
            session_type: self.kind,
            uid: self.uid,
            username: self.username.clone(),
            client_ip: self.client_ip.clone(),
            asset_id: self.asset_id,
            asset_info: self.asset_info.clone(),
            account_id: self.account_id,
            account_info: self.account_info.clone(),
            gateway_id: self.gateway_id,
            gateway_info: self.gateway_info.clone(),
            protocol: self.protocol.clone(),
            status: self.status(),
            share_id: self.share_id,
            created_at: self.created_at,
            closed_at: self.closed_at(),
        }
    }
}

fn effective_idle(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        // idle enforcement disabled; park the deadline a year out
        Duration::from_secs(365 * 24 * 3600)
    } else {
        timeout
    }
}
