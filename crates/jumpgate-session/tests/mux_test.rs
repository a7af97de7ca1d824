// End-to-end multiplexer scenarios against mock transports.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use jumpgate_session::{
    run_session, AccessAuth, AccessRange, Account, ApiError, Asset, AuthMethod, BufferSink,
    ClientTransport, Directory, ErrorCode, Gateway, MemoryStore, MuxDeps, PermissionSet,
    PlainLocalizer, Registry, Session, SessionMeta, SessionStatus, TargetIo, WindowSize,
};
use jumpgate_terminal::{CommandRule, TermParser};

#[derive(Default)]
struct MockClient {
    frames: Mutex<Vec<Bytes>>,
    closed: AtomicBool,
    fail: AtomicBool,
}

impl MockClient {
    fn payload(&self) -> Vec<u8> {
        self.frames
            .lock()
            .iter()
            .flat_map(|f| f.iter().copied())
            .collect()
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload()).into_owned()
    }
}

#[async_trait]
impl ClientTransport for MockClient {
    async fn send(&self, data: &[u8]) -> Result<(), ApiError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ApiError::internal("websocket closed"));
        }
        self.frames.lock().push(Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MockTarget {
    stdin: Mutex<Vec<u8>>,
    resizes: Mutex<Vec<WindowSize>>,
    shut: AtomicBool,
}

impl MockTarget {
    fn stdin_bytes(&self) -> Vec<u8> {
        self.stdin.lock().clone()
    }
}

#[async_trait]
impl TargetIo for MockTarget {
    async fn write_stdin(&self, data: &[u8]) -> Result<(), ApiError> {
        self.stdin.lock().extend_from_slice(data);
        Ok(())
    }

    async fn resize(&self, size: WindowSize) -> Result<(), ApiError> {
        self.resizes.lock().push(size);
        Ok(())
    }

    async fn shutdown(&self) {
        self.shut.store(true, Ordering::SeqCst);
    }
}

struct MockDirectory {
    asset: Mutex<Asset>,
}

impl MockDirectory {
    fn new(asset: Asset) -> Self {
        Self {
            asset: Mutex::new(asset),
        }
    }
}

#[async_trait]
impl Directory for MockDirectory {
    async fn asset(&self, _id: i64) -> Result<Asset, ApiError> {
        Ok(self.asset.lock().clone())
    }

    async fn account(&self, _id: i64) -> Result<Account, ApiError> {
        Ok(Account {
            method: AuthMethod::Password,
            ..Account::default()
        })
    }

    async fn gateway(&self, _id: i64) -> Result<Gateway, ApiError> {
        Ok(Gateway::default())
    }

    async fn command_rules(&self, _ids: &[i64]) -> Result<Vec<CommandRule>, ApiError> {
        Ok(vec![])
    }
}

struct Fixture {
    session: Arc<Session>,
    client: Arc<MockClient>,
    target: Arc<MockTarget>,
    store: Arc<MemoryStore>,
    registry: Arc<Registry>,
    handle: tokio::task::JoinHandle<Option<ApiError>>,
}

fn open_asset() -> Asset {
    Asset {
        id: 7,
        name: "web-01".to_string(),
        ip: "10.0.0.7".to_string(),
        ..Asset::default()
    }
}

fn spawn_session(meta: SessionMeta, rules: Vec<CommandRule>, asset: Asset) -> Fixture {
    let (session, rx) = Session::new(meta);
    session.set_permissions(PermissionSet {
        connect: true,
        ..PermissionSet::default()
    });

    let client = Arc::new(MockClient::default());
    let target = Arc::new(MockTarget::default());
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(Registry::new());
    registry.store(Arc::clone(&session));

    let parser = TermParser::new(&session.id, &session.protocol, rules);
    let deps = MuxDeps {
        client: client.clone() as Arc<dyn ClientTransport>,
        target: target.clone() as Arc<dyn TargetIo>,
        directory: Arc::new(MockDirectory::new(asset)),
        store: store.clone(),
        registry: registry.clone(),
        localizer: Arc::new(PlainLocalizer),
        parser: Some(parser),
        recorder: None,
        shutdown: CancellationToken::new(),
    };
    let handle = tokio::spawn(run_session(Arc::clone(&session), rx, deps));

    Fixture {
        session,
        client,
        target,
        store,
        registry,
        handle,
    }
}

fn web_meta(id: &str) -> SessionMeta {
    SessionMeta {
        session_id: id.to_string(),
        uid: 42,
        username: "dev".to_string(),
        client_ip: "192.0.2.10".to_string(),
        asset_id: 7,
        asset_info: "web-01(10.0.0.7)".to_string(),
        account_id: 3,
        account_info: "root(root)".to_string(),
        ..SessionMeta::default()
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(250)).await;
}

#[tokio::test(start_paused = true)]
async fn test_happy_path_input_and_output() {
    let fx = spawn_session(web_meta("happy"), vec![], open_asset());

    // web frame: '1' prefix marks a payload
    fx.session
        .chans
        .in_tx
        .send(Bytes::from_static(b"1ls\r"))
        .await
        .unwrap();
    fx.session
        .chans
        .out_tx
        .send(Bytes::from_static(b"file1 file2\r\n$ "))
        .await
        .unwrap();
    settle().await;

    assert_eq!(fx.target.stdin_bytes(), b"ls\r");
    assert!(fx.client.text().contains("file1 file2"));
    assert_eq!(fx.session.status(), SessionStatus::Online);
    assert!(fx.registry.get_by_id("happy").is_some());

    fx.session.chans.away.cancel();
    let exit = fx.handle.await.unwrap();
    assert!(exit.is_none());

    // teardown: offline, stamped, persisted, deregistered, transport closed
    assert_eq!(fx.session.status(), SessionStatus::Offline);
    let row = fx.store.get("happy").unwrap();
    assert_eq!(row.status, SessionStatus::Offline);
    assert!(row.closed_at.unwrap() >= row.created_at);
    assert!(fx.registry.get_by_id("happy").is_none());
    assert!(fx.client.closed.load(Ordering::SeqCst));
    assert!(fx.target.shut.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_does_not_reach_target_or_reset_idle() {
    let fx = spawn_session(web_meta("hb"), vec![], open_asset());
    let deadline_before = fx.session.idle_deadline();

    fx.session
        .chans
        .in_tx
        .send(Bytes::from_static(b"9"))
        .await
        .unwrap();
    settle().await;

    assert!(fx.target.stdin_bytes().is_empty());
    assert_eq!(fx.session.idle_deadline(), deadline_before);

    fx.session.chans.away.cancel();
    fx.handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_window_resize_reaches_target() {
    let fx = spawn_session(web_meta("resize"), vec![], open_asset());

    fx.session
        .chans
        .in_tx
        .send(Bytes::from_static(b"w120,40"))
        .await
        .unwrap();
    settle().await;

    assert_eq!(
        fx.target.resizes.lock().clone(),
        vec![WindowSize {
            width: 120,
            height: 40
        }]
    );

    fx.session.chans.away.cancel();
    fx.handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_forbidden_command_cancelled_not_forwarded() {
    let rules = vec![CommandRule::deny(1, "no-rm-root", r"rm -rf /")];
    let fx = spawn_session(web_meta("forbid"), rules, open_asset());

    fx.session
        .chans
        .in_tx
        .send(Bytes::from_static(b"1rm -rf /\r"))
        .await
        .unwrap();
    settle().await;

    // target sees only the line cancel, never the command
    assert_eq!(fx.target.stdin_bytes(), b"\x15\r");
    assert!(fx
        .client
        .text()
        .contains("\r\n \u{1b}[31m rm -rf / is forbidden \u{1b}[0m"));

    // session survives and keeps accepting input
    assert!(fx.registry.get_by_id("forbid").is_some());
    fx.session
        .chans
        .in_tx
        .send(Bytes::from_static(b"1ls\r"))
        .await
        .unwrap();
    settle().await;
    assert_eq!(fx.target.stdin_bytes(), b"\x15\rls\r");

    fx.session.chans.away.cancel();
    fx.handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_terminates() {
    let meta = SessionMeta {
        idle_timeout: Duration::from_secs(30),
        ..web_meta("idle")
    };
    let fx = spawn_session(meta, vec![], open_asset());

    tokio::time::sleep(Duration::from_secs(31)).await;
    let exit = fx.handle.await.unwrap().unwrap();
    assert_eq!(exit.code, ErrorCode::IdleTimeout);
    assert!(fx.client.text().contains("idle timeout"));
    assert!(fx.session.chans.away.is_cancelled());
    assert_eq!(fx.store.get("idle").unwrap().status, SessionStatus::Offline);
}

#[tokio::test(start_paused = true)]
async fn test_input_resets_idle() {
    let meta = SessionMeta {
        idle_timeout: Duration::from_secs(30),
        ..web_meta("busy")
    };
    let fx = spawn_session(meta, vec![], open_asset());

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(20)).await;
        fx.session
            .chans
            .in_tx
            .send(Bytes::from_static(b"1x"))
            .await
            .unwrap();
        settle().await;
    }
    // 60+ seconds elapsed but the session is still alive
    assert!(fx.registry.get_by_id("busy").is_some());

    fx.session.chans.away.cancel();
    fx.handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_admin_close() {
    let fx = spawn_session(web_meta("S"), vec![], open_asset());
    let observer = Arc::new(BufferSink::new());
    fx.session
        .attach_observer("1-S-0".to_string(), observer.clone());

    jumpgate_session::offline_session(&fx.registry, "S", "alice", &PlainLocalizer).await;

    let exit = fx.handle.await.unwrap().unwrap();
    assert_eq!(exit.code, ErrorCode::AdminClose);
    assert!(fx.client.text().contains("closed by alice"));

    let row = fx.store.get("S").unwrap();
    assert_eq!(row.status, SessionStatus::Offline);
    assert!(row.closed_at.unwrap() >= row.created_at);

    // observers got the end-of-session notice and were closed
    assert!(observer.is_closed());
    let text = String::from_utf8_lossy(&observer.contents()).into_owned();
    assert!(text.contains("session S ended"));
    assert!(fx.registry.get_by_id("S").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_access_window_expiry() {
    // blacklist covering the whole week: the minute tick must kill the
    // session no matter when the test runs
    let denied = Asset {
        access_auth: AccessAuth {
            start: None,
            end: None,
            ranges: (0..7)
                .map(|week| AccessRange {
                    week,
                    times: vec!["00:00~23:59".to_string()],
                })
                .collect(),
            allow: false,
        },
        ..open_asset()
    };
    let fx = spawn_session(web_meta("window"), vec![], denied);

    tokio::time::sleep(Duration::from_secs(61)).await;
    let exit = fx.handle.await.unwrap().unwrap();
    assert_eq!(exit.code, ErrorCode::AccessTime);
    assert_eq!(
        fx.store.get("window").unwrap().status,
        SessionStatus::Offline
    );
}

#[tokio::test(start_paused = true)]
async fn test_share_expiry_enforced_by_minute_tick() {
    let meta = SessionMeta {
        share_id: 9,
        share_end: Some(chrono::Utc::now() - chrono::Duration::seconds(1)),
        ..web_meta("shared")
    };
    let fx = spawn_session(meta, vec![], open_asset());

    tokio::time::sleep(Duration::from_secs(61)).await;
    let exit = fx.handle.await.unwrap().unwrap();
    assert_eq!(exit.code, ErrorCode::AccessTime);
}

#[tokio::test(start_paused = true)]
async fn test_error_channel_terminates_with_message() {
    let fx = spawn_session(web_meta("err"), vec![], open_asset());

    fx.session
        .chans
        .err_tx
        .send(ApiError::connect_server("connection reset by peer"))
        .await
        .unwrap();

    let exit = fx.handle.await.unwrap().unwrap();
    assert_eq!(exit.code, ErrorCode::ConnectServer);
    assert!(fx.client.text().contains("connection reset by peer"));
    assert_eq!(fx.session.status(), SessionStatus::Offline);
}

#[tokio::test(start_paused = true)]
async fn test_ordered_fanout_to_client_and_observers() {
    let fx = spawn_session(web_meta("fanout"), vec![], open_asset());
    let first = Arc::new(BufferSink::new());
    let second = Arc::new(BufferSink::new());
    fx.session.attach_observer("1-fanout-1".to_string(), first.clone());
    fx.session
        .attach_observer("2-fanout-2".to_string(), second.clone());

    for chunk in [&b"alpha "[..], b"beta ", b"gamma"] {
        fx.session
            .chans
            .out_tx
            .send(Bytes::copy_from_slice(chunk))
            .await
            .unwrap();
        settle().await;
    }

    fx.session.chans.away.cancel();
    fx.handle.await.unwrap();

    let client_bytes = fx.client.payload();
    assert_eq!(client_bytes, b"alpha beta gamma");
    // observers saw the same bytes in the same order, plus the end notice
    assert!(first.contents().starts_with(&client_bytes));
    assert!(second.contents().starts_with(&client_bytes));
}

#[tokio::test(start_paused = true)]
async fn test_recorder_receives_the_client_stream() {
    let (session, rx) = Session::new(web_meta("rec"));
    session.set_permissions(PermissionSet {
        connect: true,
        ..PermissionSet::default()
    });

    let dir = tempfile::TempDir::new().unwrap();
    let cast_path = dir.path().join("rec.cast");
    let recorder =
        jumpgate_recording::SessionRecorder::create(&cast_path, 80, 24, None).unwrap();

    let client = Arc::new(MockClient::default());
    let registry = Arc::new(Registry::new());
    registry.store(Arc::clone(&session));
    let deps = MuxDeps {
        client: client.clone() as Arc<dyn ClientTransport>,
        target: Arc::new(MockTarget::default()) as Arc<dyn TargetIo>,
        directory: Arc::new(MockDirectory::new(open_asset())),
        store: Arc::new(MemoryStore::new()),
        registry,
        localizer: Arc::new(PlainLocalizer),
        parser: Some(TermParser::new("rec", "ssh", vec![])),
        recorder: Some(recorder),
        shutdown: CancellationToken::new(),
    };
    let handle = tokio::spawn(run_session(Arc::clone(&session), rx, deps));

    for chunk in [&b"file1 file2\r\n"[..], b"$ "] {
        session
            .chans
            .out_tx
            .send(Bytes::copy_from_slice(chunk))
            .await
            .unwrap();
        settle().await;
    }
    session.chans.away.cancel();
    handle.await.unwrap();

    // replaying the cast file reproduces exactly what the client saw
    let content = std::fs::read_to_string(&cast_path).unwrap();
    let mut replayed = String::new();
    for line in content.lines().skip(1) {
        let frame: (f64, String, String) = serde_json::from_str(line).unwrap();
        replayed.push_str(&frame.2);
    }
    assert_eq!(replayed.as_bytes(), client.payload().as_slice());
    assert_eq!(replayed, "file1 file2\r\n$ ");
}

#[tokio::test(start_paused = true)]
async fn test_client_transport_failure_ends_session() {
    let fx = spawn_session(web_meta("dead"), vec![], open_asset());

    fx.client.fail.store(true, Ordering::SeqCst);
    fx.session
        .chans
        .out_tx
        .send(Bytes::from_static(b"data"))
        .await
        .unwrap();

    let _exit = fx.handle.await.unwrap();
    assert_eq!(fx.session.status(), SessionStatus::Offline);
    assert!(fx.registry.get_by_id("dead").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_permissions_do_not_change_after_online() {
    let fx = spawn_session(web_meta("frozen"), vec![], open_asset());
    let before = fx.session.permissions();
    assert!(!fx.session.set_permissions(PermissionSet::default()));
    assert_eq!(fx.session.permissions(), before);

    fx.session.chans.away.cancel();
    fx.handle.await.unwrap();
}
