// Database connectors
//
// Redis, MySQL, MongoDB, and PostgreSQL sessions run the vendor client in
// interactive mode: the bridge does line editing and echo the way a local
// CLI would, executes each completed statement through the client, and
// renders the reply as terminal text. SQL targets accumulate input until
// the `;` terminator; redis and mongodb execute per line.

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::mpsc;

use jumpgate_session::{
    ApiError, Account, Asset, Gateway, Session, TargetIo, WindowSize,
};

use crate::gateway::{local_forward, GatewayTunnel};
use crate::target::{PipedTarget, TargetCmd};

const ERASE_LINE: &[u8] = b"\r\x1b[K";

/// One vendor client in interactive mode.
#[async_trait]
trait QueryExecutor: Send {
    fn prompt(&self) -> &str;
    fn banner(&self) -> String;
    /// Statements end on line (redis, mongodb) or on `;` (SQL).
    fn statement_terminator(&self) -> Option<char>;
    /// Execute and render; errors are rendered too, never fatal.
    async fn execute(&mut self, statement: &str) -> String;
}

struct DbTarget {
    piped: PipedTarget,
    tunnel: Option<Arc<GatewayTunnel>>,
}

#[async_trait]
impl TargetIo for DbTarget {
    async fn write_stdin(&self, data: &[u8]) -> Result<(), ApiError> {
        self.piped.write_stdin(data).await
    }

    async fn resize(&self, _size: WindowSize) -> Result<(), ApiError> {
        Ok(())
    }

    async fn shutdown(&self) {
        self.piped.shutdown().await;
        if let Some(tunnel) = &self.tunnel {
            tunnel.close().await;
        }
    }
}

pub async fn connect_db(
    session: &Arc<Session>,
    asset: &Asset,
    account: &Account,
    gateway: Option<&Gateway>,
) -> Result<Arc<dyn TargetIo>, ApiError> {
    let protocol = session.protocol.clone();
    let port = asset.port_for(&protocol);

    // tunneled targets are reached through a loopback forwarder
    let (host, port, tunnel) = match gateway {
        Some(gw) => {
            let tunnel = Arc::new(GatewayTunnel::open(gw).await?);
            let addr = local_forward(
                Arc::clone(&tunnel),
                asset.ip.clone(),
                port,
                session.chans.away.clone(),
            )
            .await?;
            (addr.ip().to_string(), addr.port(), Some(tunnel))
        }
        None => (asset.ip.clone(), port, None),
    };
    info!(
        "session {}: {} {}@{}:{}",
        session.id, protocol, account.account, host, port
    );

    let executor: Box<dyn QueryExecutor> = match protocol.as_str() {
        "redis" => Box::new(RedisExecutor::connect(&host, port, account).await?),
        "mysql" => Box::new(MySqlExecutor::connect(&host, port, account).await?),
        "postgresql" => Box::new(PgExecutor::connect(&host, port, account).await?),
        "mongodb" => Box::new(MongoExecutor::connect(&host, port, account).await?),
        other => {
            return Err(ApiError::connect_server(format!(
                "unsupported database protocol {}",
                other
            )))
        }
    };

    let (piped, cmd_rx) = PipedTarget::new();
    spawn_repl(session, executor, cmd_rx);
    Ok(Arc::new(DbTarget { piped, tunnel }))
}

/// The interactive loop: echo keystrokes, edit the line, execute on
/// commit, print reply and prompt.
fn spawn_repl(
    session: &Arc<Session>,
    mut executor: Box<dyn QueryExecutor>,
    mut cmd_rx: mpsc::Receiver<TargetCmd>,
) {
    let out_tx = session.chans.out_tx.clone();
    let away = session.chans.away.clone();
    let session_id = session.id.clone();

    tokio::spawn(async move {
        let mut line = String::new();
        let mut pending = String::new();

        let greeting = format!("{}\r\n{}", executor.banner(), executor.prompt());
        if out_tx.send(Bytes::from(greeting)).await.is_err() {
            return;
        }

        'outer: loop {
            let cmd = tokio::select! {
                _ = away.cancelled() => break,
                cmd = cmd_rx.recv() => cmd,
            };
            let data = match cmd {
                Some(TargetCmd::Data(data)) => data,
                Some(TargetCmd::Resize(_)) => continue,
                Some(TargetCmd::Shutdown) | None => break,
            };

            let mut echo: Vec<u8> = Vec::new();
            let mut commits: Vec<String> = Vec::new();
            for &b in data.iter() {
                match b {
                    b'\r' | b'\n' => {
                        if b == b'\r' {
                            echo.extend_from_slice(b"\r\n");
                        }
                        commits.push(std::mem::take(&mut line));
                    }
                    0x7f | 0x08 => {
                        if line.pop().is_some() {
                            echo.extend_from_slice(b"\x08 \x08");
                        }
                    }
                    0x15 => {
                        line.clear();
                        pending.clear();
                        echo.extend_from_slice(ERASE_LINE);
                        echo.extend_from_slice(executor.prompt().as_bytes());
                    }
                    0x03 => {
                        line.clear();
                        pending.clear();
                        echo.extend_from_slice(b"^C\r\n");
                        echo.extend_from_slice(executor.prompt().as_bytes());
                    }
                    _ if b >= 0x20 => {
                        line.push(b as char);
                        echo.push(b);
                    }
                    _ => {}
                }
            }
            if !echo.is_empty() && out_tx.send(Bytes::from(echo)).await.is_err() {
                break;
            }

            for committed in commits {
                let reply = match executor.statement_terminator() {
                    Some(term) => {
                        if !pending.is_empty() {
                            pending.push(' ');
                        }
                        pending.push_str(committed.trim());
                        if pending.trim().is_empty() {
                            pending.clear();
                            executor.prompt().to_string()
                        } else if pending.contains(term) {
                            let statement = std::mem::take(&mut pending);
                            let rendered = executor.execute(&statement).await;
                            format!("{}\r\n{}", rendered, executor.prompt())
                        } else {
                            // continuation
                            "    -> ".to_string()
                        }
                    }
                    None => {
                        let statement = committed.trim().to_string();
                        if statement.is_empty() {
                            executor.prompt().to_string()
                        } else {
                            let rendered = executor.execute(&statement).await;
                            format!("{}\r\n{}", rendered, executor.prompt())
                        }
                    }
                };
                if out_tx.send(Bytes::from(reply)).await.is_err() {
                    break 'outer;
                }
            }
        }
        debug!("session {}: db repl exit", session_id);
    });
}

// ---------------------------------------------------------------------------
// redis
// ---------------------------------------------------------------------------

struct RedisExecutor {
    con: redis::aio::MultiplexedConnection,
    label: String,
}

impl RedisExecutor {
    async fn connect(host: &str, port: u16, account: &Account) -> Result<Self, ApiError> {
        // credentials ride in the URL, so the password must be encoded
        let connection_url = if account.password.is_empty() {
            format!("redis://{}:{}/0", host, port)
        } else {
            format!(
                "redis://{}:{}@{}:{}/0",
                account.account,
                urlencoding::encode(&account.password),
                host,
                port
            )
        };
        let client = redis::Client::open(connection_url).map_err(ApiError::connect_server)?;
        let con = client
            .get_multiplexed_async_connection()
            .await
            .map_err(ApiError::connect_server)?;
        Ok(Self {
            con,
            label: format!("{}:{}", host, port),
        })
    }
}

#[async_trait]
impl QueryExecutor for RedisExecutor {
    fn prompt(&self) -> &str {
        "redis> "
    }

    fn banner(&self) -> String {
        format!("connected to redis at {}", self.label)
    }

    fn statement_terminator(&self) -> Option<char> {
        None
    }

    async fn execute(&mut self, statement: &str) -> String {
        let tokens = tokenize(statement);
        let Some((name, args)) = tokens.split_first() else {
            return String::new();
        };
        let mut cmd = redis::cmd(name);
        for arg in args {
            cmd.arg(arg);
        }
        match cmd.query_async::<redis::Value>(&mut self.con).await {
            Ok(value) => render_redis_value(&value),
            Err(e) => format!("(error) {}", e),
        }
    }
}

/// Split a redis command line, keeping quoted strings whole.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in line.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '"' | '\'' => quote = Some(c),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn render_redis_value(value: &redis::Value) -> String {
    match value {
        redis::Value::Nil => "(nil)".to_string(),
        redis::Value::Okay => "OK".to_string(),
        redis::Value::Int(i) => format!("(integer) {}", i),
        redis::Value::SimpleString(s) => s.clone(),
        redis::Value::BulkString(data) => match std::str::from_utf8(data) {
            Ok(s) => format!("\"{}\"", s),
            Err(_) => format!("(binary) {} bytes", data.len()),
        },
        redis::Value::Array(items) => {
            if items.is_empty() {
                "(empty array)".to_string()
            } else {
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| format!("{}) {}", i + 1, render_redis_value(v)))
                    .collect::<Vec<_>>()
                    .join("\r\n")
            }
        }
        redis::Value::Map(entries) => entries
            .iter()
            .enumerate()
            .map(|(i, (key, val))| {
                format!(
                    "{}) {} -> {}",
                    i + 1,
                    render_redis_value(key),
                    render_redis_value(val)
                )
            })
            .collect::<Vec<_>>()
            .join("\r\n"),
        redis::Value::Set(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| format!("{}) {}", i + 1, render_redis_value(v)))
            .collect::<Vec<_>>()
            .join("\r\n"),
        redis::Value::Attribute { data, .. } => render_redis_value(data),
        redis::Value::Double(d) => format!("(double) {}", d),
        redis::Value::Boolean(b) => format!("(boolean) {}", b),
        redis::Value::VerbatimString { text, .. } => format!("\"{}\"", text),
        redis::Value::BigNumber(n) => format!("(bignumber) {}", n),
        redis::Value::Push { kind, data } => format!(
            "(push:{}) {}",
            kind,
            data.iter()
                .map(render_redis_value)
                .collect::<Vec<_>>()
                .join(", ")
        ),
        redis::Value::ServerError(err) => {
            format!("(error) {}", err.details().unwrap_or("unknown"))
        }
    }
}

// ---------------------------------------------------------------------------
// mysql
// ---------------------------------------------------------------------------

struct MySqlExecutor {
    conn: mysql_async::Conn,
}

impl MySqlExecutor {
    async fn connect(host: &str, port: u16, account: &Account) -> Result<Self, ApiError> {
        let opts = mysql_async::OptsBuilder::default()
            .ip_or_hostname(host.to_string())
            .tcp_port(port)
            .user(Some(account.account.clone()))
            .pass(Some(account.password.clone()));
        let conn = mysql_async::Conn::new(opts)
            .await
            .map_err(ApiError::connect_server)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl QueryExecutor for MySqlExecutor {
    fn prompt(&self) -> &str {
        "mysql> "
    }

    fn banner(&self) -> String {
        "Welcome to the MySQL monitor. Statements end with ;".to_string()
    }

    fn statement_terminator(&self) -> Option<char> {
        Some(';')
    }

    async fn execute(&mut self, statement: &str) -> String {
        use mysql_async::prelude::Queryable;

        let rows: Result<Vec<mysql_async::Row>, _> = self.conn.query(statement).await;
        match rows {
            Ok(rows) if rows.is_empty() => "Query OK".to_string(),
            Ok(rows) => {
                let columns: Vec<String> = rows[0]
                    .columns_ref()
                    .iter()
                    .map(|c| c.name_str().into_owned())
                    .collect();
                let mut lines = vec![columns.join(" | ")];
                for row in &rows {
                    let cells: Vec<String> = (0..columns.len())
                        .map(|i| row.as_ref(i).map(mysql_value_to_string).unwrap_or_default())
                        .collect();
                    lines.push(cells.join(" | "));
                }
                lines.push(format!("{} rows in set", rows.len()));
                lines.join("\r\n")
            }
            Err(e) => format!("ERROR: {}", e),
        }
    }
}

fn mysql_value_to_string(value: &mysql_async::Value) -> String {
    match value {
        mysql_async::Value::NULL => "NULL".to_string(),
        mysql_async::Value::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        mysql_async::Value::Int(i) => i.to_string(),
        mysql_async::Value::UInt(u) => u.to_string(),
        mysql_async::Value::Float(f) => f.to_string(),
        mysql_async::Value::Double(d) => d.to_string(),
        mysql_async::Value::Date(y, m, d, hh, mm, ss, _) => {
            format!("{:04}-{:02}-{:02} {:02}:{:02}:{:02}", y, m, d, hh, mm, ss)
        }
        mysql_async::Value::Time(neg, d, h, m, s, _) => {
            let sign = if *neg { "-" } else { "" };
            format!("{}{:02}:{:02}:{:02}", sign, u32::from(*d) * 24 + u32::from(*h), m, s)
        }
    }
}

// ---------------------------------------------------------------------------
// postgresql
// ---------------------------------------------------------------------------

struct PgExecutor {
    pool: sqlx::PgPool,
}

impl PgExecutor {
    async fn connect(host: &str, port: u16, account: &Account) -> Result<Self, ApiError> {
        let opts = sqlx::postgres::PgConnectOptions::new()
            .host(host)
            .port(port)
            .username(&account.account)
            .password(&account.password);
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(ApiError::connect_server)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl QueryExecutor for PgExecutor {
    fn prompt(&self) -> &str {
        "postgres=# "
    }

    fn banner(&self) -> String {
        "psql-compatible session. Statements end with ;".to_string()
    }

    fn statement_terminator(&self) -> Option<char> {
        Some(';')
    }

    async fn execute(&mut self, statement: &str) -> String {
        use sqlx::{Column, Row};

        match sqlx::query(statement).fetch_all(&self.pool).await {
            Ok(rows) if rows.is_empty() => "OK".to_string(),
            Ok(rows) => {
                let columns: Vec<String> = rows[0]
                    .columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect();
                let mut lines = vec![columns.join(" | ")];
                for row in &rows {
                    let cells: Vec<String> =
                        (0..columns.len()).map(|i| pg_value_to_string(row, i)).collect();
                    lines.push(cells.join(" | "));
                }
                lines.push(format!("({} rows)", rows.len()));
                lines.join("\r\n")
            }
            Err(e) => format!("ERROR: {}", e),
        }
    }
}

fn pg_value_to_string(row: &sqlx::postgres::PgRow, i: usize) -> String {
    use sqlx::Row;

    if let Ok(v) = row.try_get::<Option<String>, _>(i) {
        return v.unwrap_or_else(|| "NULL".to_string());
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
        return v.map(|x| x.to_string()).unwrap_or_else(|| "NULL".to_string());
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(i) {
        return v.map(|x| x.to_string()).unwrap_or_else(|| "NULL".to_string());
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
        return v.map(|x| x.to_string()).unwrap_or_else(|| "NULL".to_string());
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(i) {
        return v.map(|x| x.to_string()).unwrap_or_else(|| "NULL".to_string());
    }
    "?".to_string()
}

// ---------------------------------------------------------------------------
// mongodb
// ---------------------------------------------------------------------------

struct MongoExecutor {
    db: mongodb::Database,
}

impl MongoExecutor {
    async fn connect(host: &str, port: u16, account: &Account) -> Result<Self, ApiError> {
        let address = mongodb::options::ServerAddress::Tcp {
            host: host.to_string(),
            port: Some(port),
        };
        let credential = if !account.account.is_empty() {
            Some(
                mongodb::options::Credential::builder()
                    .username(account.account.clone())
                    .password(account.password.clone())
                    .build(),
            )
        } else {
            None
        };
        let builder = mongodb::options::ClientOptions::builder()
            .hosts(vec![address])
            .credential(credential);
        let client = mongodb::Client::with_options(builder.build())
            .map_err(ApiError::connect_server)?;
        let db = client.database("admin");
        // fail fast instead of at the first user command
        db.run_command(mongodb::bson::doc! {"ping": 1}, None)
            .await
            .map_err(ApiError::connect_server)?;
        Ok(Self { db })
    }
}

#[async_trait]
impl QueryExecutor for MongoExecutor {
    fn prompt(&self) -> &str {
        "mongo> "
    }

    fn banner(&self) -> String {
        "mongodb session. Enter commands as JSON documents, e.g. {\"find\": \"users\"}".to_string()
    }

    fn statement_terminator(&self) -> Option<char> {
        None
    }

    async fn execute(&mut self, statement: &str) -> String {
        let json: serde_json::Value = match serde_json::from_str(statement) {
            Ok(v) => v,
            Err(e) => return format!("parse error: {}", e),
        };
        let doc = match mongodb::bson::to_document(&json) {
            Ok(d) => d,
            Err(e) => return format!("invalid command document: {}", e),
        };
        match self.db.run_command(doc, None).await {
            Ok(reply) => serde_json::to_string_pretty(&reply)
                .unwrap_or_else(|e| format!("render error: {}", e))
                .replace('\n', "\r\n"),
            Err(e) => format!("error: {}", e),
        }
    }
}
