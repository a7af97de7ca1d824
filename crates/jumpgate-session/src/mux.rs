// The session multiplexer
//
// One task per session. Every signal source funnels into a single select
// loop: client input, target output, the flush/keepalive/access-window
// ticks, the idle deadline, admin close, fatal errors, window resizes,
// and the two cancellation sources. The multiplexer is the only writer
// to the client transport and the recorder, which is what makes the
// fan-out ordering guarantee hold.
//
// Lifecycle: the connector dials (Dialing); once it reports success the
// session is registered and this loop runs (Online); any branch breaking
// the loop enters teardown (Closing); after the teardown chain the
// session is Offline and gone from the registry.

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::channels::{ChannelReceivers, WindowSize};
use crate::error::{ApiError, ErrorCode};
use crate::gate::{check_access_window, Directory, SessionStore};
use crate::model::SessionKind;
use crate::registry::Registry;
use crate::session::Session;
use jumpgate_recording::SessionRecorder;
use jumpgate_terminal::{TermParser, LINE_CANCEL};

const FLUSH_INTERVAL: Duration = Duration::from_millis(100);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const ACCESS_INTERVAL: Duration = Duration::from_secs(60);
const CLOSE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// The client-facing transport. A zero-length send is a keepalive.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    async fn send(&self, data: &[u8]) -> Result<(), ApiError>;
    async fn close(&self);
}

/// The target-facing endpoint a connector attaches to the session.
#[async_trait]
pub trait TargetIo: Send + Sync {
    async fn write_stdin(&self, data: &[u8]) -> Result<(), ApiError>;
    async fn resize(&self, size: WindowSize) -> Result<(), ApiError>;
    /// Tear down the target: SFTP client first when present, then the
    /// transport and any gateway tunnel.
    async fn shutdown(&self);
}

/// Renders client-visible messages in the session's language.
pub trait Localizer: Send + Sync {
    fn error_message(&self, err: &ApiError) -> String;
    fn session_end_message(&self, session_id: &str) -> String;
}

/// English-only fallback used by tests and native clients.
pub struct PlainLocalizer;

impl Localizer for PlainLocalizer {
    fn error_message(&self, err: &ApiError) -> String {
        err.fallback_message()
    }

    fn session_end_message(&self, session_id: &str) -> String {
        format!("session {} ended", session_id)
    }
}

/// Everything the multiplexer needs beyond the session itself.
pub struct MuxDeps {
    pub client: Arc<dyn ClientTransport>,
    pub target: Arc<dyn TargetIo>,
    pub directory: Arc<dyn Directory>,
    pub store: Arc<dyn SessionStore>,
    pub registry: Arc<Registry>,
    pub localizer: Arc<dyn Localizer>,
    pub parser: Option<TermParser>,
    pub recorder: Option<SessionRecorder>,
    /// Process-wide graceful shutdown.
    pub shutdown: CancellationToken,
}

/// Run a session to completion. Returns the terminal error, if the
/// session ended on one.
pub async fn run_session(
    session: Arc<Session>,
    mut rx: ChannelReceivers,
    mut deps: MuxDeps,
) -> Option<ApiError> {
    let away = session.chans.away.clone();
    let shutdown = deps.shutdown.clone();
    let is_web = session.kind == SessionKind::Web;
    let is_guacd = session.is_guacd();

    let start = Instant::now();
    let mut flush_tick = interval_at(start + FLUSH_INTERVAL, FLUSH_INTERVAL);
    let mut keepalive_tick = interval_at(start + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);
    let mut access_tick = interval_at(start + ACCESS_INTERVAL, ACCESS_INTERVAL);
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    keepalive_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    access_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut out_buf = BytesMut::new();

    let exit: Option<ApiError> = loop {
        let idle_at = session.idle_deadline();

        tokio::select! {
            _ = away.cancelled() => break None,

            _ = shutdown.cancelled() => {
                let _ = flush(&session, &deps.client, deps.recorder.as_mut(), &mut out_buf).await;
                break None;
            }

            _ = tokio::time::sleep_until(idle_at) => {
                // the deadline may have been pushed since this sleep was armed
                if Instant::now() >= session.idle_deadline() {
                    break Some(ApiError::with(
                        ErrorCode::IdleTimeout,
                        "second",
                        session.idle_timeout.as_secs(),
                    ));
                }
            }

            _ = access_tick.tick() => {
                match deps.directory.asset(session.asset_id).await {
                    Ok(asset) => {
                        let share_ok = session.share_id == 0
                            || session.share_end.map(|end| Utc::now() < end).unwrap_or(false);
                        if !(check_access_window(&asset.access_auth) && share_ok) {
                            break Some(ApiError::new(ErrorCode::AccessTime));
                        }
                    }
                    Err(e) => debug!("session {}: access reload failed: {}", session.id, e),
                }
            }

            closer = rx.close_rx.recv() => {
                let admin = closer.unwrap_or_default();
                info!("session {}: closed by {}", session.id, admin);
                break Some(ApiError::with(ErrorCode::AdminClose, "admin", admin));
            }

            err = rx.err_rx.recv() => {
                break Some(err.unwrap_or_else(|| ApiError::internal("error channel closed")));
            }

            input = rx.in_rx.recv() => {
                let Some(input) = input else { break None };
                let payload = match demux_input(&session, is_web, is_guacd, &input) {
                    Demuxed::Payload(p) => p,
                    Demuxed::Heartbeat => continue,
                    Demuxed::Handled => {
                        session.set_idle();
                        continue;
                    }
                };
                session.set_idle();

                if let Some(parser) = deps.parser.as_mut() {
                    let (cmd, forbidden) = parser.add_input(payload);
                    if forbidden {
                        let cmd = cmd.unwrap_or_default();
                        out_buf.extend_from_slice(
                            format!("\r\n \x1b[31m {} is forbidden \x1b[0m", cmd).as_bytes(),
                        );
                        let _ = flush(&session, &deps.client, deps.recorder.as_mut(), &mut out_buf)
                            .await;
                        parser.add_input(LINE_CANCEL);
                        if let Err(e) = deps.target.write_stdin(LINE_CANCEL).await {
                            break Some(e);
                        }
                        continue;
                    }
                }

                if let Err(e) = deps.target.write_stdin(payload).await {
                    break Some(e);
                }
            }

            out = rx.out_rx.recv() => {
                let Some(out) = out else { break None };
                out_buf.extend_from_slice(&out);
                if let Some(parser) = deps.parser.as_mut() {
                    parser.add_output(&out);
                }
            }

            size = rx.window_rx.recv() => {
                if let Some(size) = size {
                    if let Err(e) = deps.target.resize(size).await {
                        debug!("session {}: resize failed: {}", session.id, e);
                    }
                }
            }

            _ = flush_tick.tick() => {
                if let Err(e) =
                    flush(&session, &deps.client, deps.recorder.as_mut(), &mut out_buf).await
                {
                    break Some(e);
                }
            }

            _ = keepalive_tick.tick() => {
                if is_web && deps.client.send(&[]).await.is_err() {
                    // peer is gone; nothing left to tell it
                    break None;
                }
            }
        }
    };

    if let Some(err) = &exit {
        let msg = deps.localizer.error_message(err);
        warn!("session {}: terminating: {}", session.id, msg);
        out_buf.extend_from_slice(format!("\r\n \x1b[31m {} \x1b[0m", msg).as_bytes());
    }
    let _ = flush(&session, &deps.client, deps.recorder.as_mut(), &mut out_buf).await;

    teardown(&session, &mut deps).await;
    exit
}

enum Demuxed<'a> {
    Payload(&'a [u8]),
    Heartbeat,
    Handled,
}

fn demux_input<'a>(
    session: &Session,
    is_web: bool,
    is_guacd: bool,
    input: &'a [u8],
) -> Demuxed<'a> {
    if !is_web || input.is_empty() {
        return Demuxed::Payload(input);
    }
    if is_guacd {
        return if input[0] == b'9' {
            Demuxed::Heartbeat
        } else {
            Demuxed::Payload(input)
        };
    }
    match input[0] {
        b'1' => Demuxed::Payload(&input[1..]),
        b'9' => Demuxed::Heartbeat,
        b'w' => {
            if let Ok(text) = std::str::from_utf8(&input[1..]) {
                let mut parts = text.splitn(2, ',');
                let width = parts.next().and_then(|p| p.trim().parse().ok());
                let height = parts.next().and_then(|p| p.trim().parse().ok());
                if let (Some(width), Some(height)) = (width, height) {
                    // the mux drains this channel itself; never block on it
                    let _ = session.chans.window_tx.try_send(WindowSize { width, height });
                }
            }
            Demuxed::Handled
        }
        _ => Demuxed::Payload(input),
    }
}

/// Drain the output buffer to the client, the recorder, and every
/// observer, in that order, then reset it. Web guacd sessions get empty
/// flushes too so the client keeps progressing; raw terminals suppress
/// them.
async fn flush(
    session: &Session,
    client: &Arc<dyn ClientTransport>,
    recorder: Option<&mut SessionRecorder>,
    out_buf: &mut BytesMut,
) -> Result<(), ApiError> {
    let is_guacd = session.is_guacd();
    let data = out_buf.split().freeze();

    if data.is_empty() && !(session.kind == SessionKind::Web && is_guacd) {
        return Ok(());
    }
    client.send(&data).await?;

    if !data.is_empty() {
        if !is_guacd {
            if let Some(rec) = recorder {
                rec.write_output(&data);
            }
        }

        let sinks: Vec<(String, Arc<dyn crate::observer::ObserverSink>)> = session
            .observers
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        for (key, sink) in sinks {
            if !sink.write(&data).await {
                session.detach_observer(&key);
            }
        }
    }
    Ok(())
}

/// The teardown chain every exit path runs.
async fn teardown(session: &Arc<Session>, deps: &mut MuxDeps) {
    debug!("session {}: teardown", session.id);

    deps.target.shutdown().await;

    if let Some(rec) = deps.recorder.as_mut() {
        rec.close();
    }

    if let Some(parser) = deps.parser.as_mut() {
        let prompt = parser.current_output_line().to_string();
        parser.close(&prompt);
    }

    session.set_offline();
    deps.registry.delete(&session.id);
    if let Err(e) = deps.store.upsert(&session.record()).await {
        error!("session {}: final upsert failed: {}", session.id, e);
    }

    session.chans.away.cancel();

    let notice = deps.localizer.session_end_message(&session.id);
    let sinks: Vec<Arc<dyn crate::observer::ObserverSink>> = session
        .observers
        .iter()
        .map(|e| Arc::clone(e.value()))
        .collect();
    for sink in sinks {
        sink.close(Some(&notice)).await;
    }
    session.observers.clear();

    deps.client.close().await;
}

/// Terminate a session on an admin's behalf.
///
/// The close channel send carries a 1 second timeout; if the multiplexer
/// is wedged we cancel the away token so the transport cannot be
/// stranded, notify observers ourselves, and force the registry delete.
pub async fn offline_session(
    registry: &Registry,
    session_id: &str,
    closer: &str,
    localizer: &dyn Localizer,
) {
    let Some(session) = registry.get_by_id(session_id) else {
        return;
    };
    debug!("offline {} by {}", session_id, closer);

    if !closer.is_empty() {
        let send = session.chans.close_tx.send(closer.to_string());
        if let Ok(Ok(())) = tokio::time::timeout(CLOSE_SEND_TIMEOUT, send).await {
            // the multiplexer owns the rest of the teardown
            return;
        }
        warn!(
            "session {}: close send timed out, forcing teardown",
            session_id
        );
        session.chans.away.cancel();
    }

    let notice = localizer.session_end_message(session_id);
    let sinks: Vec<Arc<dyn crate::observer::ObserverSink>> = session
        .observers
        .iter()
        .map(|e| Arc::clone(e.value()))
        .collect();
    for sink in sinks {
        sink.close(Some(&notice)).await;
    }
    session.observers.clear();
    registry.delete(session_id);
}
