// Connection endpoints
//
// connect: upgrade the client websocket, authorize, dial the target, and
// run the session multiplexer on this task until the session ends.
// monitor: attach an admin observer to a live session.
// close: terminate a session on an admin's behalf.
//
// Requests arrive already authenticated; the fronting auth layer passes
// the user identity in x-auth-uid / x-auth-user headers.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use log::{debug, info, warn};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use jumpgate_recording::SessionRecorder;
use jumpgate_session::{
    offline_session, run_session, ApiError, AuthAction, ChannelReceivers, ClientTransport,
    ErrorCode, Localizer, MuxDeps, PermissionSet, Session, SessionKind, SessionMeta, WindowSize,
};
use jumpgate_terminal::TermParser;

use crate::i18n::{CatalogLocalizer, Lang};
use crate::state::{AppState, CurrentUser};
use crate::ws::{spawn_client_reader, spawn_observer_reader, WsTransport};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/connect/:asset_id/:account_id/:protocol",
            get(connect_session),
        )
        .route("/api/monitor/:session_id", get(monitor_session))
        .route("/api/close/:session_id", post(close_session))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    pub w: Option<u32>,
    pub h: Option<u32>,
    pub session_id: Option<String>,
    pub share_id: Option<i64>,
    pub share_end: Option<String>,
    pub lang: Option<String>,
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or("").trim().to_string())
        .unwrap_or_default()
}

fn current_user(headers: &HeaderMap) -> CurrentUser {
    let uid = headers
        .get("x-auth-uid")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let username = headers
        .get("x-auth-user")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    CurrentUser { uid, username }
}

fn negotiate_lang(lang: Option<&str>, headers: &HeaderMap) -> Lang {
    let accept = headers
        .get("accept-language")
        .and_then(|v| v.to_str().ok());
    Lang::negotiate(lang, accept)
}

async fn connect_session(
    State(state): State<AppState>,
    Path((asset_id, account_id, protocol)): Path<(i64, i64, String)>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let user = current_user(&headers);
    let lang = negotiate_lang(query.lang.as_deref(), &headers);
    let peer_ip = client_ip(&headers);

    // echo the client's requested subprotocol
    let ws = match headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
    {
        Some(proto) => ws.protocols([proto.to_string()]),
        None => ws,
    };

    ws.on_upgrade(move |socket| async move {
        let (sender, receiver) = socket.split();
        let transport = WsTransport::new(sender);
        let localizer: Arc<dyn Localizer> = Arc::new(CatalogLocalizer::new(lang));

        match do_connect(
            &state,
            &user,
            peer_ip,
            asset_id,
            account_id,
            &protocol,
            &query,
            Arc::clone(&transport),
            Arc::clone(&localizer),
        )
        .await
        {
            Ok((session, rx, deps)) => {
                spawn_client_reader(&session, receiver);
                let session_id = session.id.clone();
                let exit = run_session(session, rx, deps).await;
                info!(
                    "session {} finished (error: {:?})",
                    session_id,
                    exit.map(|e| e.code)
                );
            }
            Err(err) => {
                warn!("connect refused: {}", err);
                let msg = localizer.error_message(&err);
                let line = format!("\r\n \x1b[31m {} \x1b[0m", msg);
                let _ = ClientTransport::send(&*transport, line.as_bytes()).await;
                ClientTransport::close(&*transport).await;
            }
        }
    })
}

/// Session setup: resolve the asset/account/gateway triple, authorize,
/// build the session with its parser and recorder, dial the target, and
/// register. Any error here aborts before registration.
#[allow(clippy::too_many_arguments)]
async fn do_connect(
    state: &AppState,
    user: &CurrentUser,
    client_ip: String,
    asset_id: i64,
    account_id: i64,
    protocol: &str,
    query: &ConnectQuery,
    transport: Arc<WsTransport>,
    localizer: Arc<dyn Localizer>,
) -> Result<(Arc<Session>, ChannelReceivers, MuxDeps), ApiError> {
    let asset = state.directory.asset(asset_id).await?;
    let mut account = state.directory.account(account_id).await?;
    let mut gateway = if asset.gateway_id != 0 {
        Some(state.directory.gateway(asset.gateway_id).await?)
    } else {
        None
    };

    account.password = state.vault.decrypt(&account.password);
    account.private_key = state.vault.decrypt(&account.private_key);
    account.passphrase = state.vault.decrypt(&account.passphrase);
    if let Some(gw) = gateway.as_mut() {
        gw.password = state.vault.decrypt(&gw.password);
        gw.private_key = state.vault.decrypt(&gw.private_key);
        gw.passphrase = state.vault.decrypt(&gw.passphrase);
    }

    let session_id = query
        .session_id
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let share_end = query
        .share_end
        .as_deref()
        .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc));

    let meta = SessionMeta {
        session_id,
        kind: SessionKind::Web,
        protocol: protocol.to_string(),
        uid: user.uid,
        username: user.username.clone(),
        client_ip,
        asset_id,
        asset_info: format!("{}({})", asset.name, asset.ip),
        account_id,
        account_info: format!("{}({})", account.name, account.account),
        gateway_id: asset.gateway_id,
        gateway_info: gateway
            .as_ref()
            .map(|g| format!("{}({})", g.name, g.host))
            .unwrap_or_default(),
        share_id: query.share_id.unwrap_or(0),
        share_end,
        idle_timeout: state.config.idle_timeout(),
    };
    let (session, rx) = Session::new(meta);

    // connect is mandatory everywhere; file and clipboard actions are
    // consulted per protocol but only connect denial aborts
    let mut actions = vec![AuthAction::Connect];
    match protocol {
        "ssh" => actions.extend([AuthAction::FileUpload, AuthAction::FileDownload]),
        "rdp" | "vnc" => actions.extend([AuthAction::Copy, AuthAction::Paste, AuthAction::Share]),
        _ => {}
    }
    let result = state.gate.evaluate(&session, &actions).await?;
    if !result.is_allowed(AuthAction::Connect) {
        return Err(ApiError::with(ErrorCode::Unauthorized, "perm", "connect"));
    }
    session.set_permissions(PermissionSet {
        connect: true,
        file_upload: result.is_allowed(AuthAction::FileUpload),
        file_download: result.is_allowed(AuthAction::FileDownload),
        copy: result.is_allowed(AuthAction::Copy),
        paste: result.is_allowed(AuthAction::Paste),
        share: result.is_allowed(AuthAction::Share),
    });

    let size = if session.is_guacd() {
        WindowSize {
            width: query.w.unwrap_or(1024),
            height: query.h.unwrap_or(768),
        }
    } else {
        WindowSize {
            width: query.w.unwrap_or(80),
            height: query.h.unwrap_or(24),
        }
    };

    let (parser, recorder) = if session.is_guacd() {
        (None, None)
    } else {
        let rules = state.directory.command_rules(&asset.cmd_ids).await?;
        let parser = TermParser::new(&session.id, protocol, rules);

        std::fs::create_dir_all(&state.config.recording_dir).map_err(ApiError::internal)?;
        let path = PathBuf::from(&state.config.recording_dir).join(format!("{}.cast", session.id));
        let recorder = SessionRecorder::create(
            &path,
            size.width.min(u32::from(u16::MAX)) as u16,
            size.height.min(u32::from(u16::MAX)) as u16,
            None,
        )
        .map_err(ApiError::internal)?;
        (Some(parser), Some(recorder))
    };

    let target = jumpgate_connect::connect(
        &session,
        &asset,
        &account,
        gateway.as_ref(),
        size,
        &state.connector,
    )
    .await?;

    state.registry.store(Arc::clone(&session));
    state.store.upsert(&session.record()).await?;
    debug!("session {} registered", session.id);

    let deps = MuxDeps {
        client: transport,
        target,
        directory: Arc::clone(&state.directory),
        store: Arc::clone(&state.store),
        registry: Arc::clone(&state.registry),
        localizer,
        parser,
        recorder,
        shutdown: state.shutdown.clone(),
    };
    Ok((session, rx, deps))
}

#[derive(Debug, Default, Deserialize)]
pub struct MonitorQuery {
    pub lang: Option<String>,
}

async fn monitor_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<MonitorQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let user = current_user(&headers);
    let lang = negotiate_lang(query.lang.as_deref(), &headers);

    if !state.gate.is_admin(user.uid) {
        let err = ApiError::with(ErrorCode::NoPermission, "perm", "monitor session");
        return (
            axum::http::StatusCode::FORBIDDEN,
            Json(serde_json::json!({"code": err.code.value(), "message": err.to_string()})),
        )
            .into_response();
    }

    ws.on_upgrade(move |socket| async move {
        let (sender, receiver) = socket.split();
        let sink = WsTransport::new(sender);
        let localizer = CatalogLocalizer::new(lang);

        let Some(session) = state.registry.get_by_id(&session_id) else {
            let err = ApiError::with(ErrorCode::InvalidSessionId, "sessionId", session_id);
            let msg = localizer.error_message(&err);
            jumpgate_session::ObserverSink::close(&*sink, Some(&msg)).await;
            return;
        };

        let key = jumpgate_session::observer_key(user.uid, &session.id);
        session.attach_observer(key.clone(), sink);
        info!("observer {} attached to {}", key, session.id);

        let _ = spawn_observer_reader(&session, key, receiver).await;
    })
}

async fn close_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<MonitorQuery>,
    headers: HeaderMap,
) -> Response {
    let user = current_user(&headers);
    let lang = negotiate_lang(query.lang.as_deref(), &headers);

    if !state.gate.is_admin(user.uid) {
        let err = ApiError::with(ErrorCode::NoPermission, "perm", "close session");
        return (
            axum::http::StatusCode::FORBIDDEN,
            Json(serde_json::json!({"code": err.code.value(), "message": err.to_string()})),
        )
            .into_response();
    }

    let Some(session) = state.registry.get_by_id(&session_id) else {
        // already gone; closing twice is not an error
        return Json(serde_json::json!({"code": 0, "message": "ok"})).into_response();
    };

    info!("closing session {} (admin {})", session.id, user.username);
    let localizer = CatalogLocalizer::new(lang);
    offline_session(&state.registry, &session.id, &user.username, &localizer).await;

    Json(serde_json::json!({"code": 0, "message": "ok"})).into_response()
}
