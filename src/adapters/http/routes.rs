//! Viewer REST surface.
//!
//! Read-only endpoints over the store plus session management, push
//! subscription management, and the internal webhook that carries
//! notifications in embedded-store deployments.

use crate::adapters::http::auth::{clear_cookie, require_auth, session_cookie};
use crate::adapters::http::state::ViewerState;
use crate::adapters::http::ws;
use crate::adapters::persistence::keys;
use crate::domain::{DomainError, MessageQuery, NotificationEvent, PushSubscriptionRecord, Statistics};
use crate::shared::time::parse_ts;
use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use chrono::{NaiveDate, NaiveDateTime, TimeZone};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, warn};

const EXPORT_PAGE_SIZE: u32 = 1000;
const DEFAULT_PAGE_LIMIT: u32 = 50;

/// Error envelope for every handler.
pub struct ApiError(StatusCode, String);

impl ApiError {
    fn not_found(detail: &str) -> Self {
        Self(StatusCode::NOT_FOUND, detail.to_string())
    }

    fn forbidden() -> Self {
        Self(StatusCode::FORBIDDEN, "Access denied".into())
    }

    fn bad_request(detail: &str) -> Self {
        Self(StatusCode::BAD_REQUEST, detail.to_string())
    }
}

impl From<StatusCode> for ApiError {
    fn from(status: StatusCode) -> Self {
        Self(status, status.canonical_reason().unwrap_or("error").to_string())
    }
}

impl From<DomainError> for ApiError {
    fn from(e: DomainError) -> Self {
        let status = match &e {
            DomainError::StoreBusy(_) => StatusCode::SERVICE_UNAVAILABLE,
            DomainError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %e, "request failed");
        }
        Self(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "detail": self.1 }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn build_router(state: Arc<ViewerState>) -> Router {
    let media_root = state.cfg.media_path();
    Router::new()
        .route("/api/auth/check", get(auth_check))
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/chats", get(list_chats))
        .route("/api/chats/{chat_id}/messages", get(chat_messages))
        .route("/api/chats/{chat_id}/messages/by-date", get(message_by_date))
        .route("/api/chats/{chat_id}/stats", get(chat_stats))
        .route("/api/chats/{chat_id}/export", get(export_chat))
        .route("/api/stats", get(stats))
        .route("/api/stats/refresh", post(stats_refresh))
        .route("/api/push/config", get(push_config))
        .route("/api/push/subscribe", post(push_subscribe))
        .route("/api/push/unsubscribe", post(push_unsubscribe))
        .route("/ws/updates", get(ws::ws_updates))
        .route("/internal/push", post(internal_push))
        .route("/healthz", get(healthz))
        .nest_service("/media", ServeDir::new(media_root))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn auth_check(
    State(state): State<Arc<ViewerState>>,
    headers: HeaderMap,
) -> Json<serde_json::Value> {
    match &state.auth {
        None => Json(json!({ "auth_required": false, "authenticated": true })),
        Some(auth) => {
            let authenticated = require_auth(Some(auth), &headers).is_ok();
            Json(json!({ "auth_required": true, "authenticated": authenticated }))
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

async fn login(
    State(state): State<Arc<ViewerState>>,
    Json(payload): Json<LoginRequest>,
) -> ApiResult<Response> {
    let Some(auth) = &state.auth else {
        return Ok(Json(json!({ "success": true, "auth_required": false })).into_response());
    };
    if payload.username.trim() != auth.username || payload.password.trim() != auth.password {
        warn!(username = %payload.username, "login failed");
        return Err(ApiError(StatusCode::UNAUTHORIZED, "Invalid credentials".into()));
    }
    let mut response = Json(json!({ "success": true, "auth_required": true })).into_response();
    response.headers_mut().insert(
        header::SET_COOKIE,
        session_cookie(&auth.token)
            .parse()
            .expect("valid cookie header"),
    );
    Ok(response)
}

async fn logout(State(state): State<Arc<ViewerState>>) -> Response {
    let mut response = Json(json!({ "success": true })).into_response();
    if state.auth.is_some() {
        response.headers_mut().insert(
            header::SET_COOKIE,
            clear_cookie().parse().expect("valid cookie header"),
        );
    }
    response
}

#[derive(Debug, Deserialize)]
struct ChatListQuery {
    limit: Option<u32>,
    #[serde(default)]
    offset: u32,
    search: Option<String>,
}

async fn list_chats(
    State(state): State<Arc<ViewerState>>,
    headers: HeaderMap,
    Query(query): Query<ChatListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    require_auth(state.auth.as_ref(), &headers)?;
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT * 4);
    let offset = query.offset;

    let (mut chats, total) = if state.display_restricted() {
        // Whitelisted mode: filter before paginating so pages stay dense.
        let page = state
            .store
            .get_all_chats(None, 0, query.search.as_deref())
            .await?;
        let visible: Vec<_> = page
            .chats
            .into_iter()
            .filter(|c| state.display_allowed(c.chat.id))
            .collect();
        let total = visible.len() as u64;
        let chats = visible
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        (chats, total)
    } else {
        let page = state
            .store
            .get_all_chats(Some(limit), offset, query.search.as_deref())
            .await?;
        (page.chats, page.total)
    };

    for chat in &mut chats {
        chat.avatar_url = state.avatar_url(chat.chat.id, chat.chat.kind).await;
    }

    let has_more = (offset as u64 + chats.len() as u64) < total;
    Ok(Json(json!({
        "chats": chats,
        "total": total,
        "limit": limit,
        "offset": offset,
        "has_more": has_more,
    })))
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    limit: Option<u32>,
    #[serde(default)]
    offset: u32,
    search: Option<String>,
    before_date: Option<String>,
    before_id: Option<i64>,
}

async fn chat_messages(
    State(state): State<Arc<ViewerState>>,
    headers: HeaderMap,
    Path(chat_id): Path<i64>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Json<Vec<crate::domain::MessageView>>> {
    require_auth(state.auth.as_ref(), &headers)?;
    if !state.display_allowed(chat_id) {
        return Err(ApiError::forbidden());
    }
    let before_date = match query.before_date.as_deref() {
        Some(raw) => Some(parse_timestamp(raw).ok_or_else(|| {
            ApiError::bad_request("invalid before_date; expected an ISO timestamp")
        })?),
        None => None,
    };
    let views = state
        .store
        .get_messages_paginated(&MessageQuery {
            chat_id,
            limit: query.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
            offset: query.offset,
            search: query.search,
            before_date,
            before_id: query.before_id,
        })
        .await?;
    Ok(Json(views))
}

#[derive(Debug, Deserialize)]
struct ByDateQuery {
    date: String,
    timezone: Option<String>,
}

async fn message_by_date(
    State(state): State<Arc<ViewerState>>,
    headers: HeaderMap,
    Path(chat_id): Path<i64>,
    Query(query): Query<ByDateQuery>,
) -> ApiResult<Json<crate::domain::MessageView>> {
    require_auth(state.auth.as_ref(), &headers)?;
    if !state.display_allowed(chat_id) {
        return Err(ApiError::forbidden());
    }
    let date = NaiveDate::parse_from_str(&query.date, "%Y-%m-%d")
        .map_err(|_| ApiError::bad_request("Invalid date format. Use YYYY-MM-DD"))?;
    let tz_name = query
        .timezone
        .unwrap_or_else(|| state.cfg.viewer_timezone.clone());
    let tz: chrono_tz::Tz = tz_name
        .parse()
        .map_err(|_| ApiError::bad_request("unknown timezone"))?;

    // Local midnight in the display timezone, normalised back to UTC-naive
    // for the store.
    let local_midnight = date.and_hms_opt(0, 0, 0).expect("midnight exists");
    let target = tz
        .from_local_datetime(&local_midnight)
        .earliest()
        .map(|dt| dt.naive_utc())
        .unwrap_or(local_midnight);

    state
        .store
        .find_message_by_date_with_joins(chat_id, target)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("No messages found for this date"))
}

async fn chat_stats(
    State(state): State<Arc<ViewerState>>,
    headers: HeaderMap,
    Path(chat_id): Path<i64>,
) -> ApiResult<Json<crate::domain::ChatStats>> {
    require_auth(state.auth.as_ref(), &headers)?;
    if !state.display_allowed(chat_id) {
        return Err(ApiError::forbidden());
    }
    Ok(Json(state.store.chat_statistics(chat_id).await?))
}

async fn export_chat(
    State(state): State<Arc<ViewerState>>,
    headers: HeaderMap,
    Path(chat_id): Path<i64>,
) -> ApiResult<Response> {
    require_auth(state.auth.as_ref(), &headers)?;
    if !state.display_allowed(chat_id) {
        return Err(ApiError::forbidden());
    }
    let chat = state
        .store
        .get_chat(chat_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Chat not found"))?;

    let safe_name: String = chat
        .display_name()
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    let filename = format!("{}_export.json", safe_name.trim());

    // Stream the export as one JSON array, paging the store with a keyset
    // cursor so memory stays flat regardless of chat size.
    enum Cursor {
        Start,
        After(Option<NaiveDateTime>, i64, bool),
        Done,
    }
    let store = Arc::clone(&state.store);
    let stream = futures_util::stream::unfold(Cursor::Start, move |cursor| {
        let store = Arc::clone(&store);
        async move {
            match cursor {
                Cursor::Start => Some((
                    Ok::<Vec<u8>, std::io::Error>(b"[\n".to_vec()),
                    Cursor::After(None, 0, true),
                )),
                Cursor::After(after_date, after_id, first) => {
                    let page = store
                        .get_export_page(chat_id, after_date, after_id, EXPORT_PAGE_SIZE)
                        .await;
                    match page {
                        Ok(rows) if rows.is_empty() => {
                            Some((Ok(b"\n]".to_vec()), Cursor::Done))
                        }
                        Ok(rows) => {
                            let mut chunk = Vec::new();
                            let mut first = first;
                            for row in &rows {
                                if !first {
                                    chunk.extend_from_slice(b",\n");
                                }
                                first = false;
                                chunk.extend_from_slice(
                                    serde_json::to_string(row).unwrap_or_default().as_bytes(),
                                );
                            }
                            let last = rows.last().expect("non-empty page");
                            let next_date = last
                                .date
                                .as_deref()
                                .and_then(parse_timestamp);
                            Some((Ok(chunk), Cursor::After(next_date, last.id, first)))
                        }
                        Err(e) => {
                            error!(chat_id, error = %e, "export stream failed");
                            Some((
                                Err(std::io::Error::other(e.to_string())),
                                Cursor::Done,
                            ))
                        }
                    }
                }
                Cursor::Done => None,
            }
        }
    });

    let mut response = Response::new(Body::from_stream(stream));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        "application/json".parse().expect("static header"),
    );
    if let Ok(value) = format!("attachment; filename={filename}").parse() {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

async fn stats(
    State(state): State<Arc<ViewerState>>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    require_auth(state.auth.as_ref(), &headers)?;
    let cached = state
        .store
        .get_metadata(keys::STATS_CACHE)
        .await?
        .and_then(|raw| serde_json::from_str::<Statistics>(&raw).ok());
    let stats = match cached {
        Some(stats) => stats,
        None => refresh_statistics(&state).await?,
    };
    Ok(Json(with_timezone(&state, stats)))
}

async fn stats_refresh(
    State(state): State<Arc<ViewerState>>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    require_auth(state.auth.as_ref(), &headers)?;
    let stats = refresh_statistics(&state).await?;
    Ok(Json(with_timezone(&state, stats)))
}

async fn refresh_statistics(state: &ViewerState) -> Result<Statistics, DomainError> {
    let stats = state.store.compute_statistics().await?;
    if let Ok(raw) = serde_json::to_string(&stats) {
        state.store.set_metadata(keys::STATS_CACHE, &raw).await?;
        state
            .store
            .set_metadata(
                keys::STATS_CALCULATED_AT,
                &format!("{}Z", chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S")),
            )
            .await?;
    }
    Ok(stats)
}

fn with_timezone(state: &ViewerState, stats: Statistics) -> serde_json::Value {
    let mut value = serde_json::to_value(&stats).unwrap_or_else(|_| json!({}));
    if let Some(map) = value.as_object_mut() {
        map.insert("timezone".into(), json!(state.cfg.viewer_timezone));
    }
    value
}

async fn push_config(State(state): State<Arc<ViewerState>>) -> Json<serde_json::Value> {
    let mode = match state.cfg.push_mode {
        crate::shared::PushMode::Off => "off",
        crate::shared::PushMode::Basic => "basic",
        crate::shared::PushMode::Full => "full",
    };
    Json(json!({
        "mode": mode,
        "enabled": state.push.is_some(),
        "public_key": state.push.as_ref().map(|p| p.public_key()),
    }))
}

#[derive(Debug, Deserialize)]
struct SubscriptionKeys {
    p256dh: String,
    auth: String,
}

#[derive(Debug, Deserialize)]
struct SubscribeRequest {
    endpoint: String,
    keys: SubscriptionKeys,
    chat_id: Option<i64>,
}

async fn push_subscribe(
    State(state): State<Arc<ViewerState>>,
    headers: HeaderMap,
    Json(payload): Json<SubscribeRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    require_auth(state.auth.as_ref(), &headers)?;
    if let Some(chat_id) = payload.chat_id {
        if !state.display_allowed(chat_id) {
            return Err(ApiError::forbidden());
        }
    }
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    state
        .store
        .upsert_push_subscription(&PushSubscriptionRecord {
            endpoint: payload.endpoint,
            p256dh: payload.keys.p256dh,
            auth: payload.keys.auth,
            chat_id: payload.chat_id,
            user_agent,
            created_at: None,
            last_used_at: None,
        })
        .await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
struct UnsubscribeRequest {
    endpoint: String,
}

async fn push_unsubscribe(
    State(state): State<Arc<ViewerState>>,
    headers: HeaderMap,
    Json(payload): Json<UnsubscribeRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    require_auth(state.auth.as_ref(), &headers)?;
    state
        .store
        .delete_push_subscription(&payload.endpoint)
        .await?;
    Ok(Json(json!({ "success": true })))
}

/// Intra-process webhook used by the embedded-store transport. Trust relies
/// on network placement: only loopback callers are accepted.
async fn internal_push(
    State(state): State<Arc<ViewerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(event): Json<NotificationEvent>,
) -> ApiResult<Json<serde_json::Value>> {
    if !addr.ip().is_loopback() {
        warn!(peer = %addr, "internal push rejected: non-local caller");
        return Err(ApiError::forbidden());
    }
    let _ = state.events.send(event);
    Ok(Json(json!({ "ok": true })))
}

async fn healthz(State(state): State<Arc<ViewerState>>) -> ApiResult<Json<serde_json::Value>> {
    state.store.health_check().await?;
    Ok(Json(json!({ "status": "ok" })))
}

/// Accept both the store's text format and RFC 3339 for cursor timestamps.
fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    parse_ts(raw).or_else(|| {
        chrono::DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.naive_utc())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_timestamps_accept_both_formats() {
        assert!(parse_timestamp("2024-06-01 10:00:00").is_some());
        assert!(parse_timestamp("2024-06-01T10:00:00").is_some());
        assert!(parse_timestamp("2024-06-01T10:00:00+02:00").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
