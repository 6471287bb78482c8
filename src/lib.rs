pub mod chat;
pub mod config;
pub mod error;
pub mod hls_origin;
pub mod kv;
pub mod metrics;
pub mod signaling;
pub mod stream_manager;
pub mod transcoder_supervisor;
pub mod viewer_tracker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, RANGE};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::chat::ChatModerator;
use crate::config::Settings;
use crate::kv::KvStore;
use crate::metrics::HLS_BYTES_SERVED;
use crate::signaling::SignalingRouter;
use crate::stream_manager::{StreamManager, StreamRecord};
use crate::transcoder_supervisor::TranscoderSupervisor;
use crate::viewer_tracker::ViewerTracker;

/// Everything a handler needs, shared behind an `Arc` the way the teacher's
/// `AppState` bundled `channels`/`stream_manager`/`hls_manager`.
pub struct AppState {
    pub stream_manager: Arc<StreamManager>,
    pub signaling_router: Arc<SignalingRouter>,
    pub transcoder_supervisor: Arc<TranscoderSupervisor>,
    pub viewer_tracker: Arc<ViewerTracker>,
    pub chat_moderator: Arc<ChatModerator>,
    pub hls_storage_root: PathBuf,
}

/// Builds the component graph from config + a `KvStore` and wires the HTTP
/// surface: the HLS origin (C3), the signaling WebSocket (C6), a Prometheus
/// scrape endpoint, and a thin REST surface over C5/C1/C2 so the binary is
/// actually exercisable — spec §6 doesn't mandate this last part, but a
/// working server needs some way to call `create_stream`/`start_stream`/etc.
pub fn create_app(settings: &Settings, kv: Arc<dyn KvStore>) -> Router {
    let stream_manager = Arc::new(StreamManager::new(
        kv.clone(),
        settings.streaming.stream_key_ttl,
    ));
    let signaling_router = Arc::new(SignalingRouter::new(stream_manager.clone()));
    let transcoder_supervisor = Arc::new(TranscoderSupervisor::new(
        PathBuf::from(&settings.streaming.hls.storage_path),
        settings.streaming.ffmpeg_path.clone(),
        settings.streaming.hls.segment_duration,
        settings.streaming.hls.playlist_size,
        settings.streaming.max_concurrent_transcodes,
    ));
    let viewer_tracker = Arc::new(ViewerTracker::new(kv.clone()));
    let chat_moderator = Arc::new(ChatModerator::new(
        kv,
        settings.streaming.chat.max_message_length,
        settings.streaming.chat.slow_mode_seconds,
    ));

    let state = Arc::new(AppState {
        stream_manager,
        signaling_router,
        transcoder_supervisor,
        viewer_tracker,
        chat_moderator,
        hls_storage_root: PathBuf::from(&settings.streaming.hls.storage_path),
    });

    // CORS is scoped to the HLS routes only (spec §4.4); the API/WS surface
    // isn't browser-facing in the same way.
    let hls_cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE]);

    Router::new()
        .route(
            "/hls/{stream_id}/{filename}",
            get(hls_file_handler).head(hls_file_handler),
        )
        .layer(hls_cors)
        .route("/ws/signaling", get(signaling_ws_handler))
        .route("/metrics", get(metrics_handler))
        .route(
            "/api/streams",
            post(create_stream_handler).get(live_streams_handler),
        )
        .route("/api/streams/{stream_id}", get(get_stream_handler))
        .route("/api/streams/{stream_id}/start", post(start_stream_handler))
        .route("/api/streams/{stream_id}/end", post(end_stream_handler))
        .route(
            "/api/streams/{stream_id}/viewers/{viewer_id}/heartbeat",
            post(viewer_heartbeat_handler),
        )
        .route("/api/streams/{stream_id}/viewers", get(viewer_count_handler))
        .route("/api/streams/{stream_id}/chat", post(chat_validate_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

// Re-exported locally to avoid importing axum::Json at every call site above.
use axum::Json;

/// Serves `{storage_root}/{streamId}/{filename}` — both the manifest and the
/// segment files live behind the same parametrized route (spec §4.4), since
/// the distinguishing behavior (content-type, Cache-Control, Range support)
/// is entirely a function of the filename's extension, not the route it
/// arrived on.
async fn hls_file_handler(
    Path((stream_id, filename)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: axum::http::HeaderMap,
) -> Response {
    let Some(path) = hls_origin::resolve_path(&state.hls_storage_root, &stream_id, &filename)
    else {
        return json_error(StatusCode::BAD_REQUEST, "Invalid filename");
    };

    let metadata = match tokio::fs::metadata(&path).await {
        Ok(m) if m.is_file() => m,
        _ => return json_error(StatusCode::NOT_FOUND, "Segment not found"),
    };

    let content_type = hls_origin::content_type_for(&filename);
    let cache_control = hls_origin::cache_control_for(&filename);
    let kind = if filename.ends_with(".m3u8") {
        "manifest"
    } else {
        "segment"
    };

    if method == Method::HEAD {
        return Response::builder()
            .header(CONTENT_TYPE, content_type)
            .header(CACHE_CONTROL, cache_control)
            .header("Access-Control-Allow-Origin", "*")
            .header("Content-Length", metadata.len().to_string())
            .body(Body::empty())
            .unwrap();
    }

    let bytes = match tokio::fs::read(&path).await {
        Ok(b) => b,
        Err(_) => return json_error(StatusCode::NOT_FOUND, "Segment not found"),
    };
    let total = bytes.len();

    let range = headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| hls_origin::parse_byte_range(h, total));

    let (status, body, content_range) = match range {
        Some((start, end)) => (
            StatusCode::PARTIAL_CONTENT,
            bytes[start..=end].to_vec(),
            Some(format!("bytes {start}-{end}/{total}")),
        ),
        None => (StatusCode::OK, bytes, None),
    };

    HLS_BYTES_SERVED
        .with_label_values(&[kind])
        .inc_by(body.len() as f64);

    let mut builder = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .header(CACHE_CONTROL, cache_control)
        .header("Access-Control-Allow-Origin", "*")
        .header("Accept-Ranges", "bytes")
        .header("Content-Length", body.len().to_string());
    if let Some(cr) = content_range {
        builder = builder.header("Content-Range", cr);
    }
    builder.body(Body::from(body)).unwrap()
}

#[derive(Deserialize)]
struct SignalingQuery {
    tenant_id: String,
    user_id: String,
}

/// Tenant/user identification arrives as query params rather than via
/// middleware, since tenant-resolution middleware is explicitly out of scope
/// (spec §1).
async fn signaling_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<SignalingQuery>,
) -> impl IntoResponse {
    let router = state.signaling_router.clone();
    ws.on_upgrade(move |socket| {
        signaling::handle_connection(router, socket, params.tenant_id, params.user_id)
    })
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

#[derive(Deserialize)]
struct CreateStreamRequest {
    tenant_id: String,
    user_id: String,
    title: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Serialize)]
struct CreateStreamResponse {
    stream_id: String,
    stream_key: String,
}

async fn create_stream_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateStreamRequest>,
) -> Response {
    match state
        .stream_manager
        .create_stream(&req.tenant_id, &req.user_id, &req.title, req.metadata)
        .await
    {
        Ok((stream_id, stream_key)) => (
            StatusCode::CREATED,
            Json(CreateStreamResponse {
                stream_id,
                stream_key,
            }),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "create_stream failed");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "stream store unavailable")
        }
    }
}

async fn start_stream_handler(
    Path(stream_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match state.stream_manager.start_stream(&stream_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => json_error(StatusCode::NOT_FOUND, "Stream not found"),
        Err(e) => {
            warn!(error = %e, "start_stream failed");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "stream store unavailable")
        }
    }
}

/// Also tears down any active encoder and its HLS artifacts — the spec
/// leaves that coordination to the caller rather than the manager itself
/// (design note 9.5), and this REST surface is that caller.
async fn end_stream_handler(
    Path(stream_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let result = state.stream_manager.end_stream(&stream_id).await;
    if state.transcoder_supervisor.is_active(&stream_id).await {
        state.transcoder_supervisor.stop(&stream_id).await;
    }
    let _ = state.transcoder_supervisor.cleanup(&stream_id).await;

    match result {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => json_error(StatusCode::NOT_FOUND, "Stream not found"),
        Err(e) => {
            warn!(error = %e, "end_stream failed");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "stream store unavailable")
        }
    }
}

async fn get_stream_handler(
    Path(stream_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match state.stream_manager.get_stream(&stream_id).await {
        Some(record) => Json(record).into_response(),
        None => json_error(StatusCode::NOT_FOUND, "Stream not found"),
    }
}

#[derive(Deserialize)]
struct TenantQuery {
    tenant_id: String,
}

async fn live_streams_handler(
    Query(q): Query<TenantQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let streams: Vec<StreamRecord> = state.stream_manager.get_live_streams(&q.tenant_id).await;
    Json(streams).into_response()
}

#[derive(Deserialize)]
struct TenantOnlyBody {
    tenant_id: String,
}

async fn viewer_heartbeat_handler(
    Path((stream_id, viewer_id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    Json(req): Json<TenantOnlyBody>,
) -> Response {
    match state
        .viewer_tracker
        .heartbeat(&req.tenant_id, &stream_id, &viewer_id)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!(error = %e, "viewer heartbeat failed");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "viewer store unavailable")
        }
    }
}

async fn viewer_count_handler(
    Path(stream_id): Path<String>,
    Query(q): Query<TenantQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match state.viewer_tracker.count(&q.tenant_id, &stream_id).await {
        Ok(count) => Json(json!({ "count": count })).into_response(),
        Err(e) => {
            warn!(error = %e, "viewer count lookup failed");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "viewer store unavailable")
        }
    }
}

#[derive(Deserialize)]
struct ChatValidateRequest {
    tenant_id: String,
    user_id: String,
    message: String,
}

async fn chat_validate_handler(
    Path(stream_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatValidateRequest>,
) -> Response {
    match state
        .chat_moderator
        .validate(&req.tenant_id, &stream_id, &req.user_id, &req.message)
        .await
    {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            warn!(error = %e, "chat validation failed");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "chat store unavailable")
        }
    }
}

async fn fallback_handler(uri: axum::http::Uri) -> Response {
    warn!(%uri, "unmatched route");
    json_error(StatusCode::NOT_FOUND, "Not found")
}
