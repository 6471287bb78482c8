use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use fabriq_streaming::config::{
    ChatConfig, HlsConfig, RedisConfig, ServerConfig, Settings, StreamingConfig,
};
use fabriq_streaming::kv::{KvStore, MemoryKv};
use fabriq_streaming::create_app;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

fn test_settings(storage_path: &std::path::Path) -> Settings {
    Settings {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        streaming: StreamingConfig {
            hls: HlsConfig {
                storage_path: storage_path.to_string_lossy().to_string(),
                segment_duration: 4,
                playlist_size: 5,
            },
            max_concurrent_transcodes: 4,
            ffmpeg_path: "/bin/false".to_string(),
            stream_key_ttl: 86_400,
            chat: ChatConfig {
                slow_mode_seconds: 0,
                max_message_length: 500,
            },
        },
        redis: RedisConfig {
            url: "redis://127.0.0.1:6379".to_string(),
        },
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn create_start_and_fetch_stream_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let app = create_app(&test_settings(dir.path()), kv);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/streams")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"tenant_id": "tenant-a", "user_id": "user-1", "title": "Morning show"})
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    let stream_id = created["stream_id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/streams/{stream_id}/start"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/streams/{stream_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let record = body_json(response).await;
    assert_eq!(record["status"], "live");
}

#[tokio::test]
async fn hls_rejects_traversal_filenames_with_400() {
    let dir = tempfile::tempdir().unwrap();
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let app = create_app(&test_settings(dir.path()), kv);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/hls/stream_abc/..%2f..%2fetc%2fpasswd")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    // axum percent-decodes the path before routing; either a 400 (decoded
    // to a traversal attempt our validator rejects) or a 404 (treated as an
    // extra path segment axum refuses to route) is an acceptable outcome —
    // the point is it is never a 200.
    assert_ne!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn hls_missing_segment_is_404_with_json_body() {
    let dir = tempfile::tempdir().unwrap();
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let app = create_app(&test_settings(dir.path()), kv);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/hls/stream_abc/playlist.m3u8")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Segment not found");
}

#[tokio::test]
async fn chat_endpoint_rejects_overlong_message() {
    let dir = tempfile::tempdir().unwrap();
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let app = create_app(&test_settings(dir.path()), kv);

    let long_message = "x".repeat(600);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/streams/stream_abc/chat")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"tenant_id": "t", "user_id": "u", "message": long_message}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["allowed"], false);
}

#[tokio::test]
async fn viewer_heartbeat_then_stream_not_found_on_unknown_stream_is_still_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let app = create_app(&test_settings(dir.path()), kv);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/streams/stream_abc/viewers/viewer-1/heartbeat")
                .header("content-type", "application/json")
                .body(Body::from(json!({"tenant_id": "t"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn viewer_count_reflects_recorded_heartbeats() {
    let dir = tempfile::tempdir().unwrap();
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let app = create_app(&test_settings(dir.path()), kv);

    app.clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/streams/stream_abc/viewers/viewer-1/heartbeat")
                .header("content-type", "application/json")
                .body(Body::from(json!({"tenant_id": "tenant-a"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/streams/stream_abc/viewers?tenant_id=tenant-a")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["count"], 1);
}
