//! Signaling Router (C6) — routes SDP/ICE between a broadcaster and its
//! viewers over WebSocket, fans out stream-state events, and converges state
//! on disconnect (spec §3, §4.2). The split-sender/tagged-frame/select-loop
//! shape follows `ws.rs`'s `handle_ws` in `brew-lab-thaumic-cast`; connection
//! identity and RAII cleanup follow its `ws_connection.rs`, adapted to a
//! monotonic counter per design note 9.2 instead of a string id.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::stream_manager::StreamKeyValidator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Deserialize, Default)]
struct OfferFrame {
    #[serde(default)]
    stream_id: String,
    #[serde(default)]
    sdp: String,
    #[serde(default)]
    stream_key: String,
}

#[derive(Debug, Deserialize, Default)]
struct AnswerFrame {
    #[serde(default)]
    stream_id: String,
    #[serde(default)]
    sdp: String,
}

#[derive(Debug, Deserialize, Default)]
struct CandidateFrame {
    #[serde(default)]
    stream_id: String,
    #[serde(default)]
    candidate: serde_json::Value,
    #[serde(default)]
    target_fd: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SubscribeFrame {
    #[serde(default)]
    stream_id: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundFrame {
    BroadcastStarted {
        stream_id: String,
    },
    Offer {
        stream_id: String,
        sdp: String,
    },
    Answer {
        stream_id: String,
        sdp: String,
        viewer_fd: u64,
    },
    Candidate {
        stream_id: String,
        candidate: serde_json::Value,
        from_fd: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_fd: Option<u64>,
    },
    StreamActive {
        stream_id: String,
    },
    StreamWaiting {
        stream_id: String,
    },
    ViewerJoined {
        stream_id: String,
        viewer_fd: u64,
    },
    StreamEnded {
        stream_id: String,
    },
}

impl OutboundFrame {
    fn into_message(self) -> Message {
        Message::Text(serde_json::to_string(&self).unwrap_or_default().into())
    }
}

struct BroadcasterEntry {
    conn_id: ConnId,
    #[allow(dead_code)]
    tenant_id: String,
    #[allow(dead_code)]
    user_id: String,
}

#[derive(Default)]
struct RouterState {
    broadcasters: HashMap<String, BroadcasterEntry>,
    viewers: HashMap<String, Vec<ConnId>>,
    reverse: HashMap<ConnId, String>,
    outboxes: HashMap<ConnId, mpsc::UnboundedSender<Message>>,
}

impl RouterState {
    fn send_to(&self, conn_id: ConnId, frame: OutboundFrame) {
        if let Some(tx) = self.outboxes.get(&conn_id) {
            let _ = tx.send(frame.into_message());
        }
    }

    fn send_error(&self, conn_id: ConnId, message: &str) {
        self.send_raw(conn_id, json!({ "error": message }));
    }

    fn send_error_with_type(&self, conn_id: ConnId, message: &str, type_str: &str) {
        self.send_raw(conn_id, json!({ "error": message, "type": type_str }));
    }

    fn send_raw(&self, conn_id: ConnId, value: serde_json::Value) {
        if let Some(tx) = self.outboxes.get(&conn_id) {
            let _ = tx.send(Message::Text(value.to_string().into()));
        }
    }
}

/// RAII guard that deregisters a connection and runs the disconnect cascade
/// (spec §4.2's "Disconnect handling") when dropped, mirroring `ClientGuard`
/// in `manager.rs`. All of the cascade's work is non-suspending (unbounded
/// channel sends, `HashMap` mutation), so it can run synchronously in `Drop`.
pub struct SignalingConnectionGuard {
    conn_id: ConnId,
    router: Arc<SignalingRouter>,
}

impl Drop for SignalingConnectionGuard {
    fn drop(&mut self) {
        self.router.disconnect(self.conn_id);
    }
}

pub struct SignalingRouter {
    state: Mutex<RouterState>,
    next_conn_id: AtomicU64,
    key_validator: Arc<dyn StreamKeyValidator>,
}

impl SignalingRouter {
    pub fn new(key_validator: Arc<dyn StreamKeyValidator>) -> Self {
        Self {
            state: Mutex::new(RouterState::default()),
            next_conn_id: AtomicU64::new(1),
            key_validator,
        }
    }

    pub fn register_connection(
        self: &Arc<Self>,
    ) -> (ConnId, mpsc::UnboundedReceiver<Message>, SignalingConnectionGuard) {
        let conn_id = ConnId(self.next_conn_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().outboxes.insert(conn_id, tx);
        info!(%conn_id, "signaling connection registered");
        (
            conn_id,
            rx,
            SignalingConnectionGuard {
                conn_id,
                router: Arc::clone(self),
            },
        )
    }

    fn disconnect(&self, conn_id: ConnId) {
        let mut state = self.state.lock().unwrap();
        state.outboxes.remove(&conn_id);
        let Some(stream_id) = state.reverse.remove(&conn_id) else {
            return;
        };
        let is_broadcaster = state
            .broadcasters
            .get(&stream_id)
            .map(|b| b.conn_id == conn_id)
            .unwrap_or(false);

        if is_broadcaster {
            state.broadcasters.remove(&stream_id);
            if let Some(viewer_ids) = state.viewers.remove(&stream_id) {
                for v in viewer_ids {
                    state.send_to(
                        v,
                        OutboundFrame::StreamEnded {
                            stream_id: stream_id.clone(),
                        },
                    );
                }
            }
            info!(%stream_id, %conn_id, "broadcaster disconnected, stream ended for viewers");
        } else if let Some(list) = state.viewers.get_mut(&stream_id) {
            list.retain(|c| *c != conn_id);
        }
    }

    pub async fn dispatch_text(
        self: &Arc<Self>,
        conn_id: ConnId,
        tenant_id: &str,
        user_id: &str,
        text: &str,
    ) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                self.state.lock().unwrap().send_error(conn_id, "Invalid JSON");
                return;
            }
        };
        let Some(type_str) = value.get("type").and_then(|t| t.as_str()).map(str::to_string) else {
            self.state.lock().unwrap().send_error(conn_id, "Invalid JSON");
            return;
        };

        match type_str.as_str() {
            "offer" => {
                let frame: OfferFrame = serde_json::from_value(value).unwrap_or_default();
                self.handle_offer(conn_id, tenant_id, user_id, frame).await;
            }
            "answer" => {
                let frame: AnswerFrame = serde_json::from_value(value).unwrap_or_default();
                self.handle_answer(conn_id, frame);
            }
            "candidate" => {
                let frame: CandidateFrame = serde_json::from_value(value).unwrap_or_default();
                self.handle_candidate(conn_id, frame);
            }
            "subscribe" => {
                let frame: SubscribeFrame = serde_json::from_value(value).unwrap_or_default();
                self.handle_subscribe(conn_id, frame);
            }
            other => {
                let mut state = self.state.lock().unwrap();
                state.send_error_with_type(conn_id, "Unknown signaling type", other);
            }
        }
    }

    async fn handle_offer(&self, conn_id: ConnId, tenant_id: &str, user_id: &str, frame: OfferFrame) {
        if frame.stream_id.is_empty() || frame.sdp.is_empty() {
            self.state
                .lock()
                .unwrap()
                .send_error(conn_id, "Missing stream_id or sdp");
            return;
        }

        let valid = self
            .key_validator
            .validate_stream_key(tenant_id, &frame.stream_id, &frame.stream_key)
            .await;
        if !valid {
            self.state.lock().unwrap().send_error(conn_id, "Invalid stream key");
            return;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(prev) = state.broadcasters.get(&frame.stream_id) {
            warn!(
                stream_id = %frame.stream_id,
                previous = %prev.conn_id,
                new = %conn_id,
                "broadcaster re-registration: overwriting prior broadcaster"
            );
        }
        state.broadcasters.insert(
            frame.stream_id.clone(),
            BroadcasterEntry {
                conn_id,
                tenant_id: tenant_id.to_string(),
                user_id: user_id.to_string(),
            },
        );
        state.viewers.entry(frame.stream_id.clone()).or_default();
        state.reverse.insert(conn_id, frame.stream_id.clone());

        state.send_to(
            conn_id,
            OutboundFrame::BroadcastStarted {
                stream_id: frame.stream_id.clone(),
            },
        );

        let viewer_ids = state
            .viewers
            .get(&frame.stream_id)
            .cloned()
            .unwrap_or_default();
        for v in viewer_ids {
            state.send_to(
                v,
                OutboundFrame::Offer {
                    stream_id: frame.stream_id.clone(),
                    sdp: frame.sdp.clone(),
                },
            );
        }
    }

    fn handle_answer(&self, conn_id: ConnId, frame: AnswerFrame) {
        let mut state = self.state.lock().unwrap();
        match state.broadcasters.get(&frame.stream_id) {
            Some(b) => {
                let target = b.conn_id;
                state.send_to(
                    target,
                    OutboundFrame::Answer {
                        stream_id: frame.stream_id,
                        sdp: frame.sdp,
                        viewer_fd: conn_id.0,
                    },
                );
            }
            None => state.send_error(conn_id, "Stream not found"),
        }
    }

    fn handle_candidate(&self, conn_id: ConnId, frame: CandidateFrame) {
        if frame.stream_id.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();

        if let Some(target_fd) = frame.target_fd {
            let target = ConnId(target_fd);
            state.send_to(
                target,
                OutboundFrame::Candidate {
                    stream_id: frame.stream_id,
                    candidate: frame.candidate,
                    from_fd: conn_id.0,
                    target_fd: Some(target_fd),
                },
            );
            return;
        }

        let is_broadcaster = state
            .broadcasters
            .get(&frame.stream_id)
            .map(|b| b.conn_id == conn_id)
            .unwrap_or(false);

        if is_broadcaster {
            let viewer_ids = state
                .viewers
                .get(&frame.stream_id)
                .cloned()
                .unwrap_or_default();
            for v in viewer_ids {
                state.send_to(
                    v,
                    OutboundFrame::Candidate {
                        stream_id: frame.stream_id.clone(),
                        candidate: frame.candidate.clone(),
                        from_fd: conn_id.0,
                        target_fd: None,
                    },
                );
            }
        } else if let Some(b) = state.broadcasters.get(&frame.stream_id) {
            let target = b.conn_id;
            state.send_to(
                target,
                OutboundFrame::Candidate {
                    stream_id: frame.stream_id,
                    candidate: frame.candidate,
                    from_fd: conn_id.0,
                    target_fd: None,
                },
            );
        }
    }

    fn handle_subscribe(&self, conn_id: ConnId, frame: SubscribeFrame) {
        if frame.stream_id.is_empty() {
            self.state.lock().unwrap().send_error(conn_id, "Missing stream_id");
            return;
        }

        let mut state = self.state.lock().unwrap();
        let list = state.viewers.entry(frame.stream_id.clone()).or_default();
        if !list.contains(&conn_id) {
            list.push(conn_id);
        }
        state.reverse.insert(conn_id, frame.stream_id.clone());

        if let Some(b) = state.broadcasters.get(&frame.stream_id) {
            let broadcaster_conn = b.conn_id;
            state.send_to(
                conn_id,
                OutboundFrame::StreamActive {
                    stream_id: frame.stream_id.clone(),
                },
            );
            state.send_to(
                broadcaster_conn,
                OutboundFrame::ViewerJoined {
                    stream_id: frame.stream_id,
                    viewer_fd: conn_id.0,
                },
            );
        } else {
            state.send_to(
                conn_id,
                OutboundFrame::StreamWaiting {
                    stream_id: frame.stream_id,
                },
            );
        }
    }
}

/// Drives one accepted WebSocket to completion: splits into sink/stream,
/// registers the connection, and runs the select loop that interleaves
/// inbound frames with outbound pushes routed from other connections.
pub async fn handle_connection(
    router: Arc<SignalingRouter>,
    socket: WebSocket,
    tenant_id: String,
    user_id: String,
) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut outbox_rx, _guard) = router.register_connection();

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        router.dispatch_text(conn_id, &tenant_id, &user_id, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            outbound = outbox_rx.recv() => {
                match outbound {
                    Some(msg) => {
                        if sender.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    // `_guard` drops here, running the disconnect cascade.
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct AlwaysValid;

    #[async_trait]
    impl StreamKeyValidator for AlwaysValid {
        async fn validate_stream_key(&self, _tenant_id: &str, _stream_id: &str, key: &str) -> bool {
            key == "sk_good"
        }
    }

    fn router() -> Arc<SignalingRouter> {
        Arc::new(SignalingRouter::new(Arc::new(AlwaysValid)))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Text(text) = msg {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    #[tokio::test]
    async fn offer_then_subscribe_then_candidate_relay() {
        let router = router();
        let (broadcaster_id, mut broadcaster_rx, _bg) = router.register_connection();
        let (viewer_id, mut viewer_rx, _vg) = router.register_connection();

        router
            .dispatch_text(
                broadcaster_id,
                "tenant-a",
                "user-1",
                r#"{"type":"offer","stream_id":"stream_abc","sdp":"v=0","stream_key":"sk_good"}"#,
            )
            .await;
        let broadcaster_msgs = drain(&mut broadcaster_rx);
        assert_eq!(broadcaster_msgs[0]["type"], "broadcast_started");

        router
            .dispatch_text(
                viewer_id,
                "tenant-a",
                "user-2",
                r#"{"type":"subscribe","stream_id":"stream_abc"}"#,
            )
            .await;
        let viewer_msgs = drain(&mut viewer_rx);
        assert_eq!(viewer_msgs[0]["type"], "stream_active");
        let broadcaster_msgs = drain(&mut broadcaster_rx);
        assert_eq!(broadcaster_msgs[0]["type"], "viewer_joined");
        assert_eq!(broadcaster_msgs[0]["viewer_fd"], viewer_id.0);

        router
            .dispatch_text(
                viewer_id,
                "tenant-a",
                "user-2",
                r#"{"type":"candidate","stream_id":"stream_abc","candidate":{"sdpMid":"0"}}"#,
            )
            .await;
        let broadcaster_msgs = drain(&mut broadcaster_rx);
        assert_eq!(broadcaster_msgs[0]["type"], "candidate");
        assert_eq!(broadcaster_msgs[0]["from_fd"], viewer_id.0);
    }

    #[tokio::test]
    async fn bad_stream_key_is_rejected() {
        let router = router();
        let (conn_id, mut rx, _g) = router.register_connection();
        router
            .dispatch_text(
                conn_id,
                "tenant-a",
                "user-1",
                r#"{"type":"offer","stream_id":"stream_abc","sdp":"v=0","stream_key":"sk_wrong"}"#,
            )
            .await;
        let msgs = drain(&mut rx);
        assert_eq!(msgs[0]["error"], "Invalid stream key");
    }

    #[tokio::test]
    async fn subscribe_without_broadcaster_waits() {
        let router = router();
        let (conn_id, mut rx, _g) = router.register_connection();
        router
            .dispatch_text(conn_id, "tenant-a", "user-1", r#"{"type":"subscribe","stream_id":"stream_x"}"#)
            .await;
        let msgs = drain(&mut rx);
        assert_eq!(msgs[0]["type"], "stream_waiting");
    }

    #[tokio::test]
    async fn broadcaster_disconnect_cascades_to_viewers() {
        let router = router();
        let (broadcaster_id, _bg_rx, bg_guard) = router.register_connection();
        let (viewer_id, mut viewer_rx, _vg) = router.register_connection();

        router
            .dispatch_text(
                broadcaster_id,
                "tenant-a",
                "user-1",
                r#"{"type":"offer","stream_id":"stream_abc","sdp":"v=0","stream_key":"sk_good"}"#,
            )
            .await;
        router
            .dispatch_text(viewer_id, "tenant-a", "user-2", r#"{"type":"subscribe","stream_id":"stream_abc"}"#)
            .await;
        drain(&mut viewer_rx);

        drop(bg_guard);

        let viewer_msgs = drain(&mut viewer_rx);
        assert_eq!(viewer_msgs[0]["type"], "stream_ended");

        let state = router.state.lock().unwrap();
        assert!(!state.broadcasters.contains_key("stream_abc"));
        assert!(!state.viewers.contains_key("stream_abc"));
    }

    #[tokio::test]
    async fn unknown_type_reports_it() {
        let router = router();
        let (conn_id, mut rx, _g) = router.register_connection();
        router
            .dispatch_text(conn_id, "tenant-a", "user-1", r#"{"type":"bogus"}"#)
            .await;
        let msgs = drain(&mut rx);
        assert_eq!(msgs[0]["error"], "Unknown signaling type");
        assert_eq!(msgs[0]["type"], "bogus");
    }
}
