//! Chat Moderator (C2) — per-message admission backed by the KV store
//! (spec §3, §4.6). Checks run in a fixed order so the first failure wins
//! and reports a specific reason, mirroring the ordered-validation style of
//! `handle_handshake`'s field-by-field rejection in
//! `brew-lab-thaumic-cast`'s `ws.rs`.

use std::sync::Arc;

use crate::error::Result;
use crate::kv::KvStore;
use crate::metrics::CHAT_MESSAGES_REJECTED;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    TooLong,
    Empty,
    Banned,
    FilteredWord,
    SlowMode,
}

impl RejectReason {
    fn message(&self) -> String {
        match self {
            RejectReason::TooLong => "Message exceeds maximum length".to_string(),
            RejectReason::Empty => "Message is empty".to_string(),
            RejectReason::Banned => "You are banned from this chat".to_string(),
            RejectReason::FilteredWord => "Message contains a filtered word".to_string(),
            RejectReason::SlowMode => "Slow mode: please wait before sending another message".to_string(),
        }
    }

    fn metric_label(&self) -> &'static str {
        match self {
            RejectReason::TooLong => "too_long",
            RejectReason::Empty => "empty",
            RejectReason::Banned => "banned",
            RejectReason::FilteredWord => "filtered_word",
            RejectReason::SlowMode => "slow_mode",
        }
    }
}

#[derive(serde::Serialize)]
pub struct ValidationResult {
    pub allowed: bool,
    pub reason: Option<String>,
}

fn ban_key(tenant_id: &str, stream_id: &str) -> String {
    format!("chat_ban:{tenant_id}:{stream_id}")
}

fn filter_key(tenant_id: &str, stream_id: &str) -> String {
    format!("chat_filter:{tenant_id}:{stream_id}")
}

fn slow_key(tenant_id: &str, stream_id: &str, user_id: &str) -> String {
    format!("chat_slow:{tenant_id}:{stream_id}:{user_id}")
}

pub struct ChatModerator {
    kv: Arc<dyn KvStore>,
    max_message_length: usize,
    slow_mode_seconds: u64,
}

impl ChatModerator {
    pub fn new(kv: Arc<dyn KvStore>, max_message_length: usize, slow_mode_seconds: u64) -> Self {
        Self {
            kv,
            max_message_length,
            slow_mode_seconds,
        }
    }

    /// Checks, in order: length, non-empty after trim, ban set, lower-cased
    /// filter substrings, slow-mode token acquisition (only when
    /// `slow_mode_seconds > 0`). First failure wins (spec §4.6).
    pub async fn validate(
        &self,
        tenant_id: &str,
        stream_id: &str,
        user_id: &str,
        message: &str,
    ) -> Result<ValidationResult> {
        if message.len() > self.max_message_length {
            return Ok(self.reject(RejectReason::TooLong));
        }
        if message.trim().is_empty() {
            return Ok(self.reject(RejectReason::Empty));
        }
        if self
            .kv
            .s_is_member(&ban_key(tenant_id, stream_id), user_id)
            .await?
        {
            return Ok(self.reject(RejectReason::Banned));
        }

        let lowered = message.to_lowercase();
        let filtered_words = self.kv.s_members(&filter_key(tenant_id, stream_id)).await?;
        if filtered_words.iter().any(|w| lowered.contains(w.as_str())) {
            return Ok(self.reject(RejectReason::FilteredWord));
        }

        if self.slow_mode_seconds > 0 {
            let key = slow_key(tenant_id, stream_id, user_id);
            let acquired = self.kv.set_nx_ex(&key, self.slow_mode_seconds, "1").await?;
            if !acquired {
                return Ok(self.reject(RejectReason::SlowMode));
            }
        }

        Ok(ValidationResult {
            allowed: true,
            reason: None,
        })
    }

    fn reject(&self, reason: RejectReason) -> ValidationResult {
        CHAT_MESSAGES_REJECTED
            .with_label_values(&[reason.metric_label()])
            .inc();
        ValidationResult {
            allowed: false,
            reason: Some(reason.message()),
        }
    }

    pub async fn ban(&self, tenant_id: &str, stream_id: &str, user_id: &str) -> Result<()> {
        self.kv.s_add(&ban_key(tenant_id, stream_id), user_id).await
    }

    pub async fn unban(&self, tenant_id: &str, stream_id: &str, user_id: &str) -> Result<()> {
        self.kv.s_rem(&ban_key(tenant_id, stream_id), user_id).await
    }

    pub async fn add_filter_word(&self, tenant_id: &str, stream_id: &str, word: &str) -> Result<()> {
        self.kv
            .s_add(&filter_key(tenant_id, stream_id), &word.to_lowercase())
            .await
    }
}
