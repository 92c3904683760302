//! Chat history loading.
//!
//! History is owned by an external service; the core only consumes it. The
//! trait keeps the transport swappable: production speaks HTTP with a bearer
//! token, tests use the in-memory loader.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

use crate::signal::{Attachment, ChatMessage};
use crate::Credentials;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("History request failed: {0}")]
    Request(String),
    #[error("History service returned status {0}")]
    Status(u16),
    #[error("History payload malformed: {0}")]
    Decode(String),
}

/// Fetch past messages for a meeting. A remote call with no side effects on
/// core state; callers treat failures as non-fatal.
#[async_trait]
pub trait HistoryLoader: Send + Sync {
    async fn fetch_history(
        &self,
        meeting_id: &str,
        credentials: &Credentials,
    ) -> Result<Vec<ChatMessage>, HistoryError>;
}

// ============================================================================
// HTTP LOADER
// ============================================================================

/// `GET {base}/api/chat/{meeting_id}` with `Authorization: Bearer <token>`.
pub struct HttpHistoryLoader {
    base_url: String,
    http: reqwest::Client,
}

impl HttpHistoryLoader {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    messages: Vec<HistoryRecord>,
}

/// One record as the history service stores it; field names follow the
/// service's wire format.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    id: String,
    user_id: String,
    user_name: String,
    message: String,
    timestamp: i64,
    #[serde(default)]
    attachment: Option<Attachment>,
}

impl From<HistoryRecord> for ChatMessage {
    fn from(record: HistoryRecord) -> Self {
        ChatMessage {
            id: record.id,
            sender_id: record.user_id,
            sender_name: record.user_name,
            content: record.message,
            timestamp: record.timestamp,
            attachment: record.attachment,
        }
    }
}

#[async_trait]
impl HistoryLoader for HttpHistoryLoader {
    async fn fetch_history(
        &self,
        meeting_id: &str,
        credentials: &Credentials,
    ) -> Result<Vec<ChatMessage>, HistoryError> {
        let url = format!(
            "{}/api/chat/{}",
            self.base_url.trim_end_matches('/'),
            meeting_id
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(&credentials.token)
            .send()
            .await
            .map_err(|e| HistoryError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HistoryError::Status(status.as_u16()));
        }

        let body: HistoryResponse = response
            .json()
            .await
            .map_err(|e| HistoryError::Decode(e.to_string()))?;
        Ok(body.messages.into_iter().map(ChatMessage::from).collect())
    }
}

// ============================================================================
// MEMORY LOADER
// ============================================================================

/// In-process loader for tests and demos. Scriptable: set the backlog, make
/// calls fail, count fetches.
#[derive(Default)]
pub struct MemoryHistoryLoader {
    messages: Mutex<Vec<ChatMessage>>,
    fail_next: AtomicUsize,
    calls: AtomicUsize,
}

impl MemoryHistoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_messages(&self, messages: Vec<ChatMessage>) {
        *self.messages.lock() = messages;
    }

    pub fn push_message(&self, message: ChatMessage) {
        self.messages.lock().push(message);
    }

    /// Make the next `n` fetches fail.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HistoryLoader for MemoryHistoryLoader {
    async fn fetch_history(
        &self,
        _meeting_id: &str,
        _credentials: &Credentials,
    ) -> Result<Vec<ChatMessage>, HistoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(HistoryError::Request("scripted failure".to_string()));
        }
        Ok(self.messages.lock().clone())
    }
}

// ============================================================================
// TESTS
// ============================================================================
