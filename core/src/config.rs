//! Client configuration: relay endpoints, ICE servers, reconnect tuning.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::backoff::BackoffSchedule;

/// A STUN/TURN server entry handed to the media engine. The core applies the
/// provided configuration as-is; traversal policy beyond that is out of scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Relay WebSocket base, e.g. `ws://meet.example.net:8080`.
    pub ws_base_url: String,
    /// Relay HTTP base for the history service, e.g. `http://meet.example.net:8080`.
    pub http_base_url: String,
    pub ice_servers: Vec<IceServerConfig>,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub max_reconnect_attempts: u32,
    pub connect_timeout_secs: u64,
    pub keepalive_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_base_url: "ws://localhost:8080".to_string(),
            http_base_url: "http://localhost:8080".to_string(),
            ice_servers: vec![IceServerConfig::stun("stun:stun.l.google.com:19302")],
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 30_000,
            max_reconnect_attempts: 8,
            connect_timeout_secs: 10,
            keepalive_secs: 30,
        }
    }
}

impl ClientConfig {
    pub fn backoff(&self) -> BackoffSchedule {
        BackoffSchedule::new(
            Duration::from_millis(self.reconnect_base_ms),
            Duration::from_millis(self.reconnect_cap_ms),
            self.max_reconnect_attempts,
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// Media signaling endpoint, scoped to a meeting and user.
    pub fn media_channel_url(
        &self,
        meeting_id: &str,
        user_id: &str,
    ) -> Result<String, url::ParseError> {
        let mut url = Url::parse(&self.ws_base_url)?;
        url.set_path("/ws");
        url.query_pairs_mut()
            .append_pair("meetingId", meeting_id)
            .append_pair("userId", user_id);
        Ok(url.to_string())
    }

    /// Chat endpoint; scope travels in the auth handshake, not the URL.
    pub fn chat_channel_url(&self) -> Result<String, url::ParseError> {
        let mut url = Url::parse(&self.ws_base_url)?;
        url.set_path("/api/ws");
        Ok(url.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================
