//! Wire protocol for the relay channels.
//!
//! Every frame is a JSON object tagged by `type`, matching what the relay
//! broadcasts: join/leave notices, SDP offers/answers, trickled ICE
//! candidates, chat payloads and the handshake/keepalive control messages.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Unix timestamp in milliseconds.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// An opaque file/emoji attachment reference. Upload and download are an
/// external collaborator's job; the core only carries the reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub url: String,
}

/// A chat message. Immutable once created.
///
/// `id` is the dedup key; `(timestamp, id)` is the ordering key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Unique message ID (UUID v4)
    pub id: String,
    /// Sender's user id
    pub sender_id: String,
    /// Sender's display name at send time
    pub sender_name: String,
    /// Message body
    pub content: String,
    /// Unix timestamp (milliseconds)
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

impl ChatMessage {
    /// Create a new outbound message with a fresh id and the current time.
    pub fn compose(
        sender_id: String,
        sender_name: String,
        content: String,
        attachment: Option<Attachment>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id,
            sender_name,
            content,
            timestamp: now_ms(),
            attachment,
        }
    }

    /// Ordering key: `(timestamp, id)`, total order regardless of arrival.
    pub fn order_key(&self) -> (i64, String) {
        (self.timestamp, self.id.clone())
    }
}

/// An SDP session description as exchanged through the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// "offer" or "answer"
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: String) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp,
        }
    }

    pub fn answer(sdp: String) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp,
        }
    }
}

/// A trickled ICE candidate. Field names follow the browser/webrtc shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// Every frame that crosses a relay channel, either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// A participant entered the meeting.
    #[serde(rename_all = "camelCase")]
    Joined {
        participant_id: String,
        display_name: String,
    },
    /// A participant left the meeting.
    #[serde(rename_all = "camelCase")]
    Left { participant_id: String },
    #[serde(rename_all = "camelCase")]
    Offer {
        participant_id: String,
        sdp: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        participant_id: String,
        sdp: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        participant_id: String,
        candidate: IceCandidate,
    },
    /// Mic/camera state broadcast so rosters can render badges.
    #[serde(rename_all = "camelCase")]
    Presence {
        participant_id: String,
        muted: bool,
        video_off: bool,
    },
    Chat {
        #[serde(flatten)]
        message: ChatMessage,
    },
    /// Application-level keepalive.
    Ping,
    Pong,
    /// Media-channel handshake: announce identity and meeting scope.
    #[serde(rename_all = "camelCase")]
    Join {
        meeting_id: String,
        user_id: String,
        display_name: String,
    },
    /// Chat-channel handshake: identity, scope and the bearer token.
    #[serde(rename_all = "camelCase")]
    Auth {
        token: String,
        meeting_id: String,
        user_id: String,
        display_name: String,
    },
    AuthOk,
    AuthError { reason: String },
}

/// Serialize a frame for the wire.
pub fn encode(msg: &SignalMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}

/// Parse a frame off the wire. Failures are protocol violations: the caller
/// logs and drops them without closing the channel.
pub fn decode(raw: &str) -> Result<SignalMessage, serde_json::Error> {
    serde_json::from_str(raw)
}

// ============================================================================
// TESTS
// ============================================================================
