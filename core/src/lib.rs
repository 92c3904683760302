// MeetLink Core — Meeting Spine
//
// "Does this keep two humans seeing and hearing each other
//  across a network that keeps letting them down?"
//
// If the answer is no, it doesn't belong in core.

pub mod backoff;
pub mod chat;
pub mod config;
pub mod media;
pub mod signal;

use serde::{Deserialize, Serialize};

pub use backoff::{BackoffSchedule, NextAttempt};
pub use chat::{ChatDelegate, ChatError, ChatTransport, HistoryLoader, HttpHistoryLoader};
pub use config::{ClientConfig, IceServerConfig};
pub use media::{
    LocalTrack, MediaConnectionState, MeetingDelegate, MeetingError, NullEngine, Participant,
    PeerManager, RemoteStream, RtcEngine, TrackKind,
};
pub use signal::{Attachment, ChatMessage, SessionState, WsConnector};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Who the local user is, as far as the relay is concerned.
///
/// `user_id` is the canonical identity: it keys the relay's per-meeting
/// connection map, attributes chat messages, and addresses signaling frames.
/// `display_name` is presentation only and may change between sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

/// Identity plus the bearer token the chat channel and history service
/// authenticate with. Token issuance is an external collaborator's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub identity: Identity,
    pub token: String,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_serializes_for_config_files() {
        let identity = Identity {
            user_id: "u1".to_string(),
            display_name: "Ada".to_string(),
        };
        let raw = serde_json::to_string(&identity).unwrap();
        let restored: Identity = serde_json::from_str(&raw).unwrap();
        assert_eq!(restored, identity);
    }
}
