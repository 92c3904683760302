//! Per-participant media connection bookkeeping.
//!
//! Owned exclusively by the meeting manager; all mutation happens inside the
//! manager's event loop. Candidates that arrive before the remote description
//! are buffered here and flushed once negotiation lands; the offer race makes
//! early candidates routine, not errors.

use std::sync::Arc;
use tracing::debug;

use crate::signal::{IceCandidate, SessionDescription};

use super::engine::{MediaEndpoint, MediaError};
use super::track::{LocalTrack, LocalTracks, TrackKind};

/// Where a participant's media connection stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaConnectionState {
    /// Created, no description exchanged yet.
    New,
    /// Offer/answer in flight.
    Negotiating,
    /// Media is flowing (or at least the transport established).
    Connected,
    /// The underlying connection failed; only a leave tears it down.
    Failed,
}

pub(crate) struct MediaConnection {
    participant_id: String,
    endpoint: Arc<dyn MediaEndpoint>,
    state: MediaConnectionState,
    has_remote_description: bool,
    pending_candidates: Vec<IceCandidate>,
}

impl MediaConnection {
    pub fn new(participant_id: String, endpoint: Arc<dyn MediaEndpoint>) -> Self {
        Self {
            participant_id,
            endpoint,
            state: MediaConnectionState::New,
            has_remote_description: false,
            pending_candidates: Vec::new(),
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn state(&self) -> MediaConnectionState {
        self.state
    }

    pub fn mark_connected(&mut self) {
        self.state = MediaConnectionState::Connected;
    }

    pub fn mark_failed(&mut self) {
        self.state = MediaConnectionState::Failed;
    }

    pub async fn attach_tracks(&self, tracks: &LocalTracks) -> Result<(), MediaError> {
        for track in tracks.iter() {
            self.endpoint.attach_track(track).await?;
        }
        Ok(())
    }

    /// We call first: produce the local offer.
    pub async fn start_negotiation(&mut self) -> Result<SessionDescription, MediaError> {
        let offer = self.endpoint.create_offer().await?;
        self.state = MediaConnectionState::Negotiating;
        Ok(offer)
    }

    /// They called first: consume the offer, produce the answer, then flush
    /// any candidates that raced ahead of it.
    pub async fn handle_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, MediaError> {
        let answer = self.endpoint.answer_offer(offer).await?;
        self.state = MediaConnectionState::Negotiating;
        self.has_remote_description = true;
        self.flush_pending_candidates().await;
        Ok(answer)
    }

    pub async fn handle_answer(&mut self, answer: SessionDescription) -> Result<(), MediaError> {
        self.endpoint.accept_answer(answer).await?;
        self.has_remote_description = true;
        self.flush_pending_candidates().await;
        Ok(())
    }

    pub async fn handle_candidate(&mut self, candidate: IceCandidate) -> Result<(), MediaError> {
        if self.has_remote_description {
            self.endpoint.add_remote_candidate(candidate).await
        } else {
            self.pending_candidates.push(candidate);
            Ok(())
        }
    }

    async fn flush_pending_candidates(&mut self) {
        for candidate in self.pending_candidates.drain(..) {
            if let Err(e) = self.endpoint.add_remote_candidate(candidate).await {
                debug!(
                    participant_id = %self.participant_id,
                    "buffered candidate rejected: {e}"
                );
            }
        }
    }

    /// Swap outgoing tracks per kind; kinds not present in `tracks` are left
    /// untouched, so a video-only swap never disturbs the audio sender.
    pub async fn replace_track(&self, track: &LocalTrack) -> Result<(), MediaError> {
        self.endpoint.replace_track(track).await
    }

    pub async fn set_track_enabled(
        &self,
        kind: TrackKind,
        enabled: bool,
    ) -> Result<(), MediaError> {
        self.endpoint.set_track_enabled(kind, enabled).await
    }

    pub async fn close(&self) {
        self.endpoint.close().await;
    }
}

// ============================================================================
// TESTS
// ============================================================================
