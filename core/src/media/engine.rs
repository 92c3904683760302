//! Media engine seam.
//!
//! The meeting manager drives negotiation through these traits and never
//! touches the underlying stack directly. Production uses the webrtc-backed
//! engine in `rtc`; tests and chat-only sessions use `NullEngine`, which
//! negotiates placeholder descriptions in-process.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::signal::{IceCandidate, SessionDescription};

use super::track::{LocalTrack, RemoteStream, TrackKind};

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Negotiation failed: {0}")]
    Negotiation(String),
    #[error("Bad ICE candidate: {0}")]
    Candidate(String),
    #[error("Track operation failed: {0}")]
    Track(String),
    #[error("Engine failure: {0}")]
    Engine(String),
}

/// Asynchronous notifications from one endpoint, delivered to the manager's
/// event loop and applied there (never on the engine's threads).
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    /// The remote side's media arrived.
    RemoteStream {
        participant_id: String,
        stream: RemoteStream,
    },
    /// A locally gathered ICE candidate to trickle to the remote.
    LocalCandidate {
        participant_id: String,
        candidate: IceCandidate,
    },
    /// The transport underneath this endpoint established.
    Connected { participant_id: String },
    /// The underlying connection failed. Local to this endpoint; the manager
    /// logs it and leaves every other connection alone.
    Faulted {
        participant_id: String,
        reason: String,
    },
}

/// One participant's negotiation endpoint.
#[async_trait]
pub trait MediaEndpoint: Send + Sync {
    /// Produce a local offer (we call first).
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;
    /// Consume a remote offer and produce the answer (they called first).
    async fn answer_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, MediaError>;
    /// Consume the remote answer to our offer.
    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), MediaError>;
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;
    /// Attach a local track of a kind not yet attached.
    async fn attach_track(&self, track: &LocalTrack) -> Result<(), MediaError>;
    /// Swap the outgoing track of `track.kind` without renegotiating; other
    /// kinds are untouched. Attaches if the kind was never attached.
    async fn replace_track(&self, track: &LocalTrack) -> Result<(), MediaError>;
    /// Pause/resume the outgoing track of a kind (mute / camera-off).
    async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), MediaError>;
    async fn close(&self);
}

/// Mints endpoints. One endpoint per participant, owned by the manager.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_endpoint(
        &self,
        participant_id: &str,
        events: mpsc::UnboundedSender<EndpointEvent>,
    ) -> Result<Arc<dyn MediaEndpoint>, MediaError>;
}

// ============================================================================
// NULL ENGINE
// ============================================================================

/// In-process engine: negotiates placeholder descriptions and moves no media.
/// Used by tests to script endpoint behavior and by chat-only sessions.
#[derive(Default)]
pub struct NullEngine {
    endpoints: Mutex<HashMap<String, Arc<NullEndpoint>>>,
}

impl NullEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The endpoint minted for a participant, if any.
    pub fn endpoint(&self, participant_id: &str) -> Option<Arc<NullEndpoint>> {
        self.endpoints.lock().get(participant_id).cloned()
    }
}

#[async_trait]
impl MediaEngine for NullEngine {
    async fn create_endpoint(
        &self,
        participant_id: &str,
        events: mpsc::UnboundedSender<EndpointEvent>,
    ) -> Result<Arc<dyn MediaEndpoint>, MediaError> {
        let endpoint = Arc::new(NullEndpoint {
            participant_id: participant_id.to_string(),
            events,
            attached: Mutex::new(HashMap::new()),
            replacements: Mutex::new(Vec::new()),
            remote_candidates: Mutex::new(Vec::new()),
            offers_answered: Mutex::new(Vec::new()),
            answers_accepted: Mutex::new(Vec::new()),
            fail_negotiation: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.endpoints
            .lock()
            .insert(participant_id.to_string(), endpoint.clone());
        Ok(endpoint)
    }
}

/// Scriptable endpoint backing `NullEngine`.
pub struct NullEndpoint {
    participant_id: String,
    events: mpsc::UnboundedSender<EndpointEvent>,
    attached: Mutex<HashMap<TrackKind, LocalTrack>>,
    replacements: Mutex<Vec<LocalTrack>>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    offers_answered: Mutex<Vec<SessionDescription>>,
    answers_accepted: Mutex<Vec<SessionDescription>>,
    fail_negotiation: AtomicBool,
    closed: AtomicBool,
}

impl NullEndpoint {
    /// Make subsequent offer/answer calls fail (a "bad SDP" participant).
    pub fn fail_negotiation(&self) {
        self.fail_negotiation.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Currently attached track per kind.
    pub fn attached(&self, kind: TrackKind) -> Option<LocalTrack> {
        self.attached.lock().get(&kind).cloned()
    }

    /// Every track that went through `replace_track`, in order.
    pub fn replacements(&self) -> Vec<LocalTrack> {
        self.replacements.lock().clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.remote_candidates.lock().clone()
    }

    pub fn offers_answered(&self) -> Vec<SessionDescription> {
        self.offers_answered.lock().clone()
    }

    pub fn answers_accepted(&self) -> Vec<SessionDescription> {
        self.answers_accepted.lock().clone()
    }

    /// Script the arrival of the remote side's media.
    pub fn emit_remote_stream(&self, stream: RemoteStream) {
        let _ = self.events.send(EndpointEvent::RemoteStream {
            participant_id: self.participant_id.clone(),
            stream,
        });
    }

    /// Script a locally gathered candidate.
    pub fn emit_candidate(&self, candidate: IceCandidate) {
        let _ = self.events.send(EndpointEvent::LocalCandidate {
            participant_id: self.participant_id.clone(),
            candidate,
        });
    }

    /// Script the transport establishing.
    pub fn emit_connected(&self) {
        let _ = self.events.send(EndpointEvent::Connected {
            participant_id: self.participant_id.clone(),
        });
    }

    /// Script an endpoint-local fault.
    pub fn emit_fault(&self, reason: &str) {
        let _ = self.events.send(EndpointEvent::Faulted {
            participant_id: self.participant_id.clone(),
            reason: reason.to_string(),
        });
    }

    fn negotiation_guard(&self) -> Result<(), MediaError> {
        if self.fail_negotiation.load(Ordering::SeqCst) {
            Err(MediaError::Negotiation("scripted failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MediaEndpoint for NullEndpoint {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.negotiation_guard()?;
        Ok(SessionDescription::offer(format!(
            "v=0 null-offer to {}",
            self.participant_id
        )))
    }

    async fn answer_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, MediaError> {
        self.negotiation_guard()?;
        if offer.kind != "offer" {
            return Err(MediaError::Negotiation(format!(
                "expected offer, got {}",
                offer.kind
            )));
        }
        self.offers_answered.lock().push(offer);
        Ok(SessionDescription::answer(format!(
            "v=0 null-answer from {}",
            self.participant_id
        )))
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), MediaError> {
        self.negotiation_guard()?;
        if answer.kind != "answer" {
            return Err(MediaError::Negotiation(format!(
                "expected answer, got {}",
                answer.kind
            )));
        }
        self.answers_accepted.lock().push(answer);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.remote_candidates.lock().push(candidate);
        Ok(())
    }

    async fn attach_track(&self, track: &LocalTrack) -> Result<(), MediaError> {
        self.attached.lock().insert(track.kind, track.clone());
        Ok(())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<(), MediaError> {
        self.replacements.lock().push(track.clone());
        self.attached.lock().insert(track.kind, track.clone());
        Ok(())
    }

    async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), MediaError> {
        let mut attached = self.attached.lock();
        if let Some(track) = attached.get_mut(&kind) {
            track.enabled = enabled;
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// TESTS
// ============================================================================
