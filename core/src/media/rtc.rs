//! Production media engine backed by the `webrtc` crate.
//!
//! Each endpoint wraps one `RTCPeerConnection` built with the default codec
//! and interceptor set. Local tracks are `TrackLocalStaticSample`s; the
//! sample writers live with the media-acquisition collaborator, so this
//! module only manages negotiation, senders and candidate trickle.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as CodecEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::IceServerConfig;
use crate::signal::{IceCandidate, SessionDescription};

use super::engine::{EndpointEvent, MediaEndpoint, MediaEngine, MediaError};
use super::track::{LocalTrack, RemoteStream, RemoteTrack, TrackKind};

/// Engine that mints one `RTCPeerConnection` per participant, configured with
/// the provided STUN/TURN servers.
pub struct RtcEngine {
    ice_servers: Vec<IceServerConfig>,
}

impl RtcEngine {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self { ice_servers }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = self
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaEngine for RtcEngine {
    async fn create_endpoint(
        &self,
        participant_id: &str,
        events: mpsc::UnboundedSender<EndpointEvent>,
    ) -> Result<Arc<dyn MediaEndpoint>, MediaError> {
        let mut codecs = CodecEngine::default();
        codecs
            .register_default_codecs()
            .map_err(|e| MediaError::Engine(format!("register codecs: {e}")))?;
        let registry = register_default_interceptors(Default::default(), &mut codecs)
            .map_err(|e| MediaError::Engine(format!("register interceptors: {e}")))?;
        let api = APIBuilder::new()
            .with_media_engine(codecs)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(self.rtc_configuration())
                .await
                .map_err(|e| MediaError::Engine(format!("new peer connection: {e}")))?,
        );

        // Candidate trickle: locally gathered candidates flow to the manager,
        // which relays them through signaling.
        {
            let events = events.clone();
            let participant_id = participant_id.to_string();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                let participant_id = participant_id.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events.send(EndpointEvent::LocalCandidate {
                                participant_id,
                                candidate: IceCandidate {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                    username_fragment: init.username_fragment,
                                },
                            });
                        }
                        Err(e) => warn!(%participant_id, "candidate to_json failed: {e}"),
                    }
                })
            }));
        }

        // Remote media: surface each incoming track as a one-track stream
        // carrying the remote's stream id.
        {
            let events = events.clone();
            let participant_id = participant_id.to_string();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let events = events.clone();
                let participant_id = participant_id.clone();
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(TrackKind::Audio),
                    RTPCodecType::Video => Some(TrackKind::Video),
                    _ => None,
                };
                let track_id = track.id();
                let stream_id = track.stream_id();
                Box::pin(async move {
                    let Some(kind) = kind else {
                        warn!(%participant_id, "ignoring track of unspecified kind");
                        return;
                    };
                    info!(%participant_id, %track_id, %kind, "remote track arrived");
                    let _ = events.send(EndpointEvent::RemoteStream {
                        participant_id,
                        stream: RemoteStream {
                            id: stream_id,
                            tracks: vec![RemoteTrack { id: track_id, kind }],
                        },
                    });
                })
            }));
        }

        {
            let events = events.clone();
            let participant_id = participant_id.to_string();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = events.clone();
                let participant_id = participant_id.clone();
                Box::pin(async move {
                    debug!(%participant_id, ?state, "peer connection state");
                    match state {
                        RTCPeerConnectionState::Connected => {
                            let _ = events.send(EndpointEvent::Connected { participant_id });
                        }
                        RTCPeerConnectionState::Failed => {
                            let _ = events.send(EndpointEvent::Faulted {
                                participant_id,
                                reason: "peer connection failed".to_string(),
                            });
                        }
                        _ => {}
                    }
                })
            }));
        }

        Ok(Arc::new(RtcEndpoint {
            participant_id: participant_id.to_string(),
            pc,
            senders: Mutex::new(HashMap::new()),
        }))
    }
}

struct RtcEndpoint {
    participant_id: String,
    pc: Arc<RTCPeerConnection>,
    /// One sender per kind, retained so replacement never renegotiates.
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
}

impl RtcEndpoint {
    fn build_local_track(&self, track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
        let capability = match track.kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        };
        Arc::new(TrackLocalStaticSample::new(
            capability,
            track.id.clone(),
            format!("stream-{}", self.participant_id),
        ))
    }

    async fn local_description(&self) -> Result<RTCSessionDescription, MediaError> {
        self.pc
            .local_description()
            .await
            .ok_or_else(|| MediaError::Negotiation("no local description".to_string()))
    }
}

#[async_trait]
impl MediaEndpoint for RtcEndpoint {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| MediaError::Negotiation(format!("create offer: {e}")))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| MediaError::Negotiation(format!("set local offer: {e}")))?;
        let local = self.local_description().await?;
        Ok(SessionDescription::offer(local.sdp))
    }

    async fn answer_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, MediaError> {
        if offer.kind != "offer" {
            return Err(MediaError::Negotiation(format!(
                "expected offer, got {}",
                offer.kind
            )));
        }
        let remote = RTCSessionDescription::offer(offer.sdp)
            .map_err(|e| MediaError::Negotiation(format!("parse offer: {e}")))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| MediaError::Negotiation(format!("set remote offer: {e}")))?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| MediaError::Negotiation(format!("create answer: {e}")))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| MediaError::Negotiation(format!("set local answer: {e}")))?;
        let local = self.local_description().await?;
        Ok(SessionDescription::answer(local.sdp))
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), MediaError> {
        if answer.kind != "answer" {
            return Err(MediaError::Negotiation(format!(
                "expected answer, got {}",
                answer.kind
            )));
        }
        let remote = RTCSessionDescription::answer(answer.sdp)
            .map_err(|e| MediaError::Negotiation(format!("parse answer: {e}")))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| MediaError::Negotiation(format!("set remote answer: {e}")))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| MediaError::Candidate(e.to_string()))
    }

    async fn attach_track(&self, track: &LocalTrack) -> Result<(), MediaError> {
        let local = self.build_local_track(track);
        let sender = self
            .pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| MediaError::Track(format!("add {} track: {e}", track.kind)))?;
        self.senders.lock().await.insert(track.kind, sender);
        debug!(participant_id = %self.participant_id, kind = %track.kind, "track attached");
        Ok(())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<(), MediaError> {
        let existing = self.senders.lock().await.get(&track.kind).cloned();
        match existing {
            Some(sender) => {
                let local = self.build_local_track(track);
                sender
                    .replace_track(Some(
                        Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>
                    ))
                    .await
                    .map_err(|e| MediaError::Track(format!("replace {} track: {e}", track.kind)))
            }
            // The kind was never attached; replacement degenerates to attach.
            None => self.attach_track(track).await,
        }
    }

    async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), MediaError> {
        // Pausing means the acquisition side stops writing samples; nothing
        // to flip on the sender itself. Logged so mute state is traceable.
        debug!(participant_id = %self.participant_id, %kind, enabled, "track enabled flag");
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(participant_id = %self.participant_id, "peer connection close: {e}");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
