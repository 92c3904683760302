//! Meeting manager: one instance per joined meeting.
//!
//! Owns the participant map and every per-participant media connection, and
//! funnels all mutation through its event loop: signaling frames, endpoint
//! events and caller commands are applied strictly sequentially, which is
//! what enforces "at most one connection per participant" mechanically.
//!
//! Failure policy: faults local to one participant (bad SDP, a failed peer
//! connection) are logged and contained. A signaling drop triggers the
//! channel's own backoff reconnect; established media connections are left
//! alone until an explicit `leave()` or a participant-left notice.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::signal::{
    ChannelConfig, SessionState, SignalClient, SignalError, SignalEvent, SignalMessage,
    SocketConnector,
};
use crate::Identity;

use super::connection::{MediaConnection, MediaConnectionState};
use super::engine::{EndpointEvent, MediaEngine, MediaError};
use super::track::{LocalTrack, LocalTracks, RemoteStream, TrackError, TrackKind};

#[derive(Debug, Error)]
pub enum MeetingError {
    /// The caller supplied no usable local tracks.
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(#[from] TrackError),
    /// Signaling never reached open (backoff exhausted or torn down).
    #[error("Signaling unavailable")]
    SignalingUnavailable,
    /// The relay rejected the join handshake.
    #[error("Join rejected: {0}")]
    JoinRejected(String),
    #[error("Bad endpoint configuration: {0}")]
    Endpoint(#[from] url::ParseError),
    /// The meeting was already left.
    #[error("Meeting closed")]
    Closed,
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Signal(#[from] SignalError),
}

/// A remote participant as the UI sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub connection_state: MediaConnectionState,
    pub muted: bool,
    pub video_off: bool,
    pub remote_stream: Option<RemoteStream>,
}

impl Participant {
    fn new(id: String, display_name: String) -> Self {
        Self {
            id,
            display_name,
            connection_state: MediaConnectionState::New,
            muted: false,
            video_off: false,
            remote_stream: None,
        }
    }
}

/// Upward events. Implementations must not block; they run on the manager's
/// event loop.
pub trait MeetingDelegate: Send + Sync {
    fn participant_joined(&self, participant: &Participant);
    fn participant_left(&self, participant_id: &str);
    fn stream_received(&self, participant_id: &str, stream: &RemoteStream);
    fn presence_changed(&self, participant: &Participant);
    /// Signaling channel state, surfaced continuously with the attempt
    /// counter so a UI can render "reconnecting (attempt N/M)".
    fn connection_state_changed(&self, state: SessionState, attempt: u32);
}

enum Command {
    ReplaceTracks(Vec<LocalTrack>, oneshot::Sender<Result<(), MeetingError>>),
    ToggleTrack(TrackKind, bool, oneshot::Sender<Result<(), MeetingError>>),
    Leave(oneshot::Sender<()>),
}

/// Handle to a joined meeting.
#[derive(Clone)]
pub struct PeerManager {
    cmd_tx: mpsc::Sender<Command>,
    roster: Arc<parking_lot::RwLock<HashMap<String, Participant>>>,
    signal: SignalClient,
}

impl PeerManager {
    /// Join a meeting: validate the supplied tracks, open the media-signaling
    /// channel and wait for it to reach open. Fails with `MediaAcquisition`
    /// when no tracks were supplied and `SignalingUnavailable` when the
    /// channel gives up before opening.
    pub async fn join(
        config: &ClientConfig,
        meeting_id: &str,
        identity: Identity,
        tracks: Vec<LocalTrack>,
        engine: Arc<dyn MediaEngine>,
        connector: Arc<dyn SocketConnector>,
        delegate: Arc<dyn MeetingDelegate>,
    ) -> Result<Self, MeetingError> {
        let local_tracks = LocalTracks::new(tracks)?;
        let url = config.media_channel_url(meeting_id, &identity.user_id)?;

        let handshake = SignalMessage::Join {
            meeting_id: meeting_id.to_string(),
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
        };
        let channel = ChannelConfig {
            url,
            handshake,
            expects_ack: false,
            backoff: config.backoff(),
            connect_timeout: config.connect_timeout(),
            keepalive_interval: config.keepalive_interval(),
        };

        let (signal, signal_events) = SignalClient::spawn(channel, connector);
        signal.connect().await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (endpoint_tx, endpoint_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let roster = Arc::new(parking_lot::RwLock::new(HashMap::new()));

        let worker = ManagerLoop {
            identity,
            local_tracks,
            engine,
            signal: signal.clone(),
            signal_events,
            endpoint_tx,
            endpoint_rx,
            cmd_rx,
            delegate,
            connections: HashMap::new(),
            participants: HashMap::new(),
            roster: roster.clone(),
            ready: Some(ready_tx),
        };
        tokio::spawn(worker.run());

        info!(meeting_id, "joining meeting");
        ready_rx.await.map_err(|_| MeetingError::SignalingUnavailable)??;

        Ok(Self {
            cmd_tx,
            roster,
            signal,
        })
    }

    /// Snapshot of the current roster.
    pub fn participants(&self) -> Vec<Participant> {
        self.roster.read().values().cloned().collect()
    }

    /// Current media-signaling channel state.
    pub fn connection_state(&self) -> SessionState {
        self.signal.state()
    }

    /// Explicit retry; the only way out of the exhausted disconnected state.
    /// A no-op while the channel is already connecting or open.
    pub async fn reconnect(&self) -> Result<(), MeetingError> {
        Ok(self.signal.connect().await?)
    }

    /// Atomically swap outgoing tracks per kind on every active connection.
    /// Kinds absent from `tracks` are untouched.
    pub async fn replace_local_tracks(
        &self,
        tracks: Vec<LocalTrack>,
    ) -> Result<(), MeetingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ReplaceTracks(tracks, reply_tx))
            .await
            .map_err(|_| MeetingError::Closed)?;
        reply_rx.await.map_err(|_| MeetingError::Closed)?
    }

    /// Flip the enabled flag of the local track of `kind` everywhere and
    /// broadcast the resulting presence state.
    pub async fn toggle_track(&self, kind: TrackKind, enabled: bool) -> Result<(), MeetingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ToggleTrack(kind, enabled, reply_tx))
            .await
            .map_err(|_| MeetingError::Closed)?;
        reply_rx.await.map_err(|_| MeetingError::Closed)?
    }

    /// Close every media connection and the signaling channel. Idempotent;
    /// no events are surfaced afterwards.
    pub async fn leave(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Leave(reply_tx)).await.is_ok() {
            let _ = reply_rx.await;
        }
    }
}

// ============================================================================
// EVENT LOOP
// ============================================================================

struct ManagerLoop {
    identity: Identity,
    local_tracks: LocalTracks,
    engine: Arc<dyn MediaEngine>,
    signal: SignalClient,
    signal_events: mpsc::UnboundedReceiver<SignalEvent>,
    endpoint_tx: mpsc::UnboundedSender<EndpointEvent>,
    endpoint_rx: mpsc::UnboundedReceiver<EndpointEvent>,
    cmd_rx: mpsc::Receiver<Command>,
    delegate: Arc<dyn MeetingDelegate>,
    connections: HashMap<String, MediaConnection>,
    participants: HashMap<String, Participant>,
    roster: Arc<parking_lot::RwLock<HashMap<String, Participant>>>,
    ready: Option<oneshot::Sender<Result<(), MeetingError>>>,
}

impl ManagerLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        None => {
                            self.teardown().await;
                            break;
                        }
                        Some(Command::Leave(reply)) => {
                            self.teardown().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(Command::ReplaceTracks(tracks, reply)) => {
                            let result = self.replace_tracks(tracks).await;
                            let _ = reply.send(result);
                        }
                        Some(Command::ToggleTrack(kind, enabled, reply)) => {
                            let result = self.toggle_track(kind, enabled).await;
                            let _ = reply.send(result);
                        }
                    }
                }
                maybe_event = self.signal_events.recv() => {
                    match maybe_event {
                        None => {
                            // The channel loop is gone; nothing left to drive.
                            self.teardown().await;
                            break;
                        }
                        Some(SignalEvent::State { state, attempt }) => {
                            self.on_signal_state(state, attempt);
                        }
                        Some(SignalEvent::Message(msg)) => {
                            self.on_signal_message(msg).await;
                        }
                        Some(SignalEvent::AuthFailed { reason }) => {
                            if let Some(ready) = self.ready.take() {
                                let _ = ready.send(Err(MeetingError::JoinRejected(reason)));
                            } else {
                                warn!("media channel rejected mid-session: {reason}");
                            }
                        }
                    }
                }
                Some(event) = self.endpoint_rx.recv() => {
                    self.on_endpoint_event(event).await;
                }
            }
        }
    }

    fn on_signal_state(&mut self, state: SessionState, attempt: u32) {
        self.delegate.connection_state_changed(state, attempt);
        match state {
            SessionState::Open => {
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(Ok(()));
                }
            }
            SessionState::Disconnected { exhausted: true } => {
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(Err(MeetingError::SignalingUnavailable));
                }
                // Established media connections stay up; ICE continues
                // independently of the signaling channel.
            }
            SessionState::Disconnected { exhausted: false } if attempt == 0 => {
                // Closed without a retry pending (normal close or teardown)
                // before ever opening: the join cannot complete.
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(Err(MeetingError::SignalingUnavailable));
                }
            }
            _ => {}
        }
    }

    async fn on_signal_message(&mut self, msg: SignalMessage) {
        match msg {
            SignalMessage::Joined {
                participant_id,
                display_name,
            } => {
                self.on_participant_joined(participant_id, display_name).await;
            }
            SignalMessage::Left { participant_id } => {
                self.on_participant_left(&participant_id).await;
            }
            SignalMessage::Offer {
                participant_id,
                sdp,
            } => {
                self.on_offer(participant_id, sdp).await;
            }
            SignalMessage::Answer {
                participant_id,
                sdp,
            } => {
                // Answers for unknown participants are an expected race (the
                // participant already left); drop without creating anything.
                match self.connections.get_mut(&participant_id) {
                    Some(connection) => {
                        if let Err(e) = connection.handle_answer(sdp).await {
                            warn!(%participant_id, "answer rejected: {e}");
                        }
                    }
                    None => {
                        debug!(%participant_id, "dropping answer for unknown participant");
                    }
                }
            }
            SignalMessage::IceCandidate {
                participant_id,
                candidate,
            } => match self.connections.get_mut(&participant_id) {
                Some(connection) => {
                    if let Err(e) = connection.handle_candidate(candidate).await {
                        debug!(%participant_id, "candidate rejected: {e}");
                    }
                }
                None => {
                    debug!(%participant_id, "dropping candidate for unknown participant");
                }
            },
            SignalMessage::Presence {
                participant_id,
                muted,
                video_off,
            } => {
                if let Some(participant) = self.participants.get_mut(&participant_id) {
                    participant.muted = muted;
                    participant.video_off = video_off;
                    let snapshot = participant.clone();
                    self.sync_roster();
                    self.delegate.presence_changed(&snapshot);
                } else {
                    debug!(%participant_id, "presence for unknown participant");
                }
            }
            other => {
                debug!("unexpected frame on media channel: {other:?}");
            }
        }
    }

    async fn on_participant_joined(&mut self, participant_id: String, display_name: String) {
        if participant_id == self.identity.user_id {
            return;
        }
        if self.connections.contains_key(&participant_id) {
            // Idempotent join: keep the existing connection and surface no
            // duplicate event. A name can still land late (offer-first race).
            if let Some(participant) = self.participants.get_mut(&participant_id) {
                if participant.display_name != display_name {
                    participant.display_name = display_name;
                    self.sync_roster();
                }
            }
            debug!(%participant_id, "duplicate join ignored");
            return;
        }

        let mut connection = match self.create_connection(&participant_id).await {
            Some(connection) => connection,
            None => return,
        };

        // Whoever observes the join makes the offer.
        let offer = match connection.start_negotiation().await {
            Ok(offer) => Some(offer),
            Err(e) => {
                warn!(%participant_id, "offer creation failed: {e}");
                None
            }
        };

        let mut participant = Participant::new(participant_id.clone(), display_name);
        participant.connection_state = connection.state();
        self.connections.insert(participant_id.clone(), connection);
        self.participants
            .insert(participant_id.clone(), participant.clone());
        self.sync_roster();
        self.delegate.participant_joined(&participant);

        if let Some(sdp) = offer {
            if let Err(e) = self
                .signal
                .send(SignalMessage::Offer {
                    participant_id: participant_id.clone(),
                    sdp,
                })
                .await
            {
                warn!(%participant_id, "offer send failed: {e}");
            }
        }
    }

    async fn on_participant_left(&mut self, participant_id: &str) {
        match self.connections.remove(participant_id) {
            Some(connection) => {
                connection.close().await;
                self.participants.remove(participant_id);
                self.sync_roster();
                self.delegate.participant_left(participant_id);
            }
            None => {
                debug!(%participant_id, "left notice for unknown participant");
            }
        }
    }

    async fn on_offer(&mut self, participant_id: String, sdp: crate::signal::SessionDescription) {
        // An offer for an unknown participant is an out-of-order join:
        // create the connection first, with a provisional display name.
        if !self.connections.contains_key(&participant_id) {
            let connection = match self.create_connection(&participant_id).await {
                Some(connection) => connection,
                None => return,
            };
            self.connections.insert(participant_id.clone(), connection);
            let participant =
                Participant::new(participant_id.clone(), participant_id.clone());
            self.participants
                .insert(participant_id.clone(), participant.clone());
            self.sync_roster();
            self.delegate.participant_joined(&participant);
        }

        let answer = match self.connections.get_mut(&participant_id) {
            Some(connection) => match connection.handle_offer(sdp).await {
                Ok(answer) => answer,
                Err(e) => {
                    // Local to this participant; every other connection is
                    // unaffected.
                    warn!(%participant_id, "offer rejected: {e}");
                    return;
                }
            },
            None => return,
        };

        if let Some(participant) = self.participants.get_mut(&participant_id) {
            participant.connection_state = MediaConnectionState::Negotiating;
        }
        self.sync_roster();

        if let Err(e) = self
            .signal
            .send(SignalMessage::Answer {
                participant_id: participant_id.clone(),
                sdp: answer,
            })
            .await
        {
            warn!(%participant_id, "answer send failed: {e}");
        }
    }

    async fn create_connection(&self, participant_id: &str) -> Option<MediaConnection> {
        let endpoint = match self
            .engine
            .create_endpoint(participant_id, self.endpoint_tx.clone())
            .await
        {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(%participant_id, "endpoint creation failed: {e}");
                return None;
            }
        };
        let connection = MediaConnection::new(participant_id.to_string(), endpoint);
        if let Err(e) = connection.attach_tracks(&self.local_tracks).await {
            warn!(%participant_id, "track attach failed: {e}");
        }
        Some(connection)
    }

    async fn on_endpoint_event(&mut self, event: EndpointEvent) {
        match event {
            EndpointEvent::RemoteStream {
                participant_id,
                stream,
            } => {
                let Some(participant) = self.participants.get_mut(&participant_id) else {
                    debug!(%participant_id, "stream for unknown participant");
                    return;
                };
                // Merge into the existing stream record instead of replacing
                // other state: tracks accumulate per stream id.
                let merged = match participant.remote_stream.take() {
                    Some(mut existing) if existing.id == stream.id => {
                        for track in stream.tracks {
                            if !existing.tracks.iter().any(|t| t.id == track.id) {
                                existing.tracks.push(track);
                            }
                        }
                        existing
                    }
                    _ => stream,
                };
                participant.remote_stream = Some(merged.clone());
                self.sync_roster();
                self.delegate.stream_received(&participant_id, &merged);
            }
            EndpointEvent::LocalCandidate {
                participant_id,
                candidate,
            } => {
                if let Err(e) = self
                    .signal
                    .send(SignalMessage::IceCandidate {
                        participant_id: participant_id.clone(),
                        candidate,
                    })
                    .await
                {
                    // Signaling is transiently down; the candidate is lost
                    // but media on established connections keeps flowing.
                    debug!(%participant_id, "candidate send failed: {e}");
                }
            }
            EndpointEvent::Connected { participant_id } => {
                if let Some(connection) = self.connections.get_mut(&participant_id) {
                    connection.mark_connected();
                }
                if let Some(participant) = self.participants.get_mut(&participant_id) {
                    participant.connection_state = MediaConnectionState::Connected;
                }
                self.sync_roster();
            }
            EndpointEvent::Faulted {
                participant_id,
                reason,
            } => {
                // Contained: never tears down the manager or other
                // participants' connections.
                warn!(%participant_id, "media connection fault: {reason}");
                if let Some(connection) = self.connections.get_mut(&participant_id) {
                    connection.mark_failed();
                }
                if let Some(participant) = self.participants.get_mut(&participant_id) {
                    participant.connection_state = MediaConnectionState::Failed;
                }
                self.sync_roster();
            }
        }
    }

    async fn replace_tracks(&mut self, tracks: Vec<LocalTrack>) -> Result<(), MeetingError> {
        // Per-kind validation; an empty swap is a no-op, not an error.
        let mut seen = Vec::new();
        for track in &tracks {
            if seen.contains(&track.kind) {
                return Err(TrackError::DuplicateKind(track.kind).into());
            }
            seen.push(track.kind);
        }

        let mut first_error: Option<MediaError> = None;
        for track in tracks {
            self.local_tracks.set(track.clone());
            for connection in self.connections.values() {
                if let Err(e) = connection.replace_track(&track).await {
                    warn!(
                        participant_id = %connection.participant_id(),
                        kind = %track.kind,
                        "track replacement failed: {e}"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn toggle_track(
        &mut self,
        kind: TrackKind,
        enabled: bool,
    ) -> Result<(), MeetingError> {
        if !self.local_tracks.set_enabled(kind, enabled) {
            debug!(%kind, "toggle for a kind with no local track");
            return Ok(());
        }
        for connection in self.connections.values() {
            if let Err(e) = connection.set_track_enabled(kind, enabled).await {
                warn!(
                    participant_id = %connection.participant_id(),
                    "toggle failed: {e}"
                );
            }
        }

        let muted = !self
            .local_tracks
            .get(TrackKind::Audio)
            .map(|t| t.enabled)
            .unwrap_or(false);
        let video_off = !self
            .local_tracks
            .get(TrackKind::Video)
            .map(|t| t.enabled)
            .unwrap_or(false);
        // Presence is best-effort: a reconnecting channel just misses one
        // update, the next toggle re-broadcasts.
        if let Err(e) = self
            .signal
            .send(SignalMessage::Presence {
                participant_id: self.identity.user_id.clone(),
                muted,
                video_off,
            })
            .await
        {
            debug!("presence broadcast failed: {e}");
        }
        Ok(())
    }

    async fn teardown(&mut self) {
        for (_, connection) in self.connections.drain() {
            connection.close().await;
        }
        self.participants.clear();
        self.sync_roster();
        self.signal.close().await;
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(MeetingError::Closed));
        }
    }

    fn sync_roster(&self) {
        *self.roster.write() = self.participants.clone();
    }
}

// ============================================================================
// TESTS
// ============================================================================
