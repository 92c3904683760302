//! Reconnecting relay channel client.
//!
//! One `SignalClient` owns one logical channel: it dials sockets through a
//! `SocketConnector`, performs the channel handshake, keeps the connection
//! alive, and reconnects with backoff after faults. All mutable state lives
//! in a single event-loop task; handles only enqueue commands, so every
//! transition is applied sequentially.
//!
//! Stale async completions are fenced with a generation counter: every
//! teardown and every dial bumps it, and a dial result carrying an old
//! generation is closed and ignored instead of mutating a superseded session.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Sleep, interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backoff::BackoffSchedule;

use super::protocol::SignalMessage;
use super::session::{SessionAction, SessionInput, SessionState, TransportSession};
use super::socket::{SignalSocket, SocketConnector, SocketError, SocketEvent, CLOSE_NORMAL};

#[derive(Debug, Error)]
pub enum SignalError {
    /// The channel is not `Open`; nothing was queued.
    #[error("Not connected")]
    NotConnected,
    #[error("Send failed: {0}")]
    SendFailed(String),
    /// The client task is gone (torn down or panicked).
    #[error("Channel closed")]
    ChannelClosed,
}

/// Static description of one logical channel.
pub struct ChannelConfig {
    /// WebSocket endpoint (or `mem://` for the in-process backend).
    pub url: String,
    /// Handshake payload sent immediately after the socket opens.
    pub handshake: SignalMessage,
    /// Whether the remote acknowledges the handshake (`auth-ok`). When
    /// false the handshake counts as acknowledged once written.
    pub expects_ack: bool,
    pub backoff: BackoffSchedule,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
}

impl ChannelConfig {
    pub fn new(url: String, handshake: SignalMessage, expects_ack: bool) -> Self {
        Self {
            url,
            handshake,
            expects_ack,
            backoff: BackoffSchedule::default(),
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

/// Events surfaced to the channel owner.
#[derive(Debug)]
pub enum SignalEvent {
    /// The session moved to a new state. Emitted on every transition so a
    /// UI can render "reconnecting (attempt N/M)" continuously.
    State { state: SessionState, attempt: u32 },
    /// A frame arrived while the channel was open.
    Message(SignalMessage),
    /// The handshake was rejected; terminal for this session.
    AuthFailed { reason: String },
}

enum Command {
    Connect,
    Send(SignalMessage, oneshot::Sender<Result<(), SignalError>>),
    Disconnect,
}

struct Shared {
    state: parking_lot::RwLock<(SessionState, u32)>,
}

/// Cloneable handle to a channel's event loop.
#[derive(Clone)]
pub struct SignalClient {
    cmd_tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
}

impl SignalClient {
    /// Spawn the channel loop. The returned receiver carries every event the
    /// channel emits; dropping both the handle and the receiver tears the
    /// loop down.
    pub fn spawn(
        config: ChannelConfig,
        connector: Arc<dyn SocketConnector>,
    ) -> (Self, mpsc::UnboundedReceiver<SignalEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: parking_lot::RwLock::new((SessionState::Disconnected { exhausted: false }, 0)),
        });

        let worker = ChannelLoop {
            session: TransportSession::new(config.backoff),
            config,
            connector,
            cmd_rx,
            event_tx,
            shared: shared.clone(),
        };
        tokio::spawn(worker.run());

        (Self { cmd_tx, shared }, event_rx)
    }

    /// Current session state (mirror, cheap to read).
    pub fn state(&self) -> SessionState {
        self.shared.state.read().0
    }

    /// Failed attempts since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.shared.state.read().1
    }

    /// Ask the channel to connect. Idempotent while already
    /// connecting/authenticating/open.
    pub async fn connect(&self) -> Result<(), SignalError> {
        self.cmd_tx
            .send(Command::Connect)
            .await
            .map_err(|_| SignalError::ChannelClosed)
    }

    /// Send a frame. Fails fast with `NotConnected` when the channel is not
    /// open; nothing is ever queued for later delivery.
    pub async fn send(&self, msg: SignalMessage) -> Result<(), SignalError> {
        if !self.state().is_open() {
            return Err(SignalError::NotConnected);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send(msg, reply_tx))
            .await
            .map_err(|_| SignalError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SignalError::ChannelClosed)?
    }

    /// Tear the channel down. No reconnect, idempotent, safe to race with an
    /// in-flight connect attempt.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect).await;
    }
}

// ============================================================================
// EVENT LOOP
// ============================================================================

type DialResult = (u64, Result<Box<dyn SignalSocket>, SocketError>);

struct ChannelLoop {
    config: ChannelConfig,
    connector: Arc<dyn SocketConnector>,
    session: TransportSession,
    cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::UnboundedSender<SignalEvent>,
    shared: Arc<Shared>,
}

impl ChannelLoop {
    async fn run(mut self) {
        let mut socket: Option<Box<dyn SignalSocket>> = None;
        let mut generation: u64 = 0;
        let mut reconnect_timer: Option<Pin<Box<Sleep>>> = None;
        let (dial_tx, mut dial_rx) = mpsc::channel::<DialResult>(4);
        let mut keepalive = interval(self.config.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let open = self.session.state().is_open();
            let has_socket = socket.is_some();
            let timer_armed = reconnect_timer.is_some();

            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        None => {
                            // All handles dropped: release the socket and stop.
                            generation += 1;
                            if let Some(mut s) = socket.take() {
                                s.close().await;
                            }
                            break;
                        }
                        Some(Command::Connect) => {
                            self.drive(
                                SessionInput::Connect,
                                &mut socket,
                                &mut generation,
                                &mut reconnect_timer,
                                &dial_tx,
                            )
                            .await;
                        }
                        Some(Command::Send(msg, reply)) => {
                            if !self.session.state().is_open() {
                                let _ = reply.send(Err(SignalError::NotConnected));
                            } else if let Some(sock) = socket.as_mut() {
                                match sock.send(&msg).await {
                                    Ok(()) => {
                                        let _ = reply.send(Ok(()));
                                    }
                                    Err(e) => {
                                        let _ = reply.send(Err(SignalError::SendFailed(
                                            e.to_string(),
                                        )));
                                        self.drive(
                                            SessionInput::Dropped {
                                                reason: format!("send failed: {e}"),
                                                normal: false,
                                            },
                                            &mut socket,
                                            &mut generation,
                                            &mut reconnect_timer,
                                            &dial_tx,
                                        )
                                        .await;
                                    }
                                }
                            } else {
                                let _ = reply.send(Err(SignalError::NotConnected));
                            }
                        }
                        Some(Command::Disconnect) => {
                            // Cancel any pending reconnect before touching the
                            // socket; a timer must never outlive a teardown.
                            reconnect_timer = None;
                            self.drive(
                                SessionInput::Disconnect,
                                &mut socket,
                                &mut generation,
                                &mut reconnect_timer,
                                &dial_tx,
                            )
                            .await;
                        }
                    }
                }

                Some((dial_generation, result)) = dial_rx.recv() => {
                    if dial_generation != generation {
                        // A teardown or newer dial superseded this attempt.
                        if let Ok(mut stale) = result {
                            stale.close().await;
                        }
                        debug!(url = %self.config.url, "ignoring stale dial result");
                        continue;
                    }
                    let input = match result {
                        Ok(new_socket) => {
                            socket = Some(new_socket);
                            SessionInput::SocketOpened
                        }
                        Err(e) => SessionInput::Dropped {
                            reason: e.to_string(),
                            normal: false,
                        },
                    };
                    self.drive(input, &mut socket, &mut generation, &mut reconnect_timer, &dial_tx)
                        .await;
                }

                event = next_socket_event(&mut socket), if has_socket => {
                    match event {
                        SocketEvent::Message(msg) => {
                            self.route_incoming(
                                msg,
                                &mut socket,
                                &mut generation,
                                &mut reconnect_timer,
                                &dial_tx,
                            )
                            .await;
                        }
                        SocketEvent::Malformed(raw) => {
                            // Protocol violation: drop the frame, keep the
                            // channel open.
                            warn!(url = %self.config.url, "dropping malformed frame: {raw}");
                        }
                        SocketEvent::Closed { code, reason } => {
                            let input = if matches!(self.session.state(), SessionState::Closing) {
                                SessionInput::SocketClosed
                            } else {
                                SessionInput::Dropped {
                                    reason: format!("socket closed ({code:?}): {reason}"),
                                    normal: code == Some(CLOSE_NORMAL),
                                }
                            };
                            socket = None;
                            self.drive(input, &mut socket, &mut generation, &mut reconnect_timer, &dial_tx)
                                .await;
                        }
                    }
                }

                () = wait_reconnect(&mut reconnect_timer), if timer_armed => {
                    reconnect_timer = None;
                    self.drive(
                        SessionInput::ReconnectDue,
                        &mut socket,
                        &mut generation,
                        &mut reconnect_timer,
                        &dial_tx,
                    )
                    .await;
                }

                _ = keepalive.tick(), if open && has_socket => {
                    let failed = match socket.as_mut() {
                        Some(sock) => sock.send(&SignalMessage::Ping).await.err(),
                        None => None,
                    };
                    if let Some(e) = failed {
                        self.drive(
                            SessionInput::Dropped {
                                reason: format!("keepalive failed: {e}"),
                                normal: false,
                            },
                            &mut socket,
                            &mut generation,
                            &mut reconnect_timer,
                            &dial_tx,
                        )
                        .await;
                    }
                }
            }
        }
    }

    /// Route a frame received off the socket.
    async fn route_incoming(
        &mut self,
        msg: SignalMessage,
        socket: &mut Option<Box<dyn SignalSocket>>,
        generation: &mut u64,
        reconnect_timer: &mut Option<Pin<Box<Sleep>>>,
        dial_tx: &mpsc::Sender<DialResult>,
    ) {
        match self.session.state() {
            SessionState::Authenticating => match msg {
                SignalMessage::AuthOk => {
                    self.drive(
                        SessionInput::HandshakeAck,
                        socket,
                        generation,
                        reconnect_timer,
                        dial_tx,
                    )
                    .await;
                }
                SignalMessage::AuthError { reason } => {
                    self.drive(
                        SessionInput::HandshakeRejected { reason },
                        socket,
                        generation,
                        reconnect_timer,
                        dial_tx,
                    )
                    .await;
                }
                other => {
                    debug!(url = %self.config.url, "dropping pre-auth frame: {other:?}");
                }
            },
            SessionState::Open => match msg {
                SignalMessage::Pong => {
                    debug!(url = %self.config.url, "keepalive pong");
                }
                SignalMessage::Ping => {
                    // Remote-initiated keepalive; answer and stay quiet.
                    if let Some(sock) = socket.as_mut() {
                        let _ = sock.send(&SignalMessage::Pong).await;
                    }
                }
                other => {
                    let _ = self.event_tx.send(SignalEvent::Message(other));
                }
            },
            state => {
                debug!(url = %self.config.url, ?state, "dropping frame outside open session");
            }
        }
    }

    /// Apply an input, perform the resulting action, and keep going while
    /// actions produce follow-up inputs (e.g. a handshake that needs no ack).
    async fn drive(
        &mut self,
        input: SessionInput,
        socket: &mut Option<Box<dyn SignalSocket>>,
        generation: &mut u64,
        reconnect_timer: &mut Option<Pin<Box<Sleep>>>,
        dial_tx: &mpsc::Sender<DialResult>,
    ) {
        let mut next = Some(input);
        while let Some(input) = next {
            // A drop invalidates the socket and fences stale completions
            // before the state machine even looks at it.
            if matches!(input, SessionInput::Dropped { .. }) {
                *generation += 1;
                if let Some(mut stale) = socket.take() {
                    stale.close().await;
                }
            }

            let before = self.session.state();
            let action = self.session.apply(input);
            let after = self.session.state();
            if after != before {
                self.publish_state(after);
            }

            next = match action {
                SessionAction::None => None,
                SessionAction::StartConnect => {
                    *reconnect_timer = None;
                    *generation += 1;
                    self.spawn_dial(*generation, dial_tx);
                    None
                }
                SessionAction::SendHandshake => match socket.as_mut() {
                    Some(sock) => match sock.send(&self.config.handshake).await {
                        Ok(()) => {
                            if self.config.expects_ack {
                                None
                            } else {
                                Some(SessionInput::HandshakeAck)
                            }
                        }
                        Err(e) => Some(SessionInput::Dropped {
                            reason: format!("handshake send failed: {e}"),
                            normal: false,
                        }),
                    },
                    None => Some(SessionInput::Dropped {
                        reason: "socket vanished before handshake".to_string(),
                        normal: false,
                    }),
                },
                SessionAction::ScheduleReconnect { delay, attempt } => {
                    info!(
                        url = %self.config.url,
                        attempt,
                        max = self.session.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "reconnect scheduled"
                    );
                    // Replacing the timer cancels any prior pending one.
                    *reconnect_timer = Some(Box::pin(tokio::time::sleep(delay)));
                    None
                }
                SessionAction::GiveUp => {
                    warn!(url = %self.config.url, "retry budget exhausted; giving up");
                    *reconnect_timer = None;
                    None
                }
                SessionAction::AuthFailed { reason } => {
                    warn!(url = %self.config.url, "handshake rejected: {reason}");
                    *generation += 1;
                    *reconnect_timer = None;
                    if let Some(mut sock) = socket.take() {
                        sock.close().await;
                    }
                    let _ = self.event_tx.send(SignalEvent::AuthFailed { reason });
                    None
                }
                SessionAction::CloseSocket => {
                    *generation += 1;
                    *reconnect_timer = None;
                    if let Some(mut sock) = socket.take() {
                        sock.close().await;
                    }
                    Some(SessionInput::SocketClosed)
                }
            };
        }
    }

    fn spawn_dial(&self, dial_generation: u64, dial_tx: &mpsc::Sender<DialResult>) {
        let connector = self.connector.clone();
        let url = self.config.url.clone();
        let timeout = self.config.connect_timeout;
        let dial_tx = dial_tx.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, connector.connect(&url)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(SocketError::ConnectTimeout),
            };
            let _ = dial_tx.send((dial_generation, result)).await;
        });
    }

    fn publish_state(&self, state: SessionState) {
        let attempt = self.session.attempt();
        *self.shared.state.write() = (state, attempt);
        let _ = self.event_tx.send(SignalEvent::State { state, attempt });
    }
}

async fn next_socket_event(socket: &mut Option<Box<dyn SignalSocket>>) -> SocketEvent {
    match socket.as_mut() {
        Some(sock) => sock.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_reconnect(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// TESTS
// ============================================================================
