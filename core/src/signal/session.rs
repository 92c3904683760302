//! Transport session lifecycle.
//!
//! One logical channel (media signaling or chat) owns one `TransportSession`.
//! The session is a pure state machine: `apply` consumes an input and returns
//! the side effect the connection loop must perform. No I/O happens here,
//! which is what makes the lifecycle testable without any network stack.

use crate::backoff::{BackoffSchedule, NextAttempt};
use std::time::Duration;

/// Channel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No socket. `exhausted` marks the distinguished sub-state reached when
    /// the retry budget is spent; only an explicit connect leaves it.
    Disconnected { exhausted: bool },
    /// Dialing the endpoint, bounded by the connect timeout.
    Connecting,
    /// Socket open, handshake sent, waiting for acknowledgement.
    Authenticating,
    /// Handshake acknowledged; the channel is usable.
    Open,
    /// Caller-initiated teardown in progress; never auto-reconnects.
    Closing,
}

impl SessionState {
    pub fn is_open(&self) -> bool {
        matches!(self, SessionState::Open)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, SessionState::Disconnected { .. })
    }
}

/// Everything that can happen to a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    /// Caller asked to connect (initial or explicit retry).
    Connect,
    /// The physical socket reached open.
    SocketOpened,
    /// The remote acknowledged the handshake.
    HandshakeAck,
    /// The remote rejected the handshake.
    HandshakeRejected { reason: String },
    /// The socket dropped. `normal` distinguishes a clean remote close
    /// (never reconnects) from a fault (reconnects while budget remains).
    Dropped { reason: String, normal: bool },
    /// The pending reconnect timer fired.
    ReconnectDue,
    /// Caller asked to tear the channel down.
    Disconnect,
    /// The socket finished closing after a teardown request.
    SocketClosed,
}

/// The side effect the connection loop must perform after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Nothing to do (also covers ignored stale inputs).
    None,
    /// Dial a new socket.
    StartConnect,
    /// Send the channel handshake payload.
    SendHandshake,
    /// Arm the reconnect timer. `attempt` is the failure count so far,
    /// suitable for "reconnecting (attempt N/M)" surfaces.
    ScheduleReconnect { delay: Duration, attempt: u32 },
    /// Retry budget spent; stop and surface the exhausted state.
    GiveUp,
    /// Handshake rejected; close the socket, do not retry.
    AuthFailed { reason: String },
    /// Close the socket as part of caller teardown.
    CloseSocket,
}

/// State machine for one logical relay channel.
#[derive(Debug)]
pub struct TransportSession {
    state: SessionState,
    attempt: u32,
    backoff: BackoffSchedule,
    last_error: Option<String>,
}

impl TransportSession {
    pub fn new(backoff: BackoffSchedule) -> Self {
        Self {
            state: SessionState::Disconnected { exhausted: false },
            attempt: 0,
            backoff,
            last_error: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Consecutive failed attempts since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.backoff.max_attempts()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// The single transition function. Inputs that make no sense in the
    /// current state (stale timers, duplicate connects) are ignored.
    pub fn apply(&mut self, input: SessionInput) -> SessionAction {
        use SessionInput as In;
        use SessionState as St;

        match (self.state, input) {
            // Explicit connect: only meaningful while fully disconnected.
            // A fresh campaign resets the attempt budget, otherwise a retry
            // from the exhausted sub-state would give up immediately.
            (St::Disconnected { .. }, In::Connect) => {
                self.attempt = 0;
                self.last_error = None;
                self.state = St::Connecting;
                SessionAction::StartConnect
            }
            // Idempotent no-op while connecting/authenticating/open/closing.
            (_, In::Connect) => SessionAction::None,

            (St::Connecting, In::SocketOpened) => {
                self.state = St::Authenticating;
                SessionAction::SendHandshake
            }
            (_, In::SocketOpened) => SessionAction::None,

            (St::Authenticating, In::HandshakeAck) => {
                self.attempt = 0;
                self.last_error = None;
                self.state = St::Open;
                SessionAction::None
            }
            (_, In::HandshakeAck) => SessionAction::None,

            (St::Authenticating, In::HandshakeRejected { reason }) => {
                self.last_error = Some(reason.clone());
                self.state = St::Disconnected { exhausted: false };
                SessionAction::AuthFailed { reason }
            }
            (_, In::HandshakeRejected { .. }) => SessionAction::None,

            (St::Connecting | St::Authenticating | St::Open, In::Dropped { reason, normal }) => {
                self.last_error = Some(reason);
                if normal {
                    self.state = St::Disconnected { exhausted: false };
                    return SessionAction::None;
                }
                let failures_so_far = self.attempt;
                self.attempt += 1;
                match self.backoff.next_attempt(failures_so_far) {
                    NextAttempt::Retry(delay) => {
                        self.state = St::Disconnected { exhausted: false };
                        SessionAction::ScheduleReconnect {
                            delay,
                            attempt: self.attempt,
                        }
                    }
                    NextAttempt::GiveUp => {
                        self.state = St::Disconnected { exhausted: true };
                        SessionAction::GiveUp
                    }
                }
            }
            // A drop while closing just completes the teardown.
            (St::Closing, In::Dropped { .. }) => {
                self.state = St::Disconnected { exhausted: false };
                SessionAction::None
            }
            (St::Disconnected { .. }, In::Dropped { .. }) => SessionAction::None,

            (St::Disconnected { exhausted: false }, In::ReconnectDue) => {
                self.state = St::Connecting;
                SessionAction::StartConnect
            }
            (_, In::ReconnectDue) => SessionAction::None,

            (St::Connecting | St::Authenticating | St::Open, In::Disconnect) => {
                self.state = St::Closing;
                SessionAction::CloseSocket
            }
            (_, In::Disconnect) => SessionAction::None,

            (St::Closing, In::SocketClosed) => {
                self.state = St::Disconnected { exhausted: false };
                SessionAction::None
            }
            (_, In::SocketClosed) => SessionAction::None,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
