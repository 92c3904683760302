//! Physical duplex sockets beneath a relay channel.
//!
//! The connection loop only sees the `SignalSocket`/`SocketConnector` traits.
//! Production uses the WebSocket backend; tests and in-process demos use the
//! memory backend, the same way the transport layer elsewhere ships a Local
//! variant alongside the real ones.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::protocol::{self, SignalMessage};

/// Close code for a clean, caller-intended shutdown.
pub const CLOSE_NORMAL: u16 = 1000;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Connect attempt timed out")]
    ConnectTimeout,
    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// What a socket read produced.
#[derive(Debug)]
pub enum SocketEvent {
    /// A well-formed frame.
    Message(SignalMessage),
    /// Unparseable payload, a protocol violation. The channel stays open;
    /// the caller logs and drops it.
    Malformed(String),
    /// The socket is gone. `code` is the close code if the peer sent one.
    Closed { code: Option<u16>, reason: String },
}

/// One physical duplex connection carrying `SignalMessage` frames.
#[async_trait]
pub trait SignalSocket: Send {
    async fn send(&mut self, msg: &SignalMessage) -> Result<(), SocketError>;
    /// Next event off the wire. After `Closed` the socket is dead.
    async fn recv(&mut self) -> SocketEvent;
    async fn close(&mut self);
}

/// Dials new sockets. The connection loop owns exactly one live socket at a
/// time; the connector exists so reconnects (and tests) can mint fresh ones.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn SignalSocket>, SocketError>;
}

// ============================================================================
// WEBSOCKET BACKEND
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production connector: WebSocket over TCP/TLS.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl SocketConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn SignalSocket>, SocketError> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| SocketError::ConnectFailed(e.to_string()))?;
        Ok(Box::new(WsSocket { stream }))
    }
}

pub struct WsSocket {
    stream: WsStream,
}

#[async_trait]
impl SignalSocket for WsSocket {
    async fn send(&mut self, msg: &SignalMessage) -> Result<(), SocketError> {
        let raw = protocol::encode(msg).map_err(|e| SocketError::SendFailed(e.to_string()))?;
        self.stream
            .send(WsMessage::Text(raw))
            .await
            .map_err(|e| SocketError::SendFailed(e.to_string()))
    }

    async fn recv(&mut self) -> SocketEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(raw))) => match protocol::decode(&raw) {
                    Ok(msg) => return SocketEvent::Message(msg),
                    Err(e) => return SocketEvent::Malformed(format!("{e}: {raw}")),
                },
                Some(Ok(WsMessage::Binary(_))) => {
                    return SocketEvent::Malformed("unexpected binary frame".to_string());
                }
                // Transport-level ping: answer and keep reading. Distinct
                // from the application-level {type:"ping"} keepalive.
                Some(Ok(WsMessage::Ping(payload))) => {
                    let _ = self.stream.send(WsMessage::Pong(payload)).await;
                }
                Some(Ok(WsMessage::Pong(_))) => {
                    debug!("transport pong");
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                        None => (None, String::new()),
                    };
                    return SocketEvent::Closed { code, reason };
                }
                Some(Ok(WsMessage::Frame(_))) => {
                    // Raw frames never surface from a configured client.
                }
                Some(Err(e)) => {
                    return SocketEvent::Closed {
                        code: None,
                        reason: e.to_string(),
                    };
                }
                None => {
                    return SocketEvent::Closed {
                        code: None,
                        reason: "stream ended".to_string(),
                    };
                }
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

// ============================================================================
// MEMORY BACKEND
// ============================================================================

/// In-process connector. Each successful `connect` yields a socket pair whose
/// far end is handed to the owner of the acceptor receiver, so a test (or an
/// embedded relay) can script the remote side.
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<ServerEnd>,
    /// Fail this many upcoming connect attempts before succeeding again.
    fail_connects: AtomicUsize,
    /// While non-zero, connect attempts hang until cancelled (drives
    /// connect-timeout paths).
    hold_connects: AtomicUsize,
}

impl MemoryConnector {
    /// Build a connector plus the acceptor stream of far ends.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                accept_tx,
                fail_connects: AtomicUsize::new(0),
                hold_connects: AtomicUsize::new(0),
            },
            accept_rx,
        )
    }

    /// Make the next `n` connect attempts fail immediately.
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` connect attempts hang until the caller's timeout
    /// cancels them.
    pub fn hold_next_connects(&self, n: usize) {
        self.hold_connects.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl SocketConnector for MemoryConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn SignalSocket>, SocketError> {
        if self
            .hold_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            std::future::pending::<()>().await;
        }
        if self
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SocketError::ConnectFailed("connection refused".to_string()));
        }

        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let (from_client_tx, from_client_rx) = mpsc::unbounded_channel();
        let server = ServerEnd {
            to_client: to_client_tx,
            from_client: from_client_rx,
        };
        self.accept_tx
            .send(server)
            .map_err(|_| SocketError::ConnectFailed("acceptor gone".to_string()))?;
        Ok(Box::new(MemorySocket {
            outbound: Some(from_client_tx),
            inbound: to_client_rx,
        }))
    }
}

/// The scripted far end of a memory socket.
pub struct ServerEnd {
    to_client: mpsc::UnboundedSender<SocketEvent>,
    from_client: mpsc::UnboundedReceiver<SignalMessage>,
}

impl ServerEnd {
    /// Push a frame to the client.
    pub fn send(&self, msg: SignalMessage) {
        let _ = self.to_client.send(SocketEvent::Message(msg));
    }

    /// Push an unparseable payload to the client.
    pub fn send_malformed(&self, raw: &str) {
        let _ = self.to_client.send(SocketEvent::Malformed(raw.to_string()));
    }

    /// Close the connection with the given code.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.to_client.send(SocketEvent::Closed {
            code: Some(code),
            reason: reason.to_string(),
        });
    }

    /// Next frame the client sent, or `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<SignalMessage> {
        self.from_client.recv().await
    }

    /// Non-blocking drain of everything the client has sent so far.
    pub fn drain(&mut self) -> Vec<SignalMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = self.from_client.try_recv() {
            out.push(msg);
        }
        out
    }
}

pub struct MemorySocket {
    outbound: Option<mpsc::UnboundedSender<SignalMessage>>,
    inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

#[async_trait]
impl SignalSocket for MemorySocket {
    async fn send(&mut self, msg: &SignalMessage) -> Result<(), SocketError> {
        match &self.outbound {
            Some(tx) => tx
                .send(msg.clone())
                .map_err(|_| SocketError::SendFailed("peer gone".to_string())),
            None => Err(SocketError::SendFailed("socket closed".to_string())),
        }
    }

    async fn recv(&mut self) -> SocketEvent {
        match self.inbound.recv().await {
            Some(event) => event,
            None => SocketEvent::Closed {
                code: None,
                reason: "peer dropped".to_string(),
            },
        }
    }

    async fn close(&mut self) {
        self.outbound = None;
        self.inbound.close();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_exchanges_frames() {
        let (connector, mut accept_rx) = MemoryConnector::pair();
        let mut client = connector.connect("mem://test").await.unwrap();
        let mut server = accept_rx.recv().await.unwrap();

        client.send(&SignalMessage::Ping).await.unwrap();
        assert_eq!(server.recv().await, Some(SignalMessage::Ping));

        server.send(SignalMessage::Pong);
        match client.recv().await {
            SocketEvent::Message(SignalMessage::Pong) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_memory_close_reaches_client() {
        let (connector, mut accept_rx) = MemoryConnector::pair();
        let mut client = connector.connect("mem://test").await.unwrap();
        let server = accept_rx.recv().await.unwrap();

        server.close(1006, "lost");
        match client.recv().await {
            SocketEvent::Closed { code, reason } => {
                assert_eq!(code, Some(1006));
                assert_eq!(reason, "lost");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_memory_server_drop_looks_like_abnormal_close() {
        let (connector, mut accept_rx) = MemoryConnector::pair();
        let mut client = connector.connect("mem://test").await.unwrap();
        drop(accept_rx.recv().await.unwrap());

        match client.recv().await {
            SocketEvent::Closed { code: None, .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_scripted_connect_failures_then_success() {
        let (connector, mut accept_rx) = MemoryConnector::pair();
        connector.fail_next_connects(2);
        assert!(connector.connect("mem://test").await.is_err());
        assert!(connector.connect("mem://test").await.is_err());
        assert!(connector.connect("mem://test").await.is_ok());
        assert!(accept_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (connector, mut accept_rx) = MemoryConnector::pair();
        let mut client = connector.connect("mem://test").await.unwrap();
        let _server = accept_rx.recv().await.unwrap();
        client.close().await;
        assert!(client.send(&SignalMessage::Ping).await.is_err());
    }
}
