//! Reconnecting chat transport.
//!
//! Built on the same channel client as media signaling, plus the pieces chat
//! needs: an authenticated handshake, the ordered dedup log, and history
//! reconciliation every time the session re-enters open. However many times
//! history is re-fetched, no message can appear twice.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::signal::{
    Attachment, ChannelConfig, ChatMessage, SessionState, SignalClient, SignalError, SignalEvent,
    SignalMessage, SocketConnector,
};
use crate::Credentials;

use super::history::HistoryLoader;
use super::log::MessageLog;

#[derive(Debug, Error)]
pub enum ChatError {
    /// The session is not `Open`; nothing was queued.
    #[error("Not connected")]
    NotConnected,
    #[error("Chat transport closed")]
    Closed,
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Bad endpoint configuration: {0}")]
    Endpoint(#[from] url::ParseError),
}

/// Upward chat events. Implementations must not block; they run on the
/// transport's event loop.
pub trait ChatDelegate: Send + Sync {
    fn connection_state_changed(&self, state: SessionState, attempt: u32);
    /// A live message (or local echo) entered the log.
    fn message_appended(&self, message: &ChatMessage);
    /// A history fetch merged; `total` is the log size afterwards. Read the
    /// full snapshot via `ChatTransport::messages`.
    fn history_loaded(&self, total: usize);
    /// The relay rejected the auth handshake; terminal until the caller
    /// re-opens with new credentials.
    fn authentication_failed(&self, reason: &str);
}

enum Command {
    Send(ChatMessage, oneshot::Sender<Result<(), ChatError>>),
    Close(oneshot::Sender<()>),
}

/// Handle to a chat session.
#[derive(Clone)]
pub struct ChatTransport {
    cmd_tx: mpsc::Sender<Command>,
    signal: SignalClient,
    credentials: Credentials,
    snapshot: Arc<parking_lot::RwLock<Vec<ChatMessage>>>,
}

impl ChatTransport {
    /// Load history (best-effort: a failure logs and proceeds with an empty
    /// log), then open the authenticated chat channel. Returns immediately;
    /// connection progress arrives through the delegate.
    pub async fn open(
        config: &ClientConfig,
        meeting_id: &str,
        credentials: Credentials,
        loader: Arc<dyn HistoryLoader>,
        connector: Arc<dyn SocketConnector>,
        delegate: Arc<dyn ChatDelegate>,
    ) -> Result<Self, ChatError> {
        let url = config.chat_channel_url()?;

        let mut log = MessageLog::new();
        match loader.fetch_history(meeting_id, &credentials).await {
            Ok(history) => {
                log.merge(history);
                delegate.history_loaded(log.len());
            }
            Err(e) => {
                // Non-fatal: chat works from an empty log and the next
                // reconciliation retries the service.
                warn!(meeting_id, "history load failed: {e}");
            }
        }

        let handshake = SignalMessage::Auth {
            token: credentials.token.clone(),
            meeting_id: meeting_id.to_string(),
            user_id: credentials.identity.user_id.clone(),
            display_name: credentials.identity.display_name.clone(),
        };
        let channel = ChannelConfig {
            url,
            handshake,
            expects_ack: true,
            backoff: config.backoff(),
            connect_timeout: config.connect_timeout(),
            keepalive_interval: config.keepalive_interval(),
        };
        let (signal, signal_events) = SignalClient::spawn(channel, connector);
        signal.connect().await.map_err(|_| ChatError::Closed)?;

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let snapshot = Arc::new(parking_lot::RwLock::new(log.messages()));

        let worker = ChatLoop {
            meeting_id: meeting_id.to_string(),
            credentials: credentials.clone(),
            loader,
            log,
            signal: signal.clone(),
            signal_events,
            cmd_rx,
            delegate,
            snapshot: snapshot.clone(),
            was_open: false,
        };
        tokio::spawn(worker.run());

        info!(meeting_id, "chat transport opening");
        Ok(Self {
            cmd_tx,
            signal,
            credentials,
            snapshot,
        })
    }

    /// Compose and send a message. Fails fast with `NotConnected` while the
    /// session is anything but open; nothing is queued for later delivery.
    pub async fn send(
        &self,
        content: &str,
        attachment: Option<Attachment>,
    ) -> Result<ChatMessage, ChatError> {
        if !self.signal.state().is_open() {
            return Err(ChatError::NotConnected);
        }
        let message = ChatMessage::compose(
            self.credentials.identity.user_id.clone(),
            self.credentials.identity.display_name.clone(),
            content.to_string(),
            attachment,
        );
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send(message.clone(), reply_tx))
            .await
            .map_err(|_| ChatError::Closed)?;
        reply_rx.await.map_err(|_| ChatError::Closed)??;
        Ok(message)
    }

    /// Full message set in display order.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.snapshot.read().clone()
    }

    pub fn connection_state(&self) -> SessionState {
        self.signal.state()
    }

    /// Explicit retry; the only way out of the exhausted disconnected state.
    /// A no-op while the channel is already connecting or open.
    pub async fn reconnect(&self) -> Result<(), ChatError> {
        self.signal.connect().await.map_err(|_| ChatError::Closed)
    }

    /// Tear the channel down. Idempotent; no reconnect afterwards.
    pub async fn close(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close(reply_tx)).await.is_ok() {
            let _ = reply_rx.await;
        }
    }
}

// ============================================================================
// EVENT LOOP
// ============================================================================

struct ChatLoop {
    meeting_id: String,
    credentials: Credentials,
    loader: Arc<dyn HistoryLoader>,
    log: MessageLog,
    signal: SignalClient,
    signal_events: mpsc::UnboundedReceiver<SignalEvent>,
    cmd_rx: mpsc::Receiver<Command>,
    delegate: Arc<dyn ChatDelegate>,
    snapshot: Arc<parking_lot::RwLock<Vec<ChatMessage>>>,
    was_open: bool,
}

impl ChatLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        None => {
                            self.signal.close().await;
                            break;
                        }
                        Some(Command::Close(reply)) => {
                            self.signal.close().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(Command::Send(message, reply)) => {
                            let result = self.send_message(message).await;
                            let _ = reply.send(result);
                        }
                    }
                }
                maybe_event = self.signal_events.recv() => {
                    match maybe_event {
                        None => break,
                        Some(SignalEvent::State { state, attempt }) => {
                            self.delegate.connection_state_changed(state, attempt);
                            if state.is_open() {
                                if self.was_open {
                                    // Re-entered open after a drop: merge a
                                    // fresh history fetch through the dedup
                                    // log to recover anything missed.
                                    self.reconcile().await;
                                }
                                self.was_open = true;
                            }
                        }
                        Some(SignalEvent::Message(SignalMessage::Chat { message })) => {
                            if self.log.insert(message.clone()) {
                                self.sync_snapshot();
                                self.delegate.message_appended(&message);
                            } else {
                                debug!(id = %message.id, "duplicate chat message discarded");
                            }
                        }
                        Some(SignalEvent::Message(other)) => {
                            debug!("unexpected frame on chat channel: {other:?}");
                        }
                        Some(SignalEvent::AuthFailed { reason }) => {
                            self.delegate.authentication_failed(&reason);
                        }
                    }
                }
            }
        }
    }

    async fn send_message(&mut self, message: ChatMessage) -> Result<(), ChatError> {
        match self
            .signal
            .send(SignalMessage::Chat {
                message: message.clone(),
            })
            .await
        {
            Ok(()) => {
                // The relay excludes the sender from the broadcast, so echo
                // locally, through the same dedup path as received frames.
                if self.log.insert(message.clone()) {
                    self.sync_snapshot();
                    self.delegate.message_appended(&message);
                }
                Ok(())
            }
            Err(SignalError::NotConnected) => Err(ChatError::NotConnected),
            Err(e) => Err(ChatError::Send(e.to_string())),
        }
    }

    async fn reconcile(&mut self) {
        match self
            .loader
            .fetch_history(&self.meeting_id, &self.credentials)
            .await
        {
            Ok(history) => {
                let fresh = self.log.merge(history);
                if !fresh.is_empty() {
                    self.sync_snapshot();
                }
                self.delegate.history_loaded(self.log.len());
            }
            Err(e) => {
                warn!(meeting_id = %self.meeting_id, "history reconciliation failed: {e}");
            }
        }
    }

    fn sync_snapshot(&self) {
        *self.snapshot.write() = self.log.messages();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::history::MemoryHistoryLoader;
    use crate::signal::{MemoryConnector, ServerEnd};
    use crate::Identity;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingDelegate {
        log: parking_lot::Mutex<Vec<String>>,
    }

    impl RecordingDelegate {
        fn entries(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    impl ChatDelegate for RecordingDelegate {
        fn connection_state_changed(&self, state: SessionState, attempt: u32) {
            self.log.lock().push(format!("state:{state:?}:{attempt}"));
        }
        fn message_appended(&self, message: &ChatMessage) {
            self.log.lock().push(format!("append:{}", message.id));
        }
        fn history_loaded(&self, total: usize) {
            self.log.lock().push(format!("history:{total}"));
        }
        fn authentication_failed(&self, reason: &str) {
            self.log.lock().push(format!("auth-failed:{reason}"));
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            identity: Identity {
                user_id: "self".into(),
                display_name: "Me".into(),
            },
            token: "tok".into(),
        }
    }

    fn canned(id: &str, timestamp: i64) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            sender_id: "u2".to_string(),
            sender_name: "Grace".to_string(),
            content: format!("msg {id}"),
            timestamp,
            attachment: None,
        }
    }

    fn fast_config() -> ClientConfig {
        ClientConfig {
            reconnect_base_ms: 50,
            reconnect_cap_ms: 200,
            max_reconnect_attempts: 4,
            ..ClientConfig::default()
        }
    }

    struct Harness {
        chat: ChatTransport,
        loader: Arc<MemoryHistoryLoader>,
        delegate: Arc<RecordingDelegate>,
        server: ServerEnd,
        accept_rx: mpsc::UnboundedReceiver<ServerEnd>,
    }

    /// Open a chat transport against a scripted relay and drive it to open.
    async fn open_chat(loader: Arc<MemoryHistoryLoader>) -> Harness {
        let (connector, mut accept_rx) = MemoryConnector::pair();
        let delegate = Arc::new(RecordingDelegate::default());

        let chat = ChatTransport::open(
            &fast_config(),
            "m1",
            credentials(),
            loader.clone(),
            Arc::new(connector),
            delegate.clone(),
        )
        .await
        .unwrap();

        let mut server = accept_rx.recv().await.unwrap();
        let _ = server.recv().await; // auth handshake
        server.send(SignalMessage::AuthOk);
        wait_until(|| chat.connection_state().is_open()).await;

        Harness {
            chat,
            loader,
            delegate,
            server,
            accept_rx,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_before_open_fails_fast() {
        let (connector, _accept_rx) = MemoryConnector::pair();
        let chat = ChatTransport::open(
            &fast_config(),
            "m1",
            credentials(),
            Arc::new(MemoryHistoryLoader::new()),
            Arc::new(connector),
            Arc::new(RecordingDelegate::default()),
        )
        .await
        .unwrap();

        // Still connecting: immediate NotConnected, nothing queued.
        match chat.send("hello", None).await {
            Err(ChatError::NotConnected) => {}
            other => panic!("expected NotConnected, got {other:?}"),
        }
        assert!(chat.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_seeds_the_log() {
        let loader = Arc::new(MemoryHistoryLoader::new());
        loader.set_messages(vec![canned("h2", 200), canned("h1", 100)]);
        let h = open_chat(loader).await;

        let ids: Vec<_> = h.chat.messages().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["h1", "h2"]);
        assert!(h.delegate.entries().contains(&"history:2".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_failure_is_non_fatal() {
        let loader = Arc::new(MemoryHistoryLoader::new());
        loader.fail_next(1);
        let h = open_chat(loader).await;

        assert!(h.chat.messages().is_empty());
        assert!(h.chat.connection_state().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_messages_order_and_dedup() {
        let loader = Arc::new(MemoryHistoryLoader::new());
        let h = open_chat(loader).await;

        h.server.send(SignalMessage::Chat {
            message: canned("b", 200),
        });
        h.server.send(SignalMessage::Chat {
            message: canned("a", 100),
        });
        h.server.send(SignalMessage::Chat {
            message: canned("b", 200),
        });
        wait_until(|| h.chat.messages().len() == 2).await;

        let ids: Vec<_> = h.chat.messages().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        let appends = h
            .delegate
            .entries()
            .into_iter()
            .filter(|e| e.starts_with("append:"))
            .count();
        assert_eq!(appends, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_echoes_locally() {
        let loader = Arc::new(MemoryHistoryLoader::new());
        let mut h = open_chat(loader).await;

        let sent = h.chat.send("hello there", None).await.unwrap();
        assert_eq!(sent.sender_id, "self");

        wait_until(|| h.chat.messages().len() == 1).await;
        assert_eq!(h.chat.messages()[0].id, sent.id);

        // The frame also went to the relay.
        let outbound = h.server.drain();
        assert!(outbound.iter().any(
            |m| matches!(m, SignalMessage::Chat { message } if message.id == sent.id)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_reconciles_history_without_duplicates() {
        let loader = Arc::new(MemoryHistoryLoader::new());
        loader.set_messages(vec![canned("h1", 100)]);
        let mut h = open_chat(loader).await;
        assert_eq!(h.loader.calls(), 1);

        // A message lands while we're about to drop; the relay stores it.
        h.server.send(SignalMessage::Chat {
            message: canned("live", 150),
        });
        wait_until(|| h.chat.messages().len() == 2).await;
        h.loader
            .set_messages(vec![canned("h1", 100), canned("live", 150), canned("missed", 160)]);

        h.server.close(1006, "network flake");

        // Backoff reconnect: accept, ack, then reconciliation refetches.
        let mut server2 = h.accept_rx.recv().await.unwrap();
        let _ = server2.recv().await;
        server2.send(SignalMessage::AuthOk);
        wait_until(|| h.chat.messages().len() == 3).await;

        assert_eq!(h.loader.calls(), 2);
        let ids: Vec<_> = h.chat.messages().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["h1", "live", "missed"]);

        // A second reconciliation changes nothing.
        server2.close(1006, "again");
        let mut server3 = h.accept_rx.recv().await.unwrap();
        let _ = server3.recv().await;
        server3.send(SignalMessage::AuthOk);
        wait_until(|| h.chat.connection_state().is_open()).await;
        wait_until(|| h.loader.calls() == 3).await;
        assert_eq!(h.chat.messages().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_rejection_surfaces_to_delegate() {
        let (connector, mut accept_rx) = MemoryConnector::pair();
        let delegate = Arc::new(RecordingDelegate::default());
        let chat = ChatTransport::open(
            &fast_config(),
            "m1",
            credentials(),
            Arc::new(MemoryHistoryLoader::new()),
            Arc::new(connector),
            delegate.clone(),
        )
        .await
        .unwrap();

        let mut server = accept_rx.recv().await.unwrap();
        let _ = server.recv().await;
        server.send(SignalMessage::AuthError {
            reason: "expired token".into(),
        });

        wait_until(|| {
            delegate
                .entries()
                .contains(&"auth-failed:expired token".to_string())
        })
        .await;
        assert!(!chat.connection_state().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let loader = Arc::new(MemoryHistoryLoader::new());
        let h = open_chat(loader).await;

        h.chat.close().await;
        h.chat.close().await;
        wait_until(|| h.chat.connection_state().is_disconnected()).await;
        assert_eq!(
            h.chat.connection_state(),
            SessionState::Disconnected { exhausted: false }
        );

        match h.chat.send("too late", None).await {
            Err(ChatError::NotConnected) | Err(ChatError::Closed) => {}
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
