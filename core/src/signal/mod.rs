//! Relay signaling: wire protocol, socket backends, the session state
//! machine, and the reconnecting channel client built from them.

pub mod client;
pub mod protocol;
pub mod session;
pub mod socket;

pub use client::{ChannelConfig, SignalClient, SignalError, SignalEvent};
pub use protocol::{Attachment, ChatMessage, IceCandidate, SessionDescription, SignalMessage};
pub use session::{SessionInput, SessionState, TransportSession};
pub use socket::{
    MemoryConnector, MemorySocket, ServerEnd, SignalSocket, SocketConnector, SocketError,
    SocketEvent, WsConnector,
};
