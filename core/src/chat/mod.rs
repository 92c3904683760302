//! Chat: ordered dedup log, history loading, and the reconnecting transport.

pub mod history;
pub mod log;
pub mod transport;

pub use history::{HistoryError, HistoryLoader, HttpHistoryLoader, MemoryHistoryLoader};
pub use log::MessageLog;
pub use transport::{ChatDelegate, ChatError, ChatTransport};
