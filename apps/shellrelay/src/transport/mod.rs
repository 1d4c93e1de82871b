use async_trait::async_trait;
use thiserror::Error;
use url::Url;

pub mod mock;
pub mod websocket;

/// Something that happened on the terminal socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Raw shell output.
    Binary(Vec<u8>),
    Text(String),
    /// A transport-level error. The socket may still be usable; only
    /// `Closed` ends the session.
    Error(String),
    Closed { reason: Option<String> },
}

/// Duplex socket carrying one terminal session.
#[async_trait]
pub trait TerminalSocket: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Next inbound event. Must be cancel safe; the session polls it inside
    /// `select!`. Returns `Closed` forever once the socket has ended.
    async fn next_event(&mut self) -> SocketEvent;

    async fn close(&mut self, reason: &str);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn TerminalSocket>, TransportError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to open socket: {0}")]
    Connect(String),
    #[error("failed to send on socket: {0}")]
    Send(String),
    #[error("invalid socket url: {0}")]
    InvalidUrl(String),
}
