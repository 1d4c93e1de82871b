pub mod decoder;
pub mod geometry;
pub mod session;
pub mod widget;

use thiserror::Error;

use crate::transport::TransportError;
use geometry::GeometryError;

pub use session::{CloseReason, SessionInput, SocketState, TerminalSession};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error("session is closed")]
    SessionClosed,
    #[error("session is not open yet")]
    NotOpen,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("terminal output failed: {0}")]
    Widget(#[from] std::io::Error),
}
