pub mod client;
pub mod config;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod terminal;
pub mod transfer;
pub mod transport;
