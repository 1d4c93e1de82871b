use crate::client::ClientError;
use crate::config::ConfigError;
use crate::session::SessionError;
use crate::telemetry::logging::InitError;
use crate::transfer::TransferError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Session(#[from] SessionError),
    #[error("{0}")]
    Client(#[from] ClientError),
    #[error("{0}")]
    Transfer(#[from] TransferError),
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("logging initialization failed: {0}")]
    Logging(#[from] InitError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// The relay refused the login. Its reason has already been shown to
    /// the user by the session observer.
    #[error("login failed: {0}")]
    Handshake(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_)
            | CliError::InvalidArgument(_)
            | CliError::Session(SessionError::MissingField(_))
            | CliError::Session(SessionError::InvalidConfig(_)) => 2,
            CliError::Handshake(_) => 3,
            _ => 1,
        }
    }

    /// Whether the user has already seen this error, so `main` should only
    /// set the exit code.
    pub fn already_reported(&self) -> bool {
        matches!(self, CliError::Handshake(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_problems_exit_with_two() {
        assert_eq!(CliError::InvalidArgument("x".into()).exit_code(), 2);
        assert_eq!(
            CliError::from(SessionError::MissingField("password")).exit_code(),
            2
        );
        assert_eq!(CliError::Handshake("Authentication failed.".into()).exit_code(), 3);
        assert_eq!(CliError::from(TransferError::Busy).exit_code(), 1);
    }

    #[test]
    fn rejected_login_is_not_printed_twice() {
        assert!(CliError::Handshake("Authentication failed.".into()).already_reported());
        assert!(!CliError::InvalidArgument("x".into()).already_reported());
        assert!(!CliError::from(TransferError::Busy).already_reported());
    }
}
