use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::ConfigOverrides;
use crate::telemetry::logging::LogLevel;
use crate::transfer::PayloadEncoding;

#[derive(Parser, Debug)]
#[command(
    name = "shellrelay",
    about = "🐚 Drive a relayed remote shell and move files to and from its host",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "SHELLRELAY_SERVER",
        value_name = "URL",
        help = "Base URL of the relay server (scheme inferred when omitted)"
    )]
    pub server: Option<String>,

    #[arg(
        long = "config",
        global = true,
        env = "SHELLRELAY_CONFIG",
        value_name = "PATH",
        help = "Read settings from this TOML file instead of the default location"
    )]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(flatten)]
    pub transfer: TransferArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone, Default)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "SHELLRELAY_LOG_LEVEL",
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: Option<LogLevel>,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "SHELLRELAY_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct TransferArgs {
    #[arg(
        long = "chunk-size",
        global = true,
        env = "SHELLRELAY_CHUNK_SIZE",
        value_name = "BYTES",
        help = "Upload chunk size in bytes"
    )]
    pub chunk_size: Option<u64>,

    #[arg(
        long = "retry-status",
        global = true,
        env = "SHELLRELAY_RETRY_STATUSES",
        value_name = "STATUS",
        value_delimiter = ',',
        help = "HTTP status that makes the uploader resend the same chunk (repeatable)"
    )]
    pub retry_status: Vec<u16>,

    #[arg(
        long = "retry-delay-ms",
        global = true,
        env = "SHELLRELAY_RETRY_DELAY_MS",
        value_name = "MILLIS",
        help = "Pause before resending a chunk"
    )]
    pub retry_delay_ms: Option<u64>,

    #[arg(
        long = "max-attempts",
        global = true,
        env = "SHELLRELAY_MAX_ATTEMPTS",
        value_name = "COUNT",
        help = "Give up on a chunk after this many attempts (default: never)"
    )]
    pub max_attempts: Option<u32>,

    #[arg(
        long = "payload",
        global = true,
        value_enum,
        env = "SHELLRELAY_PAYLOAD",
        help = "How chunk bytes are encoded on the wire"
    )]
    pub payload: Option<PayloadEncoding>,
}

impl Cli {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            server: self.server.clone(),
            chunk_size: self.transfer.chunk_size,
            retry_statuses: self.transfer.retry_status.clone(),
            retry_delay_ms: self.transfer.retry_delay_ms,
            max_attempts: self.transfer.max_attempts,
            payload: self.transfer.payload,
            log_level: self.logging.level,
            log_file: self.logging.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Log in and open an interactive remote shell
    Connect(ConnectArgs),
    /// Upload a local file to the host of a running session
    Upload(UploadArgs),
    /// Download a file from the host of a running session
    Download(DownloadArgs),
    /// List the clients registered with the relay
    Clients,
    /// Drop unreachable clients from the relay and list the rest
    Clean,
}

#[derive(Args, Debug)]
pub struct ConnectArgs {
    #[arg(
        long,
        short = 'u',
        env = "SHELLRELAY_USERNAME",
        value_name = "USER",
        help = "Login user on the remote host"
    )]
    pub username: String,

    #[arg(
        long,
        env = "SHELLRELAY_PASSWORD",
        hide_env_values = true,
        value_name = "PASSWORD",
        help = "Login password (prompted when omitted)"
    )]
    pub password: Option<String>,

    #[arg(
        long,
        short = 'p',
        value_name = "PORT",
        help = "Port of the registered client, or the SSH port with --hostname"
    )]
    pub port: u16,

    #[arg(
        long = "hostname",
        short = 'H',
        value_name = "HOST",
        help = "Log in to this host over SSH directly instead of a registered client"
    )]
    pub hostname: Option<String>,
}

#[derive(Args, Debug)]
pub struct UploadArgs {
    #[arg(long, short = 's', value_name = "SESSION_ID", help = "Session to upload through")]
    pub session: String,

    #[arg(
        long,
        value_name = "NAME",
        help = "File name on the remote host (defaults to the local file name)"
    )]
    pub name: Option<String>,

    #[arg(value_name = "FILE", help = "Local file to upload")]
    pub file: PathBuf,
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    #[arg(long, short = 's', value_name = "SESSION_ID", help = "Session to download through")]
    pub session: String,

    #[arg(value_name = "REMOTE_PATH", help = "Path of the file on the remote host")]
    pub remote_path: String,

    #[arg(
        long,
        short = 'o',
        value_name = "PATH",
        help = "Where to save the file (defaults to its remote name)"
    )]
    pub output: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "shellrelay",
            "upload",
            "--session",
            "42",
            "--retry-status",
            "555,503",
            "--payload",
            "raw",
            "--server",
            "10.0.0.3:8888",
            "notes.txt",
        ])
        .unwrap();

        let overrides = cli.overrides();
        assert_eq!(overrides.retry_statuses, vec![555, 503]);
        assert_eq!(overrides.payload, Some(PayloadEncoding::Raw));
        assert_eq!(overrides.server.as_deref(), Some("10.0.0.3:8888"));
        match cli.command {
            Command::Upload(args) => {
                assert_eq!(args.session, "42");
                assert_eq!(args.file, PathBuf::from("notes.txt"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn connect_requires_username_and_port() {
        assert!(Cli::try_parse_from(["shellrelay", "connect", "--port", "22"]).is_err());
        let cli = Cli::try_parse_from([
            "shellrelay", "connect", "-u", "ops", "-p", "40122", "--password", "pw",
        ])
        .unwrap();
        match cli.command {
            Command::Connect(args) => {
                assert_eq!(args.port, 40122);
                assert_eq!(args.hostname, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
