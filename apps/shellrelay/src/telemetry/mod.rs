pub(crate) fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

pub mod logging {
    use clap::ValueEnum;
    use serde::Deserialize;
    use std::fmt::Write as _;
    use std::fs::OpenOptions;
    use std::path::{Path, PathBuf};
    use std::sync::OnceLock;
    use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
    use tracing_subscriber::EnvFilter;

    pub const LOG_FILTER_ENV: &str = "SHELLRELAY_LOG_FILTER";
    pub const TRACE_DEPS_ENV: &str = "SHELLRELAY_TRACE_DEPS";

    /// Crates whose trace output drowns out the session's own events.
    const NOISY_DEPENDENCIES: &[&str] = &[
        "hyper",
        "hyper_util",
        "h2",
        "reqwest",
        "rustls",
        "native_tls",
        "tungstenite",
        "tokio_tungstenite",
        "mio",
    ];

    #[derive(
        Clone, Copy, Debug, Default, ValueEnum, Deserialize, PartialEq, Eq, PartialOrd, Ord,
    )]
    #[serde(rename_all = "lowercase")]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        /// Filter directive for this level. Debug and trace only raise our
        /// own crates; everything else stays at info.
        fn directive(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "info,shellrelay_client_core=debug,shellrelay=debug",
                LogLevel::Trace => "info,shellrelay_client_core=trace,shellrelay=trace",
            }
        }
    }

    #[derive(Clone, Debug)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
        /// Whether stderr may be used when no file is configured. The
        /// interactive terminal turns this off while it owns the screen.
        pub console: bool,
    }

    impl Default for LogConfig {
        fn default() -> Self {
            Self {
                level: LogLevel::default(),
                file: None,
                console: true,
            }
        }
    }

    /// Where formatted events end up.
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Sink<'a> {
        File(&'a Path),
        Stderr,
        Discard,
    }

    impl LogConfig {
        fn sink(&self) -> Sink<'_> {
            match (&self.file, self.console) {
                (Some(path), _) => Sink::File(path),
                (None, true) => Sink::Stderr,
                (None, false) => Sink::Discard,
            }
        }
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let plan = FilterPlan::resolve(config.level);
        let sink = config.sink();
        let (writer, guard) = open_writer(&sink)?;

        let verbose = config.level >= LogLevel::Debug;
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(&plan.directives))
            .with_target(verbose)
            .with_thread_names(config.level == LogLevel::Trace)
            .with_ansi(sink == Sink::Stderr)
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;
        let _ = GUARD.set(guard);

        if plan.throttled {
            tracing::info!(
                "dependency traces capped at info; set {TRACE_DEPS_ENV}=1 or {LOG_FILTER_ENV} to see them"
            );
        }
        Ok(())
    }

    fn open_writer(sink: &Sink<'_>) -> Result<(NonBlocking, WorkerGuard), InitError> {
        Ok(match sink {
            Sink::File(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.to_path_buf(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            Sink::Stderr => tracing_appender::non_blocking(std::io::stderr()),
            Sink::Discard => tracing_appender::non_blocking(std::io::sink()),
        })
    }

    /// The filter string handed to `EnvFilter`, and whether dependency
    /// traces were capped to get it.
    #[derive(Debug, PartialEq, Eq)]
    struct FilterPlan {
        directives: String,
        throttled: bool,
    }

    impl FilterPlan {
        fn resolve(level: LogLevel) -> Self {
            match std::env::var(LOG_FILTER_ENV) {
                Ok(directives) => Self {
                    directives,
                    throttled: false,
                },
                Err(_) => {
                    let deps = super::env_truthy(TRACE_DEPS_ENV).unwrap_or(false);
                    Self::for_level(level, deps)
                }
            }
        }

        fn for_level(level: LogLevel, dependency_traces: bool) -> Self {
            let mut directives = level.directive().to_string();
            let throttled = level == LogLevel::Trace && !dependency_traces;
            if throttled {
                for target in NOISY_DEPENDENCIES {
                    let _ = write!(directives, ",{target}=info");
                }
            }
            Self {
                directives,
                throttled,
            }
        }
    }

    /// Offset, hex bytes and printable ASCII, sixteen bytes per line. Used
    /// to log terminal frames that could not be decoded.
    pub fn hexdump(bytes: &[u8]) -> String {
        let mut out = String::with_capacity(bytes.len() * 4 + 16);
        for (row, line) in bytes.chunks(16).enumerate() {
            let _ = write!(out, "{:08x}  ", row * 16);
            for column in 0..16 {
                if column == 8 {
                    out.push(' ');
                }
                match line.get(column) {
                    Some(byte) => {
                        let _ = write!(out, "{byte:02x} ");
                    }
                    None => out.push_str("   "),
                }
            }
            out.push(' ');
            for &byte in line {
                out.push(if byte.is_ascii_graphic() || byte == b' ' {
                    byte as char
                } else {
                    '.'
                });
            }
            out.push('\n');
        }
        out
    }

}
