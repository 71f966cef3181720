/// Shortens a payload for log lines, respecting char boundaries.
pub fn preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

/// Subscriber setup for the watch binary.
///
/// Our own crates log at the requested level. Everything else stays at
/// `warn` or below, except that the HTTP and websocket stacks follow the
/// requested level at `trace`.
pub mod logging {
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;

    use clap::ValueEnum;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    const OWN_TARGETS: &[&str] = &["live_sync", "study_watch"];
    const NETWORK_TARGETS: &[&str] = &["hyper", "reqwest", "tungstenite", "tokio_tungstenite"];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
        /// Raw `EnvFilter` directives; replaces the level-derived ones.
        pub filter: Option<String>,
    }

    impl LogConfig {
        pub fn directives(&self) -> String {
            if let Some(filter) = self.filter.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
                return filter.to_owned();
            }
            let level = self.level.as_str();
            let quiet = self.level.min(LogLevel::Warn).as_str();
            let network = if self.level == LogLevel::Trace { level } else { quiet };
            let mut directives = vec![quiet.to_owned()];
            directives.extend(OWN_TARGETS.iter().map(|target| format!("{target}={level}")));
            directives.extend(NETWORK_TARGETS.iter().map(|target| format!("{target}={network}")));
            directives.join(",")
        }
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("invalid log filter: {0}")]
        Filter(String),
        #[error("failed to install logger: {0}")]
        Install(String),
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }
        let filter = EnvFilter::try_new(config.directives())
            .map_err(|err| InitError::Filter(err.to_string()))?;

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(config.level >= LogLevel::Debug)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .try_init()
            .map_err(|err| InitError::Install(err.to_string()))?;

        let _ = GUARD.set(guard);
        Ok(())
    }

}
