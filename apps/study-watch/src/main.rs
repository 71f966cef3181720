use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use live_sync::config::normalize_http_base;
use live_sync::error::SyncError;
use live_sync::frames::TraceCanvas;
use live_sync::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use live_sync::telemetry::preview;
use live_sync::{
    ConnectionEvent, ConnectionState, StoreChange, StudyHub, StudyPhase, StudyWatch, SyncConfig,
};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

const EXIT_FAILED: u8 = 1;
const EXIT_INTERRUPTED: u8 = 130;
const RELEASE_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("❌ {err}");
            ExitCode::from(EXIT_FAILED)
        }
    }
}

async fn run() -> Result<ExitCode, CliError> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(directives = %log_config.directives(), log_file = ?log_config.file, "logging configured");

    let config = cli.endpoints.apply(SyncConfig::from_env());
    match cli.command {
        Command::Watch(args) => handle_watch(config, args).await,
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "study-watch",
    about = "Follow the personas of a running study as they work",
    author,
    version
)]
struct Cli {
    #[command(flatten)]
    endpoints: EndpointArgs,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct EndpointArgs {
    #[arg(
        long,
        global = true,
        value_name = "URL",
        env = "STUDY_WATCH_API_URL",
        help = "Base URL of the study REST API"
    )]
    api_url: Option<String>,

    #[arg(
        long,
        global = true,
        value_name = "URL",
        env = "STUDY_WATCH_PUSH_URL",
        help = "Websocket endpoint of the push channel"
    )]
    push_url: Option<String>,

    #[arg(
        long,
        global = true,
        value_name = "URL",
        env = "STUDY_WATCH_FRAMES_URL",
        help = "Websocket prefix of the per-session screencast channel"
    )]
    frames_url: Option<String>,

    #[arg(
        long,
        global = true,
        value_name = "MILLIS",
        env = "STUDY_WATCH_POLL_MS",
        help = "Polling interval in milliseconds"
    )]
    poll_ms: Option<u64>,
}

impl EndpointArgs {
    fn apply(&self, mut config: SyncConfig) -> SyncConfig {
        if let Some(url) = &self.api_url {
            config.api_base_url = normalize_http_base(url);
        }
        if let Some(url) = &self.push_url {
            config.push_url = url.clone();
        }
        if let Some(url) = &self.frames_url {
            config.frames_url = url.clone();
        }
        if let Some(millis) = self.poll_ms.filter(|millis| *millis > 0) {
            config.poll_interval = Duration::from_millis(millis);
        }
        config
    }
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "STUDY_WATCH_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "STUDY_WATCH_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,

    #[arg(
        long = "log-filter",
        value_name = "DIRECTIVES",
        global = true,
        env = "STUDY_WATCH_LOG_FILTER",
        help = "Raw tracing filter directives, overriding --log-level"
    )]
    filter: Option<String>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
            filter: self.filter.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow a study until it completes or fails
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
struct WatchArgs {
    #[arg(value_name = "STUDY_ID")]
    study_id: String,

    #[arg(long, help = "Open the screencast channel of sessions with a live browser")]
    frames: bool,

    #[arg(long, help = "Print the full study view as JSON on every change")]
    json: bool,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Sync(#[from] SyncError),
    #[error("failed to encode study view: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("logging initialization failed: {0}")]
    Logging(String),
}

enum Outcome {
    Finished,
    Exhausted { attempts: u32 },
    Interrupted,
}

async fn handle_watch(config: SyncConfig, args: WatchArgs) -> Result<ExitCode, CliError> {
    let canvases = args.frames.then(TraceCanvas::factory);
    let hub = StudyHub::from_config(&config, canvases)?;
    let mut connection = hub.connection_events();
    let watch = hub.attach(args.study_id.as_str());
    let mut changes = watch.changes();
    info!(study_id = %args.study_id, api = %config.api_base_url, push = %config.push_url, "watching");
    println!("👀 watching study {}", args.study_id);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let outcome = loop {
        tokio::select! {
            _ = &mut ctrl_c => break Outcome::Interrupted,
            change = changes.next() => {
                let Some(change) = change else { break Outcome::Finished };
                report(&watch, &change, args.json)?;
                if watch.store().is_terminal() {
                    break Outcome::Finished;
                }
            }
            event = connection.recv() => match event {
                Ok(ConnectionEvent::State(state)) => {
                    println!("🔌 push channel {}", state.as_str());
                }
                Ok(ConnectionEvent::Exhausted { attempts }) => {
                    break Outcome::Exhausted { attempts };
                }
                Ok(ConnectionEvent::Push(_)) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "connection events lagged");
                }
                Err(RecvError::Closed) => break Outcome::Exhausted { attempts: 0 },
            },
        }
    };

    let view = watch.view();
    drop(changes);
    release(&hub, watch).await;

    let code = match outcome {
        Outcome::Interrupted => {
            println!("👋 stopped watching {}", args.study_id);
            ExitCode::from(EXIT_INTERRUPTED)
        }
        Outcome::Exhausted { attempts } => {
            eprintln!("❌ push channel gave up after {attempts} reconnect attempts");
            ExitCode::from(EXIT_FAILED)
        }
        Outcome::Finished => match view.phase {
            StudyPhase::Complete => {
                match view.score {
                    Some(score) => println!("✅ study complete (score {score:.1})"),
                    None => println!("✅ study complete"),
                }
                ExitCode::SUCCESS
            }
            _ => {
                match &view.error {
                    Some(err) => eprintln!("❌ {err}"),
                    None => eprintln!("❌ study {} stopped in phase {}", args.study_id, view.phase.as_str()),
                }
                ExitCode::from(EXIT_FAILED)
            }
        },
    };
    Ok(code)
}

/// Drops the watch and gives the driver a moment to unsubscribe and close.
async fn release(hub: &StudyHub, watch: StudyWatch) {
    let mut state = hub.watch_connection_state();
    drop(watch);
    let closed = matches!(
        tokio::time::timeout(
            RELEASE_GRACE,
            state.wait_for(|state| *state == ConnectionState::Closed),
        )
        .await,
        Ok(Ok(_))
    );
    if !closed {
        warn!("push channel did not close in time");
    }
}

fn report(watch: &StudyWatch, change: &StoreChange, json: bool) -> Result<(), CliError> {
    if json {
        println!("{}", serde_json::to_string(&watch.view())?);
        return Ok(());
    }
    match change {
        StoreChange::StudyUpdated { phase, percent } => {
            println!("📊 {} {percent:>3}%", phase.as_str());
        }
        StoreChange::SessionUpdated { session_id } => {
            if let Some(session) = watch.store().session(session_id) {
                let name = session.persona_name.as_deref().unwrap_or(session_id);
                let total = session
                    .total_steps
                    .map(|total| total.to_string())
                    .unwrap_or_else(|| "?".to_string());
                let mood = session.emotional_state.as_deref().unwrap_or("-");
                println!(
                    "   {name:<20} step {:>3}/{total:<3} {:<8} {mood}",
                    session.step_number,
                    session.status.as_str(),
                );
            }
        }
        StoreChange::StepAppended {
            session_id,
            step_number,
        } => {
            let entry = watch
                .store()
                .timeline(session_id)
                .and_then(|steps| steps.into_iter().find(|step| step.step_number == *step_number));
            if let Some(entry) = entry {
                let action = entry.action.map(|action| action.label()).unwrap_or_default();
                let thought = entry
                    .think_aloud
                    .as_deref()
                    .map(|text| preview(text, 80))
                    .unwrap_or_default();
                println!("   {session_id} #{step_number} {action} {thought}");
            }
        }
        StoreChange::StudyInitialized { .. } | StoreChange::Reset => {}
    }
    Ok(())
}
