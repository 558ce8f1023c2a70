//! RASP reference host
//!
//! Runs the plugin evaluation engine from the command line.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rasp::config::HostConfig;
use rasp::replay;
use rasp::sinks::JsonLinesAlarmSink;
use rasp_js_runtime::{AlarmSink, Engine, RequestContext, Sinks, TracingLogSink, Worker};

/// Evaluate detection plugins against application events
#[derive(Parser, Debug)]
#[command(name = "rasp")]
#[command(about = "Evaluate detection plugins against application events", long_about = None)]
struct Args {
    /// Configuration file (defaults to ./rasp.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Root directory; plugins are read from <root>/plugins
    #[arg(long)]
    root: Option<PathBuf>,

    /// Per-check deadline in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate one event; exits with status 2 when it is blocked
    Check {
        /// Event type, e.g. "sql"
        #[arg(long = "type")]
        event_type: String,

        /// Event parameters as JSON
        #[arg(long, default_value = "{}")]
        params: String,

        /// Request context as JSON
        #[arg(long)]
        context: Option<String>,
    },

    /// Print engine status as JSON
    List,

    /// Replay a JSON-lines event file
    Replay {
        /// File with one {"type", "params", "context"} object per line
        #[arg(long)]
        events: PathBuf,

        /// Number of worker threads
        #[arg(long, default_value_t = 4)]
        workers: usize,
    },
}

fn main() -> Result<ExitCode> {
    // V8 must be initialized on the main thread before the tokio runtime starts.
    rasp_js_runtime::init_platform();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main())
}

async fn async_main() -> Result<ExitCode> {
    let args = Args::parse();

    let mut config = HostConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(root) = args.root {
        config.engine.root_dir = root;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.engine.timeout_ms = timeout_ms;
    }

    init_tracing(config.log_json);
    info!("Starting rasp v{}", env!("CARGO_PKG_VERSION"));

    let alarm: Arc<dyn AlarmSink> = match &config.alarm_log {
        Some(path) => Arc::new(
            JsonLinesAlarmSink::file(path)
                .with_context(|| format!("Failed to open alarm log {}", path.display()))?,
        ),
        None => Arc::new(JsonLinesAlarmSink::stdout()),
    };
    let sinks = Sinks {
        alarm,
        log: Arc::new(TracingLogSink),
    };
    let engine = Engine::with_sinks(config.engine.clone(), sinks).context("Failed to start engine")?;
    info!(
        "Engine ready: {} plugins from {}, enabled: {}",
        engine.plugins().len(),
        config.engine.plugin_dir().display(),
        engine.is_enabled()
    );

    match args.command {
        Command::Check {
            event_type,
            params,
            context,
        } => {
            let blocked = run_check(&engine, &event_type, &params, context.as_deref())?;
            println!("blocked: {}", blocked);
            Ok(if blocked { ExitCode::from(2) } else { ExitCode::SUCCESS })
        }
        Command::List => {
            println!("{}", serde_json::to_string_pretty(&engine.status())?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Replay { events, workers } => {
            let events = replay::read_events(&events)?;
            let summary = replay::replay(&engine, events, workers).await?;
            println!("{}", serde_json::to_string(&summary)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_check(engine: &Engine, event_type: &str, params: &str, context: Option<&str>) -> Result<bool> {
    let params: serde_json::Value = serde_json::from_str(params).context("Invalid --params JSON")?;
    let mut worker = Worker::new(engine);
    if let Some(context) = context {
        let request: RequestContext =
            serde_json::from_str(context).context("Invalid --context JSON")?;
        worker.set_request(request);
    }
    Ok(worker.check(event_type, params))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("rasp=info,rasp_js_runtime=info"));
    let registry = tracing_subscriber::registry().with(filter);
    // Alarms own stdout; diagnostics go to stderr.
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
