//! Tracery - deterministic event-learning pipeline server
//!
//! Entry point for the HTTP server (`serve`), one-shot pipeline runs
//! (`derive`) and database initialization (`init`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracery::api::{ApiServer, ApiServerConfig, AppState};
use tracery::config::TraceryConfig;
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tracery")]
#[command(about = "Deterministic event-learning pipeline with live streaming", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Set log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database path (overrides TRACERY_DB_PATH env var and config file)
    #[arg(long)]
    db_path: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server with the periodic pipeline trigger
    Serve {
        /// Bind address (overrides config file)
        #[arg(long)]
        addr: Option<String>,
    },
    /// Run one pipeline batch and print the report
    Derive {
        /// Scope the batch to one subject (safe filter: ignored when it
        /// matches nothing)
        #[arg(long)]
        subject: Option<String>,
    },
    /// Create the database and apply the schema
    Init,
}

/// Resolve the database path from CLI arg, env var, or config
fn resolve_db_path(cli_path: Option<String>, config: &TraceryConfig) -> String {
    cli_path
        .or_else(|| std::env::var("TRACERY_DB_PATH").ok())
        .unwrap_or_else(|| config.database.path.clone())
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<TraceryConfig> {
    match path {
        Some(path) => Ok(TraceryConfig::from_file(path)?),
        None => {
            let default_path = PathBuf::from("tracery.toml");
            if default_path.exists() {
                Ok(TraceryConfig::from_file(&default_path)?)
            } else {
                Ok(TraceryConfig::default())
            }
        }
    }
}

async fn serve(config: TraceryConfig, addr_override: Option<String>) -> anyhow::Result<()> {
    let mut api_config = ApiServerConfig {
        addr: config.server.addr,
        pipeline_interval: config.pipeline.interval,
        ping_interval: config.stream.ping_interval,
    };

    if let Some(addr) = addr_override {
        api_config.addr = addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid address '{}': {}", addr, e))?;
    }

    let state = AppState::initialize(&config).await?;

    info!(
        db = %config.database.path,
        addr = %api_config.addr,
        modules = state.registry.descriptors().len(),
        "starting tracery server"
    );

    ApiServer::new(api_config, state).serve().await
}

async fn derive(config: TraceryConfig, subject: Option<String>) -> anyhow::Result<()> {
    let state = AppState::initialize(&config).await?;

    let subjects: Option<Vec<String>> = subject.map(|s| vec![s]);
    let report = state.runner.trigger(subjects.as_deref()).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn init(config: TraceryConfig) -> anyhow::Result<()> {
    // Connecting applies the embedded schema
    let _state = AppState::initialize(&config).await?;
    println!("database ready at {}", config.database.path);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Use the specified level for tracery, WARN for noisy external crates
    let filter = EnvFilter::new(format!(
        "tracery={},tower_http=warn,hyper=warn",
        level.as_str().to_lowercase()
    ));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    debug!("Tracery v{} starting...", env!("CARGO_PKG_VERSION"));

    let mut config = load_config(cli.config.as_ref())?;
    config.database.path = resolve_db_path(cli.db_path, &config);

    match cli.command {
        Some(Commands::Serve { addr }) => serve(config, addr).await,
        Some(Commands::Derive { subject }) => derive(config, subject).await,
        Some(Commands::Init) => init(config).await,
        None => serve(config, None).await,
    }
}
