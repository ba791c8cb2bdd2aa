use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use replset_watchdog::config::{Config, ConfigError};
use replset_watchdog::db::mongodb::MongoDialer;
use replset_watchdog::health::mongodb::MongodHealthChecker;
use replset_watchdog::health::ReachabilityProbe;
use replset_watchdog::pod::dcos::DcosSource;
use replset_watchdog::Watchdog;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

// Pause between attempts of a replica set dial
const DIAL_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "replset-watchdog")]
#[command(about = "Keeps MongoDB replica set membership in step with orchestrator pods")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the watchdog
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/watchdog.toml")]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
        /// Name of the orchestrated MongoDB service
        #[arg(short, long)]
        service: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_watchdog(config).await?,
        Commands::Config { service, output } => generate_config(&service, output)?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Version => show_version(),
    }

    Ok(())
}

async fn run_watchdog(config_path: PathBuf) -> Result<()> {
    let mut config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    config.apply_env_overrides();

    init_logging(&config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?config_path,
        service = %config.service.name,
        api = %format!("{}://{}", config.service.api_scheme, config.service.api_host),
        "Starting replset watchdog"
    );

    let source = DcosSource::new(&config.service).context("Failed to create DC/OS pod source")?;

    let limits = &config.replset;
    let dialer = Arc::new(MongoDialer::new(limits.max_connect_tries, DIAL_RETRY_INTERVAL));
    // One attempt per probe try, the probe does its own retrying
    let checker = MongodHealthChecker::new(
        Arc::new(MongoDialer::new(1, DIAL_RETRY_INTERVAL)),
        config.mongodb.clone(),
        limits.connect_timeout(),
    );
    let probe = ReachabilityProbe::new(
        Box::new(checker),
        limits.max_connect_tries,
        config.poll.config_update_interval(),
    );

    let watchdog = Watchdog::new(Arc::new(config), Arc::new(source), dialer, Arc::new(probe));
    watchdog.run(shutdown_signal()).await?;

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Ctrl+C detected"),
                    _ = sigterm.recv() => info!("SIGTERM detected"),
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "Cannot listen for SIGTERM"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Cannot listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Ctrl+C detected");
}

fn generate_config(service: &str, output: PathBuf) -> Result<()> {
    println!("Generating configuration file for {}: {:?}", service, output);

    Config::create_example_config(&output, service).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  replset-watchdog run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Service: {}", config.service.name);
            println!(
                "  Orchestrator API: {}://{}",
                config.service.api_scheme, config.service.api_host
            );
            println!(
                "  Poll intervals: api {}s, replset {}s",
                config.poll.api_interval_sec, config.poll.replset_interval_sec
            );
            println!(
                "  Limits: {} members, {} voting",
                config.replset.max_members, config.replset.max_voting_members
            );
            println!("  TLS: {}", if config.mongodb.tls.enabled { "enabled" } else { "disabled" });
            if !config.discovery.ignore_pods.is_empty() {
                println!("  Ignored pods: {}", config.discovery.ignore_pods.join(", "));
            }
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn show_version() {
    println!("replset-watchdog v{}", env!("CARGO_PKG_VERSION"));
    println!("Keeps MongoDB replica set membership in step with orchestrator pods");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • DC/OS SDK pod discovery");
    println!("  • Automatic admission of new mongod members with voting caps");
    println!("  • Hidden, non-voting backup members");
    println!("  • Eviction of members whose pods were removed");
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!(level = %config.logging.level, format = %config.logging.format, "Logging initialized");
    Ok(())
}
