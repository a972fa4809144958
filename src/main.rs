//! mqlink - supervised RabbitMQ consumer
//!
//! Declares the configured queues, consumes from each of them and keeps doing
//! so across broker restarts and network failures.

use mqlink::broker::amqp::AmqpBroker;
use mqlink::config::MqConfig;
use mqlink::coordinator::ListenOptions;
use mqlink::error::sanitize_error_message;
use mqlink::health::{HealthSink, SharedHealth};
use mqlink::observability::{health::HealthServer, init_default_logging};
use mqlink::supervisor::initialize;
use mqlink::worker::{ConfiguredQueues, DeliveryLogger, QueueConsumers};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Supervised RabbitMQ consumer
#[derive(Parser)]
#[command(name = "mqlink")]
#[command(about = "Consume RabbitMQ queues with automatic reconnection")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "MQLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, consume and reconnect until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose > 0 && std::env::var("LOG_LEVEL").is_err() {
        let level = if cli.verbose > 1 { "TRACE" } else { "DEBUG" };
        std::env::set_var("LOG_LEVEL", level);
    }
    init_default_logging();

    info!("Starting mqlink v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: &Option<PathBuf>) -> Result<MqConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(MqConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = ["mqlink.toml", "config/mqlink.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(MqConfig::load_from_file(&path)?);
                }
            }

            Err("No configuration file found. Provide one with -c/--config or create mqlink.toml".into())
        }
    }
}

async fn run(config: MqConfig) -> Result<(), Box<dyn std::error::Error>> {
    let options = config.options()?;
    let health = Arc::new(SharedHealth::new());

    if config.health.enabled {
        let server = Arc::new(HealthServer::new(
            "mqlink",
            config.health.port,
            health.clone(),
        ));
        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                error!("Health server error: {}", e);
            }
        });
    }

    if config.queues.is_empty() {
        warn!("No queues configured, the connection will be supervised but nothing consumed");
    }

    let mut broker = AmqpBroker::new();
    if let Some(name) = &config.broker.connection_name {
        broker = broker.with_connection_name(name.clone());
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    // Dropping the initialize future on a signal abandons the dial loop
    let sink: Arc<dyn HealthSink> = health.clone();
    let handle = tokio::select! {
        handle = initialize(broker, options, ConfiguredQueues::new(config.queues.clone()), Some(sink)) => handle?,
        _ = sigint.recv() => {
            info!("Received SIGINT before the broker was reachable");
            return Ok(());
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM before the broker was reachable");
            return Ok(());
        }
    };

    let monitor = handle.spawn_monitor();
    let listener = handle
        .listen(
            ListenOptions::<AmqpBroker, lapin::Consumer>::new()
                .create_consumers(QueueConsumers)
                .handle_events(DeliveryLogger::default()),
        )
        .await?;

    info!("Consuming from {} queue(s)", config.queues.len());

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }

    handle.shutdown();
    if let Err(e) = listener.join().await {
        warn!("Consumer task ended abnormally: {}", e);
    }
    if let Err(e) = monitor.await {
        warn!("Connection monitor ended abnormally: {}", e);
    }

    if let Err(e) = handle.current_link().connection.close().await {
        warn!("Error closing broker connection: {}", e);
    }

    Ok(())
}

fn handle_config_command(config: &MqConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!("Configuration is valid");

    if show {
        let mut shown = config.clone();
        shown.broker.uri = shown.broker.uri.as_deref().map(sanitize_error_message);
        println!("{}", toml::to_string_pretty(&shown)?);
    }

    Ok(())
}
