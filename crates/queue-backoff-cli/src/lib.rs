//! # Queue Backoff CLI
//!
//! Command-line consumer that applies redelivery backoff to an SQS queue.
//!
//! This module provides CLI commands for:
//! - Consuming a queue until interrupted
//! - Configuration validation and display
//!
//! Configuration is layered: an optional YAML, TOML or JSON file, then
//! environment variables prefixed `QB__` (`QB__QUEUE__QUEUE_URL` sets
//! `queue.queue_url`). AWS credentials fall back to the standard `AWS_*`
//! variables.

use clap::{Parser, Subcommand};
use queue_backoff::{
    AwsSqsConfig, AwsSqsProvider, BackoffConfig, BackoffController, BackoffDecision,
    BackoffPolicy, ConfigurationError, MessageReceiver, QueueConfig, QueueError, QueueProvider,
    ValidationError,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, Instrument};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// ============================================================================
// CLI Structure
// ============================================================================

/// Queue Backoff CLI - redelivery backoff for SQS consumers
#[derive(Parser)]
#[command(name = "queue-backoff")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Consume an SQS queue and delay each redelivery by attempt count")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "QUEUE_BACKOFF_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level, used when RUST_LOG is not set
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Receive messages and apply backoff until interrupted
    Consume {
        /// Maximum number of messages handled at once
        #[arg(short = 'n', long)]
        concurrency: Option<usize>,
    },

    /// Validate configuration
    Config {
        /// Show resolved configuration
        #[arg(short, long)]
        show: bool,

        /// Output format for configuration
        #[arg(short = 'f', long, default_value = "yaml")]
        format: ConfigFormat,
    },
}

/// Configuration format options
#[derive(Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// JSON format
    Json,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Logging initialization failed: {message}")]
    Logging { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 2,
            Self::Queue(_) => 3,
            Self::Logging { .. } => 4,
            Self::Io(_) => 5,
        }
    }
}

/// Configuration loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Could not load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Provider configuration error: {0}")]
    Provider(#[from] ConfigurationError),

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Could not render configuration: {message}")]
    Render { message: String },
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Resolved CLI configuration
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct CliConfig {
    /// Queue to consume and receive parameters
    pub queue: QueueConfig,

    #[serde(default)]
    pub backoff: BackoffConfig,

    #[serde(default)]
    pub aws: AwsSqsConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,
}

impl CliConfig {
    /// Check every section plus the constraints between them
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue.validate()?;
        self.backoff.validate()?;
        self.aws.validate()?;

        if self.consumer.concurrency == 0 || self.consumer.concurrency > MAX_CONCURRENCY {
            return Err(ConfigError::Invalid {
                message: format!(
                    "consumer.concurrency must be between 1 and {}",
                    MAX_CONCURRENCY
                ),
            });
        }

        if self.aws.request_timeout_seconds <= u64::from(self.queue.wait_time_seconds) {
            return Err(ConfigError::Invalid {
                message: format!(
                    "aws.request_timeout_seconds ({}) must exceed queue.wait_time_seconds ({})",
                    self.aws.request_timeout_seconds, self.queue.wait_time_seconds
                ),
            });
        }

        Ok(())
    }
}

/// Upper bound for `consumer.concurrency`
pub const MAX_CONCURRENCY: usize = 1024;

/// Message handling settings
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ConsumerConfig {
    /// Maximum number of messages handled at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    10
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

/// Environment source for `QB__SECTION__KEY` variables
pub fn environment() -> config::Environment {
    config::Environment::with_prefix("QB")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("backoff.delays_seconds")
}

/// Load configuration from the optional file and the process environment
pub fn load_configuration(config_path: Option<&Path>) -> Result<CliConfig, ConfigError> {
    load_configuration_with(config_path, environment())
}

/// Load configuration from the optional file and the given environment source
pub fn load_configuration_with(
    config_path: Option<&Path>,
    environment: config::Environment,
) -> Result<CliConfig, ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = config_path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        info!(path = %path.display(), "Loading configuration file");
        builder = builder.add_source(config::File::from(path).required(true));
    }

    let mut config: CliConfig = builder.add_source(environment).build()?.try_deserialize()?;
    config.aws = config.aws.with_env_credentials();
    config.validate()?;

    Ok(config)
}

/// Serialize the resolved configuration; secrets are never written
pub fn render_configuration(
    config: &CliConfig,
    format: &ConfigFormat,
) -> Result<String, ConfigError> {
    match format {
        ConfigFormat::Yaml => serde_yaml::to_string(config).map_err(|e| ConfigError::Render {
            message: e.to_string(),
        }),
        ConfigFormat::Json => {
            serde_json::to_string_pretty(config).map_err(|e| ConfigError::Render {
                message: e.to_string(),
            })
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    // Initialize logging
    initialize_logging(&cli)?;

    // Load configuration
    let config = load_configuration(cli.config.as_deref())?;

    // Execute command
    match cli.command {
        Commands::Consume { concurrency } => execute_consume_command(config, concurrency).await,
        Commands::Config { show, format } => execute_config_command(&config, show, format),
    }
}

fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .map_err(|e| CliError::Logging {
            message: e.to_string(),
        })?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if cli.json_logs {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };

    result.map_err(|e| CliError::Logging {
        message: e.to_string(),
    })
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn execute_consume_command(
    mut config: CliConfig,
    concurrency: Option<usize>,
) -> Result<(), CliError> {
    if let Some(concurrency) = concurrency {
        config.consumer.concurrency = concurrency;
        config.validate()?;
    }

    let provider = AwsSqsProvider::new(config.aws.clone()).map_err(|e| e.to_queue_error())?;
    let (cancel_tx, cancel_rx) = watch::channel(false);

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = cancel_tx.send(true);
    });

    let summary = consume(Arc::new(provider), &config, cancel_rx).await?;
    info!(
        received = summary.received,
        delayed = summary.delayed,
        deleted = summary.deleted,
        "Consumer stopped"
    );
    Ok(())
}

fn execute_config_command(
    config: &CliConfig,
    show: bool,
    format: ConfigFormat,
) -> Result<(), CliError> {
    let mut out = std::io::stdout().lock();
    if show {
        writeln!(out, "{}", render_configuration(config, &format)?)?;
    } else {
        writeln!(out, "Configuration is valid")?;
    }
    Ok(())
}

/// Resolves on Ctrl-C or, on unix, SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C signal handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C), stopping consumer"),
        _ = terminate => info!("Received SIGTERM, stopping consumer"),
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// Counts of what a consumer run did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeSummary {
    pub received: u64,
    pub delayed: u64,
    pub deleted: u64,
}

#[derive(Default)]
struct Counters {
    delayed: AtomicU64,
    deleted: AtomicU64,
}

/// Receive until `cancel` is set, handing every message to the backoff controller.
///
/// Up to `consumer.concurrency` messages are handled at once. In-flight
/// handles are awaited before returning, also when receiving failed.
pub async fn consume(
    provider: Arc<dyn QueueProvider>,
    config: &CliConfig,
    cancel: watch::Receiver<bool>,
) -> Result<ConsumeSummary, QueueError> {
    let receiver = MessageReceiver::new(Arc::clone(&provider), &config.queue);
    let controller = Arc::new(BackoffController::new(
        provider,
        &config.queue,
        BackoffPolicy::from(&config.backoff),
    ));

    let concurrency = config.consumer.concurrency.clamp(1, MAX_CONCURRENCY);
    let permits = Arc::new(Semaphore::new(concurrency));
    let counters = Arc::new(Counters::default());
    let mut received = 0;
    let mut failure = None;

    let mut messages = receiver.stream(cancel);
    while let Some(item) = messages.next().await {
        let message = match item {
            Ok(message) => message,
            Err(e) => {
                failure = Some(e);
                break;
            }
        };
        received += 1;

        debug!(
            message_id = %message.message_id,
            body = %message.body,
            "Received message"
        );

        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let controller = Arc::clone(&controller);
        let counters = Arc::clone(&counters);
        tokio::spawn(
            async move {
                match controller.handle(&message).await {
                    BackoffDecision::Delete => counters.deleted.fetch_add(1, Ordering::Relaxed),
                    BackoffDecision::ChangeVisibility { .. } => {
                        counters.delayed.fetch_add(1, Ordering::Relaxed)
                    }
                };
                drop(permit);
            }
            .in_current_span(),
        );
    }

    // Every permit back means every handle finished
    let all = u32::try_from(concurrency).unwrap_or(u32::MAX);
    if permits.acquire_many(all).await.is_err() {
        error!("Handler permits closed before in-flight messages finished");
    }

    if let Some(e) = failure {
        error!(error = %e, "Receiving failed, consumer stopped");
        return Err(e);
    }

    Ok(ConsumeSummary {
        received,
        delayed: counters.delayed.load(Ordering::Relaxed),
        deleted: counters.deleted.load(Ordering::Relaxed),
    })
}
