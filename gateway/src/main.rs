mod config;

use clap::{Parser, Subcommand};
use config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use ingest::errors::IngestError;
use metrics_exporter_statsd::StatsdBuilder;
use shared::metrics_defs::describe_all;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(version, about = "Device telemetry ingestion gateway")]
struct Cli {
    /// Path to the YAML config file
    #[arg(long, default_value = "gateway.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve the ingestion and admin listeners
    Run,
    /// Load and validate the config, then exit
    Validate,
}

#[derive(thiserror::Error, Debug)]
enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli_main(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn cli_main(cli: Cli) -> Result<(), GatewayError> {
    let config = Config::from_file(&cli.config)?;
    config.validate()?;

    match cli.command {
        CliCommand::Validate => {
            println!("{}: ok", cli.config.display());
            Ok(())
        }
        CliCommand::Run => {
            let _sentry = init_logging(config.common.logging.as_ref());
            if let Some(metrics) = &config.common.metrics {
                init_metrics(metrics)?;
            }

            tracing::info!(config = %cli.config.display(), "starting gateway");
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(ingest::run(config.ingest, shutdown_signal()))?;
            tracing::info!("gateway stopped");
            Ok(())
        }
    }
}

/// Installs the fmt subscriber, plus sentry when a DSN is configured.
///
/// The returned guard flushes pending sentry events when dropped.
fn init_logging(config: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let level = config.map_or("info", |c| c.level.as_str());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let guard = config.and_then(|c| c.sentry_dsn.as_deref()).map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(sentry_layer)
        .init();

    guard
}

fn init_metrics(config: &MetricsConfig) -> Result<(), GatewayError> {
    let recorder = StatsdBuilder::from(config.statsd_host.clone(), config.statsd_port)
        .build(Some(&config.prefix))
        .map_err(|e| GatewayError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| GatewayError::Metrics(e.to_string()))?;

    describe_all(registry::metrics_defs::ALL_METRICS);
    describe_all(ingest::metrics_defs::ALL_METRICS);
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received ctrl-c"),
        Err(e) => {
            // Without a signal handler, run until the listeners fail.
            tracing::error!("could not listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    }
}
