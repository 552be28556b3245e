//! loadgen: synthetic telemetry load generator
//!
//! `loadgen start` serves the HTTP API; `loadgen run` executes a single test in
//! process and prints the delivery statistics when it ends.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use api::ApiState;
use clap::{Args, Parser, Subcommand};
use common::cli::{CommonArgs, CommonCommands, utils};
use common::config::Configuration;
use common::{CoreError, Destination, NewTest};
use delivery::DeliveryWorkerPool;
use orchestrator::TestOrchestrator;

#[derive(Parser, Debug)]
#[command(name = "loadgen", author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(flatten)]
    Common(CommonCommands),
    /// Run a single test in process and print its delivery statistics
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Log records per second
    #[arg(long, default_value_t = 0.0)]
    log_rate: f64,
    /// Metric records per second
    #[arg(long, default_value_t = 0.0)]
    metrics_rate: f64,
    /// Trace records per second
    #[arg(long, default_value_t = 0.0)]
    trace_rate: f64,
    /// Byte budget per log message
    #[arg(long, default_value_t = 256)]
    log_size: usize,
    /// Test duration in seconds
    #[arg(long, default_value_t = 10)]
    duration: u64,
    /// Base path of a rotating file destination (repeatable)
    #[arg(long)]
    file: Vec<PathBuf>,
    /// HTTP endpoint destination (repeatable)
    #[arg(long)]
    http: Vec<String>,
    /// Bearer credential sent to HTTP destinations
    #[arg(long)]
    credential: Option<String>,
    #[arg(long, default_value = "cli")]
    owner: String,
}

impl RunArgs {
    fn to_new_test(&self) -> NewTest {
        let files = self.file.iter().cloned().map(Destination::file);
        let endpoints = self.http.iter().map(|endpoint| {
            let destination = Destination::http(endpoint.clone());
            match &self.credential {
                Some(credential) => destination.with_credential(credential.clone()),
                None => destination,
            }
        });

        NewTest {
            owner: self.owner.clone(),
            log_rate: Some(self.log_rate),
            metrics_rate: Some(self.metrics_rate),
            trace_rate: Some(self.trace_rate),
            log_size: self.log_size,
            duration_secs: self.duration,
            destinations: files.chain(endpoints).collect(),
        }
    }
}

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => log::info!("Received SIGINT"),
            _ = sigterm.recv() => log::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        log::info!("Received Ctrl+C");
    }

    Ok(())
}

async fn build_orchestrator(config: &Configuration) -> Result<TestOrchestrator> {
    utils::validate_config(config)?;

    let store = common::store::connect(&config.store)
        .await
        .context("Failed to open test store")?;
    let pool = DeliveryWorkerPool::start(&config.delivery)
        .context("Failed to start delivery worker pool")?;

    Ok(TestOrchestrator::new(store, Arc::new(pool), config))
}

async fn serve(config: Configuration) -> Result<()> {
    let orchestrator = build_orchestrator(&config).await?;

    if config.orchestrator.recover_on_startup {
        orchestrator
            .recover()
            .await
            .context("Failed to recover persisted tests")?;
    }

    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind API listener on {}", config.api.listen))?;

    let shutdown = async {
        if let Err(e) = wait_for_shutdown_signal().await {
            log::error!("Shutdown signal handler failed: {e:?}");
        }
    };
    let served = api::serve(listener, ApiState::new(orchestrator.clone()), shutdown).await;

    log::info!("Stopping live tests");
    orchestrator.shutdown().await;
    served.context("API server failed")
}

async fn run_once(config: Configuration, args: RunArgs) -> Result<()> {
    let orchestrator = build_orchestrator(&config).await?;

    let test = orchestrator
        .create_test(args.to_new_test())
        .await
        .context("Invalid test definition")?;
    let id = orchestrator
        .start_test(test)
        .await
        .context("Failed to start test")?;
    tracing::info!(test_id = %id, duration_secs = args.duration, "Running test");

    tokio::select! {
        _ = orchestrator.wait_for(&id) => {}
        signal = wait_for_shutdown_signal() => {
            signal?;
            match orchestrator.cancel_test(&id).await {
                // the run ended on its own while the signal arrived
                Ok(()) | Err(CoreError::StateConflict { .. }) => {}
                Err(e) => return Err(e).context("Failed to cancel test"),
            }
        }
    }

    let test = orchestrator.get_test_by_id(&id).await?;
    let delivery = orchestrator.pool().stats().snapshot();
    orchestrator.shutdown().await;

    let report = serde_json::json!({
        "test": test,
        "delivery": delivery,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to serialize report")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    utils::init_logging(&cli.common);

    let config = utils::load_config(cli.common.config.as_ref())?;

    match cli.command {
        Some(Command::Run(args)) => run_once(config, args).await,
        Some(Command::Common(command)) => {
            if utils::handle_common_command(&command, &config).await? {
                return Ok(());
            }
            serve(config).await
        }
        None => serve(config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::DestinationTarget;

    #[test]
    fn test_run_arguments() {
        let cli = Cli::try_parse_from([
            "loadgen",
            "-v",
            "run",
            "--log-rate",
            "5",
            "--duration",
            "1",
            "--file",
            "/tmp/loadgen/out",
            "--http",
            "http://collector:4318",
            "--credential",
            "token",
        ])
        .unwrap();

        assert!(cli.common.verbose);
        let Some(Command::Run(args)) = cli.command else {
            panic!("expected run command");
        };
        let new_test = args.to_new_test();
        assert!(new_test.validate().is_ok());
        assert_eq!(new_test.destinations.len(), 2);
        assert!(matches!(
            new_test.destinations[0].target,
            DestinationTarget::File { .. }
        ));
        assert_eq!(new_test.destinations[1].credential.as_deref(), Some("token"));
    }

    #[test]
    fn test_common_subcommands_parse() {
        let cli = Cli::try_parse_from(["loadgen", "config", "--json"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Common(CommonCommands::Config { json: true }))
        ));

        let cli = Cli::try_parse_from(["loadgen"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_run_without_destination_is_invalid() {
        let cli = Cli::try_parse_from(["loadgen", "run", "--log-rate", "5"]).unwrap();
        let Some(Command::Run(args)) = cli.command else {
            panic!("expected run command");
        };
        assert!(args.to_new_test().validate().is_err());
    }
}
