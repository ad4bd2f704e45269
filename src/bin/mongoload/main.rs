#[macro_use]
extern crate async_trait;

mod args;
mod mongo;
mod printer;


use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use mongoload::backend::memory::MemoryBackend;
use mongoload::backend::Backend;
use mongoload::config::Config;
use mongoload::engine::{Engine, EngineController, EXIT_FAILURE, EXIT_INVALID_CONFIG};

use crate::args::Cli;
use crate::mongo::MongoBackend;
use crate::printer::StatsPrinter;

const MEMORY_SCHEME: &str = "memory://";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(exit_code) => exit_code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            EXIT_FAILURE
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<i32> {
    let stdin = args::read_piped_stdin()?;
    let (config, source) = cli.load_config(stdin.as_deref())?;

    init_logging(config.debug);
    tracing::debug!(?source, "configuration loaded");

    if let Err(err) = config.validate() {
        eprintln!("Invalid configuration:");
        for violation in err.violations() {
            eprintln!("  {violation}");
        }
        return Ok(EXIT_INVALID_CONFIG);
    }
    args::print_configuration(&config, &mut std::io::stdout())?;

    let backend = create_backend(&config).await?;
    let engine = Engine::new(config, backend)?;
    let (ctrl, engine_finished) = engine.start();
    let ctrl = Arc::new(ctrl);

    // Don't care about the leaking task, it won't prevent the runtime
    // from being stopped.
    tokio::task::spawn(stop_on_signal(Arc::clone(&ctrl)));

    let mut printer = StatsPrinter::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    futures::pin_mut!(engine_finished);

    // Skip the first tick, which is immediate
    ticker.tick().await;

    printer.print_header(&mut std::io::stdout())?;

    let report = loop {
        tokio::select! {
            _ = ticker.tick() => {
                let intervals = ctrl
                    .jobs()
                    .iter()
                    .map(|job| (job.name(), job.take_interval()))
                    .collect::<Vec<_>>();
                printer.print_partial(&intervals, &mut std::io::stdout())?;
            }
            report = &mut engine_finished => break report,
        }
    };

    printer.print_final(&report, &mut std::io::stdout())?;
    Ok(report.exit_code())
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // The report goes to stdout, keep it free of log lines
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn create_backend(config: &Config) -> Result<Arc<dyn Backend>> {
    if config.connection_string.starts_with(MEMORY_SCHEME) {
        tracing::info!("running against the in-memory store");
        return Ok(Arc::new(MemoryBackend::new()));
    }
    let backend = MongoBackend::connect(config)
        .await
        .context("Failed to set up the MongoDB client")?;
    Ok(Arc::new(backend))
}

async fn stop_on_signal(ctrl: Arc<EngineController>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    tracing::info!("interrupted, waiting for operations in flight (interrupt again to abort)");
    ctrl.ask_to_stop();

    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    tracing::info!("interrupted again, aborting");
    ctrl.abort();
}
