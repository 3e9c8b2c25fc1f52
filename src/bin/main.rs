//! resolvhook binary entry point.

use clap::Parser;
use resolvhook::command::ShellRunner;
use resolvhook::supervisor::{cancel_on_signals, Supervisor};
use resolvhook::webhook::WebhookClient;
use resolvhook::{telemetry, Config, Dispatcher};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// DNS forwarding proxy that runs commands and webhooks when answers match rules.
#[derive(Parser, Debug)]
#[command(name = "resolvhook")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML). Created with defaults if missing.
    #[arg(short, long, default_value = "resolvhook.yml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Telemetry settings come from the config file; the supervisor reloads
    // everything else from it on its own.
    let telemetry_config = match Config::load(&args.config).await {
        Ok(config) => config.telemetry,
        Err(e) => {
            eprintln!("Error while reading config {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = telemetry::init(&telemetry_config) {
        eprintln!("Failed to initialize telemetry: {}", e);
        return ExitCode::FAILURE;
    }

    let webhook = match WebhookClient::new() {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to build HTTP client: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(ShellRunner::detect()), webhook));

    let shutdown = CancellationToken::new();
    cancel_on_signals(shutdown.clone());

    info!(config_file = %args.config.display(), "Service starting");

    let result = Supervisor::new(args.config, dispatcher.clone(), shutdown)
        .run()
        .await;

    // Detached triggers run to completion even on shutdown.
    dispatcher.wait_detached().await;

    match result {
        Ok(()) => {
            info!("resolvhook shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("resolvhook error: {}", e);
            ExitCode::FAILURE
        }
    }
}
