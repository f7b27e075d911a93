use broadcast_hub::{Config, Server};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("broadcast-hub: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        idle_timeout_secs = config.idle_timeout.map(|d| d.as_secs()).unwrap_or(0),
        include_sender = config.include_sender,
        workers = ?config.workers,
        "Starting broadcast hub"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers.max(1));
    }
    let runtime = match builder.enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        let server = Server::bind(config).await?;
        server.run().await
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Broadcast hub failed");
            ExitCode::FAILURE
        }
    }
}
