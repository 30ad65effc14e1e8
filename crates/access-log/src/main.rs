//! HTTP server that appends every request path to a log file.
//!
//! The log is closed in the first shutdown stage, once no request holds the
//! shutdown lock; the listener stops in the second stage.

mod logging;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use staged_shutdown::{Completion, Coordinator, ShutdownConfig};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use server::{AccessLog, AppState};

#[derive(Debug, Parser)]
#[command(
    name = "access-log",
    version,
    about = "Log HTTP requests to a file and close it cleanly on shutdown"
)]
struct Cli {
    /// Shutdown configuration (YAML). Defaults apply when omitted.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// File that receives one line per request.
    #[arg(long, value_name = "FILE", default_value = "log.txt")]
    log_file: PathBuf,
}

#[tokio::main]
async fn main() {
    if let Err(err) = try_main().await {
        error!(error = ?err, "access-log exited with error");
        std::process::exit(1);
    }
}

async fn try_main() -> Result<()> {
    let cli = Cli::parse();
    logging::init();

    let config = match &cli.config {
        Some(path) => ShutdownConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load config at {}", path.display()))?
            .validated()
            .context("invalid shutdown configuration")?,
        None => ShutdownConfig::default(),
    };

    let coordinator = Coordinator::from_config(&config);
    coordinator
        .on_signal(config.exit_code, &config.signals)
        .context("failed to install signal handlers")?;

    let log = AccessLog::create(&cli.log_file)
        .with_context(|| format!("failed to open {}", cli.log_file.display()))?;
    coordinator.first_func(
        |log: AccessLog| async move {
            info!("closing access log");
            if let Err(err) = log.close() {
                warn!(error = %err, "failed to flush access log");
            }
        },
        log.clone(),
    );

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;
    info!(listen = %cli.listen, log = %cli.log_file.display(), "serving");

    let (drained_tx, drained_rx) = oneshot::channel::<Completion>();
    let mut stop = coordinator.second();
    let app = server::router(AppState {
        coordinator: coordinator.clone(),
        log,
    });
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Some(completion) = stop.notified().await {
                let _ = drained_tx.send(completion);
            }
        })
        .await
        .context("http server failed")?;

    // Keep the second stage open until in-flight connections are gone.
    if let Ok(completion) = drained_rx.await {
        completion.done();
    }
    coordinator.exit(config.exit_code).await;
    Ok(())
}
