//! sycri - container runtime shim daemon
//!
//! Serves the runtime and image services on a local Unix socket and drives
//! the privileged `starter` helper for every sandbox and container.
//!
//! ## Usage
//!
//! ```sh
//! sycri --sock /var/run/singularity.sock --store /var/lib/singularity
//! RUST_LOG=sycri=debug sycri
//! ```
//!
//! Every flag can also be set through its `SYCRI_*` environment variable.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use sycri::{RuntimeConfig, RuntimeContext, Server};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Container runtime shim over the starter helper
#[derive(Debug, Parser)]
#[command(name = "sycri")]
#[command(version)]
#[command(about = "Container runtime shim for SIF images", long_about = None)]
struct Cli {
    /// Unix socket to serve on
    #[arg(long, env = "SYCRI_SOCK")]
    sock: Option<PathBuf>,

    /// Image store directory
    #[arg(long, env = "SYCRI_STORE")]
    store: Option<PathBuf>,

    /// Directory for sandbox, container and starter records
    #[arg(long, env = "SYCRI_STATE")]
    state: Option<PathBuf>,

    /// Starter helper executable
    #[arg(long, env = "SYCRI_STARTER")]
    starter: Option<PathBuf>,

    /// Engine executable used for docker image builds
    #[arg(long, env = "SYCRI_SINGULARITY")]
    singularity: Option<PathBuf>,

    /// Library server address
    #[arg(long, env = "SYCRI_LIBRARY_URL")]
    library_url: Option<String>,

    /// Key verification server
    #[arg(long, env = "SYCRI_KEYS_SERVER")]
    keys_server: Option<String>,
}

impl Cli {
    fn into_config(self) -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        if let Some(sock) = self.sock {
            config.socket_path = sock;
        }
        if let Some(store) = self.store {
            config.store_dir = store;
        }
        if let Some(state) = self.state {
            config.state_dir = state;
        }
        if let Some(starter) = self.starter {
            config.starter_path = starter;
        }
        if let Some(singularity) = self.singularity {
            config.singularity_path = singularity;
        }
        if let Some(library) = self.library_url {
            config.endpoints.library = library;
        }
        if let Some(keys) = self.keys_server {
            config.endpoints.keys = keys;
        }
        config
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.into_config();
    let socket = config.socket_path.clone();
    info!(
        socket = %socket.display(),
        store = %config.store_dir.display(),
        state = %config.state_dir.display(),
        starter = %config.starter_path.display(),
        "starting sycri"
    );

    let context = RuntimeContext::start(config)
        .await
        .context("failed to start runtime services")?;
    Server::new(Arc::new(context))
        .serve(&socket, shutdown_signal())
        .await
        .context("server failed")?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "sycri exited with error");
            ExitCode::FAILURE
        }
    }
}
