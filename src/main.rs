//! podbridge - Docker Engine API on top of a Kubernetes namespace
//!
//! ## Usage
//!
//! ```bash
//! # Serve the engine API against the current kube context
//! podbridge serve --namespace test
//!
//! # Point Docker clients at it
//! export DOCKER_HOST=tcp://127.0.0.1:2475
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use podbridge::backend::Backend;
use podbridge::config::{init_logging, Config};
use podbridge::kube::{KubeOrchestrator, Orchestrator};
use podbridge::server;

#[derive(Parser, Debug)]
#[command(name = "podbridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the engine API
    Serve {
        /// Listen address
        #[arg(short, long, default_value = "127.0.0.1:2475")]
        listen_addr: String,
        /// Namespace workloads are scheduled into
        #[arg(short, long, default_value = "default")]
        namespace: String,
        /// Seconds to wait for a workload to come up
        #[arg(long, default_value_t = 60)]
        timeout: u64,
        /// Do not create services for network aliases
        #[arg(long)]
        disable_services: bool,
        /// Do not forward declared ports to local endpoints
        #[arg(long)]
        disable_port_forward: bool,
        /// Fail mounts that would need a post-start copy
        #[arg(long)]
        disable_exec_copy: bool,
        /// Report containers running before their mount copies finished
        #[arg(long)]
        early_ready: bool,
        /// Service account for created workloads
        #[arg(long)]
        service_account: Option<String>,
        /// Default image pull policy (default, always, never, ifnotpresent)
        #[arg(long)]
        pull_policy: Option<String>,
        /// Seconds before leftover containers and resources are reaped
        #[arg(long, default_value_t = 300)]
        reap_max_age: u64,
        /// Log level when RUST_LOG is not set
        #[arg(long, default_value = "info")]
        log_level: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Serve {
            listen_addr,
            namespace,
            timeout,
            disable_services,
            disable_port_forward,
            disable_exec_copy,
            early_ready,
            service_account,
            pull_policy,
            reap_max_age,
            log_level,
        } => {
            let config = Config {
                listen_addr,
                namespace,
                start_timeout_secs: timeout,
                disable_services,
                disable_port_forward,
                disable_exec_copy,
                ready_requires_mounts: !early_ready,
                service_account,
                pull_policy,
                reap_max_age_secs: reap_max_age,
                log_level,
            };
            serve(config).await
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    init_logging(&config.log_level);

    let orchestrator = KubeOrchestrator::try_default(&config.namespace)
        .await
        .context("could not connect to the cluster")?;
    let orchestrator: Arc<dyn Orchestrator> = Arc::new(orchestrator);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let backend = Arc::new(Backend::new(&config, orchestrator, shutdown_rx));

    let reaper = tokio::spawn(Arc::clone(&backend).run_reaper(
        config.reap_max_age(),
        shutdown_tx.subscribe(),
    ));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("could not bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, namespace = %config.namespace, "engine API listening");

    let app = server::router(Arc::clone(&backend));
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    // Cancel in-flight starts and the reaper, then sweep everything this
    // run created.
    let _ = shutdown_tx.send(true);
    let _ = reaper.await;
    backend.purge().await;
    info!("shutdown complete");
    Ok(())
}
