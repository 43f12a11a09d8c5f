use anyhow::Result;
use appvisor_common::HostVersion;
use appvisor_config_store::{ConfigStore, ENABLEMENT_GROUP};
use appvisor_packages::{Orchestrator, OrchestratorConfig};
use clap::Parser;
use tracing::info;

/// Micro-app supervisor daemon.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding one subdirectory per installed package
    #[arg(long, env = "APPVISOR_STORAGE", value_name = "DIR")]
    storage: String,

    /// Directory holding configuration group files
    #[arg(long, env = "APPVISOR_PARAMS", value_name = "DIR")]
    params: String,

    /// Host version advertised to packages, dotted components
    #[arg(long, default_value = env!("CARGO_PKG_VERSION"))]
    host_version: String,

    /// Command run inside a staged package before installation
    /// (program plus arguments)
    #[arg(long, num_args = 1.., value_name = "CMD")]
    install_command: Option<Vec<String>>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    initialize_logging(args.debug)?;

    info!(storage = %args.storage, params = %args.params, "starting appvisord");

    let host_version: HostVersion = args.host_version.parse()?;
    let store = ConfigStore::open(&args.params).await?;

    let mut config = OrchestratorConfig::new(&args.storage, host_version);
    config.install_command = args.install_command.clone();
    let orchestrator = Orchestrator::open(config, store).await?;
    orchestrator.connect(ENABLEMENT_GROUP);

    info!(packages = orchestrator.unit_names().len(), "appvisord running");
    wait_for_shutdown().await;

    info!("shutting down");
    orchestrator.shutdown();
    Ok(())
}

fn initialize_logging(debug: bool) -> Result<()> {
    let level = if debug { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .init();

    Ok(())
}

async fn wait_for_shutdown() {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("received Ctrl+C");
    }
}
