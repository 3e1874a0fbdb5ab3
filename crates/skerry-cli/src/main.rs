//! skerry entry point.
//!
//! Logs go to stderr; `RUST_LOG` overrides the default `skerry=info`.

mod cli;

use clap::Parser;
use cli::{Cli, Command};
use skerry_core::{FirecrackerDriver, Orchestrator, RuntimeConfig};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("skerry=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("Run Container error: {err:#}");
        std::process::exit(-1);
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = RuntimeConfig::from_env()?;
    cli.apply(&mut config);
    config.validate()?;
    tracing::debug!(?config, "Configuration loaded");

    let driver = Arc::new(FirecrackerDriver::new(config.clone()));
    let orchestrator = Orchestrator::new(config, driver);

    match cli.command {
        Command::Create(args) => {
            let created = orchestrator.create_container(args.into()).await?;
            tracing::info!(
                container_id = %created.state.id,
                sandbox = %created.sandbox,
                pid = created.state.pid,
                "Create done"
            );
        }
    }
    Ok(())
}
