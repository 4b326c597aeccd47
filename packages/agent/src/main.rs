// Main entry point for the worker agent.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_core::readiness::{self, ReadinessState};
use agent_core::{Agent, MasterClient};
use transcode_core::config::AgentConfig;
use transcode_wrapper::{CgroupManager, Supervisor, WrapperMetrics};

#[derive(Parser, Debug)]
#[command(name = "transcode-agent", about = "Transcoding worker agent")]
struct Args {
    /// Master base URL; overrides the MASTER_URL environment variable.
    #[arg(long)]
    master_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,agent_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting transcode agent");

    let mut config = AgentConfig::from_env().context("failed to load configuration")?;
    if let Some(master_url) = args.master_url {
        config.master_url = master_url;
    }

    std::fs::create_dir_all(&config.scratch_dir).with_context(|| {
        format!(
            "failed to create scratch dir {}",
            config.scratch_dir.display()
        )
    })?;

    let profile = agent_core::capabilities::probe();
    let client = Arc::new(
        MasterClient::new(&config.master_url, &config.auth_token)
            .context("failed to build master client")?,
    );
    let supervisor = Arc::new(Supervisor::new(
        CgroupManager::new(),
        Arc::new(WrapperMetrics::new()),
    ));

    let agent = Arc::new(Agent::new(
        client,
        config.clone(),
        supervisor,
        profile,
    ));

    // Readiness endpoint runs beside the agent for the fleet's orchestrator.
    let readiness_state = ReadinessState {
        scratch_dir: config.scratch_dir.clone(),
        last_master_contact: agent.last_master_contact(),
    };
    let readiness_port = config.readiness_port;
    tokio::spawn(async move {
        if let Err(e) = readiness::serve(readiness_state, readiness_port).await {
            tracing::error!(error = %e, "readiness endpoint failed");
        }
    });

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received, draining");
        signal_token.cancel();
    });

    agent.run(shutdown).await?;
    tracing::info!("agent exited");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
