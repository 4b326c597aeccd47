// Main entry point for the control-plane master.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use master_core::metrics::Metrics;
use master_core::scheduler::Scheduler;
use master_core::server::{build_app, AppState};
use master_core::store::Store;
use transcode_core::config::MasterConfig;

#[derive(Parser, Debug)]
#[command(name = "transcode-master", about = "Transcoding control-plane master")]
struct Args {
    /// Listen port; overrides the PORT environment variable.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,master_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting transcode master");

    let mut config = MasterConfig::from_env().context("failed to load configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.pool.max_open)
        .min_connections(config.pool.max_idle)
        .max_lifetime(config.pool.max_lifetime)
        .idle_timeout(config.pool.max_idle_time)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;
    tracing::info!("database connected");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;
    tracing::info!("migrations complete");

    let store = Arc::new(Store::new(pool, config.retry, config.timeouts));
    let metrics = Arc::new(Metrics::new().context("failed to build metrics registry")?);

    let shutdown = CancellationToken::new();
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        metrics.clone(),
        config.scheduler.clone(),
    ));
    let scheduler_handles = scheduler.spawn(&shutdown);

    let app = build_app(AppState {
        store,
        metrics,
        auth_tokens: config.auth_tokens.clone(),
        admin_token: config.admin_token.clone(),
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %addr, "master listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_signal(shutdown.clone()))
        .await
        .context("server error")?;

    // HTTP has drained; let the loops finish their in-flight cycles.
    shutdown.cancel();
    for handle in scheduler_handles {
        let _ = handle.await;
    }

    tracing::info!("master stopped");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM and propagate onto the scheduler token.
async fn wait_for_signal(shutdown: CancellationToken) {
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
    tracing::info!("shutdown signal received");
    shutdown.cancel();
}
