//! Shared test infrastructure: one Postgres container for the whole run,
//! migrations applied once, per-test isolation via distinct tenants.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use master_core::store::Store;
use transcode_core::fsm::{RetryPolicy, TimeoutPolicy};
use transcode_core::tenant::TenantQuotas;

struct SharedTestInfra {
    db_url: String,
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .start()
            .await
            .context("failed to start Postgres container")?;

        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&db_url)
            .await
            .context("failed to connect for migrations")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;

        Ok(Self {
            db_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("failed to initialize shared test infrastructure")
            })
            .await
    }
}

pub async fn test_pool() -> PgPool {
    let infra = SharedTestInfra::get().await;
    PgPoolOptions::new()
        .max_connections(5)
        .connect(&infra.db_url)
        .await
        .expect("failed to connect to test database")
}

/// A store with the default policies, except a short retry backoff so tests
/// that wait for promotion stay fast.
pub async fn test_store() -> Arc<Store> {
    let retry = RetryPolicy {
        initial_backoff: std::time::Duration::from_millis(50),
        ..RetryPolicy::default()
    };
    Arc::new(Store::new(
        test_pool().await,
        retry,
        TimeoutPolicy::default(),
    ))
}

/// A fresh tenant with roomy quotas; tests isolate on tenants, not schemas.
pub async fn fresh_tenant(store: &Store) -> transcode_core::tenant::Tenant {
    store
        .create_tenant(
            &format!("t-{}", Uuid::new_v4()),
            "standard",
            TenantQuotas {
                max_jobs: 1000,
                max_workers: 100,
                max_jobs_per_hour: 10_000,
                ..TenantQuotas::default()
            },
        )
        .await
        .expect("failed to create test tenant")
}
