//! Test harness with testcontainers for integration testing.
//!
//! One PostgreSQL container is shared across the whole test run; each test
//! gets its own freshly created database, because the task queue and the
//! catalog are global surfaces that parallel tests must not share.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use data_manager::catalog::SchemaOperations;
use data_manager::{Config, Store};
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

struct SharedPostgres {
    url_base: String,
    // Keep the container alive for the entire test run
    _container: ContainerAsync<Postgres>,
}

static SHARED_PG: OnceCell<SharedPostgres> = OnceCell::const_new();

impl SharedPostgres {
    async fn init() -> Result<Self> {
        // Respect RUST_LOG when debugging tests; try_init avoids panicking
        // when another test got there first.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let container = Postgres::default()
            .start()
            .await
            .context("failed to start Postgres container")?;
        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;

        Ok(Self {
            url_base: format!("postgresql://postgres:postgres@{host}:{port}"),
            _container: container,
        })
    }

    async fn get() -> &'static Self {
        SHARED_PG
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// Per-test store plus the configuration the job manager runs with.
pub struct TestHarness {
    pub store: Store,
    pub config: Config,
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedPostgres::get().await;

        let db_name = format!("dm_test_{}", Uuid::new_v4().simple());
        let admin = sqlx::PgPool::connect(&format!("{}/postgres", infra.url_base))
            .await
            .context("failed to connect for database creation")?;
        sqlx::query(&format!(r#"CREATE DATABASE "{db_name}""#))
            .execute(&admin)
            .await
            .context("failed to create test database")?;
        admin.close().await;

        let database_url = format!("{}/{db_name}", infra.url_base);
        let store = Store::open(&database_url)
            .await
            .context("failed to open store")?;

        let config = Config {
            database_url,
            output_path: PathBuf::from("/tmp/joboutput"),
            output_filename_pattern: "{PRODUCT}-{LEVEL}-{VERSION}-{Y}{m}{d}{H}{M}{S}".to_string(),
            task_quota: 4,
            job_quota: 2,
            cleanup_after_secs: 3600,
            max_task_retries: 1,
        };

        Ok(Self { store, config })
    }

    /// The YAML catalog fixtures used by the schema and manager tests.
    pub fn schema_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/schema")
    }

    /// Load the fixture catalog into this test's database.
    pub async fn populate_catalog(&self) -> Result<()> {
        let mut tx = self.store.begin().await?;
        tx.populate_schema(&Self::schema_dir()).await?;
        tx.commit().await?;
        Ok(())
    }
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("failed to create test harness")
    }

    async fn teardown(self) {
        self.store.pool().close().await;
    }
}
