//! Test helpers: a throwaway Postgres with the workspace migrations applied.
//!
//! Run from workspace root: `cargo test -p pictor-db --test postgres_repository_test`.
//! Migrations path: from pictor-db crate root, `../../migrations`.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

use pictor_core::models::{DerivativeStatus, NewSourceImage, SourceImage};
use pictor_db::{
    PostgresDerivativeRepository, PostgresSourceImageRepository, SourceImageRepository,
};

pub struct TestDb {
    pub pool: PgPool,
    pub derivatives: PostgresDerivativeRepository,
    pub sources: PostgresSourceImageRepository,
    _container: ContainerAsync<Postgres>,
}

impl TestDb {
    /// Start a Postgres container, or `None` when Docker is unavailable or
    /// SKIP_POSTGRES_TESTS is set. Only a failed container start skips;
    /// connection and migration errors still panic.
    pub async fn start() -> Option<Self> {
        if std::env::var_os("SKIP_POSTGRES_TESTS").is_some() {
            eprintln!("Skipping PostgreSQL test (SKIP_POSTGRES_TESTS set)");
            return None;
        }
        let container = match Postgres::default().with_tag("15-alpine").start().await {
            Ok(container) => container,
            Err(e) => {
                eprintln!("Skipping PostgreSQL test (Docker unavailable): {e}");
                return None;
            }
        };
        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get port");

        let connection_string = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .expect("Failed to connect to test database");

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .expect("Failed to run migrations");

        Some(Self {
            derivatives: PostgresDerivativeRepository::new(pool.clone()),
            sources: PostgresSourceImageRepository::new(pool.clone()),
            pool,
            _container: container,
        })
    }

    /// Register an original so derivative rows have a parent.
    pub async fn source(&self) -> SourceImage {
        let hash = format!("{:064x}", Uuid::new_v4().as_u128());
        self.sources
            .create(NewSourceImage {
                file_name: "cat.png".to_string(),
                content_type: "image/png".to_string(),
                storage_key: format!("originals/{}/{}.png", &hash[..2], hash),
                content_hash: hash,
                file_size: 1024,
            })
            .await
            .expect("source image inserted")
    }

    /// Write lifecycle columns directly, bypassing the state machine.
    pub async fn force(
        &self,
        id: Uuid,
        status: DerivativeStatus,
        retry_count: i32,
        next_retry_at: Option<DateTime<Utc>>,
        updated_at: DateTime<Utc>,
    ) {
        sqlx::query(
            r#"
            UPDATE derivatives
            SET status = $2, retry_count = $3, next_retry_at = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(retry_count)
        .bind(next_retry_at)
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .expect("derivative forced");
    }
}
