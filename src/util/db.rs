use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool, Row,
};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

/// Versioned schema files, applied in order. Versions are never reused.
const MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "imdb_schema",
    include_str!("../../migrations/0001_imdb_schema.sql"),
)];

/// Pooled handle used for schema management and read-only reporting.
#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

/// Row counts of the durable tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TableCounts {
    pub shows: i64,
    pub episodes: i64,
    pub valid_shows: i64,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        // PgBouncer txn mode safe
        let mut connect_options =
            PgConnectOptions::from_str(database_url)?.statement_cache_capacity(0);

        // Ensure TLS is enabled when DSN contains sslmode=require
        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await
            .context("failed to connect to database")?;
        info!("connected to db");
        Ok(Self { pool })
    }

    /// Apply every embedded migration that has not been recorded yet.
    /// Returns the versions applied by this call.
    pub async fn run_migrations(&self) -> Result<Vec<i64>> {
        // Use raw_sql to avoid prepared statements under PgBouncer
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _imdb_migrations (
                version BIGINT PRIMARY KEY,
                description TEXT,
                installed_at TIMESTAMPTZ DEFAULT now()
             )",
        )
        .execute(&self.pool)
        .await?;

        let applied_rows = sqlx::raw_sql("SELECT version FROM _imdb_migrations")
            .fetch_all(&self.pool)
            .await?;
        let mut applied: HashSet<i64> = HashSet::new();
        for r in applied_rows {
            applied.insert(r.try_get::<i64, _>(0)?);
        }

        let mut newly_applied = Vec::new();
        for &(version, desc, sql) in MIGRATIONS {
            if applied.contains(&version) {
                continue;
            }
            info!(version, desc, "applying migration");
            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(sql)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("migration {version} ({desc}) failed"))?;
            let insert_stmt = format!(
                "INSERT INTO _imdb_migrations(version, description) VALUES ({}, '{}')",
                version,
                desc.replace('\'', "''")
            );
            sqlx::raw_sql(&insert_stmt).execute(&mut *tx).await?;
            tx.commit().await?;
            applied.insert(version);
            newly_applied.push(version);
        }
        info!(applied = newly_applied.len(), "migrations up-to-date");
        Ok(newly_applied)
    }

    #[instrument(skip(self))]
    pub async fn table_counts(&self) -> Result<TableCounts> {
        let row = sqlx::query(
            "SELECT
                (SELECT count(*) FROM imdb.show)       AS shows,
                (SELECT count(*) FROM imdb.episode)    AS episodes,
                (SELECT count(*) FROM imdb.valid_show) AS valid_shows",
        )
        .persistent(false)
        .fetch_one(&self.pool)
        .await
        .context("count durable tables")?;
        Ok(TableCounts {
            shows: row.try_get("shows")?,
            episodes: row.try_get("episodes")?,
            valid_shows: row.try_get("valid_shows")?,
        })
    }
}
