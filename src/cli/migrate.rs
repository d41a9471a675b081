use anyhow::Result;
use tracing::info;

use crate::util::db::Db;
use crate::util::env as env_util;

#[derive(Debug, Clone, Default)]
pub struct MigrateConfig {
    /// Optional override for the Postgres connection string.
    pub database_url: Option<String>,
}

pub async fn run(cfg: MigrateConfig) -> Result<()> {
    env_util::init_env();
    let db_url = match cfg.database_url {
        Some(url) => url,
        None => env_util::db_url()?,
    };
    let db = Db::connect(&db_url, 1).await?;
    let applied = db.run_migrations().await?;
    if applied.is_empty() {
        println!("schema up to date");
    } else {
        info!(versions = ?applied, "migrate: applied");
        println!("applied migrations: {applied:?}");
    }
    Ok(())
}
