use anyhow::{Context, Result};
use std::fmt::Write as _;

use crate::util::db::{Db, TableCounts};
use crate::util::env as env_util;

#[derive(Debug, Clone, Default)]
pub struct DbCountsConfig {
    /// Optional override for the Postgres connection string.
    pub database_url: Option<String>,
    /// Print the counts as JSON instead of the text summary.
    pub json: bool,
}

pub async fn run(cfg: DbCountsConfig) -> Result<()> {
    env_util::init_env();
    let db_url = match cfg.database_url.clone() {
        Some(url) => url,
        None => env_util::db_url()?,
    };
    let db = Db::connect(&db_url, 2).await?;
    let counts = db.table_counts().await.context("db-counts")?;

    if cfg.json {
        println!("{}", serde_json::to_string_pretty(&counts)?);
    } else {
        print!("{}", render(&counts));
    }
    Ok(())
}

fn render(counts: &TableCounts) -> String {
    let mut out = String::new();
    writeln!(out, "DB COUNTS SUMMARY:").ok();
    writeln!(out, "imdb.show: {}", counts.shows).ok();
    writeln!(out, "imdb.episode: {}", counts.episodes).ok();
    writeln!(
        out,
        "imdb.valid_show: {} ({} shows without rated episodes)",
        counts.valid_shows,
        counts.shows - counts.valid_shows
    )
    .ok();
    out
}
