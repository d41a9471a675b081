//! Runtime configuration resolved from the environment (`.env` honoured).

use crate::database_ops::imdb::archive::DEFAULT_ARCHIVE_CAPACITY;
use crate::database_ops::imdb::catalog::DEFAULT_BASE_URL;
use crate::database_ops::imdb::pipeline::{ArchivePolicy, PipelineSettings};
use crate::database_ops::imdb::staging::DEFAULT_BATCH_BYTES;
use crate::util::env::{env_flag, env_opt, env_parse_or, init_env};
use anyhow::{anyhow, bail, Result};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

/// Keys logged (redacted) by the preflight snapshot of each command.
pub const CONFIG_KEYS: &[&str] = &[
    "IMDB_DATABASE_URL",
    "DATABASE_URL",
    "IMDB_BASE_URL",
    "IMDB_DATA_DIR",
    "IMDB_ARCHIVE_DIR",
    "IMDB_ARCHIVE_CAPACITY",
    "IMDB_ARCHIVE_POLICY",
    "IMDB_PARALLEL_DOWNLOADS",
    "IMDB_HTTP_TIMEOUT_SECS",
    "IMDB_COPY_BATCH_BYTES",
    "IMDB_UPDATE_HOUR_UTC",
    "IMDB_UPDATE_MINUTE_UTC",
    "PG_SSLMODE",
];

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub base_url: String,
    pub data_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub archive_capacity: NonZeroUsize,
    pub archive_policy: ArchivePolicy,
    pub parallel_downloads: bool,
    pub http_timeout: Duration,
    pub copy_batch_bytes: usize,
    pub update_hour_utc: u32,
    pub update_minute_utc: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("./data");
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            archive_dir: data_dir.join("archive"),
            data_dir,
            archive_capacity: NonZeroUsize::new(DEFAULT_ARCHIVE_CAPACITY)
                .unwrap_or(NonZeroUsize::MIN),
            archive_policy: ArchivePolicy::Implicated,
            parallel_downloads: true,
            http_timeout: Duration::from_secs(600),
            copy_batch_bytes: DEFAULT_BATCH_BYTES,
            update_hour_utc: 8,
            update_minute_utc: 0,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        init_env();
        let defaults = Self::default();

        let data_dir = env_opt("IMDB_DATA_DIR").map_or(defaults.data_dir, PathBuf::from);
        let archive_dir = env_opt("IMDB_ARCHIVE_DIR")
            .map_or_else(|| data_dir.join("archive"), PathBuf::from);

        let archive_capacity: NonZeroUsize =
            env_parse_or("IMDB_ARCHIVE_CAPACITY", defaults.archive_capacity)?;
        let archive_policy = env_parse_or("IMDB_ARCHIVE_POLICY", defaults.archive_policy)?;
        let timeout_secs =
            env_parse_or("IMDB_HTTP_TIMEOUT_SECS", defaults.http_timeout.as_secs())?;

        let cfg = Self {
            base_url: env_opt("IMDB_BASE_URL").unwrap_or(defaults.base_url),
            data_dir,
            archive_dir,
            archive_capacity,
            archive_policy,
            parallel_downloads: env_flag("IMDB_PARALLEL_DOWNLOADS", defaults.parallel_downloads),
            http_timeout: Duration::from_secs(timeout_secs),
            copy_batch_bytes: env_parse_or("IMDB_COPY_BATCH_BYTES", defaults.copy_batch_bytes)?,
            update_hour_utc: env_parse_or("IMDB_UPDATE_HOUR_UTC", defaults.update_hour_utc)?,
            update_minute_utc: env_parse_or(
                "IMDB_UPDATE_MINUTE_UTC",
                defaults.update_minute_utc,
            )?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.update_hour_utc > 23 || self.update_minute_utc > 59 {
            bail!(
                "invalid daily update time {:02}:{:02} UTC",
                self.update_hour_utc,
                self.update_minute_utc
            );
        }
        if self.copy_batch_bytes == 0 {
            bail!("IMDB_COPY_BATCH_BYTES must be positive");
        }
        url::Url::parse(&self.base_url)
            .map_err(|e| anyhow!("IMDB_BASE_URL {:?} is not a URL: {e}", self.base_url))?;
        Ok(())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            download_dir: self.data_dir.clone(),
            archive_policy: self.archive_policy,
            parallel_downloads: self.parallel_downloads,
            copy_batch_bytes: self.copy_batch_bytes,
        }
    }
}
