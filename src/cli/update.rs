use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{error, info};

use crate::config::{PipelineConfig, CONFIG_KEYS};
use crate::database_ops::imdb::acquire::HttpAcquirer;
use crate::database_ops::imdb::archive::FileArchiver;
use crate::database_ops::imdb::pipeline::{ArchivePolicy, UpdatePipeline};
use crate::scheduler::{self, DailySchedule};
use crate::util::env as env_util;
use crate::util::pg::connect_postgres_auto;

#[derive(Debug, Clone, Default)]
pub struct UpdateConfig {
    /// Optional override for the Postgres connection string.
    pub database_url: Option<String>,
    /// Override IMDB_ARCHIVE_POLICY for this run.
    pub archive_policy: Option<ArchivePolicy>,
    /// Download the files one after another instead of concurrently.
    pub sequential: bool,
    /// Print the run report as JSON on stdout.
    pub json: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
    pub update: UpdateConfig,
    /// Run once at startup before waiting for the schedule.
    pub run_now: bool,
}

fn resolve(cfg: &UpdateConfig) -> Result<(String, PipelineConfig)> {
    env_util::init_env();
    env_util::preflight_check("imdbgraph", &[], CONFIG_KEYS)?;
    let database_url = match cfg.database_url.clone() {
        Some(url) => url,
        None => env_util::db_url()?,
    };
    let mut pipeline_cfg = PipelineConfig::from_env()?;
    if let Some(policy) = cfg.archive_policy {
        pipeline_cfg.archive_policy = policy;
    }
    if cfg.sequential {
        pipeline_cfg.parallel_downloads = false;
    }
    Ok((database_url, pipeline_cfg))
}

pub fn build_pipeline(cfg: &PipelineConfig) -> Result<UpdatePipeline<HttpAcquirer>> {
    let acquirer = HttpAcquirer::new(&cfg.base_url, &cfg.data_dir, cfg.http_timeout)
        .context("build HTTP client")?;
    let archiver = FileArchiver::new(&cfg.archive_dir, cfg.archive_capacity);
    Ok(UpdatePipeline::new(acquirer, archiver, cfg.pipeline_settings()))
}

/// One manual run. Exits with an error when the run fails.
pub async fn run(cfg: UpdateConfig) -> Result<()> {
    let (database_url, pipeline_cfg) = resolve(&cfg)?;
    let pipeline = build_pipeline(&pipeline_cfg)?;
    let mut client = connect_postgres_auto(&database_url).await?;

    let report = pipeline
        .update_database(&mut client)
        .await
        .context("update run failed")?;

    if cfg.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "update committed: {} shows, {} episodes in {:.1}s",
            report.shows_upserted,
            report.episodes_upserted,
            Duration::from_millis(report.elapsed_ms).as_secs_f64()
        );
    }
    Ok(())
}

/// Long-running scheduler; stops on Ctrl-C between runs.
pub async fn run_daemon(cfg: DaemonConfig) -> Result<()> {
    let (database_url, pipeline_cfg) = resolve(&cfg.update)?;
    let schedule = DailySchedule::new(
        pipeline_cfg.update_hour_utc,
        pipeline_cfg.update_minute_utc,
    )?;
    let pipeline = build_pipeline(&pipeline_cfg)?;
    info!(
        hour_utc = pipeline_cfg.update_hour_utc,
        minute_utc = pipeline_cfg.update_minute_utc,
        policy = %pipeline_cfg.archive_policy,
        "daemon: started"
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "daemon: failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    let pipeline = &pipeline;
    let database_url = database_url.as_str();
    scheduler::run_daily(schedule, cfg.run_now, shutdown, move || async move {
        // Fresh connection per run; the daemon idles for a day between runs.
        let mut client = match connect_postgres_auto(database_url).await {
            Ok(client) => client,
            Err(e) => {
                error!(error = %format!("{e:#}"), "daemon: database connection failed");
                return;
            }
        };
        match pipeline.update_database(&mut client).await {
            Ok(report) => info!(
                shows = report.shows_upserted,
                episodes = report.episodes_upserted,
                elapsed_ms = report.elapsed_ms,
                "daemon: run committed"
            ),
            Err(e) => error!(
                error = %format!("{:#}", anyhow::Error::new(e)),
                "daemon: run failed; next attempt at the next scheduled time"
            ),
        }
    })
    .await
}
