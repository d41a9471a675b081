use anyhow::Result;
use clap::{Parser, Subcommand};
use imdbgraph_updater::cli::db_counts::DbCountsConfig;
use imdbgraph_updater::cli::migrate::MigrateConfig;
use imdbgraph_updater::cli::update::{DaemonConfig, UpdateConfig};
use imdbgraph_updater::database_ops::imdb::ArchivePolicy;
use imdbgraph_updater::logging::{init_tracing, DEFAULT_FILTER};

#[derive(Parser, Debug)]
#[command(name = "imdbgraph", version, about = "IMDb dataset update pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Download the latest dataset files and replace the show/episode tables
    Update {
        /// Optional override for the Postgres connection string
        #[arg(long)]
        db_url: Option<String>,
        /// Which files to archive on failure: `implicated` or `all`
        #[arg(long)]
        policy: Option<ArchivePolicy>,
        /// Download files one at a time
        #[arg(long, default_value_t = false)]
        sequential: bool,
        /// Print the run report as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Run the update every day at IMDB_UPDATE_HOUR_UTC:IMDB_UPDATE_MINUTE_UTC
    Daemon {
        /// Optional override for the Postgres connection string
        #[arg(long)]
        db_url: Option<String>,
        /// Which files to archive on failure: `implicated` or `all`
        #[arg(long)]
        policy: Option<ArchivePolicy>,
        /// Run once immediately before waiting for the schedule
        #[arg(long, default_value_t = false)]
        run_now: bool,
    },
    /// Apply the embedded schema migrations
    Migrate {
        /// Optional override for the Postgres connection string
        #[arg(long)]
        db_url: Option<String>,
    },
    /// Print row counts of the durable tables
    DbCounts {
        /// Optional override for the Postgres connection string
        #[arg(long)]
        db_url: Option<String>,
        /// Print the counts as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    imdbgraph_updater::util::env::init_env();
    init_tracing(DEFAULT_FILTER)?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Update {
            db_url,
            policy,
            sequential,
            json,
        } => {
            imdbgraph_updater::cli::update::run(UpdateConfig {
                database_url: db_url,
                archive_policy: policy,
                sequential,
                json,
            })
            .await?
        }
        Commands::Daemon {
            db_url,
            policy,
            run_now,
        } => {
            imdbgraph_updater::cli::update::run_daemon(DaemonConfig {
                update: UpdateConfig {
                    database_url: db_url,
                    archive_policy: policy,
                    ..UpdateConfig::default()
                },
                run_now,
            })
            .await?
        }
        Commands::Migrate { db_url } => {
            imdbgraph_updater::cli::migrate::run(MigrateConfig {
                database_url: db_url,
            })
            .await?
        }
        Commands::DbCounts { db_url, json } => {
            imdbgraph_updater::cli::db_counts::run(DbCountsConfig {
                database_url: db_url,
                json,
            })
            .await?
        }
    }
    Ok(())
}
