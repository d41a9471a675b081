//! Daily import of the IMDb non-commercial datasets into Postgres.

pub mod cli;
pub mod config;
pub mod database_ops;
pub mod logging;
pub mod scheduler;

pub mod util {
    pub mod db;
    pub mod env;
    pub mod pg;
}
