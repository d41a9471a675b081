//! Process-wide `tracing` setup shared by every subcommand.

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Directives used when `RUST_LOG` is unset: pipeline progress at info, the
/// database drivers only when they warn.
pub const DEFAULT_FILTER: &str = "info,sqlx=warn,tokio_postgres=warn";

/// Installs the global fmt subscriber, filtered by `RUST_LOG` or else by
/// `fallback`. Fails if a subscriber is already installed.
pub fn init_tracing(fallback: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow!("tracing subscriber already installed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installs_only_once() {
        let _ = init_tracing(DEFAULT_FILTER);
        assert!(init_tracing(DEFAULT_FILTER).is_err());
    }
}
