use tracing_subscriber::{fmt, EnvFilter};

/// Filter used by the `rankwatch` binary when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,sqlx=warn,hyper=warn,reqwest=warn";

/// Installs the global fmt subscriber. `RUST_LOG` wins over `default_filter`.
///
/// Agents and collectors run concurrently, so records carry the thread id;
/// the platform / source fields on each event identify the worker.
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}
