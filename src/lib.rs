pub mod agent_core;
pub mod config;
pub mod inference;
pub mod server;
pub mod stores;

use config::{LogFormat, LoggingConfig};

/// Platform data directory for the default database.
///
/// Falls back to `~/.pai/` when the platform directory can't be resolved.
pub(crate) fn data_dir() -> std::path::PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("pai-orchestrator");
    }
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".pai")
}

/// Install the global tracing subscriber and log the startup banner.
///
/// `RUST_LOG` overrides the default filter. Calling this twice is a no-op.
pub fn init_tracing(logging: &LoggingConfig) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pai_orchestrator=info,tower_http=info,warn"));

    let installed = match logging.format {
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_current_span(true)
            .try_init(),
        LogFormat::Pretty => fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .try_init(),
    };
    if installed.is_err() {
        return;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir().display(),
        pid = std::process::id(),
        "=== pai-orchestrator starting ==="
    );
}
