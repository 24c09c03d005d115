use pai_orchestrator::{config, init_tracing, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, path) = config::load_or_default()?;
    init_tracing(&config.logging);

    match path {
        Some(ref path) => tracing::info!(config = %path.display(), "configuration loaded"),
        None => tracing::info!("no {} found, using defaults", config::CONFIG_FILE_NAME),
    }

    server::run(config).await
}
