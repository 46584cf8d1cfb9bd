/// ChatKu server - broker and credential endpoint
use chatku_core::{Config, Server};
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    info!("Starting ChatKu server");
    info!("   Room: {}", config.channel_name);
    info!("   Broker: {}", config.broker_listen_addr);
    info!("   Credentials: http://{}", config.http_addr);
    if config.api_key.is_none() {
        info!("   No CHATKU_API_KEY set; clients will not be able to join");
    }

    let server = Server::new(config);
    server.start().await.map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
