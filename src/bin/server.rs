use log::{error, info};
use std::process;
use std::sync::Arc;

use chat_relay::config::BrokerConfig;
use chat_relay::core::server::ChatBroker;

#[tokio::main]
async fn main() {
    // Load .env before logger init so RUST_LOG from the file is honored
    let dotenv_result = dotenvy::dotenv();

    // Initialize logging
    env_logger::init();

    if let Ok(path) = dotenv_result {
        info!("Environment variables loaded from {}", path.display());
    }

    // Load config from the environment
    let config = match BrokerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            process::exit(1);
        }
    };

    info!("Configuration: host={}, port={}", config.host, config.port);

    let broker = Arc::new(ChatBroker::new(config));

    // Ctrl+C drains every session and stops the accept loop
    {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let summary = broker.shutdown().await;
                info!(
                    "Drained {} sessions ({} connections, {} messages total)",
                    summary.sessions_drained, summary.total_connections, summary.total_messages
                );
            }
        });
    }

    // Start the broker; blocks until shutdown
    if let Err(e) = broker.start().await {
        error!("Failed to start chat relay: {}", e);
        process::exit(1);
    }
}
