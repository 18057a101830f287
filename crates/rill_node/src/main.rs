//! Rill node entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use rill_node::config::NodeConfig;
use rill_node::server::Server;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = NodeConfig::parse();
    if let Err(err) = cfg.validate() {
        tracing::error!(error = %err, "invalid configuration");
        std::process::exit(2);
    }

    let server = match Server::start(&cfg).await {
        Ok(server) => server,
        Err(err) => {
            tracing::error!(error = %err, "node failed to start");
            std::process::exit(1);
        }
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "signal handler failed");
    }
    tracing::info!("shutting down");
    if let Err(err) = server.stop().await {
        tracing::error!(error = %err, "shutdown failed");
        std::process::exit(1);
    }
}
