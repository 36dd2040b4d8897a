use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (GENFLOW_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("GENFLOW_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("genflow_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    let config = genflow_server::config::ServerConfig::parse();
    tracing::info!("Starting generation server on {}", config.listen_addr);
    tracing::info!(
        budget_secs = config.pipeline_budget_secs,
        rate_limit = config.rate_limit,
        claim_lease_secs = config.claim_lease_secs,
        "Pipeline settings"
    );
    let server = genflow_server::server::Server::new(config);
    server.run().await
}
