// src/main.rs
use clap::Parser;
use feature_materializer::cli::{execute_command, Cli, EXIT_ERROR};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize environment
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Parse command line arguments
    let cli = Cli::parse();

    let code = match execute_command(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            EXIT_ERROR
        }
    };

    std::process::exit(code);
}
