//! Tasklink CLI binary.

use anyhow::Result;
use tasklink::cli::Cli;
use tracing_subscriber::EnvFilter;

/// Main entry point for the tasklink CLI.
///
/// Uses tokio's current_thread runtime; the write queue's flush tasks and
/// the GitHub client run on it as well.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Controlled via RUST_LOG, e.g. RUST_LOG=tasklink=debug,tasklink_store=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tasklink=info,tasklink_store=info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!("Starting tasklink CLI");

    let cli = Cli::parse_args();
    cli.execute().await?;

    tracing::debug!("Tasklink CLI completed successfully");
    Ok(())
}
