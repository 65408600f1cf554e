//! Chatgate - Main entry point.

use anyhow::Result;
use chatgate_common::config::Config;
use chatgate_common::logging::init_logging_with_exclusions;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration (file + environment) and validate before doing anything else
    let config = Config::load_and_validate()?;

    init_logging_with_exclusions(
        &config.observability.log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );

    tracing::info!("Chatgate v{}", env!("CARGO_PKG_VERSION"));

    chatgate_server::start_server(&config).await
}
