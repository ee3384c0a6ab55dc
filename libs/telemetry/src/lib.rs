//! Logging and metrics setup for processes hosting chat widget instances.

use anyhow::Result;

mod config;
mod describe;
mod tracing_init;

pub use config::TelemetryConfig;
pub use describe::describe_metrics;
pub use tracing_init::init_telemetry;

/// Installs the subscriber configured from the environment (`RUST_LOG`,
/// `LOG_FORMAT`, `CHAT_WIDGET_LOG`) and describes the core metrics.
pub fn install(service_name: &str) -> Result<()> {
    init_telemetry(&TelemetryConfig::from_env(service_name))?;
    describe_metrics();
    Ok(())
}
