//! Logging service

use crate::models::LogLevel;

/// Initialize logging with the specified level
pub fn init_logging(level: LogLevel) -> anyhow::Result<()> {
    let filter = match level {
        LogLevel::Error => "nodeflow=error,nodeflow_core=error",
        LogLevel::Warn => "nodeflow=warn,nodeflow_core=warn",
        LogLevel::Info => "nodeflow=info,nodeflow_core=info",
        LogLevel::Debug => "nodeflow=debug,nodeflow_core=debug",
        LogLevel::Trace => "nodeflow=trace,nodeflow_core=trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;

    Ok(())
}
