use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Output format of the log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Initialize tracing
///
/// Filtering follows `RUST_LOG` and falls back to `info`.
pub fn init(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    match format {
        LogFormat::Compact => {
            let logger = tracing_subscriber::fmt::layer().compact();
            let collector = Registry::default().with(logger).with(env_filter);
            tracing::subscriber::set_global_default(collector)?;
        }
        LogFormat::Json => {
            let logger = tracing_subscriber::fmt::layer().json();
            let collector = Registry::default().with(logger).with(env_filter);
            tracing::subscriber::set_global_default(collector)?;
        }
    }
    Ok(())
}
