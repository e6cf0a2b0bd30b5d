use anyhow::Result;
use clap::ValueEnum;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// RUST_LOG wins over `level`. Logs go to stderr.
pub fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let base = fmt::layer().with_target(false).with_writer(std::io::stderr);
    match format {
        LogFormat::Json => tracing_subscriber::registry().with(env).with(base.json()).try_init()?,
        LogFormat::Text => tracing_subscriber::registry().with(env).with(base.compact()).try_init()?,
    }
    Ok(())
}
