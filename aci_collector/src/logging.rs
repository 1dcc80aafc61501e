//! Process-wide `tracing` setup: a JSON log file for the snapshot and a console for the operator

use std::{fs::File, path::Path, sync::Arc};

use anyhow::Context;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter of the console when neither `--log-filter` nor `-v` is given
pub(crate) const DEFAULT_CONSOLE_FILTER: &str = "info";

/// Filter of the log file, which is archived with the snapshot
pub(crate) const FILE_FILTER: &str = "debug,hyper=info,reqwest=info,rustls=info";

#[derive(Debug, Clone, Default, clap::Parser)]
pub(crate) struct LoggingConfig {
    /// Logs: filter directive of the console output
    ///
    /// Configures the console output using the same syntax as `RUST_LOG`, for example
    /// `info,aci_pipeline=debug`. Overridden by `-v`.
    #[clap(long = "log-filter", env = "LOG_FILTER")]
    pub(crate) log_filter: Option<String>,

    /// Logs: console verbosity short-hand
    ///
    /// -v   'debug'
    ///
    /// -vv  'trace'
    #[clap(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub(crate) log_verbose_count: u8,
}

impl LoggingConfig {
    /// The filter directive of the console output
    pub(crate) fn console_filter(&self) -> &str {
        match self.log_verbose_count {
            0 => self.log_filter.as_deref().unwrap_or(DEFAULT_CONSOLE_FILTER),
            1 => "debug,hyper=info,rustls=info",
            _ => "trace,hyper=info,rustls=info",
        }
    }
}

/// Install the global subscriber
///
/// When `log_file` is given it is truncated and receives every event at or above
/// [`FILE_FILTER`] as one JSON object per line.
pub(crate) fn init(config: &LoggingConfig, log_file: Option<&Path>) -> anyhow::Result<()> {
    let console_filter = EnvFilter::try_new(config.console_filter())
        .with_context(|| format!("invalid log filter '{}'", config.console_filter()))?;
    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter);

    let file = match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("creating log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(Arc::new(file))
                    .with_ansi(false)
                    .with_filter(EnvFilter::try_new(FILE_FILTER)?),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .context("installing the global log subscriber")
}
