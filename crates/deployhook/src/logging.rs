use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::DeployHookConfig;

const LOG_FILE_PREFIX: &str = "deployhook.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
    /// Daily-rolling file output in addition to stdout.
    pub log_dir: Option<PathBuf>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            log_dir: None,
        }
    }
}

impl LogOptions {
    #[must_use]
    pub fn from_config(config: &DeployHookConfig) -> Self {
        Self {
            level: config.log_level(),
            json: config.log_json(),
            log_dir: config.log_dir(),
        }
    }

    fn filter(&self) -> Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.level)
                .with_context(|| format!("invalid log level '{}'", self.level)),
        }
    }
}

/// Installs the global subscriber. Keep the returned guard alive for the life of the
/// process when file output is enabled, or buffered lines are lost on exit.
///
/// # Errors
/// Returns an error if the level is not a valid filter, the log directory cannot be
/// created, or a global subscriber is already installed.
pub fn init_logging(options: &LogOptions) -> Result<Option<WorkerGuard>> {
    let filter = options.filter()?;

    let stdout_layer: BoxedLayer = if options.json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };
    let mut layers = vec![stdout_layer];

    let mut guard = None;
    if let Some(log_dir) = &options.log_dir {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;
        let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
        let (writer, worker_guard) = tracing_appender::non_blocking(appender);
        let file_layer: BoxedLayer = if options.json {
            fmt::layer().json().with_writer(writer).boxed()
        } else {
            fmt::layer().with_ansi(false).with_writer(writer).boxed()
        };
        layers.push(file_layer);
        guard = Some(worker_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|error| anyhow!("failed to install log subscriber: {error}"))?;

    Ok(guard)
}
