//! # Logging
//!
//! Installs the process-wide `tracing` subscriber from a [`LoggingConfig`].
//! `RUST_LOG` takes precedence over the configured level when set.
//!
//! Console and file output are independent layers. With both disabled the
//! subscriber is still installed and discards every event.

use std::fs::OpenOptions;
use std::io;
use std::sync::Mutex;

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

type OutputLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_lowercase()));

    tracing_subscriber::registry()
        .with(output_layers(config)?)
        .with(filter)
        .try_init()
        .map_err(|e| ProtocolError::ConfigError(format!("Failed to install logger: {e}")))?;

    tracing::debug!(app = %config.app_name, "Logging initialized");
    Ok(())
}

/// One formatting layer per enabled output
pub(crate) fn output_layers(config: &LoggingConfig) -> Result<Vec<OutputLayer>> {
    let mut layers = Vec::new();

    if config.log_to_console {
        layers.push(format_layer(io::stdout, config.json_format, true));
    }

    if config.log_to_file {
        let path = config.log_file_path.as_deref().ok_or_else(|| {
            ProtocolError::ConfigError("log_to_file is set without log_file_path".to_string())
        })?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open log file: {e}")))?;
        layers.push(format_layer(Mutex::new(file), config.json_format, false));
    }

    Ok(layers)
}

fn format_layer<W>(writer: W, json: bool, ansi: bool) -> OutputLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_thread_names(true);
    if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}
