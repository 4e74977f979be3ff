//! Logging configuration and initialization

use crate::config::LoggingConfigSerde;
use crate::error::{ConversionError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// File name prefix for rolling log files
const LOG_FILE_PREFIX: &str = "atlas-queue.log";

/// Initialize the logging system with console output
pub fn init_logging() -> Result<()> {
    init_logging_with(&LoggingConfigSerde::default()).map(|_| ())
}

/// Initialize logging from configuration.
///
/// `RUST_LOG` takes precedence over the configured level. When logging to a
/// file the returned guard must be kept alive to flush buffered lines.
pub fn init_logging_with(config: &LoggingConfigSerde) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| ConversionError::LoggingError {
            message: format!("Invalid log level '{}': {}", config.level, e),
        })?;

    let (writer, guard) = match config.output_type.as_str() {
        "console" => (BoxMakeWriter::new(std::io::stderr), None),
        "file" => {
            let directory =
                config
                    .output_path
                    .clone()
                    .ok_or_else(|| ConversionError::LoggingError {
                        message: "File logging requires an output path".to_string(),
                    })?;
            let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(writer), Some(guard))
        }
        other => {
            return Err(ConversionError::LoggingError {
                message: format!("Unknown log output type '{}'", other),
            })
        }
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(guard.is_none());

    let result = if config.structured {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer.json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
    };

    match result {
        Ok(()) => Ok(guard),
        Err(e) => {
            // Check if the error is because logging is already initialized
            let error_msg = e.to_string();
            if error_msg.contains("a global default trace dispatcher has already been set") {
                Ok(guard)
            } else {
                Err(ConversionError::LoggingError {
                    message: format!("Failed to initialize logging: {}", e),
                })
            }
        }
    }
}
