use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::error::{CoreError, Result};

/// Logging configuration for the interception engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Whether to emit JSON formatted logs
    pub json_format: bool,

    pub include_thread_names: bool,

    /// Whether to include file and line number information
    pub include_file_info: bool,

    /// Colored output (only for non-JSON format)
    pub enable_colors: bool,

    /// Log file path. Logs only go to stdout when unset.
    pub log_file: Option<String>,

    /// Module-specific log levels
    pub module_levels: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let mut module_levels = HashMap::new();
        module_levels.insert("intercept_core".to_string(), "info".to_string());
        module_levels.insert("hyper".to_string(), "warn".to_string());
        module_levels.insert("reqwest".to_string(), "warn".to_string());
        module_levels.insert("tower_http".to_string(), "info".to_string());

        Self {
            level: "info".to_string(),
            json_format: false,
            include_thread_names: true,
            include_file_info: false,
            enable_colors: true,
            log_file: None,
            module_levels,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        if !levels::is_valid_level(&self.level) {
            return Err(CoreError::Configuration(format!(
                "Invalid log level '{}', expected one of {:?}",
                self.level,
                levels::valid_levels()
            )));
        }
        for (module, level) in &self.module_levels {
            if !levels::is_valid_level(level) {
                return Err(CoreError::Configuration(format!(
                    "Invalid log level '{}' for module {}",
                    level, module
                )));
            }
        }
        Ok(())
    }
}

/// Base level plus per-module directives
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let mut filter = EnvFilter::try_new(&config.level)
        .map_err(|e| CoreError::Logging(format!("Invalid log level: {}", e)))?;

    for (module, level) in &config.module_levels {
        let directive = format!("{}={}", module, level);
        filter = filter.add_directive(
            directive
                .parse()
                .map_err(|e| CoreError::Logging(format!("Invalid log directive: {}", e)))?,
        );
    }
    Ok(filter)
}

/// Install the global subscriber. Calling it again is harmless: the first
/// subscriber stays in place.
///
/// The returned guard flushes the log file on drop and must be held for as
/// long as file logging is wanted.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(config)?;

    let stdout_layer = if config.json_format {
        fmt::layer()
            .json()
            .with_target(true)
            .with_thread_names(config.include_thread_names)
            .with_file(config.include_file_info)
            .with_line_number(config.include_file_info)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_names(config.include_thread_names)
            .with_file(config.include_file_info)
            .with_line_number(config.include_file_info)
            .with_ansi(config.enable_colors)
            .boxed()
    };

    let (file_layer, guard) = match &config.log_file {
        Some(path) => {
            let appender = create_file_appender(path)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let result = tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .with(filter)
        .try_init();

    match result {
        Ok(_) => tracing::info!("Logging initialized with level: {}", config.level),
        Err(_) => tracing::debug!("Logging already initialized, skipping"),
    }

    Ok(guard)
}

/// Daily-rotated file appender
fn create_file_appender(log_file: &str) -> Result<tracing_appender::rolling::RollingFileAppender> {
    use std::path::Path;
    use tracing_appender::rolling::{RollingFileAppender, Rotation};

    let log_path = Path::new(log_file);
    let directory = log_path
        .parent()
        .ok_or_else(|| CoreError::Logging("Invalid log file path".to_string()))?;
    let filename = log_path
        .file_name()
        .ok_or_else(|| CoreError::Logging("Invalid log file name".to_string()))?
        .to_string_lossy();

    std::fs::create_dir_all(directory)
        .map_err(|e| CoreError::Logging(format!("Failed to create log directory: {}", e)))?;

    Ok(RollingFileAppender::new(
        Rotation::DAILY,
        directory,
        filename.as_ref(),
    ))
}

/// Log level utilities
pub mod levels {
    pub fn is_valid_level(level: &str) -> bool {
        matches!(
            level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        )
    }

    pub fn valid_levels() -> Vec<&'static str> {
        vec!["trace", "debug", "info", "warn", "error"]
    }
}
