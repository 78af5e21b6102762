//! Logging handler configuration

use log::LevelFilter;
use serde::{Deserialize, Serialize};

/// Where a handler writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    /// Write to a file named by `name`
    File,
    /// Write to `stdout` or `stderr`
    Stream,
}

/// One log destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogHandler {
    #[serde(rename = "type")]
    pub kind: HandlerKind,

    /// File path for file handlers, `stdout`/`stderr` for streams
    pub name: String,

    #[serde(default = "default_handler_level")]
    pub level: String,

    /// Format with `%(asctime)s`, `%(levelname)s`, `%(message)s` placeholders
    #[serde(default = "default_format")]
    pub format: String,

    /// Append to an existing log file instead of truncating it
    #[serde(default)]
    pub append: bool,
}

fn default_handler_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "%(message)s".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Upper bound for every handler
    pub level: String,
    pub handlers: Vec<LogHandler>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "debug".to_string(),
            handlers: vec![
                LogHandler {
                    kind: HandlerKind::File,
                    name: "hpc-regress.log".to_string(),
                    level: "debug".to_string(),
                    format: "[%(asctime)s] %(levelname)s: %(message)s".to_string(),
                    append: false,
                },
                LogHandler {
                    kind: HandlerKind::Stream,
                    name: "stdout".to_string(),
                    level: "info".to_string(),
                    format: "%(message)s".to_string(),
                    append: false,
                },
            ],
        }
    }
}

/// Parse a level name. Accepts the Python logging names as well.
pub fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.to_lowercase().as_str() {
        "off" | "none" => Some(LevelFilter::Off),
        "error" | "critical" => Some(LevelFilter::Error),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" | "verbose" => Some(LevelFilter::Debug),
        "trace" | "debug2" => Some(LevelFilter::Trace),
        _ => None,
    }
}
