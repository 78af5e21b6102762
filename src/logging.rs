//! Logger setup driven by the `[logging]` configuration.
//!
//! `env_logger` owns the stream handler; file handlers are written from the
//! same format callback so every record is rendered once per destination
//! with that destination's level and format.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use env_logger::{Builder, Target};
use log::{LevelFilter, Record};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use crate::config::{HandlerKind, LoggingConfig, parse_level};

struct FileSink {
    level: LevelFilter,
    format: String,
    file: Mutex<File>,
}

struct StreamSink {
    level: LevelFilter,
    format: String,
}

/// Render a `%(name)s`-style format string for one record
pub fn render_format(format: &str, now: &DateTime<Local>, record: &Record) -> String {
    format
        .replace("%(asctime)s", &now.format("%Y-%m-%dT%H:%M:%S").to_string())
        .replace("%(levelname)s", record.level().as_str())
        .replace("%(name)s", record.target())
        .replace("%(message)s", &record.args().to_string())
}

fn open_log_file(name: &str, append: bool) -> Result<File> {
    let path = Path::new(name);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

/// Install the global logger.
///
/// `verbosity` (the count of `-v` flags) raises the stream handler to debug
/// or trace. `RUST_LOG` directives are honoured on top of the configuration.
pub fn init_logging(config: &LoggingConfig, verbosity: u8) -> Result<()> {
    let global = parse_level(&config.level).unwrap_or(LevelFilter::Info);
    let mut files = Vec::new();
    let mut stream: Option<StreamSink> = None;
    let mut target = Target::Stdout;

    for handler in &config.handlers {
        let level = parse_level(&handler.level)
            .unwrap_or(LevelFilter::Info)
            .min(global);
        match handler.kind {
            HandlerKind::File => files.push(FileSink {
                level,
                format: handler.format.clone(),
                file: Mutex::new(open_log_file(&handler.name, handler.append)?),
            }),
            HandlerKind::Stream if stream.is_none() => {
                target = if handler.name == "stderr" {
                    Target::Stderr
                } else {
                    Target::Stdout
                };
                stream = Some(StreamSink {
                    level,
                    format: handler.format.clone(),
                });
            }
            HandlerKind::Stream => {}
        }
    }

    if let Some(sink) = stream.as_mut() {
        sink.level = match verbosity {
            0 => sink.level,
            1 => sink.level.max(LevelFilter::Debug),
            _ => LevelFilter::Trace,
        };
    }

    let max_level = files
        .iter()
        .map(|f| f.level)
        .chain(stream.iter().map(|s| s.level))
        .max()
        .unwrap_or(LevelFilter::Off);

    let mut builder = Builder::new();
    builder
        .filter_level(max_level)
        .parse_default_env()
        .target(target)
        .format(move |buf, record| {
            let now = Local::now();
            for sink in &files {
                if record.level() <= sink.level
                    && let Ok(mut file) = sink.file.lock()
                {
                    let _ = writeln!(file, "{}", render_format(&sink.format, &now, record));
                }
            }
            if let Some(sink) = &stream
                && record.level() <= sink.level
            {
                writeln!(buf, "{}", render_format(&sink.format, &now, record))?;
            }
            Ok(())
        });
    builder.try_init().context("Logger already initialized")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn test_render_format() {
        let now = Local::now();
        let record = Record::builder()
            .args(format_args!("staged cm1"))
            .level(Level::Warn)
            .target("hpc_regress::pipeline")
            .build();
        let line = render_format("%(levelname)s: %(message)s [%(name)s]", &now, &record);
        assert_eq!(line, "WARN: staged cm1 [hpc_regress::pipeline]");
    }

    #[test]
    fn test_open_log_file_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("run.log");
        let file = open_log_file(path.to_str().unwrap(), false);
        assert!(file.is_ok());
        assert!(path.exists());
    }
}
