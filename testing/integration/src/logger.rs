// File: testing/integration/src/logger.rs
//
// Harness logging: everything at Debug into <tmpdir>/test_framework.log,
// the console at the level chosen on the command line.

use crate::error::{HarnessError, HarnessResult, IoResultExt};
use crate::rpc::RPC_LOG_TARGET;
use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;
use std::path::{Path, PathBuf};

/// Log file written into the test's temp directory
pub const LOG_FILE: &str = "test_framework.log";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Parse a console level: a level name (`warning` and `critical` accepted
/// as aliases) or a number from 0 (off) to 5 (trace)
pub fn parse_level(value: &str) -> HarnessResult<LevelFilter> {
    if let Ok(n) = value.parse::<usize>() {
        return match n {
            0 => Ok(LevelFilter::Off),
            1 => Ok(LevelFilter::Error),
            2 => Ok(LevelFilter::Warn),
            3 => Ok(LevelFilter::Info),
            4 => Ok(LevelFilter::Debug),
            5 => Ok(LevelFilter::Trace),
            _ => Err(HarnessError::Config(format!("log level {n} out of range"))),
        };
    }

    match value.to_ascii_lowercase().as_str() {
        "off" => Ok(LevelFilter::Off),
        "error" | "critical" => Ok(LevelFilter::Error),
        "warn" | "warning" => Ok(LevelFilter::Warn),
        "info" => Ok(LevelFilter::Info),
        "debug" => Ok(LevelFilter::Debug),
        "trace" => Ok(LevelFilter::Trace),
        other => Err(HarnessError::Config(format!("unknown log level '{other}'"))),
    }
}

/// Install the global logger and return the log file path.
///
/// When a logger is already installed (several tests in one process) the
/// existing one is kept.
pub fn init_logging(tmpdir: &Path, console_level: LevelFilter, trace_rpc: bool) -> HarnessResult<PathBuf> {
    let log_path = tmpdir.join(LOG_FILE);
    let log_file = fern::log_file(&log_path).with_path(&log_path)?;

    let colors = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::Green)
        .debug(Color::Cyan)
        .trace(Color::BrightBlack);

    let file = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {} ({}): {}",
                chrono::Utc::now().format(TIMESTAMP_FORMAT),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(LevelFilter::Debug)
        .chain(log_file);

    let rpc_console_level = if trace_rpc {
        LevelFilter::Debug
    } else {
        console_level
    };
    let console = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} {} ({}): {}",
                chrono::Utc::now().format(TIMESTAMP_FORMAT),
                record.target(),
                colors.color(record.level()),
                message
            ))
        })
        .level(console_level)
        .level_for(RPC_LOG_TARGET, rpc_console_level)
        .chain(std::io::stdout());

    let applied = fern::Dispatch::new()
        .level(LevelFilter::Trace)
        .level_for("hyper", LevelFilter::Warn)
        .level_for("hyper_util", LevelFilter::Warn)
        .level_for("reqwest", LevelFilter::Warn)
        .chain(file)
        .chain(console)
        .apply();

    if let Err(e) = applied {
        log::debug!("Logger already installed, keeping it ({})", e);
    }
    Ok(log_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_names() {
        assert_eq!(parse_level("INFO").unwrap(), LevelFilter::Info);
        assert_eq!(parse_level("debug").unwrap(), LevelFilter::Debug);
        assert_eq!(parse_level("WARNING").unwrap(), LevelFilter::Warn);
        assert_eq!(parse_level("critical").unwrap(), LevelFilter::Error);
    }

    #[test]
    fn test_parse_level_numbers() {
        assert_eq!(parse_level("0").unwrap(), LevelFilter::Off);
        assert_eq!(parse_level("5").unwrap(), LevelFilter::Trace);
        assert!(parse_level("9").is_err());
    }

    #[test]
    fn test_parse_level_rejects_garbage() {
        assert!(matches!(parse_level("loud"), Err(HarnessError::Config(_))));
    }
}
