use std::io::Write;

use chrono::Local;
use log::{LevelFilter, SetLoggerError};

/// Installs the env_logger backend.
///
/// `level` is the default; `RUST_LOG` overrides it per module.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{}",
                format_line(&Local::now().to_rfc3339(), record.level(), record.target(), &record.args().to_string())
            )
        })
        .try_init()
}

/// Maps the number of `-v` flags to a level filter
pub fn level_for_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn format_line(timestamp: &str, level: log::Level, target: &str, message: &str) -> String {
    // Module path is noise for our own crate
    let target = target.rsplit("::").next().unwrap_or(target);
    format!("{} [{:<5}] {}: {}", timestamp, level, target, message)
}
