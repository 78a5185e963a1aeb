use std::io;
use std::str::FromStr;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::config_loader::LogSection;

/// Parse a level name, falling back to `INFO`
pub fn parse_level(level: &str) -> Level {
    Level::from_str(level).unwrap_or(Level::INFO)
}

/// Initialise tracing with a non-blocking daily file appender, optionally mirrored to stdout.
///
/// `RUST_LOG` overrides the configured level. Keep the returned guard alive for the whole process
/// or buffered lines are lost.
pub fn init(app_name: &str, log: &LogSection) -> WorkerGuard {
    let _ = std::fs::create_dir_all(&log.dir);

    let file_appender = tracing_appender::rolling::daily(&log.dir, format!("{app_name}.log"));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::builder().with_default_directive(parse_level(&log.level).into()).from_env_lossy();

    let file_layer =
        fmt::layer().with_writer(non_blocking).with_target(true).with_thread_ids(true).with_line_number(true).with_ansi(false).compact();

    let stdout_layer = log
        .stdout
        .then(|| fmt::layer().with_writer(io::stdout).with_target(true).with_line_number(true).with_ansi(true).compact());

    tracing_subscriber::registry().with(env_filter).with(file_layer).with(stdout_layer).init();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("chatty"), Level::INFO);
    }
}
