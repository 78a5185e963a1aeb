use std::path::PathBuf;

use fleet_types::Topic;

pub const DEFAULT_CONFIG_PATH: &str = "config/fleet_monitor.toml";

/// `fleet_monitor [config-path] [topic...]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorArgs {
    pub config_path: PathBuf,
    /// Topics given on the command line; they replace the configured ones
    pub topics: Vec<Topic>,
}

pub fn parse_args() -> MonitorArgs {
    parse_from(std::env::args().skip(1))
}

pub fn parse_from<I, S>(args: I) -> MonitorArgs
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut args = args.into_iter().map(Into::into);
    let config_path = args.next().map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let topics = args.map(Topic::from).collect();
    MonitorArgs { config_path, topics }
}
