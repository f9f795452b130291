//! Command-line interface handling for the Sculptor server.
//!
//! This module provides command-line argument parsing using the `clap` crate.
//! Every option overrides the matching setting from the configuration file.

use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;

/// Command line arguments parsed from user input.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the client bind address
    pub bind_address: Option<String>,
    /// Optional override for the collaborator feed address
    pub feed_address: Option<String>,
    /// Optional override for the avatar storage directory
    pub avatar_dir: Option<PathBuf>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
}

impl CliArgs {
    /// Parses the process arguments.
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    /// Parses an explicit argument list; the first item is the binary name.
    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Ok(Self::from_matches(&command().try_get_matches_from(args)?))
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config.toml")),
            bind_address: matches.get_one::<String>("bind").cloned(),
            feed_address: matches.get_one::<String>("feed").cloned(),
            avatar_dir: matches.get_one::<String>("avatars").map(PathBuf::from),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}

fn command() -> Command {
    Command::new("Sculptor")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Real-time avatar distribution server")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Client WebSocket bind address (e.g., 0.0.0.0:6665)"),
        )
        .arg(
            Arg::new("feed")
                .short('f')
                .long("feed")
                .value_name("ADDRESS")
                .help("Collaborator feed bind address (e.g., 127.0.0.1:6666)"),
        )
        .arg(
            Arg::new("avatars")
                .short('a')
                .long("avatars")
                .value_name("DIR")
                .help("Avatar storage directory"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(clap::ArgAction::SetTrue),
        )
}
