// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use clap::{command, Arg, ArgAction};
use std::ffi::OsString;
use std::path::PathBuf;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/datarouter/datarouter.json";
pub const DEFAULT_SOCKET_PATH: &str = "/run/datarouter/control.sock";
pub const DEFAULT_PERSISTENCE_PATH: &str = "/var/lib/datarouter/kvs.json";

#[derive(Debug, Clone)]
pub struct Options {
    pub verbose: bool,
    pub no_adaptive_runtime: bool,
    pub config_path: PathBuf,
    pub socket_path: PathBuf,
    pub persistence_path: PathBuf,
}

impl Options {
    pub fn parse() -> Options {
        Self::parse_from(std::env::args_os())
    }

    /// Argument errors print usage and exit non-zero, version/help exit 0.
    pub fn parse_from<I, T>(args: I) -> Options
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = command!()
            .name("datarouter")
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .action(ArgAction::SetTrue)
                    .help("Raise log output to debug level"),
            )
            .arg(
                Arg::new("no_adaptive_runtime")
                    .short('n')
                    .long("no_adaptive_runtime")
                    .action(ArgAction::SetTrue)
                    .help("Disable the persistent configuration store"),
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .default_value(DEFAULT_CONFIG_PATH)
                    .help("Static channel configuration"),
            )
            .arg(
                Arg::new("socket")
                    .short('s')
                    .long("socket")
                    .value_name("PATH")
                    .default_value(DEFAULT_SOCKET_PATH)
                    .help("Control socket path"),
            )
            .arg(
                Arg::new("persistence")
                    .short('p')
                    .long("persistence")
                    .value_name("FILE")
                    .default_value(DEFAULT_PERSISTENCE_PATH)
                    .help("Key-value store backing the persistent configuration"),
            )
            .get_matches_from(args);

        Options {
            verbose: matches.get_flag("verbose"),
            no_adaptive_runtime: matches.get_flag("no_adaptive_runtime"),
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
            socket_path: matches
                .get_one::<String>("socket")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH)),
            persistence_path: matches
                .get_one::<String>("persistence")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PERSISTENCE_PATH)),
        }
    }
}
