// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use tracing_subscriber::EnvFilter;

/// Environment variable overriding the log filter, e.g.
/// `DATAROUTER_LOG=datarouter_daemon=trace`.
pub const LOG_FILTER_ENV: &str = "DATAROUTER_LOG";

/// Installs the stderr subscriber. Safe to call once per process; repeated
/// calls (tests) are ignored.
pub fn enable_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
