// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Fatal configuration errors. Everything else in the daemon degrades and
/// keeps running; a broken static configuration aborts startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not open configuration file {0}")]
    NoFileFound(String),
    #[error("configuration parse error: {0}")]
    ParseError(String),
    #[error("configuration contains no channels")]
    NoChannelsFound,
}
