// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The DLT router daemon: drains log records produced into shared memory,
//! routes them through runtime-configurable filters and forwards them over
//! UDP to external DLT consumers. A local AF_UNIX control socket accepts
//! binary diagnostic commands that mutate the routing state without restart.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod channel;
pub mod config;
pub mod diagnostic_jobs;
pub mod dlt_log_server;
pub mod error;
pub mod forwarder;
pub mod logging;
pub mod options;
pub mod persistence;
pub mod record;
pub mod sessions;
pub mod udp_stream_output;
pub mod unix_domain;

pub use config::StaticConfig;
pub use dlt_log_server::{DltLogServer, LogSender, UdpLogSender};
pub use error::ConfigError;
pub use options::Options;
