// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use datarouter_daemon::dlt_log_server::DltLogServer;
use datarouter_daemon::forwarder::Forwarder;
use datarouter_daemon::logging::enable_logging;
use datarouter_daemon::options::Options;
use datarouter_daemon::persistence::open_dictionary;
use datarouter_daemon::sessions::session_factory;
use datarouter_daemon::unix_domain::UnixDomainServer;
use datarouter_daemon::StaticConfig;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_stop(_signal: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let action = SigAction::new(
        SigHandler::Handler(request_stop),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        if let Err(err) = unsafe { sigaction(signal, &action) } {
            warn!("could not install {signal} handler: {err}");
        }
    }
}

fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    enable_logging(options.verbose);

    let config = StaticConfig::load(&options.config_path)
        .with_context(|| format!("loading {}", options.config_path.display()))?;

    let store = open_dictionary(!options.no_adaptive_runtime, &options.persistence_path);
    let server = Arc::new(DltLogServer::new(config, store));
    let forwarder = Arc::new(Forwarder::spawn(Arc::clone(&server)));

    let mut control = UnixDomainServer::bind(
        &options.socket_path,
        session_factory(Arc::clone(&server), Arc::clone(&forwarder)),
    )
    .with_context(|| format!("binding {}", options.socket_path.display()))?;

    install_signal_handlers();
    info!(
        "datarouter up: {} channels, control socket {}",
        server.channels().len(),
        options.socket_path.display()
    );

    control.run(&STOP_REQUESTED);

    info!("shutting down");
    forwarder.shutdown();
    _ = std::fs::remove_file(&options.socket_path);
    Ok(())
}
