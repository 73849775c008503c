// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Control-plane sessions. The first framed message of a connection decides
//! its role: a producer announcement (shared-memory path) becomes a
//! subscriber session driving the acquisition handshake, anything else is a
//! diagnostic client whose commands go to the engine.

use crate::dlt_log_server::DltLogServer;
use crate::forwarder::Forwarder;
use crate::unix_domain::{Session, SessionFactory};
use datarouter_queue::messages::{
    decode_acquire_response, decode_connect, encode_acquire_request,
};
use datarouter_queue::SharedMemoryReader;
use std::ffi::CString;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Diagnostic client session: every framed command produces exactly one
/// framed response.
pub struct ConfigCommandSession {
    server: Arc<DltLogServer>,
}

impl Session for ConfigCommandSession {
    fn on_command(&mut self, message: &[u8], out: &mut Vec<Vec<u8>>) {
        out.push(self.server.on_config_command(message));
    }
}

/// Producer session. Performs the first acquisition handshake, then hands
/// the mapped reader over to the forwarder thread and stays around only to
/// notice the peer going away.
pub struct SubscriberSession {
    forwarder: Arc<Forwarder>,
    reader: Option<Box<SharedMemoryReader>>,
    producer_pid: Option<libc::pid_t>,
    request_sent: bool,
    close: bool,
}

impl SubscriberSession {
    fn new(forwarder: Arc<Forwarder>, reader: Box<SharedMemoryReader>) -> SubscriberSession {
        SubscriberSession {
            forwarder,
            producer_pid: Some(reader.producer_pid()),
            reader: Some(reader),
            request_sent: false,
            close: false,
        }
    }
}

impl Session for SubscriberSession {
    fn on_command(&mut self, message: &[u8], _out: &mut Vec<Vec<u8>>) {
        let Some(reply) = decode_acquire_response(message) else {
            debug!("unexpected producer message of {} bytes", message.len());
            return;
        };
        let Some(mut reader) = self.reader.take() else {
            return;
        };

        match reader.notify_acquisition(reply) {
            Some(_block) => {
                // First acquire cycle confirmed: the filesystem name is no
                // longer needed, the mapping alone keeps the object alive.
                reader.unlink();
                self.forwarder.attach(reader);
            }
            None => {
                error!(
                    "producer pid {:?} replied with a stale switch count; dropping it",
                    self.producer_pid
                );
                reader.unlink();
                self.close = true;
            }
        }
    }

    fn tick(&mut self, out: &mut Vec<Vec<u8>>) -> bool {
        if self.reader.is_some() && !self.request_sent {
            out.push(encode_acquire_request().to_vec());
            self.request_sent = true;
        }
        false
    }

    fn on_closed_by_peer(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            // Handshake never finished; reclaim the name ourselves.
            reader.unlink();
        } else if let Some(pid) = self.producer_pid {
            self.forwarder.detach(pid);
        }
    }

    fn wants_close(&self) -> bool {
        self.close
    }
}

/// Builds the factory handed to the control server.
pub fn session_factory(server: Arc<DltLogServer>, forwarder: Arc<Forwarder>) -> SessionFactory {
    Box::new(move |first_message| {
        if let Some(path) = decode_connect(first_message) {
            let Ok(cpath) = CString::new(path) else {
                error!("producer announced an invalid shared-memory path");
                return None;
            };
            match SharedMemoryReader::open(&cpath) {
                Ok(reader) => {
                    info!("producer connected via {path}");
                    Some(Box::new(SubscriberSession::new(
                        Arc::clone(&forwarder),
                        Box::new(reader),
                    )))
                }
                Err(err) => {
                    error!("could not map {path}: {err}");
                    None
                }
            }
        } else {
            debug!(
                "diagnostic client '{}' connected",
                String::from_utf8_lossy(first_message)
            );
            Some(Box::new(ConfigCommandSession {
                server: Arc::clone(&server),
            }))
        }
    })
}
