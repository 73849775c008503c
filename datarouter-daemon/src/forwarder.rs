// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The drain thread: owns every attached producer's shared-memory reader,
//! periodically switches and drains the alternating buffers, converts the
//! records to DLT frames and pushes them out in `sendmmsg` batches. It holds
//! no locks while sending.

use crate::channel::DltLogChannel;
use crate::dlt_log_server::DltLogServer;
use crate::record::{LogEntry, LOG_ENTRY_TYPE};
use datarouter_dlt::VERBOSE_HEADER_BYTES;
use datarouter_queue::SharedMemoryReader;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Messages per `sendmmsg` call.
const SEND_BATCH: usize = 16;

/// Sweep cadence while idle; new attachments interrupt the wait.
const SWEEP_PERIOD: Duration = Duration::from_millis(20);

pub enum ForwarderMessage {
    Attach(Box<SharedMemoryReader>),
    /// The producer's control connection went away; mark its mapping
    /// detached so the next sweep drains the residue and reclaims it.
    Detach(libc::pid_t),
}

pub struct Forwarder {
    tx: Sender<ForwarderMessage>,
    stop: Arc<AtomicBool>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Forwarder {
    pub fn spawn(server: Arc<DltLogServer>) -> Forwarder {
        let (tx, rx) = std::sync::mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("dr-forwarder".into())
            .spawn(move || forwarder_loop(server, rx, stop_flag))
            .ok();
        if handle.is_none() {
            warn!("could not spawn the forwarder thread");
        }
        Forwarder {
            tx,
            stop,
            handle: std::sync::Mutex::new(handle),
        }
    }

    pub fn attach(&self, reader: Box<SharedMemoryReader>) {
        _ = self.tx.send(ForwarderMessage::Attach(reader));
    }

    pub fn detach(&self, producer_pid: libc::pid_t) {
        _ = self.tx.send(ForwarderMessage::Detach(producer_pid));
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(mut poisoned) => poisoned.get_mut().take(),
        };
        if let Some(handle) = handle {
            _ = handle.join();
        }
    }
}

fn forwarder_loop(
    server: Arc<DltLogServer>,
    rx: Receiver<ForwarderMessage>,
    stop: Arc<AtomicBool>,
) {
    let mut readers: Vec<Box<SharedMemoryReader>> = Vec::new();

    while !stop.load(Ordering::SeqCst) {
        match rx.recv_timeout(SWEEP_PERIOD) {
            Ok(ForwarderMessage::Attach(reader)) => {
                info!("producer attached (pid {})", reader.producer_pid());
                readers.push(reader);
            }
            Ok(ForwarderMessage::Detach(pid)) => {
                for reader in readers.iter().filter(|reader| reader.producer_pid() == pid) {
                    reader.mark_writer_detached();
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        readers.retain_mut(|reader| {
            if reader.writer_detached() {
                drain_detached(reader, &server);
                let drops = reader.drop_counters();
                info!(
                    "producer detached (pid {}), drops: full={} invalid={}",
                    reader.producer_pid(),
                    drops.buffer_full,
                    drops.invalid_size
                );
                return false;
            }
            drain_once(reader, &server);
            true
        });
    }

    // Final sweep so already-produced records are not lost on shutdown.
    for reader in &mut readers {
        drain_detached(reader, &server);
    }
}

pub(crate) fn drain_once(reader: &mut SharedMemoryReader, server: &DltLogServer) {
    let mut batcher = FrameBatcher::new(server.channels().len());
    reader.read(
        &mut |registration| {
            debug!(
                "type registration: id {} ({} description bytes)",
                registration.type_identifier,
                registration.description.len()
            );
        },
        &mut |record| {
            if record.header.type_identifier != LOG_ENTRY_TYPE {
                return;
            }
            let Some(entry) = LogEntry::decode(record.payload) else {
                debug!("undecodable log entry of {} bytes", record.payload.len());
                return;
            };
            // DLT timestamps are in 0.1 ms units.
            let tmsp = (record.header.time_stamp_ns / 100_000) as u32;
            server.filter_and_call(entry.app_id, entry.ctx_id, entry.log_level, |index, channel| {
                batcher.push(index, channel, tmsp, &entry);
            });
        },
    );
    batcher.flush_all(server.channels());
}

pub(crate) fn drain_detached(reader: &mut SharedMemoryReader, server: &DltLogServer) {
    // Both sides may hold residue; two unconditional drains cover them.
    for _ in 0..2 {
        let mut batcher = FrameBatcher::new(server.channels().len());
        reader.read_detached(
            &mut |_| {},
            &mut |record| {
                if record.header.type_identifier != LOG_ENTRY_TYPE {
                    return;
                }
                let Some(entry) = LogEntry::decode(record.payload) else {
                    return;
                };
                let tmsp = (record.header.time_stamp_ns / 100_000) as u32;
                server.filter_and_call(
                    entry.app_id,
                    entry.ctx_id,
                    entry.log_level,
                    |index, channel| {
                        batcher.push(index, channel, tmsp, &entry);
                    },
                );
            },
        );
        batcher.flush_all(server.channels());
    }
}

struct PendingFrame {
    header: [u8; VERBOSE_HEADER_BYTES],
    payload_ptr: *const u8,
    payload_len: usize,
}

/// Collects frames per destination channel and flushes them in `sendmmsg`
/// batches. Payload pointers reference the shared-memory block being
/// drained, so a batcher never outlives one drain pass.
struct FrameBatcher {
    per_channel: Vec<Vec<PendingFrame>>,
}

impl FrameBatcher {
    fn new(channel_count: usize) -> FrameBatcher {
        FrameBatcher {
            per_channel: (0..channel_count).map(|_| Vec::new()).collect(),
        }
    }

    fn push(&mut self, index: usize, channel: &DltLogChannel, tmsp: u32, entry: &LogEntry<'_>) {
        let mut header = [0u8; VERBOSE_HEADER_BYTES];
        let payload = channel.prepare_verbose_frame(&mut header, tmsp, entry);
        if let Some(frames) = self.per_channel.get_mut(index) {
            frames.push(PendingFrame {
                header,
                payload_ptr: payload.as_ptr(),
                payload_len: payload.len(),
            });
        }
    }

    fn flush_all(&mut self, channels: &[DltLogChannel]) {
        for (index, frames) in self.per_channel.iter_mut().enumerate() {
            let Some(channel) = channels.get(index) else {
                continue;
            };
            for chunk in frames.chunks(SEND_BATCH) {
                let mut iovecs: Vec<[libc::iovec; 2]> = chunk
                    .iter()
                    .map(|frame| {
                        [
                            libc::iovec {
                                iov_base: frame.header.as_ptr() as *mut libc::c_void,
                                iov_len: frame.header.len(),
                            },
                            libc::iovec {
                                iov_base: frame.payload_ptr as *mut libc::c_void,
                                iov_len: frame.payload_len,
                            },
                        ]
                    })
                    .collect();
                let mut messages: Vec<libc::mmsghdr> = iovecs
                    .iter_mut()
                    .map(|iov| {
                        let mut message: libc::mmsghdr = unsafe { std::mem::zeroed() };
                        message.msg_hdr.msg_iov = iov.as_mut_ptr();
                        message.msg_hdr.msg_iovlen = iov.len();
                        message
                    })
                    .collect();
                if let Err(err) = channel.output().send_batch(&mut messages) {
                    // Retried implicitly with the next drained record.
                    warn!("channel {}: batch send failed: {err}", channel.name());
                }
            }
            frames.clear();
        }
    }
}
