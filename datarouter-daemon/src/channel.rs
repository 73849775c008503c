// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::record::LogEntry;
use crate::udp_stream_output::UdpStreamOutput;
use datarouter_dlt::{
    build_non_verbose_packet, write_extended_header, write_header_extra, write_standard_header,
    DltId, LogLevel, DLT_MESSAGE_SIZE, HEADER_EXTRA_BYTES, NON_VERBOSE_HEADER_BYTES,
    STANDARD_HEADER_BYTES, VERBOSE_HEADER_BYTES,
};
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::warn;

/// One logical output destination: a UDP endpoint, its ECU identity and an
/// atomically adjustable threshold. The socket is created once at channel
/// construction and never recreated, even across configuration reloads.
pub struct DltLogChannel {
    name: DltId,
    ecu: DltId,
    threshold: AtomicU8,
    message_counter: AtomicU8,
    output: UdpStreamOutput,
}

impl DltLogChannel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: DltId,
        threshold: LogLevel,
        ecu: DltId,
        address: &str,
        port: u16,
        dst_address: &str,
        dst_port: u16,
        multicast_interface: &str,
    ) -> io::Result<DltLogChannel> {
        let output = UdpStreamOutput::new(dst_address, dst_port, multicast_interface)?;
        // A failed bind leaves the channel usable for unbound sends.
        _ = output.bind(address, port);
        Ok(DltLogChannel {
            name,
            ecu,
            threshold: AtomicU8::new(threshold as u8),
            message_counter: AtomicU8::new(0),
            output,
        })
    }

    pub fn name(&self) -> DltId {
        self.name
    }

    pub fn ecu(&self) -> DltId {
        self.ecu
    }

    pub fn threshold(&self) -> LogLevel {
        LogLevel::try_from_u8(self.threshold.load(Ordering::Relaxed)).unwrap_or(LogLevel::Off)
    }

    pub fn set_threshold(&self, threshold: LogLevel) {
        self.threshold.store(threshold as u8, Ordering::Relaxed);
    }

    pub fn output(&self) -> &UdpStreamOutput {
        &self.output
    }

    pub fn next_message_counter(&self) -> u8 {
        self.message_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Builds the verbose header for `entry` into `header_out` and returns
    /// the truncated payload view. Shared by the single-send path and the
    /// sendmmsg batcher.
    pub fn prepare_verbose_frame<'a>(
        &self,
        header_out: &mut [u8; VERBOSE_HEADER_BYTES],
        tmsp: u32,
        entry: &LogEntry<'a>,
    ) -> &'a [u8] {
        let size = entry
            .payload
            .len()
            .min(DLT_MESSAGE_SIZE - VERBOSE_HEADER_BYTES);
        write_standard_header(
            header_out,
            VERBOSE_HEADER_BYTES + size,
            self.next_message_counter(),
            true,
        );
        write_header_extra(&mut header_out[STANDARD_HEADER_BYTES..], self.ecu, tmsp);
        write_extended_header(
            &mut header_out[STANDARD_HEADER_BYTES + HEADER_EXTRA_BYTES..],
            entry.log_level,
            entry.num_of_args,
            entry.app_id,
            entry.ctx_id,
        );
        &entry.payload[..size]
    }

    pub fn send_verbose(&self, tmsp: u32, entry: &LogEntry<'_>) {
        let mut header = [0u8; VERBOSE_HEADER_BYTES];
        let payload = self.prepare_verbose_frame(&mut header, tmsp, entry);
        let iov = [
            libc::iovec {
                iov_base: header.as_ptr() as *mut libc::c_void,
                iov_len: header.len(),
            },
            libc::iovec {
                iov_base: payload.as_ptr() as *mut libc::c_void,
                iov_len: payload.len(),
            },
        ];
        if let Err(err) = self.output.send_single(&iov) {
            warn!("channel {}: verbose send failed: {err}", self.name);
        }
    }

    pub fn send_non_verbose(&self, msgid: u32, tmsp: u32, data: &[u8]) {
        let mut frame = vec![0u8; NON_VERBOSE_HEADER_BYTES + data.len().min(DLT_MESSAGE_SIZE)];
        let Some(written) = build_non_verbose_packet(
            &mut frame,
            msgid,
            self.ecu,
            self.next_message_counter(),
            tmsp,
            data,
        ) else {
            return;
        };
        let iov = [libc::iovec {
            iov_base: frame.as_ptr() as *mut libc::c_void,
            iov_len: written,
        }];
        if let Err(err) = self.output.send_single(&iov) {
            warn!("channel {}: non-verbose send failed: {err}", self.name);
        }
    }

    /// File-transfer frame: a pre-encoded argument payload sent verbatim
    /// behind a verbose header.
    #[allow(clippy::too_many_arguments)]
    pub fn send_ft_verbose(
        &self,
        data: &[u8],
        level: LogLevel,
        app_id: DltId,
        ctx_id: DltId,
        nor: u8,
        tmsp: u32,
    ) {
        let entry = LogEntry {
            app_id,
            ctx_id,
            log_level: level,
            num_of_args: nor,
            payload: data,
        };
        self.send_verbose(tmsp, &entry);
    }
}
