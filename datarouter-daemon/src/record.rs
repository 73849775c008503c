// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Serialized log entry exchanged through the shared-memory queue. The queue
//! treats the payload as opaque bytes; this is the daemon-side contract for
//! the verbose log entry type.

use datarouter_dlt::{DltId, LogLevel};

/// Shared-memory type identifier for verbose log entries.
pub const LOG_ENTRY_TYPE: u16 = 0x0001;

const FIXED_HEAD_BYTES: usize = 4 + 4 + 1 + 1;

/// A decoded verbose log entry; the payload stays a view into the shared
/// buffer and is only valid until the next switch.
#[derive(Clone, Copy, Debug)]
pub struct LogEntry<'a> {
    pub app_id: DltId,
    pub ctx_id: DltId,
    pub log_level: LogLevel,
    pub num_of_args: u8,
    pub payload: &'a [u8],
}

impl<'a> LogEntry<'a> {
    /// Wire layout: `app[4] ctx[4] level u8 noar u8 payload…`.
    pub fn decode(data: &'a [u8]) -> Option<LogEntry<'a>> {
        if data.len() < FIXED_HEAD_BYTES {
            return None;
        }
        let mut app = [0u8; 4];
        app.copy_from_slice(&data[0..4]);
        let mut ctx = [0u8; 4];
        ctx.copy_from_slice(&data[4..8]);
        let log_level = LogLevel::try_from_u8(data[8])?;
        Some(LogEntry {
            app_id: DltId::from_bytes(app),
            ctx_id: DltId::from_bytes(ctx),
            log_level,
            num_of_args: data[9],
            payload: &data[FIXED_HEAD_BYTES..],
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_HEAD_BYTES + self.payload.len());
        out.extend_from_slice(self.app_id.as_bytes());
        out.extend_from_slice(self.ctx_id.as_bytes());
        out.push(self.log_level as u8);
        out.push(self.num_of_args);
        out.extend_from_slice(self.payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let entry = LogEntry {
            app_id: DltId::new("APP0"),
            ctx_id: DltId::new("CTX0"),
            log_level: LogLevel::Info,
            num_of_args: 2,
            payload: b"payload",
        };
        let bytes = entry.encode();
        let decoded = LogEntry::decode(&bytes).unwrap();
        assert_eq!(decoded.app_id, entry.app_id);
        assert_eq!(decoded.ctx_id, entry.ctx_id);
        assert_eq!(decoded.log_level, LogLevel::Info);
        assert_eq!(decoded.num_of_args, 2);
        assert_eq!(decoded.payload, b"payload");
    }

    #[test]
    fn invalid_level_or_truncation_fails() {
        let mut bytes = LogEntry {
            app_id: DltId::new("A"),
            ctx_id: DltId::new("C"),
            log_level: LogLevel::Warn,
            num_of_args: 0,
            payload: b"",
        }
        .encode();
        bytes[8] = 0x20;
        assert!(LogEntry::decode(&bytes).is_none());
        assert!(LogEntry::decode(&[0u8; 5]).is_none());
    }
}
