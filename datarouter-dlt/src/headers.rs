// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::id::DltId;
use crate::level::LogLevel;

/// Hard upper bound for one DLT message on the wire, headers included.
pub const DLT_MESSAGE_SIZE: usize = 65536;

pub const STORAGE_HEADER_BYTES: usize = 16;
pub const STANDARD_HEADER_BYTES: usize = 4;
pub const HEADER_EXTRA_BYTES: usize = 8;
pub const EXTENDED_HEADER_BYTES: usize = 10;

/// Standard header + extra + extended header, as sent for verbose messages.
pub const VERBOSE_HEADER_BYTES: usize =
    STANDARD_HEADER_BYTES + HEADER_EXTRA_BYTES + EXTENDED_HEADER_BYTES;

/// Standard header + extra + 4-byte message id, as sent for non-verbose
/// messages.
pub const NON_VERBOSE_HEADER_BYTES: usize = STANDARD_HEADER_BYTES + HEADER_EXTRA_BYTES + 4;

/// `htyp` flag bits of the standard header.
pub const DLT_HTYP_UEH: u8 = 0x01;
pub const DLT_HTYP_MSBF: u8 = 0x02;
pub const DLT_HTYP_WEID: u8 = 0x04;
pub const DLT_HTYP_WTMS: u8 = 0x10;
pub const DLT_HTYP_VERS: u8 = 0x20;

const DLT_TYPE_LOG: u8 = 0x00;
const DLT_MSIN_MSTP_SHIFT: u8 = 1;
const DLT_MSIN_MTIN_SHIFT: u8 = 4;
const DLT_MSIN_VERB: u8 = 0x01;

/// Storage header: `"DLT\x01"`, wall-clock seconds/microseconds, ECU id.
pub fn write_storage_header(out: &mut [u8], seconds: u32, microseconds: i32, ecu: DltId) {
    out[0..4].copy_from_slice(b"DLT\x01");
    out[4..8].copy_from_slice(&seconds.to_le_bytes());
    out[8..12].copy_from_slice(&microseconds.to_le_bytes());
    out[12..16].copy_from_slice(ecu.as_bytes());
}

/// Standard header. `message_size` covers everything behind the storage
/// header, itself included; stored big-endian.
pub fn write_standard_header(out: &mut [u8], message_size: usize, mcnt: u8, use_ext_header: bool) {
    let mut htyp = DLT_HTYP_WEID | DLT_HTYP_WTMS | DLT_HTYP_VERS;
    if use_ext_header {
        htyp |= DLT_HTYP_UEH;
    }
    out[0] = htyp;
    out[1] = mcnt;
    out[2..4].copy_from_slice(&(message_size as u16).to_be_bytes());
}

/// Header extra: ECU id plus timestamp in 0.1 ms units, big-endian.
pub fn write_header_extra(out: &mut [u8], ecu: DltId, tmsp: u32) {
    out[0..4].copy_from_slice(ecu.as_bytes());
    out[4..8].copy_from_slice(&tmsp.to_be_bytes());
}

/// Extended header for verbose log messages: message info, argument count,
/// application and context ids.
pub fn write_extended_header(out: &mut [u8], level: LogLevel, noar: u8, app_id: DltId, ctx_id: DltId) {
    out[0] = (DLT_TYPE_LOG << DLT_MSIN_MSTP_SHIFT)
        | ((level as u8) << DLT_MSIN_MTIN_SHIFT)
        | DLT_MSIN_VERB;
    out[1] = noar;
    out[2..6].copy_from_slice(app_id.as_bytes());
    out[6..10].copy_from_slice(ctx_id.as_bytes());
}

fn truncated_payload_len(payload_len: usize, header_len: usize, out_len: usize) -> Option<usize> {
    let room = out_len.checked_sub(header_len)?;
    Some(payload_len.min(DLT_MESSAGE_SIZE - header_len).min(room))
}

/// Builds a verbose message (standard + extra + extended header + payload)
/// into `out`. Oversized payloads are truncated, not dropped; the standard
/// header length reflects the truncated size. Returns the bytes written, or
/// `None` when `out` cannot even hold the headers.
#[allow(clippy::too_many_arguments)]
pub fn build_verbose_packet(
    out: &mut [u8],
    app_id: DltId,
    ctx_id: DltId,
    ecu: DltId,
    level: LogLevel,
    noar: u8,
    mcnt: u8,
    tmsp: u32,
    payload: &[u8],
) -> Option<usize> {
    let size = truncated_payload_len(payload.len(), VERBOSE_HEADER_BYTES, out.len())?;
    write_standard_header(out, VERBOSE_HEADER_BYTES + size, mcnt, true);
    write_header_extra(&mut out[STANDARD_HEADER_BYTES..], ecu, tmsp);
    write_extended_header(
        &mut out[STANDARD_HEADER_BYTES + HEADER_EXTRA_BYTES..],
        level,
        noar,
        app_id,
        ctx_id,
    );
    out[VERBOSE_HEADER_BYTES..VERBOSE_HEADER_BYTES + size].copy_from_slice(&payload[..size]);
    Some(VERBOSE_HEADER_BYTES + size)
}

/// Verbose message prefixed with a storage header, as written to DLT files.
#[allow(clippy::too_many_arguments)]
pub fn build_storage_verbose_packet(
    out: &mut [u8],
    app_id: DltId,
    ctx_id: DltId,
    ecu: DltId,
    level: LogLevel,
    noar: u8,
    mcnt: u8,
    tmsp: u32,
    seconds: u32,
    microseconds: i32,
    payload: &[u8],
) -> Option<usize> {
    if out.len() < STORAGE_HEADER_BYTES {
        return None;
    }
    write_storage_header(out, seconds, microseconds, ecu);
    let written = build_verbose_packet(
        &mut out[STORAGE_HEADER_BYTES..],
        app_id,
        ctx_id,
        ecu,
        level,
        noar,
        mcnt,
        tmsp,
        payload,
    )?;
    Some(STORAGE_HEADER_BYTES + written)
}

/// Non-verbose message: standard header without UEH, extra, little-endian
/// message id, raw payload.
pub fn build_non_verbose_packet(
    out: &mut [u8],
    msgid: u32,
    ecu: DltId,
    mcnt: u8,
    tmsp: u32,
    payload: &[u8],
) -> Option<usize> {
    let size = truncated_payload_len(payload.len(), NON_VERBOSE_HEADER_BYTES, out.len())?;
    write_standard_header(out, NON_VERBOSE_HEADER_BYTES + size, mcnt, false);
    write_header_extra(&mut out[STANDARD_HEADER_BYTES..], ecu, tmsp);
    out[STANDARD_HEADER_BYTES + HEADER_EXTRA_BYTES..NON_VERBOSE_HEADER_BYTES]
        .copy_from_slice(&msgid.to_le_bytes());
    out[NON_VERBOSE_HEADER_BYTES..NON_VERBOSE_HEADER_BYTES + size]
        .copy_from_slice(&payload[..size]);
    Some(NON_VERBOSE_HEADER_BYTES + size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_packet_layout() {
        let payload = [0xABu8; 42];
        let mut out = [0u8; 128];
        let written = build_storage_verbose_packet(
            &mut out,
            DltId::new("APP0"),
            DltId::new("CTX0"),
            DltId::new("ECU0"),
            LogLevel::Info,
            3,
            7,
            0x0102_0304,
            1_700_000_000,
            250_000,
            &payload,
        )
        .unwrap();

        assert_eq!(written, STORAGE_HEADER_BYTES + VERBOSE_HEADER_BYTES + 42);
        assert_eq!(&out[0..4], b"DLT\x01");
        assert_eq!(&out[12..16], b"ECU0");

        let std = &out[STORAGE_HEADER_BYTES..];
        assert_eq!(std[0], 0x35); // WEID | WTMS | VERS | UEH
        assert_eq!(std[1], 7);
        let len = u16::from_be_bytes([std[2], std[3]]);
        assert_eq!(len as usize, VERBOSE_HEADER_BYTES + 42);

        let extra = &std[STANDARD_HEADER_BYTES..];
        assert_eq!(&extra[0..4], b"ECU0");
        assert_eq!(&extra[4..8], &0x0102_0304u32.to_be_bytes());

        let ext = &std[STANDARD_HEADER_BYTES + HEADER_EXTRA_BYTES..];
        let msin = ext[0];
        assert_eq!(msin & 0x01, 0x01); // verbose
        assert_eq!((msin >> 1) & 0x07, 0); // MSTP == TYPE_LOG
        assert_eq!((msin >> 4) & 0x0F, LogLevel::Info as u8);
        assert_eq!(ext[1], 3);
        assert_eq!(&ext[2..6], b"APP0");
        assert_eq!(&ext[6..10], b"CTX0");

        assert_eq!(
            &out[STORAGE_HEADER_BYTES + VERBOSE_HEADER_BYTES..written],
            &payload[..]
        );
    }

    #[test]
    fn verbose_packet_truncates_to_message_size() {
        let payload = vec![0x5Au8; DLT_MESSAGE_SIZE];
        let mut out = vec![0u8; DLT_MESSAGE_SIZE];
        let written = build_verbose_packet(
            &mut out,
            DltId::new("APP0"),
            DltId::new("CTX0"),
            DltId::new("ECU1"),
            LogLevel::Warn,
            1,
            0,
            0,
            &payload,
        )
        .unwrap();

        assert_eq!(written, DLT_MESSAGE_SIZE);
        assert_eq!(out[VERBOSE_HEADER_BYTES], 0x5A);
        assert_eq!(out[DLT_MESSAGE_SIZE - 1], 0x5A);
    }

    #[test]
    fn standard_header_length_reflects_truncation() {
        // Truncated by the output buffer, not the wire cap.
        let payload = [1u8; 512];
        let mut out = [0u8; VERBOSE_HEADER_BYTES + 100];
        let written = build_verbose_packet(
            &mut out,
            DltId::new("APP0"),
            DltId::new("CTX0"),
            DltId::new("ECU1"),
            LogLevel::Warn,
            1,
            0,
            0,
            &payload,
        )
        .unwrap();
        assert_eq!(written, VERBOSE_HEADER_BYTES + 100);
        let len = u16::from_be_bytes([out[2], out[3]]);
        assert_eq!(len as usize, written);
    }

    #[test]
    fn non_verbose_packet_carries_little_endian_msgid() {
        let mut out = [0u8; 64];
        let written =
            build_non_verbose_packet(&mut out, 0xCAFE_F00D, DltId::new("ECU1"), 2, 9, b"nv")
                .unwrap();
        assert_eq!(written, NON_VERBOSE_HEADER_BYTES + 2);
        assert_eq!(out[0], DLT_HTYP_WEID | DLT_HTYP_WTMS | DLT_HTYP_VERS);
        assert_eq!(
            &out[STANDARD_HEADER_BYTES + HEADER_EXTRA_BYTES..NON_VERBOSE_HEADER_BYTES],
            &0xCAFE_F00Du32.to_le_bytes()
        );
        assert_eq!(&out[NON_VERBOSE_HEADER_BYTES..written], b"nv");
    }

    #[test]
    fn header_room_is_required() {
        let mut out = [0u8; VERBOSE_HEADER_BYTES - 1];
        assert!(build_verbose_packet(
            &mut out,
            DltId::new("A"),
            DltId::new("C"),
            DltId::new("E"),
            LogLevel::Info,
            0,
            0,
            0,
            b""
        )
        .is_none());
    }
}
