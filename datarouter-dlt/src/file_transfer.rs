// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! File-transfer payload packets. A transferred file is announced with an
//! FLST (or FLIF) packet, moved in FLDA data packets of at most
//! [`FT_BUFFER_SIZE`] raw bytes, and closed with FLFI; FLER reports errors.
//! Every packet is a sequence of `type_info`-prefixed arguments written into
//! a caller-provided buffer.

use std::path::Path;

pub const FLST_NOR: u8 = 8;
pub const FLDA_NOR: u8 = 5;
pub const FLFI_NOR: u8 = 3;
pub const FLIF_NOR: u8 = 7;
pub const FLER_FILE_NOR: u8 = 9;
pub const FLER_NO_FILE_NOR: u8 = 5;

/// Raw bytes of file content per FLDA packet.
pub const FT_BUFFER_SIZE: u16 = 1024;

const TYPE_INFO_SINT: u32 = 0x0000_0020;
const TYPE_INFO_UINT: u32 = 0x0000_0040;
const TYPE_INFO_STRG: u32 = 0x0000_0200;
const TYPE_INFO_RAWD: u32 = 0x0000_0400;
const TYLE_16BIT: u32 = 0x0000_0002;
const TYLE_32BIT: u32 = 0x0000_0003;
const SCOD_UTF8: u32 = 0x0000_8000;

const FLAG_FLST: &[u8; 5] = b"FLST\0";
const FLAG_FLDA: &[u8; 5] = b"FLDA\0";
const FLAG_FLFI: &[u8; 5] = b"FLFI\0";
const FLAG_FLIF: &[u8; 5] = b"FLIF\0";
const FLAG_FLER: &[u8; 5] = b"FLER\0";

const TYPE_INFO_BYTES: usize = 4;
const STRING_LENGTH_BYTES: usize = 2;

fn flag_field_len() -> usize {
    TYPE_INFO_BYTES + STRING_LENGTH_BYTES + FLAG_FLST.len()
}

fn string_field_len(s: &str) -> usize {
    TYPE_INFO_BYTES + STRING_LENGTH_BYTES + s.len() + 1
}

fn u32_field_len() -> usize {
    TYPE_INFO_BYTES + 4
}

fn u16_field_len() -> usize {
    TYPE_INFO_BYTES + 2
}

fn i16_field_len() -> usize {
    TYPE_INFO_BYTES + 2
}

fn raw_field_len(data_len: usize) -> usize {
    TYPE_INFO_BYTES + STRING_LENGTH_BYTES + data_len
}

fn base_name(filename: &str) -> &str {
    Path::new(filename)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(filename)
}

struct ArgWriter<'a> {
    out: &'a mut [u8],
    pos: usize,
}

impl<'a> ArgWriter<'a> {
    fn new(out: &'a mut [u8]) -> Self {
        Self { out, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) {
        self.out[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn type_info(&mut self, info: u32) {
        self.put(&info.to_le_bytes());
    }

    fn flag(&mut self, tag: &[u8; 5]) {
        self.type_info(TYPE_INFO_STRG | SCOD_UTF8);
        self.put(&(tag.len() as u16).to_le_bytes());
        self.put(tag);
    }

    fn uint32(&mut self, value: u32) {
        self.type_info(TYPE_INFO_UINT | TYLE_32BIT);
        self.put(&value.to_le_bytes());
    }

    fn uint16(&mut self, value: u16) {
        self.type_info(TYPE_INFO_UINT | TYLE_16BIT);
        self.put(&value.to_le_bytes());
    }

    fn sint16(&mut self, value: i16) {
        self.type_info(TYPE_INFO_SINT | TYLE_16BIT);
        self.put(&value.to_le_bytes());
    }

    /// Length prefix counts the trailing NUL, which is part of the payload.
    fn string(&mut self, value: &str) {
        self.type_info(TYPE_INFO_STRG | SCOD_UTF8);
        self.put(&((value.len() + 1) as u16).to_le_bytes());
        self.put(value.as_bytes());
        self.put(&[0]);
    }

    fn raw(&mut self, data: &[u8]) {
        self.type_info(TYPE_INFO_RAWD);
        self.put(&(data.len() as u16).to_le_bytes());
        self.put(data);
    }

    fn finish(self) -> usize {
        self.pos
    }
}

/// FLIF: transfer information without starting a transfer.
pub fn package_file_information(
    out: &mut [u8],
    serial_number: u32,
    filename: &str,
    file_size: u32,
    creation_date: &str,
    package_count: u32,
) -> Option<(usize, u8)> {
    let alias = base_name(filename);
    let required = 2 * flag_field_len()
        + 2 * u32_field_len()
        + string_field_len(alias)
        + u32_field_len()
        + string_field_len(creation_date);
    if required > out.len() {
        return None;
    }

    let mut w = ArgWriter::new(out);
    w.flag(FLAG_FLIF);
    w.uint32(serial_number);
    w.string(alias);
    w.uint32(file_size);
    w.string(creation_date);
    w.uint32(package_count);
    w.flag(FLAG_FLIF);
    Some((w.finish(), FLIF_NOR))
}

/// FLST: header packet opening a transfer; announces the data packet size.
pub fn package_file_header(
    out: &mut [u8],
    serial_number: u32,
    filename: &str,
    file_size: u32,
    creation_date: &str,
    package_count: u32,
) -> Option<(usize, u8)> {
    let alias = base_name(filename);
    let required = 2 * flag_field_len()
        + 2 * u32_field_len()
        + string_field_len(alias)
        + u32_field_len()
        + string_field_len(creation_date)
        + u16_field_len();
    if required > out.len() {
        return None;
    }

    let mut w = ArgWriter::new(out);
    w.flag(FLAG_FLST);
    w.uint32(serial_number);
    w.string(alias);
    w.uint32(file_size);
    w.string(creation_date);
    w.uint32(package_count);
    w.uint16(FT_BUFFER_SIZE);
    w.flag(FLAG_FLST);
    Some((w.finish(), FLST_NOR))
}

/// FLDA: one chunk of file content, at most [`FT_BUFFER_SIZE`] bytes.
pub fn package_file_data(
    out: &mut [u8],
    serial_number: u32,
    package_number: u32,
    data: &[u8],
) -> Option<(usize, u8)> {
    if data.len() > FT_BUFFER_SIZE as usize {
        return None;
    }
    let required =
        2 * flag_field_len() + 2 * u32_field_len() + raw_field_len(FT_BUFFER_SIZE as usize);
    if required > out.len() {
        return None;
    }

    let mut w = ArgWriter::new(out);
    w.flag(FLAG_FLDA);
    w.uint32(serial_number);
    w.uint32(package_number);
    w.raw(data);
    w.flag(FLAG_FLDA);
    Some((w.finish(), FLDA_NOR))
}

/// FLFI: closes a transfer.
pub fn package_file_end(out: &mut [u8], serial_number: u32) -> Option<(usize, u8)> {
    let required = 2 * flag_field_len() + u32_field_len();
    if required > out.len() {
        return None;
    }

    let mut w = ArgWriter::new(out);
    w.flag(FLAG_FLFI);
    w.uint32(serial_number);
    w.flag(FLAG_FLFI);
    Some((w.finish(), FLFI_NOR))
}

/// FLER: error report. With `file_available` the packet carries the full
/// file description (plus an optional error message); without it only the
/// error codes and the file name.
#[allow(clippy::too_many_arguments)]
pub fn package_file_error(
    out: &mut [u8],
    error_code: i16,
    os_error: i16,
    serial_number: u32,
    filename: &str,
    file_size: u32,
    creation_date: &str,
    package_count: u32,
    error_message: &str,
    file_available: bool,
) -> Option<(usize, u8)> {
    let alias = base_name(filename);

    if !file_available {
        let required = 2 * flag_field_len() + 2 * i16_field_len() + string_field_len(alias);
        if required > out.len() {
            return None;
        }
        let mut w = ArgWriter::new(out);
        w.flag(FLAG_FLER);
        w.sint16(error_code);
        w.sint16(os_error);
        w.string(alias);
        w.flag(FLAG_FLER);
        return Some((w.finish(), FLER_NO_FILE_NOR));
    }

    let mut required = 2 * flag_field_len()
        + 2 * i16_field_len()
        + 2 * u32_field_len()
        + string_field_len(alias)
        + u32_field_len()
        + string_field_len(creation_date);
    if !error_message.is_empty() {
        required += string_field_len(error_message);
    }
    if required > out.len() {
        return None;
    }

    let mut w = ArgWriter::new(out);
    let mut nor = FLER_FILE_NOR;
    w.flag(FLAG_FLER);
    w.sint16(error_code);
    w.sint16(os_error);
    w.uint32(serial_number);
    w.string(alias);
    w.uint32(file_size);
    w.string(creation_date);
    w.uint32(package_count);
    if !error_message.is_empty() {
        w.string(error_message);
        nor += 1;
    }
    w.flag(FLAG_FLER);
    Some((w.finish(), nor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_header_packet_layout() {
        let mut out = [0u8; 256];
        let (len, nor) =
            package_file_header(&mut out, 1, "x.txt", 10, "2025-01-01", 1).unwrap();
        assert_eq!(nor, FLST_NOR);

        // Leading flag argument: STRG|UTF8 type info, length 5, "FLST\0".
        assert_eq!(&out[0..4], &(TYPE_INFO_STRG | SCOD_UTF8).to_le_bytes());
        assert_eq!(&out[4..6], &5u16.to_le_bytes());
        assert_eq!(&out[6..11], b"FLST\0");

        // serial number
        assert_eq!(&out[11..15], &(TYPE_INFO_UINT | TYLE_32BIT).to_le_bytes());
        assert_eq!(&out[15..19], &1u32.to_le_bytes());

        // file name, NUL-terminated and counted
        assert_eq!(&out[19..23], &(TYPE_INFO_STRG | SCOD_UTF8).to_le_bytes());
        assert_eq!(&out[23..25], &6u16.to_le_bytes());
        assert_eq!(&out[25..31], b"x.txt\0");

        // trailing flag closes the packet
        assert_eq!(&out[len - 5..len], b"FLST\0");
    }

    #[test]
    fn file_header_uses_base_name() {
        let mut out = [0u8; 256];
        let (_, _) =
            package_file_header(&mut out, 1, "/var/tmp/core.dump", 10, "2025-01-01", 1).unwrap();
        assert_eq!(&out[23..25], &10u16.to_le_bytes());
        assert_eq!(&out[25..35], b"core.dump\0");
    }

    #[test]
    fn data_packet_carries_raw_chunk() {
        let chunk = [0x42u8; 100];
        let mut out = [0u8; 2048];
        let (len, nor) = package_file_data(&mut out, 7, 3, &chunk).unwrap();
        assert_eq!(nor, FLDA_NOR);

        // flag(11) + serial(8) + pkgno(8), then the raw argument.
        let raw = &out[27..];
        assert_eq!(&raw[0..4], &TYPE_INFO_RAWD.to_le_bytes());
        assert_eq!(&raw[4..6], &100u16.to_le_bytes());
        assert_eq!(&raw[6..106], &chunk[..]);
        assert_eq!(&out[len - 5..len], b"FLDA\0");
    }

    #[test]
    fn data_packet_rejects_oversized_chunk() {
        let chunk = vec![0u8; FT_BUFFER_SIZE as usize + 1];
        let mut out = [0u8; 4096];
        assert!(package_file_data(&mut out, 1, 1, &chunk).is_none());
    }

    #[test]
    fn end_packet_is_flag_serial_flag() {
        let mut out = [0u8; 64];
        let (len, nor) = package_file_end(&mut out, 9).unwrap();
        assert_eq!(nor, FLFI_NOR);
        assert_eq!(len, 2 * flag_field_len() + u32_field_len());
        assert_eq!(&out[6..11], b"FLFI\0");
        assert_eq!(&out[15..19], &9u32.to_le_bytes());
        assert_eq!(&out[len - 5..len], b"FLFI\0");
    }

    #[test]
    fn error_packet_argument_counts() {
        let mut out = [0u8; 512];
        let (_, nor) =
            package_file_error(&mut out, -300, 13, 1, "a.bin", 5, "2025-01-01", 2, "", true)
                .unwrap();
        assert_eq!(nor, FLER_FILE_NOR);

        let (_, nor) =
            package_file_error(&mut out, -300, 13, 1, "a.bin", 5, "2025-01-01", 2, "boom", true)
                .unwrap();
        assert_eq!(nor, FLER_FILE_NOR + 1);

        let (len, nor) =
            package_file_error(&mut out, -700, 2, 1, "a.bin", 0, "", 0, "", false).unwrap();
        assert_eq!(nor, FLER_NO_FILE_NOR);
        assert_eq!(&out[len - 5..len], b"FLER\0");
    }

    #[test]
    fn too_small_buffer_is_rejected() {
        let mut out = [0u8; 16];
        assert!(package_file_header(&mut out, 1, "x.txt", 10, "2025-01-01", 1).is_none());
        assert!(package_file_end(&mut out, 1).is_none());
    }
}
