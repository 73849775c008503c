// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Byte-exact construction of DLT (Diagnostic Log and Trace) wire frames:
//! storage/standard/extended headers and the file-transfer payload packets.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod file_transfer;
pub mod headers;
pub mod id;
pub mod level;

pub use file_transfer::{
    package_file_data, package_file_end, package_file_error, package_file_header,
    package_file_information, FLDA_NOR, FLER_FILE_NOR, FLER_NO_FILE_NOR, FLFI_NOR, FLIF_NOR,
    FLST_NOR, FT_BUFFER_SIZE,
};
pub use headers::{
    build_non_verbose_packet, build_storage_verbose_packet, build_verbose_packet,
    write_extended_header, write_header_extra, write_standard_header, write_storage_header,
    DLT_HTYP_MSBF, DLT_HTYP_UEH, DLT_HTYP_VERS, DLT_HTYP_WEID, DLT_HTYP_WTMS, DLT_MESSAGE_SIZE,
    EXTENDED_HEADER_BYTES, HEADER_EXTRA_BYTES, NON_VERBOSE_HEADER_BYTES, STANDARD_HEADER_BYTES,
    STORAGE_HEADER_BYTES, VERBOSE_HEADER_BYTES,
};
pub use id::DltId;
pub use level::LogLevel;
