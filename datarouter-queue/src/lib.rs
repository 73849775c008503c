// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wait-free producer queue shared between log producer processes and the
//! router daemon. Producers acquire length-prefixed slices inside one of two
//! alternating linear buffers; the single consumer switches the active buffer
//! and drains the other one without ever blocking a writer.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod alternating;
pub mod linear;
pub mod messages;
pub mod shared_memory;
pub mod shm;

pub use alternating::{
    AlternatingAcquiredData, AlternatingControlBlock, AlternatingReader, AlternatingReaderProxy,
    BlockId, WaitFreeAlternatingWriter,
};
pub use linear::{
    bytes_fit_in_remaining_capacity, AcquiredData, Length, LinearControlBlock, LinearReader,
    RawSpan, WaitFreeLinearWriter, LENGTH_PREFIX_BYTES, MAX_ACQUIRE_LENGTH_BYTES,
    MAX_CONCURRENT_WRITERS, MAX_LINEAR_BUFFER_CAPACITY_BYTES,
};
pub use messages::{
    expected_next_acquired_block_id, MessageId, ReadAcquireResult,
};
pub use shared_memory::{
    BufferEntryHeader, DropCounters, SharedData, SharedMemoryReader, SharedMemoryRecord,
    SharedMemoryWriter, TypeRegistration, ENTRY_HEADER_BYTES, REGISTER_TYPE_TOKEN,
};
pub use shm::SharedMapping;
