// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Record framing on top of the alternating buffers, shared between the
//! producer process (writer side) and the daemon (reader side).
//!
//! Each frame carries a [`BufferEntryHeader`] followed by an opaque payload.
//! A frame whose type identifier equals [`REGISTER_TYPE_TOKEN`] is a type
//! registration announcing a new type id to the reader.

use crate::alternating::{
    AlternatingControlBlock, AlternatingReader, AlternatingReaderProxy, WaitFreeAlternatingWriter,
};
use crate::linear::{Length, RawSpan, MAX_ACQUIRE_LENGTH_BYTES};
use crate::messages::ReadAcquireResult;
use crate::shm::SharedMapping;
use std::ffi::CStr;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Type identifier reserved for registration records.
pub const REGISTER_TYPE_TOKEN: u16 = u16::MAX;

/// Serialized size of [`BufferEntryHeader`]: 8 bytes timestamp plus 2 bytes
/// type identifier.
pub const ENTRY_HEADER_BYTES: Length = 10;

/// Prepended by producers inside each framed payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferEntryHeader {
    /// Monotonic producer timestamp in nanoseconds.
    pub time_stamp_ns: u64,
    pub type_identifier: u16,
}

impl BufferEntryHeader {
    fn write_to(&self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.time_stamp_ns.to_le_bytes());
        out[8..10].copy_from_slice(&self.type_identifier.to_le_bytes());
    }

    fn parse(frame: &[u8]) -> Option<(BufferEntryHeader, &[u8])> {
        if frame.len() < ENTRY_HEADER_BYTES as usize {
            return None;
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&frame[..8]);
        let mut ty = [0u8; 2];
        ty.copy_from_slice(&frame[8..10]);
        Some((
            BufferEntryHeader {
                time_stamp_ns: u64::from_le_bytes(ts),
                type_identifier: u16::from_le_bytes(ty),
            },
            &frame[ENTRY_HEADER_BYTES as usize..],
        ))
    }
}

/// A data record as seen by the daemon. The payload view is only valid until
/// the next buffer switch.
#[derive(Clone, Copy, Debug)]
pub struct SharedMemoryRecord<'a> {
    pub header: BufferEntryHeader,
    pub payload: &'a [u8],
}

/// A registration record announcing `type_identifier` with an opaque
/// description payload.
#[derive(Clone, Copy, Debug)]
pub struct TypeRegistration<'a> {
    pub type_identifier: u16,
    pub description: &'a [u8],
}

impl<'a> TypeRegistration<'a> {
    fn parse(payload: &'a [u8]) -> Option<Self> {
        if payload.len() < 2 {
            return None;
        }
        let mut id = [0u8; 2];
        id.copy_from_slice(&payload[..2]);
        Some(TypeRegistration {
            type_identifier: u16::from_le_bytes(id),
            description: &payload[2..],
        })
    }
}

/// Head structure of the shared-memory object. No owning pointers: the two
/// linear buffers are addressed by offsets into the same mapping.
#[repr(C)]
pub struct SharedData {
    pub control_block: AlternatingControlBlock,
    /// Lets the reader locate the buffers without sharing pointers.
    pub linear_buffer_1_offset: Length,
    pub linear_buffer_2_offset: Length,
    pub number_of_drops_buffer_full: AtomicU64,
    pub size_of_drops_buffer_full: AtomicU64,
    pub number_of_drops_invalid_size: AtomicU64,
    pub number_of_drops_type_registration_failed: AtomicU64,
    pub writer_detached: AtomicBool,
    /// Lets the daemon check that a sender pid matches the shared-memory
    /// file's creator.
    pub producer_pid: libc::pid_t,
}

// Cross-process atomics must be lock-free; a mutex-based fallback would be
// meaningless across address spaces.
const _: () = assert!(cfg!(target_has_atomic = "64"));
const _: () = assert!(std::mem::align_of::<SharedData>() <= 8);

fn buffer_region_offset() -> Length {
    // Keep the buffers 8-byte aligned behind the head structure.
    ((std::mem::size_of::<SharedData>() as Length) + 7) & !7
}

/// Monotonic drop statistics published by the producer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DropCounters {
    pub buffer_full: u64,
    pub buffer_full_bytes: u64,
    pub invalid_size: u64,
    pub type_registration_failed: u64,
}

/// Producer-side endpoint: creates the shared-memory object and publishes
/// typed records through the wait-free writer.
pub struct SharedMemoryWriter {
    mapping: SharedMapping,
}

impl SharedMemoryWriter {
    /// Creates and initializes the shared object with two linear buffers of
    /// `buffer_size` bytes each.
    pub fn create(path: &CStr, buffer_size: usize) -> io::Result<SharedMemoryWriter> {
        let head = buffer_region_offset() as usize;
        let mapping = SharedMapping::create(path, head + 2 * buffer_size)?;

        // A fresh shared object is zero-filled, which is a valid bit pattern
        // for every atomic in SharedData; only the non-zero fields need
        // explicit stores.
        let writer = SharedMemoryWriter { mapping };
        {
            let shared = writer.shared();
            shared.control_block.initialize();
        }
        // The offsets and pid are written before any reader can attach
        // (attachment is announced over the control socket after creation).
        unsafe {
            let shared = writer.mapping.as_ptr() as *mut SharedData;
            (*shared).linear_buffer_1_offset = buffer_region_offset();
            (*shared).linear_buffer_2_offset = buffer_region_offset() + buffer_size as Length;
            (*shared).producer_pid = std::process::id() as libc::pid_t;
        }
        Ok(writer)
    }

    fn shared(&self) -> &SharedData {
        unsafe { &*(self.mapping.as_ptr() as *const SharedData) }
    }

    fn writer(&self) -> WaitFreeAlternatingWriter<'_> {
        let shared = self.shared();
        let (even, odd) = buffer_spans(&self.mapping, shared);
        WaitFreeAlternatingWriter::new(&shared.control_block, even, odd)
    }

    /// Publishes a registration record for `type_identifier`. Must happen
    /// before the first data record of that type. Returns false and bumps the
    /// registration drop counter when the queue is full.
    pub fn register_type(&self, type_identifier: u16, description: &[u8]) -> bool {
        let header = BufferEntryHeader {
            time_stamp_ns: monotonic_ns(),
            type_identifier: REGISTER_TYPE_TOKEN,
        };
        let total = ENTRY_HEADER_BYTES + 2 + description.len() as Length;
        let writer = self.writer();
        let Some(mut acquired) = writer.acquire(total) else {
            self.shared()
                .number_of_drops_type_registration_failed
                .fetch_add(1, Ordering::SeqCst);
            return false;
        };
        {
            let out = acquired.as_mut_slice();
            header.write_to(out);
            out[10..12].copy_from_slice(&type_identifier.to_le_bytes());
            out[12..].copy_from_slice(description);
        }
        writer.release(acquired);
        true
    }

    /// Publishes one data record. Acquire failures are translated into the
    /// drop counters and reported as `false`.
    pub fn write_record(&self, type_identifier: u16, time_stamp_ns: u64, payload: &[u8]) -> bool {
        let total = ENTRY_HEADER_BYTES + payload.len() as Length;
        let writer = self.writer();
        let Some(mut acquired) = writer.acquire(total) else {
            let shared = self.shared();
            if total > MAX_ACQUIRE_LENGTH_BYTES {
                shared
                    .number_of_drops_invalid_size
                    .fetch_add(1, Ordering::SeqCst);
            } else {
                shared
                    .number_of_drops_buffer_full
                    .fetch_add(1, Ordering::SeqCst);
                shared
                    .size_of_drops_buffer_full
                    .fetch_add(total, Ordering::SeqCst);
            }
            return false;
        };
        {
            let out = acquired.as_mut_slice();
            BufferEntryHeader {
                time_stamp_ns,
                type_identifier,
            }
            .write_to(out);
            out[ENTRY_HEADER_BYTES as usize..].copy_from_slice(payload);
        }
        writer.release(acquired);
        true
    }

    /// Current switch counter, sent to the daemon as the acquisition
    /// response during the read handshake.
    pub fn current_switch_count(&self) -> u32 {
        self.shared().control_block.switch_count.load(Ordering::SeqCst)
    }

    pub fn shm_name(&self) -> &CStr {
        self.mapping.name()
    }

    pub fn drop_counters(&self) -> DropCounters {
        drop_counters(self.shared())
    }

    /// Signals the reader that no further records will be produced.
    pub fn detach(&self) {
        self.shared().writer_detached.store(true, Ordering::SeqCst);
    }
}

impl Drop for SharedMemoryWriter {
    fn drop(&mut self) {
        self.detach();
    }
}

fn buffer_spans(mapping: &SharedMapping, shared: &SharedData) -> (RawSpan, RawSpan) {
    let buffer_size = (shared.linear_buffer_2_offset - shared.linear_buffer_1_offset) as usize;
    unsafe {
        (
            RawSpan::new(
                mapping.as_ptr().add(shared.linear_buffer_1_offset as usize),
                buffer_size,
            ),
            RawSpan::new(
                mapping.as_ptr().add(shared.linear_buffer_2_offset as usize),
                buffer_size,
            ),
        )
    }
}

fn drop_counters(shared: &SharedData) -> DropCounters {
    DropCounters {
        buffer_full: shared.number_of_drops_buffer_full.load(Ordering::SeqCst),
        buffer_full_bytes: shared.size_of_drops_buffer_full.load(Ordering::SeqCst),
        invalid_size: shared.number_of_drops_invalid_size.load(Ordering::SeqCst),
        type_registration_failed: shared
            .number_of_drops_type_registration_failed
            .load(Ordering::SeqCst),
    }
}

fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

/// Daemon-side endpoint: single consumer draining a producer's shared
/// object.
pub struct SharedMemoryReader {
    mapping: SharedMapping,
    /// Block switched away from writers but not yet released/consumed.
    pending_block: Option<u32>,
}

impl SharedMemoryReader {
    pub fn open(path: &CStr) -> io::Result<SharedMemoryReader> {
        let mapping = SharedMapping::open(path)?;
        if mapping.len() < std::mem::size_of::<SharedData>() {
            return Err(io::Error::other("shared object too small"));
        }
        let reader = SharedMemoryReader {
            mapping,
            pending_block: None,
        };
        let shared = reader.shared();
        let end = shared.linear_buffer_2_offset
            + (shared.linear_buffer_2_offset - shared.linear_buffer_1_offset);
        if shared.linear_buffer_1_offset < buffer_region_offset()
            || end > reader.mapping.len() as Length
        {
            return Err(io::Error::other("corrupt shared object layout"));
        }
        Ok(reader)
    }

    fn shared(&self) -> &SharedData {
        unsafe { &*(self.mapping.as_ptr() as *const SharedData) }
    }

    fn reader(&self) -> AlternatingReader<'_> {
        let shared = self.shared();
        let (even, odd) = buffer_spans(&self.mapping, shared);
        AlternatingReader::new(&shared.control_block, even, odd)
    }

    pub fn producer_pid(&self) -> libc::pid_t {
        self.shared().producer_pid
    }

    pub fn writer_detached(&self) -> bool {
        self.shared().writer_detached.load(Ordering::SeqCst)
    }

    pub fn drop_counters(&self) -> DropCounters {
        drop_counters(self.shared())
    }

    /// Removes the shared object's filesystem name. Called once the producer
    /// acknowledged the first acquire cycle so that an abrupt daemon exit
    /// does not leak namespace entries.
    pub fn unlink(&mut self) {
        _ = nix::sys::mman::shm_unlink(self.mapping.name());
    }

    /// Reader-side detach, for producers that disappeared without setting
    /// the flag themselves. Allows the drain loop to reclaim the mapping.
    pub fn mark_writer_detached(&self) {
        self.shared().writer_detached.store(true, Ordering::SeqCst);
    }

    /// Validates the producer's acquisition reply against the shared counter
    /// and takes ownership of the reported block. Returns the block counter
    /// to drain, or `None` when the reply is stale or already switched.
    pub fn notify_acquisition(&mut self, acquired: ReadAcquireResult) -> Option<u32> {
        if self.pending_block.is_some() {
            return self.pending_block;
        }
        let current = self
            .shared()
            .control_block
            .switch_count
            .load(Ordering::SeqCst);
        if acquired.acquired_buffer != current {
            return None;
        }
        let consumed = self.switch();
        Some(consumed)
    }

    /// Switches the active buffer and remembers the consumed block. The
    /// caller drains it via [`Self::read`] or [`Self::try_consume`].
    pub fn switch(&mut self) -> u32 {
        let shared = self.shared();
        let consumed = AlternatingReaderProxy::new(&shared.control_block).switch_buffers();
        self.pending_block = Some(consumed);
        consumed
    }

    pub fn is_block_released_by_writers(&self, block: u32) -> bool {
        self.reader().is_block_released_by_writers(block)
    }

    /// Drains the pending block if the writers already released it. Returns
    /// the number of consumed payload bytes, or `None` when the buffer was
    /// not ready (the pending block stays armed for a later attempt).
    pub fn try_consume(
        &mut self,
        type_cb: &mut dyn FnMut(TypeRegistration<'_>),
        record_cb: &mut dyn FnMut(SharedMemoryRecord<'_>),
    ) -> Option<Length> {
        let block = self.pending_block?;
        if !self.reader().is_block_released_by_writers(block) {
            return None;
        }
        self.pending_block = None;
        Some(consume_block(&self.reader(), block, type_cb, record_cb))
    }

    /// Switches (unless a block is already pending) and drains as soon as
    /// writers release; `None` when the buffer was not ready.
    pub fn read(
        &mut self,
        type_cb: &mut dyn FnMut(TypeRegistration<'_>),
        record_cb: &mut dyn FnMut(SharedMemoryRecord<'_>),
    ) -> Option<Length> {
        if self.pending_block.is_none() {
            self.switch();
        }
        self.try_consume(type_cb, record_cb)
    }

    /// Consumes the remaining side unconditionally. Only valid once
    /// `writer_detached` is set: no writer can touch the buffers anymore.
    pub fn read_detached(
        &mut self,
        type_cb: &mut dyn FnMut(TypeRegistration<'_>),
        record_cb: &mut dyn FnMut(SharedMemoryRecord<'_>),
    ) -> Length {
        let block = match self.pending_block.take() {
            Some(block) => block,
            None => self.switch_detached(),
        };
        consume_block(&self.reader(), block, type_cb, record_cb)
    }

    fn switch_detached(&mut self) -> u32 {
        let shared = self.shared();
        let consumed = AlternatingReaderProxy::new(&shared.control_block).switch_buffers();
        self.pending_block = None;
        consumed
    }
}

fn consume_block(
    reader: &AlternatingReader<'_>,
    block: u32,
    type_cb: &mut dyn FnMut(TypeRegistration<'_>),
    record_cb: &mut dyn FnMut(SharedMemoryRecord<'_>),
) -> Length {
    let mut linear = reader.create_linear_reader(block);
    let mut consumed: Length = 0;
    loop {
        let before = linear.remaining();
        match linear.read() {
            Some(frame) => {
                consumed += frame.len() as Length;
                let Some((header, payload)) = BufferEntryHeader::parse(frame) else {
                    // Truncated frame; nothing sensible to dispatch.
                    continue;
                };
                if header.type_identifier == REGISTER_TYPE_TOKEN {
                    if let Some(registration) = TypeRegistration::parse(payload) {
                        type_cb(registration);
                    }
                } else {
                    record_cb(SharedMemoryRecord { header, payload });
                }
            }
            None => {
                if linear.remaining() == before {
                    break;
                }
                // Terminated slot of a failed acquisition; keep going.
            }
        }
    }
    consumed
}
