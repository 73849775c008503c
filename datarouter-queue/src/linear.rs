// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{fence, AtomicU64, Ordering};

/// Byte count used throughout the queue. Indices are monotonically increasing
/// and never wrap thanks to [`MAX_LINEAR_BUFFER_CAPACITY_BYTES`].
pub type Length = u64;

/// Each entry consists of a little-endian length prefix followed by payload.
pub const LENGTH_PREFIX_BYTES: Length = std::mem::size_of::<Length>() as Length;

/// Upper bound for a single acquisition. DLT v1 needs at least 64 KiB; the
/// limit exists so that `acquired_index` cannot overflow under any legal
/// sequence of operations.
pub const MAX_ACQUIRE_LENGTH_BYTES: Length = 128 * 1024 * 1024;

pub const MAX_CONCURRENT_WRITERS: Length = 64;

/// The largest `acquired_index` value at which another acquisition may still
/// be attempted without risking index overflow.
pub const MAX_LINEAR_BUFFER_CAPACITY_BYTES: Length =
    Length::MAX - MAX_CONCURRENT_WRITERS * (MAX_ACQUIRE_LENGTH_BYTES + LENGTH_PREFIX_BYTES);

/// The only capacity predicate in the queue; all writer arithmetic routes
/// through this check.
pub fn bytes_fit_in_remaining_capacity(
    buffer_len: Length,
    offset: Length,
    number_of_bytes: Length,
) -> bool {
    offset <= buffer_len && number_of_bytes <= buffer_len - offset
}

/// Control data for one linear buffer. Lives in shared memory, so the layout
/// is fixed and every field is an atomic; buffers are addressed separately via
/// offsets stored next to this block.
#[repr(C)]
#[derive(Default)]
pub struct LinearControlBlock {
    /// Total bytes reserved by writers, including length prefixes.
    pub acquired_index: AtomicU64,
    /// Total bytes fully written and released.
    pub written_index: AtomicU64,
    /// Number of writers currently inside an acquire/release region.
    pub number_of_writers: AtomicU64,
}

impl LinearControlBlock {
    /// Resets the indices for buffer reuse. Only the single consumer may call
    /// this, and only on a block with no remaining writer references.
    pub fn reset_indices(&self) {
        self.acquired_index.swap(0, Ordering::SeqCst);
        self.written_index.swap(0, Ordering::SeqCst);
    }
}

/// Raw view of a data buffer in shared memory. Writers address disjoint
/// regions handed out by `acquired_index`, so concurrent mutation through
/// copies of this span never overlaps.
#[derive(Clone, Copy, Debug)]
pub struct RawSpan {
    ptr: *mut u8,
    len: Length,
}

// The span points into a shared mapping whose lifetime is managed by the
// owning reader/writer object; disjointness of writes is guaranteed by the
// acquire protocol.
unsafe impl Send for RawSpan {}
unsafe impl Sync for RawSpan {}

impl RawSpan {
    /// # Safety
    /// `ptr..ptr+len` must stay valid and mapped for as long as any copy of
    /// the span is used.
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Self {
        Self {
            ptr,
            len: len as Length,
        }
    }

    pub fn len(&self) -> Length {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn ptr_at(&self, offset: Length) -> *mut u8 {
        debug_assert!(offset <= self.len);
        unsafe { self.ptr.add(offset as usize) }
    }

    pub(crate) fn copy_in(&self, offset: Length, src: &[u8]) {
        debug_assert!(bytes_fit_in_remaining_capacity(
            self.len,
            offset,
            src.len() as Length
        ));
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr_at(offset), src.len());
        }
    }

    /// Read-only view of a prefix of the buffer. The caller must have
    /// established a happens-before edge with all writers of the range
    /// (quiescence check plus acquire fence).
    pub(crate) fn view(&self, len: Length) -> &[u8] {
        debug_assert!(len <= self.len);
        unsafe { std::slice::from_raw_parts(self.ptr, len as usize) }
    }
}

/// A successfully acquired payload region. Must be handed back via
/// [`WaitFreeLinearWriter::release`] once filled.
#[derive(Debug)]
pub struct AcquiredData {
    pub(crate) ptr: *mut u8,
    pub(crate) len: Length,
}

unsafe impl Send for AcquiredData {}

impl AcquiredData {
    pub fn len(&self) -> Length {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len as usize) }
    }
}

/// Multi-producer wait-free writer over a single [`LinearControlBlock`].
pub struct WaitFreeLinearWriter<'a> {
    control_block: &'a LinearControlBlock,
    data: RawSpan,
}

impl<'a> WaitFreeLinearWriter<'a> {
    pub fn new(control_block: &'a LinearControlBlock, data: RawSpan) -> Self {
        Self {
            control_block,
            data,
        }
    }

    /// Produces a writable span of exactly `length` bytes (the length prefix
    /// is written by the queue and not part of `length`). Returns `None` on
    /// concurrency or capacity limits; the caller translates that into the
    /// appropriate drop counter.
    pub fn acquire(&self, length: Length) -> Option<AcquiredData> {
        self.control_block
            .number_of_writers
            .fetch_add(1, Ordering::SeqCst);
        let writer_concurrency = self.control_block.number_of_writers.load(Ordering::SeqCst);

        let Some(offset) = self.check_and_get_acquire_offset(length, writer_concurrency) else {
            self.control_block
                .number_of_writers
                .fetch_sub(1, Ordering::SeqCst);
            return None;
        };

        // Copy the length prefix to the beginning of the acquired range.
        self.data.copy_in(offset, &length.to_le_bytes());

        Some(AcquiredData {
            ptr: self.data.ptr_at(offset + LENGTH_PREFIX_BYTES),
            len: length,
        })
    }

    /// Finalizes a previously acquired span, making it visible to the reader.
    pub fn release(&self, acquired: AcquiredData) {
        // The fence ensures the payload writes are seen before the index is
        // updated.
        fence(Ordering::Release);

        self.control_block
            .written_index
            .fetch_add(acquired.len + LENGTH_PREFIX_BYTES, Ordering::SeqCst);
        self.control_block
            .number_of_writers
            .fetch_sub(1, Ordering::SeqCst);
    }

    fn check_and_get_acquire_offset(
        &self,
        length: Length,
        writer_concurrency: Length,
    ) -> Option<Length> {
        if writer_concurrency > MAX_CONCURRENT_WRITERS {
            return None;
        }
        if length > MAX_ACQUIRE_LENGTH_BYTES {
            return None;
        }

        let total_acquired_length = length + LENGTH_PREFIX_BYTES;

        // Check if it makes sense to touch the atomic counter at all.
        let old_offset = self.control_block.acquired_index.load(Ordering::SeqCst);
        if old_offset >= MAX_LINEAR_BUFFER_CAPACITY_BYTES {
            return None;
        }
        if !bytes_fit_in_remaining_capacity(self.data.len(), old_offset, total_acquired_length) {
            return None;
        }

        let offset = self
            .control_block
            .acquired_index
            .fetch_add(total_acquired_length, Ordering::SeqCst);

        if !bytes_fit_in_remaining_capacity(self.data.len(), offset, total_acquired_length) {
            // Someone was faster, the buffer filled up meanwhile.
            self.terminate_buffer(offset, length);
            return None;
        }

        Some(offset)
    }

    /// The atomic counter was already incremented but the payload no longer
    /// fits. Write at least the length prefix so the reader can identify the
    /// failed acquisition; if even the prefix does not fit the reader detects
    /// the slot by bounds checking.
    fn terminate_buffer(&self, offset: Length, length: Length) {
        if bytes_fit_in_remaining_capacity(self.data.len(), offset, LENGTH_PREFIX_BYTES) {
            self.data.copy_in(offset, &length.to_le_bytes());
        }

        // written_index must advance even for failed acquisitions so that
        // written_index == acquired_index holds once all writers are done.
        self.control_block
            .written_index
            .fetch_add(length + LENGTH_PREFIX_BYTES, Ordering::SeqCst);
    }
}

/// Single-consumer framed iterator over the written portion of a buffer.
pub struct LinearReader<'a> {
    data: &'a [u8],
    read_index: Length,
}

impl<'a> LinearReader<'a> {
    /// Crops `data` to the published write index before iterating.
    pub fn from_data_and_length(data: &'a [u8], number_of_bytes_written: Length) -> Self {
        let number_of_bytes_to_read =
            std::cmp::min(number_of_bytes_written, data.len() as Length) as usize;
        Self {
            data: &data[..number_of_bytes_to_read],
            read_index: 0,
        }
    }

    /// Returns the next payload, skipping terminated (failed-acquire) slots.
    /// `None` either means the buffer is exhausted or the current slot was a
    /// failed acquisition; `remaining()` distinguishes the two if needed.
    pub fn read(&mut self) -> Option<&'a [u8]> {
        let offset = self.read_index;
        let data_len = self.data.len() as Length;

        if !bytes_fit_in_remaining_capacity(data_len, offset, LENGTH_PREFIX_BYTES) {
            return None;
        }

        let mut length_bytes = [0u8; LENGTH_PREFIX_BYTES as usize];
        length_bytes
            .copy_from_slice(&self.data[offset as usize..(offset + LENGTH_PREFIX_BYTES) as usize]);
        let length = Length::from_le_bytes(length_bytes);

        if length > MAX_ACQUIRE_LENGTH_BYTES {
            // Unexpected length value, drop all remaining data.
            self.read_index = data_len;
            return None;
        }

        self.read_index = offset + length + LENGTH_PREFIX_BYTES;

        if !bytes_fit_in_remaining_capacity(data_len, offset, LENGTH_PREFIX_BYTES + length) {
            // Terminated slot of a failed acquisition.
            return None;
        }

        let payload_offset = (offset + LENGTH_PREFIX_BYTES) as usize;
        Some(&self.data[payload_offset..payload_offset + length as usize])
    }

    /// Bytes left between the read index and the cropped end.
    pub fn remaining(&self) -> Length {
        (self.data.len() as Length).saturating_sub(self.read_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn buffer(len: usize) -> (Vec<u8>, RawSpan) {
        let mut storage = vec![0u8; len];
        let span = unsafe { RawSpan::new(storage.as_mut_ptr(), storage.len()) };
        (storage, span)
    }

    #[test]
    fn acquire_returns_exact_size_or_nothing() {
        let control = LinearControlBlock::default();
        let (_storage, span) = buffer(64);
        let writer = WaitFreeLinearWriter::new(&control, span);

        let grant = writer.acquire(16).unwrap();
        assert_eq!(grant.len(), 16);
        writer.release(grant);

        // 64 - (16 + 8) = 40 left; 40 - 8 = 32 payload bytes at most.
        assert!(writer.acquire(33).is_none());
        let grant = writer.acquire(32).unwrap();
        assert_eq!(grant.len(), 32);
        writer.release(grant);
    }

    #[test]
    fn roundtrip_single_frame() {
        let control = LinearControlBlock::default();
        let (storage, span) = buffer(128);
        let writer = WaitFreeLinearWriter::new(&control, span);

        let payload = b"the quick brown fox";
        let mut grant = writer.acquire(payload.len() as Length).unwrap();
        grant.as_mut_slice().copy_from_slice(payload);
        writer.release(grant);

        let written = control.written_index.load(Ordering::SeqCst);
        let mut reader = LinearReader::from_data_and_length(&storage, written);
        assert_eq!(reader.read().unwrap(), payload);
        assert!(reader.read().is_none());
    }

    #[test]
    fn quiescent_indices_converge_after_failed_acquires() {
        let control = LinearControlBlock::default();
        let (_storage, span) = buffer(48);
        let writer = WaitFreeLinearWriter::new(&control, span);

        let grant = writer.acquire(8).unwrap();
        writer.release(grant);
        // Does not fit anymore, but indices must still converge.
        assert!(writer.acquire(40).is_none());

        assert_eq!(control.number_of_writers.load(Ordering::SeqCst), 0);
        assert_eq!(
            control.acquired_index.load(Ordering::SeqCst),
            control.written_index.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn indices_converge_with_mixed_acquires() {
        let control = LinearControlBlock::default();
        let (storage, span) = buffer(40);
        let writer = WaitFreeLinearWriter::new(&control, span);

        let mut grant = writer.acquire(8).unwrap();
        grant.as_mut_slice().copy_from_slice(b"aaaaaaaa");
        writer.release(grant);

        let a = writer.acquire(4);
        let b = writer.acquire(4);
        drop(a.map(|g| writer.release(g)));
        drop(b.map(|g| writer.release(g)));

        assert_eq!(
            control.acquired_index.load(Ordering::SeqCst),
            control.written_index.load(Ordering::SeqCst)
        );

        let written = control.written_index.load(Ordering::SeqCst);
        let mut reader = LinearReader::from_data_and_length(&storage, written);
        assert_eq!(reader.read().unwrap(), b"aaaaaaaa");
    }

    #[test]
    fn reader_skips_a_terminated_slot() {
        // Lay out a valid frame followed by what a failed acquisition leaves
        // behind: a length prefix whose payload never fit into the buffer.
        let mut storage = vec![0u8; 32];
        storage[..8].copy_from_slice(&8u64.to_le_bytes());
        storage[8..16].copy_from_slice(b"bbbbbbbb");
        storage[16..24].copy_from_slice(&100u64.to_le_bytes());
        let written = 16 + 100 + 8; // as advanced by the terminating writer

        let mut reader = LinearReader::from_data_and_length(&storage, written);
        assert_eq!(reader.read().unwrap(), b"bbbbbbbb");
        assert!(reader.read().is_none());
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn reader_discards_rest_on_oversized_length_prefix() {
        let mut storage = vec![0u8; 64];
        storage[..8].copy_from_slice(&(MAX_ACQUIRE_LENGTH_BYTES + 1).to_le_bytes());
        let mut reader = LinearReader::from_data_and_length(&storage, 64);
        assert!(reader.read().is_none());
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn concurrent_writers_frames_seen_exactly_once() {
        const WRITERS: usize = 8;
        const PER_WRITER: usize = 64;
        const PAYLOAD: usize = 24;

        let control = LinearControlBlock::default();
        let (storage, span) = buffer(WRITERS * PER_WRITER * (PAYLOAD + 8) + 64);

        std::thread::scope(|scope| {
            for w in 0..WRITERS {
                let control = &control;
                scope.spawn(move || {
                    let writer = WaitFreeLinearWriter::new(control, span);
                    for i in 0..PER_WRITER {
                        if let Some(mut grant) = writer.acquire(PAYLOAD as Length) {
                            let tag = (w * PER_WRITER + i) as u64;
                            let slice = grant.as_mut_slice();
                            for chunk in slice.chunks_exact_mut(8) {
                                chunk.copy_from_slice(&tag.to_le_bytes());
                            }
                            writer.release(grant);
                        }
                    }
                });
            }
        });

        assert_eq!(control.number_of_writers.load(Ordering::SeqCst), 0);
        assert_eq!(
            control.acquired_index.load(Ordering::SeqCst),
            control.written_index.load(Ordering::SeqCst)
        );

        let written = control.written_index.load(Ordering::SeqCst);
        let mut reader = LinearReader::from_data_and_length(&storage, written);
        let mut seen = HashSet::new();
        while reader.remaining() > 0 {
            let Some(frame) = reader.read() else {
                continue;
            };
            assert_eq!(frame.len(), PAYLOAD);
            let mut tag_bytes = [0u8; 8];
            tag_bytes.copy_from_slice(&frame[..8]);
            let tag = u64::from_le_bytes(tag_bytes);
            for chunk in frame.chunks_exact(8) {
                assert_eq!(chunk, tag.to_le_bytes());
            }
            assert!(seen.insert(tag), "frame {tag} delivered twice");
        }
        assert_eq!(seen.len(), WRITERS * PER_WRITER);
    }
}
