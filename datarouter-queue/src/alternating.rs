// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::linear::{
    AcquiredData, Length, LinearControlBlock, LinearReader, RawSpan, WaitFreeLinearWriter,
};
use std::sync::atomic::{fence, AtomicU32, Ordering};

/// Two linear control blocks plus the switch counter that selects the block
/// currently active for writing. Parity of the counter selects the block:
/// even counter value means the even block is active.
#[repr(C)]
#[derive(Default)]
pub struct AlternatingControlBlock {
    pub control_block_even: LinearControlBlock,
    pub control_block_odd: LinearControlBlock,
    /// Monotonically increased by the reader, wrapping at u32::MAX. Never
    /// compared with ordered operators, only for equality modulo 2^32.
    pub switch_count: AtomicU32,
}

impl AlternatingControlBlock {
    /// Counter starts at 1 so the odd block is active for writers and the
    /// even block is reserved for the reader's first cycle.
    pub const INITIAL_SWITCH_COUNT: u32 = 1;

    pub fn initialize(&self) {
        self.control_block_even.reset_indices();
        self.control_block_even
            .number_of_writers
            .store(0, Ordering::SeqCst);
        self.control_block_odd.reset_indices();
        self.control_block_odd
            .number_of_writers
            .store(0, Ordering::SeqCst);
        self.switch_count
            .store(Self::INITIAL_SWITCH_COUNT, Ordering::SeqCst);
    }

    fn block(&self, id: BlockId) -> &LinearControlBlock {
        match id {
            BlockId::Even => &self.control_block_even,
            BlockId::Odd => &self.control_block_odd,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockId {
    Even,
    Odd,
}

impl BlockId {
    pub fn from_switch_count(count: u32) -> Self {
        if count % 2 == 0 {
            BlockId::Even
        } else {
            BlockId::Odd
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            BlockId::Even => BlockId::Odd,
            BlockId::Odd => BlockId::Even,
        }
    }
}

/// An acquisition routed to one of the two blocks; release must go back to
/// the same block.
#[derive(Debug)]
pub struct AlternatingAcquiredData {
    pub(crate) data: AcquiredData,
    block_id: BlockId,
}

impl AlternatingAcquiredData {
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn len(&self) -> Length {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data.as_mut_slice()
    }
}

/// Producer-side writer that routes every acquisition to the currently
/// active block, surviving a reader-initiated switch that happens mid-way.
pub struct WaitFreeAlternatingWriter<'a> {
    control_block: &'a AlternatingControlBlock,
    writer_even: WaitFreeLinearWriter<'a>,
    writer_odd: WaitFreeLinearWriter<'a>,
}

impl<'a> WaitFreeAlternatingWriter<'a> {
    pub fn new(
        control_block: &'a AlternatingControlBlock,
        buffer_even: RawSpan,
        buffer_odd: RawSpan,
    ) -> Self {
        Self {
            control_block,
            writer_even: WaitFreeLinearWriter::new(&control_block.control_block_even, buffer_even),
            writer_odd: WaitFreeLinearWriter::new(&control_block.control_block_odd, buffer_odd),
        }
    }

    pub fn acquire(&self, length: Length) -> Option<AlternatingAcquiredData> {
        let loaded_switch_count = self.control_block.switch_count.load(Ordering::SeqCst);

        let block_id = self.acquire_block(loaded_switch_count)?;

        let acquired = match block_id {
            BlockId::Even => self.writer_even.acquire(length),
            BlockId::Odd => self.writer_odd.acquire(length),
        }
        .map(|data| AlternatingAcquiredData { data, block_id });

        // Drop the block reservation taken during selection; a successful
        // linear acquire holds its own writer reference until release.
        self.control_block
            .block(block_id)
            .number_of_writers
            .fetch_sub(1, Ordering::Release);

        acquired
    }

    pub fn release(&self, acquired: AlternatingAcquiredData) {
        match acquired.block_id {
            BlockId::Even => self.writer_even.release(acquired.data),
            BlockId::Odd => self.writer_odd.release(acquired.data),
        }
    }

    /// Reserves the block that is active for the loaded counter value by
    /// incrementing its writer count, which alone blocks reader progress.
    fn acquire_block(&self, loaded_switch_count: u32) -> Option<BlockId> {
        let candidate = BlockId::from_switch_count(loaded_switch_count);
        let candidate_block = self.control_block.block(candidate);

        candidate_block
            .number_of_writers
            .fetch_add(1, Ordering::Acquire);

        let check = self.control_block.switch_count.load(Ordering::SeqCst);
        // Wrap-around on overflow is well-defined and expected for the block
        // id cycle.
        let advanced_once = loaded_switch_count.wrapping_add(1);

        if check == loaded_switch_count {
            // No switch happened; the candidate is genuinely active.
            return Some(candidate);
        }

        if check == advanced_once {
            // The reader switched before our reservation landed. Reserve the
            // opposite block first, then give up the candidate, so the reader
            // can never observe both blocks unreserved.
            let opposite = candidate.opposite();
            let opposite_block = self.control_block.block(opposite);
            opposite_block
                .number_of_writers
                .fetch_add(1, Ordering::Acquire);

            let second_check = self.control_block.switch_count.load(Ordering::SeqCst);

            candidate_block
                .number_of_writers
                .fetch_sub(1, Ordering::Release);

            if second_check != advanced_once {
                opposite_block
                    .number_of_writers
                    .fetch_sub(1, Ordering::Release);
                return None;
            }

            return Some(opposite);
        }

        // The counter advanced more than once while we held a reservation.
        // The reader is forbidden to do that; treat as fatal and fail the
        // acquisition.
        candidate_block
            .number_of_writers
            .fetch_sub(1, Ordering::Release);
        None
    }
}

/// Consumer-side switch operation. Single consumer only.
pub struct AlternatingReaderProxy<'a> {
    control_block: &'a AlternatingControlBlock,
}

impl<'a> AlternatingReaderProxy<'a> {
    pub fn new(control_block: &'a AlternatingControlBlock) -> Self {
        Self { control_block }
    }

    /// Moves writers to the opposite block and returns the counter value of
    /// the block that is now owned by the reader. The caller must not switch
    /// again before `is_block_released_by_writers` returns true for the
    /// returned value.
    pub fn switch_buffers(&self) -> u32 {
        let switch_count = self.control_block.switch_count.load(Ordering::SeqCst);

        // The opposite block was fully drained in the previous cycle and has
        // no writer references left by contract; make it ready for reuse.
        let reused = BlockId::from_switch_count(switch_count).opposite();
        self.control_block.block(reused).reset_indices();

        let saved = self.control_block.switch_count.fetch_add(1, Ordering::SeqCst);

        fence(Ordering::Release);

        // Writers may still hold the returned block; reading it requires the
        // release check below.
        saved
    }
}

/// Consumer-side view used to check for writer quiescence and to iterate a
/// drained block.
pub struct AlternatingReader<'a> {
    control_block: &'a AlternatingControlBlock,
    buffer_even: RawSpan,
    buffer_odd: RawSpan,
}

impl<'a> AlternatingReader<'a> {
    pub fn new(
        control_block: &'a AlternatingControlBlock,
        buffer_even: RawSpan,
        buffer_odd: RawSpan,
    ) -> Self {
        Self {
            control_block,
            buffer_even,
            buffer_odd,
        }
    }

    /// True once no writer holds the block and all acquisitions were
    /// released. A true result is followed by an acquire fence, pairing with
    /// the writers' release fences.
    pub fn is_block_released_by_writers(&self, block_id_count: u32) -> bool {
        let block = self
            .control_block
            .block(BlockId::from_switch_count(block_id_count));

        let released = block.number_of_writers.load(Ordering::SeqCst) == 0
            && block.written_index.load(Ordering::SeqCst)
                == block.acquired_index.load(Ordering::SeqCst);
        if released {
            fence(Ordering::Acquire);
        }
        released
    }

    /// Framed reader over the written portion of the block selected by
    /// `block_id_count`. Only valid after `is_block_released_by_writers`
    /// returned true for the same counter value.
    pub fn create_linear_reader(&self, block_id_count: u32) -> LinearReader<'_> {
        let block_id = BlockId::from_switch_count(block_id_count);
        let block = self.control_block.block(block_id);
        let written_bytes = block.written_index.load(Ordering::SeqCst);

        let buffer = match block_id {
            BlockId::Even => &self.buffer_even,
            BlockId::Odd => &self.buffer_odd,
        };
        let len = std::cmp::min(written_bytes, buffer.len());
        LinearReader::from_data_and_length(buffer.view(len), written_bytes)
    }
}
