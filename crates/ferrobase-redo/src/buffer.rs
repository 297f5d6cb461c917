//! The in-memory log buffer.
//!
//! Two owned halves of equal size plus an `active` index: appenders
//! (holding the log mutex) fill the active half while the writer
//! (holding the write group-commit lock) drains a snapshot of the other
//! one. [`LogBuffer::switch`] hands the filled half to the writer by
//! value and re-seeds the new active half with the in-progress tail
//! block, so the two sides never touch the same bytes.
//!
//! All methods must be called with the log mutex held; the returned
//! [`WriteRegion`] is the only piece that leaves the mutex.

use crate::block::{
    self, BLOCK_SIZE, BlockFormat, init_block, set_hdr_checkpoint_no, set_hdr_data_len,
    set_hdr_first_rec_group, set_hdr_flush_bit,
};
use crate::Lsn;

/// Free-space margin kept ahead of appends, in bytes (4 blocks).
pub const BUF_WRITE_MARGIN: usize = 4 * BLOCK_SIZE;

/// `max_buf_free` is half the buffer minus this flush margin.
const fn flush_margin(page_size: usize) -> usize {
    BUF_WRITE_MARGIN + 4 * page_size
}

/// A filled half handed to the writer.
///
/// Owns the half's backing storage for the duration of the I/O; give it
/// back with [`LogBuffer::reinstall`] once the write completes.
pub struct WriteRegion {
    /// The outgoing half; `area_start..area_end` is the block-aligned
    /// region to write.
    pub buf: Vec<u8>,
    /// Block-aligned start of the region.
    pub area_start: usize,
    /// Block-aligned end of the region.
    pub area_end: usize,
    /// Unaligned end of real data; `end_offset..area_end` is padding to
    /// be erased before computing checksums.
    pub end_offset: usize,
    generation: u64,
    half: usize,
}

/// Dual-half log buffer with per-block framing state.
pub struct LogBuffer {
    halves: [Vec<u8>; 2],
    active: usize,
    size: usize,
    format: BlockFormat,
    page_size: usize,
    /// First free byte offset in the active half.
    pub(crate) buf_free: usize,
    /// First byte offset not yet handed to the writer.
    pub(crate) buf_next_to_write: usize,
    /// Recommended maximum `buf_free` before a background write.
    pub(crate) max_buf_free: usize,
    generation: u64,
}

impl LogBuffer {
    /// Allocate a buffer with halves of `size` bytes.
    pub fn new(size: usize, page_size: usize, format: BlockFormat) -> Self {
        debug_assert!(size % BLOCK_SIZE == 0);
        Self {
            halves: [vec![0; size], vec![0; size]],
            active: 0,
            size,
            format,
            page_size,
            buf_free: 0,
            buf_next_to_write: 0,
            max_buf_free: Self::max_buf_free_for(size, page_size),
            generation: 0,
        }
    }

    fn max_buf_free_for(size: usize, page_size: usize) -> usize {
        (size / 2).saturating_sub(flush_margin(page_size))
    }

    /// Size of one half.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Block geometry in use.
    pub fn format(&self) -> BlockFormat {
        self.format
    }

    /// Position the buffer at `lsn`, initializing the block header of
    /// the containing block. Returns the possibly adjusted LSN (LSNs
    /// inside a block header move forward to the first payload byte).
    pub fn start_at(&mut self, lsn: Lsn) -> Lsn {
        let lsn = block::first_usable_lsn(lsn);
        self.buf_free = (lsn % BLOCK_SIZE as u64) as usize;
        self.buf_next_to_write = self.buf_free;
        init_block(&mut self.halves[self.active][..BLOCK_SIZE], lsn);
        set_hdr_data_len(&mut self.halves[self.active][..BLOCK_SIZE], self.buf_free);
        lsn
    }

    /// Copy `bytes` into the active half, maintaining block framing.
    ///
    /// Advances `lsn` by the payload length plus the framing bytes of
    /// every block boundary crossed. Blocks that fill up get their data
    /// length forced to 512 and the current checkpoint number stamped;
    /// the next block's header is initialized in place.
    ///
    /// The caller must have reserved space: the append plus one spare
    /// block must fit in the active half.
    pub fn append(&mut self, lsn: &mut Lsn, checkpoint_no: u64, mut bytes: &[u8]) {
        let trailer_offset = self.format.trailer_offset();
        let framing = self.format.framing_size();

        while !bytes.is_empty() {
            let within = self.buf_free % BLOCK_SIZE;
            let mut data_len = within + bytes.len();
            let len = if data_len <= trailer_offset {
                bytes.len()
            } else {
                data_len = trailer_offset;
                trailer_offset - within
            };

            let dst = self.buf_free;
            self.halves[self.active][dst..dst + len].copy_from_slice(&bytes[..len]);
            bytes = &bytes[len..];

            let block_start = dst - within;
            let block = &mut self.halves[self.active][block_start..block_start + BLOCK_SIZE];
            set_hdr_data_len(block, data_len);

            if data_len == trailer_offset {
                // This block became full.
                set_hdr_data_len(block, BLOCK_SIZE);
                set_hdr_checkpoint_no(block, checkpoint_no);
                *lsn += (len + framing) as u64;

                let next = block_start + BLOCK_SIZE;
                init_block(&mut self.halves[self.active][next..next + BLOCK_SIZE], *lsn);
                self.buf_free += len + framing;
            } else {
                *lsn += len as u64;
                self.buf_free += len;
            }
            debug_assert!(self.buf_free <= self.size);
        }
    }

    /// Close an append: if no record group starts in the current block
    /// yet, the next one will start at the current data length.
    pub fn close(&mut self) {
        let block_start = self.buf_free / BLOCK_SIZE * BLOCK_SIZE;
        let block = &mut self.halves[self.active][block_start..block_start + BLOCK_SIZE];
        if block::hdr_first_rec_group(block) == 0 {
            let data_len = block::hdr_data_len(block);
            set_hdr_first_rec_group(block, data_len);
        }
    }

    /// Whether there are bytes the writer has not been handed yet.
    pub fn has_unwritten(&self) -> bool {
        self.buf_free > self.buf_next_to_write
    }

    /// Stamp the flush bit on the first block of the upcoming write
    /// region and the checkpoint number on its last block.
    pub fn stamp_for_write(&mut self, checkpoint_no: u64) {
        let area_start = self.buf_next_to_write / BLOCK_SIZE * BLOCK_SIZE;
        let area_end = (self.buf_free + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE;
        debug_assert!(area_end > area_start);

        let half = &mut self.halves[self.active];
        set_hdr_flush_bit(&mut half[area_start..area_start + BLOCK_SIZE], true);
        set_hdr_checkpoint_no(
            &mut half[area_end - BLOCK_SIZE..area_end],
            checkpoint_no,
        );
    }

    /// Switch halves and hand the filled one to the writer.
    ///
    /// The last (possibly partial) block is copied to the head of the
    /// new active half so appenders keep extending it; `buf_free` and
    /// `buf_next_to_write` restart inside that block.
    pub fn switch(&mut self) -> WriteRegion {
        let area_start = self.buf_next_to_write / BLOCK_SIZE * BLOCK_SIZE;
        let area_end = (self.buf_free + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE;
        let end_offset = self.buf_free;

        let outgoing = self.active;
        self.active = 1 - outgoing;
        debug_assert_eq!(self.halves[self.active].len(), self.size);

        // Preserve the in-progress block at the head of the new half.
        let (first, second) = self.halves.split_at_mut(1);
        let (old_half, new_half) = if outgoing == 0 {
            (&first[0], &mut second[0])
        } else {
            (&second[0], &mut first[0])
        };
        new_half[..BLOCK_SIZE].copy_from_slice(&old_half[area_end - BLOCK_SIZE..area_end]);

        self.buf_free %= BLOCK_SIZE;
        self.buf_next_to_write = self.buf_free;

        WriteRegion {
            buf: std::mem::take(&mut self.halves[outgoing]),
            area_start,
            area_end,
            end_offset,
            generation: self.generation,
            half: outgoing,
        }
    }

    /// Return a half after its I/O completed. Dropped silently if the
    /// buffer was extended in the meantime.
    pub fn reinstall(&mut self, region: WriteRegion) {
        if region.generation == self.generation {
            self.halves[region.half] = region.buf;
        }
    }

    /// Replace both halves with larger ones, preserving the active
    /// half's contents. `min_size` is rounded up to the page size.
    ///
    /// Returns the new half size.
    pub fn extend(&mut self, min_size: usize) -> usize {
        let new_size = min_size.div_ceil(self.page_size) * self.page_size;
        debug_assert!(new_size > self.size);

        let mut first = vec![0; new_size];
        first[..self.buf_free].copy_from_slice(&self.halves[self.active][..self.buf_free]);
        self.halves = [first, vec![0; new_size]];
        self.active = 0;
        self.size = new_size;
        self.max_buf_free = Self::max_buf_free_for(new_size, self.page_size);
        self.generation += 1;
        new_size
    }

    /// Read-only view of the active half (tests and diagnostics).
    #[cfg(test)]
    pub(crate) fn active_half(&self) -> &[u8] {
        &self.halves[self.active]
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use crate::block::{
        hdr_block_number, hdr_data_len, hdr_first_rec_group, hdr_flush_bit, BLOCK_HDR_SIZE,
    };

    use super::*;

    fn new_buffer() -> (LogBuffer, Lsn) {
        let mut buffer = LogBuffer::new(8192, 4096, BlockFormat::new(false));
        let lsn = buffer.start_at(1);
        (buffer, lsn)
    }

    #[test]
    fn start_aligns_into_first_payload_byte() {
        let (buffer, lsn) = new_buffer();
        assert_eq!(lsn, 12);
        assert_eq!(buffer.buf_free, 12);
        assert_eq!(buffer.buf_next_to_write, 12);
        assert_eq!(hdr_block_number(buffer.active_half()), 1);
    }

    #[test]
    fn small_append_advances_lsn_by_payload() {
        let (mut buffer, mut lsn) = new_buffer();
        buffer.append(&mut lsn, 0, &[7_u8; 100]);
        assert_eq!(lsn, 112);
        assert_eq!(buffer.buf_free, 112);
        assert_eq!(hdr_data_len(&buffer.active_half()[..BLOCK_SIZE]), 112);
    }

    #[test]
    fn append_crossing_block_adds_framing() {
        let (mut buffer, mut lsn) = new_buffer();
        // Fill to offset 500 within the first block.
        buffer.append(&mut lsn, 0, &vec![1_u8; 488]);
        assert_eq!(buffer.buf_free, 500);
        assert_eq!(lsn, 500);

        // 100 more: 8 bytes fit (trailer at 508), then 92 spill over.
        buffer.append(&mut lsn, 5, &vec![2_u8; 100]);
        // 100 payload + 16 framing for the crossed boundary.
        assert_eq!(lsn, 616);
        assert_eq!(buffer.buf_free, 616);

        let first = &buffer.active_half()[..BLOCK_SIZE];
        assert_eq!(hdr_data_len(first), BLOCK_SIZE);
        assert_eq!(crate::block::hdr_checkpoint_no(first), 5);

        let second = &buffer.active_half()[BLOCK_SIZE..2 * BLOCK_SIZE];
        assert_eq!(hdr_block_number(second), 2);
        assert_eq!(hdr_data_len(second), 104);
    }

    #[test]
    fn close_sets_first_rec_group_once() {
        let (mut buffer, mut lsn) = new_buffer();
        buffer.append(&mut lsn, 0, &[1_u8; 30]);
        buffer.close();
        assert_eq!(
            hdr_first_rec_group(&buffer.active_half()[..BLOCK_SIZE]),
            42
        );

        // A later close must not move the group start.
        buffer.append(&mut lsn, 0, &[2_u8; 10]);
        buffer.close();
        assert_eq!(
            hdr_first_rec_group(&buffer.active_half()[..BLOCK_SIZE]),
            42
        );
    }

    #[test]
    fn switch_hands_over_region_and_preserves_tail_block() {
        let (mut buffer, mut lsn) = new_buffer();
        buffer.append(&mut lsn, 0, &vec![3_u8; 700]);
        assert!(buffer.has_unwritten());

        buffer.stamp_for_write(9);
        let region = buffer.switch();
        assert_eq!(region.area_start, 0);
        assert_eq!(region.area_end, 1024);
        assert_eq!(region.end_offset, 728); // 12 + 700 + 16 framing

        assert!(hdr_flush_bit(&region.buf[..BLOCK_SIZE]));
        assert_eq!(
            crate::block::hdr_checkpoint_no(&region.buf[BLOCK_SIZE..2 * BLOCK_SIZE]),
            9
        );

        // The new active half starts with a copy of the partial block.
        assert_eq!(buffer.buf_free, 728 % BLOCK_SIZE);
        assert_eq!(buffer.buf_next_to_write, buffer.buf_free);
        assert_eq!(
            &buffer.active_half()[..BLOCK_SIZE],
            &region.buf[BLOCK_SIZE..2 * BLOCK_SIZE]
        );
        assert!(!buffer.has_unwritten());

        buffer.reinstall(region);
    }

    #[test]
    fn reinstall_after_extension_drops_stale_half() {
        let (mut buffer, mut lsn) = new_buffer();
        buffer.append(&mut lsn, 0, &[1_u8; 100]);
        let region = buffer.switch();

        let new_size = buffer.extend(16384);
        assert_eq!(new_size, 16384);
        buffer.reinstall(region);
        assert_eq!(buffer.size(), 16384);
        assert_eq!(buffer.active_half().len(), 16384);
    }

    #[test]
    fn extend_preserves_active_contents() {
        let (mut buffer, mut lsn) = new_buffer();
        buffer.append(&mut lsn, 0, &[0xaa_u8; 64]);
        let snapshot = buffer.active_half()[..buffer.buf_free].to_vec();

        buffer.extend(32768);
        assert_eq!(&buffer.active_half()[..snapshot.len()], &snapshot[..]);
        assert_eq!(buffer.buf_free, snapshot.len());
    }

    #[test]
    fn max_buf_free_saturates_for_tiny_buffers() {
        let buffer = LogBuffer::new(8192, 4096, BlockFormat::new(false));
        // 8192 / 2 < flush margin (2048 + 16384), so the recommended
        // ceiling collapses to zero and every close requests a flush.
        assert_eq!(buffer.max_buf_free, 0);
    }

    #[test]
    fn encrypted_format_fills_at_504() {
        let mut buffer = LogBuffer::new(8192, 4096, BlockFormat::new(true));
        let mut lsn = buffer.start_at(1);
        buffer.append(&mut lsn, 0, &vec![1_u8; 492]);
        // 12 + 492 = 504 = encrypted trailer offset: block full, 20
        // bytes of framing.
        assert_eq!(lsn, 12 + 492 + 20);
        assert_eq!(buffer.buf_free, BLOCK_SIZE + BLOCK_HDR_SIZE);
    }
}
