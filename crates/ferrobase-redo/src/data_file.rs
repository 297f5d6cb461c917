//! The circular data file (`ib_logdata`).
//!
//! A fixed-size file that byte spans are appended to with wrap-around.
//! A single sequence bit flips on every wrap; recovery uses it to tell
//! live bytes from stale ones, so a single append must never span a
//! full wrap.
//!
//! The writer path re-writes the previously written tail block each
//! time (the block was padded to 512 bytes but may have gained payload
//! since) and pads the I/O to the write-ahead boundary; neither kind of
//! overlap advances the append position, which tracks fresh log bytes
//! only.

use std::sync::Mutex;

use ferrobase_error::Result;
use ferrobase_vfs::LogFile;

use crate::block::BLOCK_SIZE;
use crate::Lsn;

struct CircularState {
    position: u64,
    sequence_bit: u8,
}

/// Fixed-size circular file with a wrap sequence bit.
pub struct CircularDataFile {
    file: LogFile,
    size: u64,
    state: Mutex<CircularState>,
}

impl CircularDataFile {
    /// Wrap an open file of `size` bytes; position 0, sequence bit 1
    /// (the state of a freshly materialized log).
    pub fn new(file: LogFile, size: u64) -> Self {
        debug_assert!(size % BLOCK_SIZE as u64 == 0);
        Self {
            file,
            size,
            state: Mutex::new(CircularState {
                position: 0,
                sequence_bit: 1,
            }),
        }
    }

    /// File size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current `(position, sequence_bit)`.
    pub fn position_and_bit(&self) -> (u64, u8) {
        let state = self.state.lock().expect("data file state poisoned");
        (state.position, state.sequence_bit)
    }

    /// Whether writes reach stable storage without an explicit flush.
    pub fn writes_are_durable(&self) -> bool {
        self.file.writes_are_durable()
    }

    /// Flush file data to stable storage.
    pub fn flush_data_only(&self) -> Result<()> {
        self.file.flush_data_only()
    }

    /// Close the underlying file.
    pub fn close(&mut self) -> Result<()> {
        self.file.close()
    }

    /// Append `buf` at the current position.
    ///
    /// Splits the write at the file end; the position wraps to 0 and
    /// the sequence bit flips exactly when the end is reached. `buf`
    /// must be strictly smaller than the file.
    ///
    /// Returns the number of physical writes issued (1, or 2 on wrap).
    pub fn append(&self, buf: &[u8]) -> Result<usize> {
        self.append_region(0, 0, buf)
    }

    /// Append a region whose first `rewritten` bytes overwrite the tail
    /// of the previous write and whose last `pad` bytes are write-ahead
    /// padding.
    ///
    /// The physical write starts `rewritten` bytes behind the current
    /// position; the position advances only by
    /// `buf.len() - rewritten - pad` and the sequence bit flips when it
    /// passes the file end. The fresh byte count must be strictly
    /// smaller than the file.
    pub fn append_region(&self, rewritten: u64, pad: u64, buf: &[u8]) -> Result<usize> {
        let len = buf.len() as u64;
        debug_assert!(rewritten + pad <= len);
        let fresh = len - rewritten - pad;
        debug_assert!(fresh < self.size, "append must not bite its own tail");

        let mut state = self.state.lock().expect("data file state poisoned");
        debug_assert!(rewritten <= self.size);
        let start = (state.position + self.size - rewritten) % self.size;

        let writes = self.write_wrapped(start, buf)?;

        state.position += fresh;
        if state.position >= self.size {
            state.position -= self.size;
            state.sequence_bit ^= 1;
        }
        Ok(writes)
    }

    fn write_wrapped(&self, offset: u64, mut buf: &[u8]) -> Result<usize> {
        let mut offset = offset;
        let mut writes = 0;
        if offset + buf.len() as u64 > self.size {
            let tail_len = (self.size - offset) as usize;
            self.file.write(&buf[..tail_len], offset)?;
            writes += 1;
            buf = &buf[tail_len..];
            offset = 0;
        }
        self.file.write(buf, offset)?;
        Ok(writes + 1)
    }

    /// Read `buf.len()` bytes starting at `offset`, wrapping at the
    /// file end. `buf` must be strictly smaller than the file.
    pub fn read_wrapped(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert!((buf.len() as u64) < self.size);
        let offset = offset % self.size;
        if offset + buf.len() as u64 > self.size {
            let tail_len = (self.size - offset) as usize;
            let (head, rest) = buf.split_at_mut(tail_len);
            self.file.read(head, offset)?;
            return self.file.read(rest, 0);
        }
        self.file.read(buf, offset)
    }
}

/// Data-file coordinates of the block containing `lsn`.
///
/// Returns `(offset, sequence_bit)` of the live-region start for a
/// checkpoint at `lsn`. The block stream starts at LSN 0 / offset 0 /
/// sequence bit 1 and the bit flips on every full pass over the file.
#[must_use]
pub fn checkpoint_coordinates(lsn: Lsn, file_size: u64) -> (u64, u8) {
    let block_lsn = lsn & !(BLOCK_SIZE as u64 - 1);
    let offset = block_lsn % file_size;
    let era = block_lsn / file_size;
    (offset, if era % 2 == 0 { 1 } else { 0 })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use ferrobase_vfs::MemFileIo;

    use super::*;

    fn mem_data_file(size: usize) -> (CircularDataFile, MemFileIo) {
        let io = MemFileIo::with_size(size);
        let peek = io.clone();
        let file = LogFile::from_io("ib_logdata", Box::new(io));
        (CircularDataFile::new(file, size as u64), peek)
    }

    #[test]
    fn append_advances_position() {
        let (data, peek) = mem_data_file(2048);
        data.append(&[1_u8; 100]).expect("append");
        assert_eq!(data.position_and_bit(), (100, 1));
        assert_eq!(&peek.contents()[..100], &[1_u8; 100][..]);
    }

    #[test]
    fn wrap_splits_write_and_flips_bit() {
        let (data, peek) = mem_data_file(2048);
        data.append(&vec![1_u8; 2000]).expect("fill");
        assert_eq!(data.position_and_bit(), (2000, 1));

        // 100 bytes split 48/52 across the file end.
        data.append(&vec![2_u8; 100]).expect("wrap");
        assert_eq!(data.position_and_bit(), (52, 0));

        let contents = peek.contents();
        assert_eq!(&contents[2000..], &[2_u8; 48][..]);
        assert_eq!(&contents[..52], &[2_u8; 52][..]);
    }

    #[test]
    fn exact_fill_resets_position_and_flips() {
        let (data, _) = mem_data_file(2048);
        data.append(&vec![1_u8; 1024]).expect("first");
        data.append(&vec![2_u8; 1024]).expect("second");
        assert_eq!(data.position_and_bit(), (0, 0));

        // A second full pass restores the original bit.
        data.append(&vec![3_u8; 1024]).expect("third");
        data.append(&vec![4_u8; 1024]).expect("fourth");
        assert_eq!(data.position_and_bit(), (0, 1));
    }

    #[test]
    fn rewritten_bytes_do_not_advance_position() {
        let (data, peek) = mem_data_file(2048);
        data.append(&vec![1_u8; 512]).expect("block");
        assert_eq!(data.position_and_bit(), (512, 1));

        // Rewrite the same block plus one fresh block.
        data.append_region(512, 0, &vec![2_u8; 1024]).expect("rewrite");
        assert_eq!(data.position_and_bit(), (1024, 1));
        assert_eq!(&peek.contents()[..1024], &[2_u8; 1024][..]);
    }

    #[test]
    fn pad_bytes_do_not_advance_position() {
        let (data, peek) = mem_data_file(2048);
        data.append_region(0, 512, &vec![5_u8; 1024]).expect("padded");
        assert_eq!(data.position_and_bit(), (512, 1));
        // The pad was still written physically.
        assert_eq!(&peek.contents()[512..1024], &[5_u8; 512][..]);
    }

    #[test]
    fn read_wrapped_crosses_the_end() {
        let (data, _) = mem_data_file(2048);
        data.append(&vec![1_u8; 2000]).expect("fill");
        data.append(&vec![2_u8; 100]).expect("wrap");

        let mut buf = [0_u8; 100];
        data.read_wrapped(2000, &mut buf).expect("read");
        assert_eq!(&buf, &[2_u8; 100]);
    }

    #[test]
    fn checkpoint_coordinates_track_eras() {
        // First era: bit 1.
        assert_eq!(checkpoint_coordinates(12, 2048), (0, 1));
        assert_eq!(checkpoint_coordinates(600, 2048), (512, 1));
        assert_eq!(checkpoint_coordinates(2047, 2048), (1536, 1));
        // Second era: bit 0.
        assert_eq!(checkpoint_coordinates(2048, 2048), (0, 0));
        assert_eq!(checkpoint_coordinates(4095, 2048), (1536, 0));
        // Third era: bit 1 again.
        assert_eq!(checkpoint_coordinates(4096, 2048), (0, 1));
    }
}
