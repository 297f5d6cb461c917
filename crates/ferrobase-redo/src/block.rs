//! On-disk framing: 512-byte log blocks, the main-file header, and the
//! appended checkpoint / file-id records.
//!
//! Block layout:
//! ```text
//! 0..4    block number, big-endian; MSB set on the first block of a
//!         flush write batch
//! 4..6    data length (bytes used, counted from the block start)
//! 6..8    offset of the first record-group start in this block (0: none)
//! 8..12   low 32 bits of the next checkpoint number
//! 12..    payload (ends 4 bytes earlier when encryption reserves the
//!         key-version slot)
//! 508..512 CRC-32C of bytes 0..508
//! ```
//!
//! Everything here is pure byte manipulation; no I/O.

use ferrobase_error::{FerroError, Result};

use crate::Lsn;

/// Size of one log block.
pub const BLOCK_SIZE: usize = 512;
/// Size of the block header.
pub const BLOCK_HDR_SIZE: usize = 12;
/// Size of the CRC-32C block trailer.
pub const BLOCK_TRAILER_SIZE: usize = 4;
/// Size of the key-version slot reserved before the trailer when the
/// log is encrypted.
pub const BLOCK_KEY_SIZE: usize = 4;

/// The canonical physical redo log format tag ("PHYS").
pub const FORMAT_PHYSICAL: u32 = 0x5048_5953;

/// Size of the main-file header block.
pub const FILE_HEADER_SIZE: usize = BLOCK_SIZE;

/// Appended checkpoint record size: type, LSN, packed offset, CRC.
pub const CHECKPOINT_RECORD_SIZE: usize = 1 + 8 + 6 + 4;

/// Type tag of a checkpoint record (low nibble carries the body length).
pub const FILE_CHECKPOINT: u8 = 0xf0;
/// Type tag of a tablespace file-id record.
pub const FILE_ID: u8 = 0x90;

const HDR_NO: usize = 0;
const HDR_DATA_LEN: usize = 4;
const HDR_FIRST_REC_GROUP: usize = 6;
const HDR_CHECKPOINT_NO: usize = 8;
const TRAILER: usize = BLOCK_SIZE - BLOCK_TRAILER_SIZE;

const FLUSH_BIT_MASK: u32 = 0x8000_0000;
const BLOCK_NO_MASK: u32 = 0x3fff_ffff;

// Creator string stamped into new main-file headers.
const CREATOR_CURRENT: &str = "FerroBase 0.1";

// ---------------------------------------------------------------------------
// Block framing geometry
// ---------------------------------------------------------------------------

/// Block geometry, parameterized on whether the log is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockFormat {
    encrypted: bool,
}

impl BlockFormat {
    /// Geometry for an unencrypted or encrypted log.
    #[must_use]
    pub const fn new(encrypted: bool) -> Self {
        Self { encrypted }
    }

    /// Whether blocks reserve the key-version slot.
    #[must_use]
    pub const fn is_encrypted(self) -> bool {
        self.encrypted
    }

    /// Header + trailer bytes per block.
    #[must_use]
    pub const fn framing_size(self) -> usize {
        if self.encrypted {
            BLOCK_HDR_SIZE + BLOCK_KEY_SIZE + BLOCK_TRAILER_SIZE
        } else {
            BLOCK_HDR_SIZE + BLOCK_TRAILER_SIZE
        }
    }

    /// Payload bytes per block.
    #[must_use]
    pub const fn payload_size(self) -> usize {
        BLOCK_SIZE - self.framing_size()
    }

    /// Offset at which payload ends; a block whose data length reaches
    /// this value is full.
    #[must_use]
    pub const fn trailer_offset(self) -> usize {
        if self.encrypted {
            TRAILER - BLOCK_KEY_SIZE
        } else {
            TRAILER
        }
    }
}

// ---------------------------------------------------------------------------
// Block header accessors
// ---------------------------------------------------------------------------

/// Block number containing the byte at `lsn`: `1 + ((lsn / 512) mod 2^30)`.
#[must_use]
pub fn block_number_for_lsn(lsn: Lsn) -> u32 {
    1 + ((lsn >> 9) & u64::from(BLOCK_NO_MASK)) as u32
}

/// First LSN usable for payload: LSNs inside a block header are skipped.
#[must_use]
pub fn first_usable_lsn(lsn: Lsn) -> Lsn {
    if lsn % (BLOCK_SIZE as u64) < (BLOCK_HDR_SIZE as u64) {
        (lsn & !(BLOCK_SIZE as u64 - 1)) + BLOCK_HDR_SIZE as u64
    } else {
        lsn
    }
}

/// Block number stored in the header (flush bit stripped).
#[must_use]
pub fn hdr_block_number(block: &[u8]) -> u32 {
    read_u32(block, HDR_NO) & !FLUSH_BIT_MASK
}

/// Whether the flush bit is set: this block began a flush write batch.
#[must_use]
pub fn hdr_flush_bit(block: &[u8]) -> bool {
    read_u32(block, HDR_NO) & FLUSH_BIT_MASK != 0
}

/// Set the block number, clearing the flush bit.
pub fn set_hdr_block_number(block: &mut [u8], number: u32) {
    debug_assert!(number > 0 && number <= BLOCK_NO_MASK + 1);
    write_u32(block, HDR_NO, number & !FLUSH_BIT_MASK);
}

/// Set or clear the flush bit.
pub fn set_hdr_flush_bit(block: &mut [u8], flush: bool) {
    let mut no = read_u32(block, HDR_NO);
    if flush {
        no |= FLUSH_BIT_MASK;
    } else {
        no &= !FLUSH_BIT_MASK;
    }
    write_u32(block, HDR_NO, no);
}

/// Data length: bytes used in the block, counted from the block start.
#[must_use]
pub fn hdr_data_len(block: &[u8]) -> usize {
    usize::from(u16::from_be_bytes([block[HDR_DATA_LEN], block[HDR_DATA_LEN + 1]]))
}

/// Set the data length.
pub fn set_hdr_data_len(block: &mut [u8], len: usize) {
    debug_assert!(len <= BLOCK_SIZE);
    block[HDR_DATA_LEN..HDR_DATA_LEN + 2].copy_from_slice(&(len as u16).to_be_bytes());
}

/// Offset of the first record-group start in this block, 0 if none.
#[must_use]
pub fn hdr_first_rec_group(block: &[u8]) -> usize {
    usize::from(u16::from_be_bytes([
        block[HDR_FIRST_REC_GROUP],
        block[HDR_FIRST_REC_GROUP + 1],
    ]))
}

/// Set the first record-group offset.
pub fn set_hdr_first_rec_group(block: &mut [u8], offset: usize) {
    debug_assert!(offset <= BLOCK_SIZE);
    block[HDR_FIRST_REC_GROUP..HDR_FIRST_REC_GROUP + 2]
        .copy_from_slice(&(offset as u16).to_be_bytes());
}

/// Low 32 bits of the checkpoint number stamped when the block was last
/// written.
#[must_use]
pub fn hdr_checkpoint_no(block: &[u8]) -> u32 {
    read_u32(block, HDR_CHECKPOINT_NO)
}

/// Stamp the low 32 bits of `checkpoint_no`.
pub fn set_hdr_checkpoint_no(block: &mut [u8], checkpoint_no: u64) {
    write_u32(block, HDR_CHECKPOINT_NO, checkpoint_no as u32);
}

/// Initialize a fresh block header for the block containing `lsn`.
pub fn init_block(block: &mut [u8], lsn: Lsn) {
    set_hdr_block_number(block, block_number_for_lsn(lsn));
    set_hdr_data_len(block, BLOCK_HDR_SIZE);
    set_hdr_first_rec_group(block, 0);
}

// ---------------------------------------------------------------------------
// Block checksum
// ---------------------------------------------------------------------------

/// CRC-32C over bytes 0..508 of the block.
#[must_use]
pub fn calc_block_checksum(block: &[u8]) -> u32 {
    crc32c::crc32c(&block[..TRAILER])
}

/// Checksum stored in the block trailer.
#[must_use]
pub fn stored_block_checksum(block: &[u8]) -> u32 {
    read_u32(block, TRAILER)
}

/// Compute and store the trailer checksum.
pub fn store_block_checksum(block: &mut [u8]) {
    let checksum = calc_block_checksum(block);
    write_u32(block, TRAILER, checksum);
}

/// Validate a block's trailer checksum.
pub fn verify_block(block: &[u8]) -> Result<()> {
    let expected = calc_block_checksum(block);
    let stored = stored_block_checksum(block);
    if expected != stored {
        return Err(FerroError::corrupt_block(format!(
            "block {} checksum mismatch: stored {stored:#010x}, computed {expected:#010x}",
            hdr_block_number(block)
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Main-file header
// ---------------------------------------------------------------------------

/// The first 512 bytes of `ib_logfile0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Format tag; only [`FORMAT_PHYSICAL`] is written or accepted.
    pub format: u32,
    /// Encryption key version, 0 if unencrypted.
    pub key_version: u32,
    /// Size of the circular data file. Bottom 9 bits zero; the top 17
    /// bits are reserved for flags and must be zero.
    pub file_size: u64,
    /// NUL-terminated creator string.
    pub creator: String,
}

impl FileHeader {
    const FORMAT: usize = 0;
    const KEY_VERSION: usize = 4;
    const SIZE: usize = 8;
    const CREATOR: usize = 16;
    const CREATOR_END: usize = 48;

    /// Header for a newly materialized log.
    #[must_use]
    pub fn for_new_log(file_size: u64, key_version: u32) -> Self {
        Self {
            format: FORMAT_PHYSICAL,
            key_version,
            file_size,
            creator: CREATOR_CURRENT.to_owned(),
        }
    }

    /// Encode into a checksummed 512-byte header block.
    #[must_use]
    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut block = [0_u8; FILE_HEADER_SIZE];
        write_u32(&mut block, Self::FORMAT, self.format);
        write_u32(&mut block, Self::KEY_VERSION, self.key_version);
        block[Self::SIZE..Self::SIZE + 8].copy_from_slice(&self.file_size.to_be_bytes());
        let creator = self.creator.as_bytes();
        let n = creator.len().min(Self::CREATOR_END - Self::CREATOR - 1);
        block[Self::CREATOR..Self::CREATOR + n].copy_from_slice(&creator[..n]);
        store_block_checksum(&mut block);
        block
    }

    /// Decode and validate a header block.
    ///
    /// Rejects checksum mismatches, non-physical formats (the legacy
    /// block formats have no upgrade path here), and size fields whose
    /// reserved bits are set.
    pub fn decode(block: &[u8]) -> Result<Self> {
        if block.len() < FILE_HEADER_SIZE {
            return Err(FerroError::corrupt_block("file header shorter than 512"));
        }
        verify_block(block)?;

        let format = read_u32(block, Self::FORMAT);
        if format != FORMAT_PHYSICAL {
            return Err(FerroError::UnsupportedFormat {
                format,
                expected: FORMAT_PHYSICAL,
            });
        }

        let mut size_bytes = [0_u8; 8];
        size_bytes.copy_from_slice(&block[Self::SIZE..Self::SIZE + 8]);
        let file_size = u64::from_be_bytes(size_bytes);
        if file_size & 0x1ff != 0 || file_size >> 47 != 0 {
            return Err(FerroError::corrupt_block(format!(
                "file header size field {file_size:#x} has reserved bits set"
            )));
        }

        let creator_field = &block[Self::CREATOR..Self::CREATOR_END];
        let nul = creator_field.iter().position(|&b| b == 0).unwrap_or(0);
        let creator = String::from_utf8_lossy(&creator_field[..nul]).into_owned();

        Ok(Self {
            format,
            key_version: read_u32(block, Self::KEY_VERSION),
            file_size,
            creator,
        })
    }
}

// ---------------------------------------------------------------------------
// Checkpoint record
// ---------------------------------------------------------------------------

/// A 19-byte `FILE_CHECKPOINT` record appended to the main file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointRecord {
    /// All modifications with LSN below this are in data files or in
    /// durable log.
    pub lsn: Lsn,
    /// Data-file offset where the live region begins (47 bits).
    pub offset: u64,
    /// Sequence bit of the era that wrote `offset`.
    pub sequence_bit: u8,
}

impl CheckpointRecord {
    /// Encode into the 19-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; CHECKPOINT_RECORD_SIZE] {
        debug_assert!(self.sequence_bit <= 1);
        debug_assert!(self.offset < 1 << 47);

        let mut buf = [0_u8; CHECKPOINT_RECORD_SIZE];
        buf[0] = FILE_CHECKPOINT | (8 + 6);
        buf[1..9].copy_from_slice(&self.lsn.to_be_bytes());
        let packed = u64::from(self.sequence_bit) << 47 | self.offset;
        buf[9..15].copy_from_slice(&packed.to_be_bytes()[2..8]);
        let crc = crc32c::crc32c(&buf[..15]);
        buf[15..19].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Decode and validate a 19-byte record read at `offset_in_file`
    /// (used only for the error message).
    pub fn decode(buf: &[u8], offset_in_file: u64) -> Result<Self> {
        if buf.len() < CHECKPOINT_RECORD_SIZE
            || buf[0] != FILE_CHECKPOINT | (8 + 6)
            || crc32c::crc32c(&buf[..15]) != read_u32(buf, 15)
        {
            return Err(FerroError::CorruptCheckpoint {
                offset: offset_in_file,
            });
        }

        let mut lsn_bytes = [0_u8; 8];
        lsn_bytes.copy_from_slice(&buf[1..9]);
        let mut packed_bytes = [0_u8; 8];
        packed_bytes[2..8].copy_from_slice(&buf[9..15]);
        let packed = u64::from_be_bytes(packed_bytes);

        Ok(Self {
            lsn: u64::from_be_bytes(lsn_bytes),
            offset: packed & ((1 << 47) - 1),
            sequence_bit: (packed >> 47) as u8,
        })
    }
}

// ---------------------------------------------------------------------------
// Varint + file-id records
// ---------------------------------------------------------------------------

const MIN_2BYTE: u64 = 1 << 7;
const MIN_3BYTE: u64 = 1 << 14;
const MIN_4BYTE: u64 = 1 << 21;
const MIN_5BYTE: u64 = 1 << 28;

/// Append the big-endian prefix varint encoding of `value` (< 2^35).
pub fn encode_varint(out: &mut Vec<u8>, value: u64) {
    debug_assert!(value < 1 << 35);
    if value < MIN_2BYTE {
        out.push(value as u8);
    } else if value < MIN_3BYTE {
        out.push(0x80 | (value >> 8) as u8);
        out.push(value as u8);
    } else if value < MIN_4BYTE {
        out.push(0xc0 | (value >> 16) as u8);
        out.push((value >> 8) as u8);
        out.push(value as u8);
    } else if value < MIN_5BYTE {
        out.push(0xe0 | (value >> 24) as u8);
        out.push((value >> 16) as u8);
        out.push((value >> 8) as u8);
        out.push(value as u8);
    } else {
        out.push(0xf0 | (value >> 32) as u8);
        out.push((value >> 24) as u8);
        out.push((value >> 16) as u8);
        out.push((value >> 8) as u8);
        out.push(value as u8);
    }
}

/// Decode a prefix varint; returns the value and the encoded length.
pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize)> {
    let first = *buf
        .first()
        .ok_or_else(|| FerroError::corrupt_block("empty varint"))?;
    let (len, mut value) = match first.leading_ones() {
        0 => (1, u64::from(first)),
        1 => (2, u64::from(first & 0x3f)),
        2 => (3, u64::from(first & 0x1f)),
        3 => (4, u64::from(first & 0x0f)),
        _ => (5, u64::from(first & 0x07)),
    };
    if buf.len() < len {
        return Err(FerroError::corrupt_block("truncated varint"));
    }
    for &b in &buf[1..len] {
        value = value << 8 | u64::from(b);
    }
    Ok((value, len))
}

/// A `FILE_ID` record naming a tablespace file, appended to the main
/// file so recovery can resolve tablespace ids to paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdRecord {
    pub space_id: u32,
    pub path: String,
}

impl FileIdRecord {
    /// Encode as `type | body-len-nibble`, body, CRC-32C; bodies of 16
    /// bytes or more move the length into a varint after the type byte.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut body = Vec::with_capacity(5 + self.path.len());
        encode_varint(&mut body, u64::from(self.space_id));
        body.extend_from_slice(self.path.as_bytes());

        let start = out.len();
        if body.len() < 16 {
            out.push(FILE_ID | body.len() as u8);
            out.extend_from_slice(&body);
        } else {
            out.push(FILE_ID);
            encode_varint(out, body.len() as u64);
            out.extend_from_slice(&body);
        }
        let crc = crc32c::crc32c(&out[start..]);
        out.extend_from_slice(&crc.to_be_bytes());
    }

    /// Decode one record from the head of `buf`; returns the record and
    /// its total encoded length.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let first = *buf
            .first()
            .ok_or_else(|| FerroError::corrupt_block("empty file-id record"))?;
        if first & 0xf0 != FILE_ID {
            return Err(FerroError::corrupt_block(format!(
                "unexpected record type {first:#04x}"
            )));
        }

        let (body_len, body_start) = if first & 0x0f != 0 {
            (usize::from(first & 0x0f), 1)
        } else {
            let (len, n) = decode_varint(&buf[1..])?;
            (len as usize, 1 + n)
        };
        let total = body_start + body_len + 4;
        if buf.len() < total {
            return Err(FerroError::corrupt_block("truncated file-id record"));
        }
        let crc = crc32c::crc32c(&buf[..total - 4]);
        if crc != read_u32(buf, total - 4) {
            return Err(FerroError::corrupt_block("file-id record checksum mismatch"));
        }

        let body = &buf[body_start..body_start + body_len];
        let (space_id, n) = decode_varint(body)?;
        let path = String::from_utf8_lossy(&body[n..]).into_owned();
        Ok((
            Self {
                space_id: space_id as u32,
                path,
            },
            total,
        ))
    }
}

// ---------------------------------------------------------------------------
// Block stream scanning
// ---------------------------------------------------------------------------

/// A decoded block from a contiguous stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedBlock {
    /// Stored block number (flush bit stripped).
    pub number: u32,
    /// Whether this block began a flush write batch.
    pub flush_start: bool,
    /// Payload bytes (framing stripped).
    pub data: Vec<u8>,
    /// First record-group offset, 0 if none.
    pub first_rec_group: usize,
}

/// Validate and decode a stream of whole blocks.
///
/// Rejects streams whose length is not a multiple of 512 and blocks
/// whose checksum does not match. This is the recovery-side view of the
/// framing; the tests use it to prove the append path round-trips.
pub fn scan_block_stream(stream: &[u8], format: BlockFormat) -> Result<Vec<ScannedBlock>> {
    if stream.len() % BLOCK_SIZE != 0 {
        return Err(FerroError::corrupt_block(format!(
            "stream length {} is not block aligned",
            stream.len()
        )));
    }

    let mut blocks = Vec::with_capacity(stream.len() / BLOCK_SIZE);
    for chunk in stream.chunks_exact(BLOCK_SIZE) {
        verify_block(chunk)?;
        let data_len = hdr_data_len(chunk);
        let payload_end = if data_len == BLOCK_SIZE {
            format.trailer_offset()
        } else {
            data_len
        };
        if payload_end < BLOCK_HDR_SIZE || payload_end > format.trailer_offset() {
            return Err(FerroError::corrupt_block(format!(
                "block {} has invalid data length {data_len}",
                hdr_block_number(chunk)
            )));
        }
        blocks.push(ScannedBlock {
            number: hdr_block_number(chunk),
            flush_start: hdr_flush_bit(chunk),
            data: chunk[BLOCK_HDR_SIZE..payload_end].to_vec(),
            first_rec_group: hdr_first_rec_group(chunk),
        });
    }
    Ok(blocks)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn block_number_identity() {
        assert_eq!(block_number_for_lsn(0), 1);
        assert_eq!(block_number_for_lsn(511), 1);
        assert_eq!(block_number_for_lsn(512), 2);
        assert_eq!(block_number_for_lsn(8192), 17);
        // Wraps at 2^30 blocks.
        assert_eq!(block_number_for_lsn((1_u64 << 30) * 512), 1);
    }

    #[test]
    fn first_usable_lsn_skips_headers() {
        assert_eq!(first_usable_lsn(0), 12);
        assert_eq!(first_usable_lsn(1), 12);
        assert_eq!(first_usable_lsn(11), 12);
        assert_eq!(first_usable_lsn(12), 12);
        assert_eq!(first_usable_lsn(100), 100);
        assert_eq!(first_usable_lsn(512), 524);
        assert_eq!(first_usable_lsn(1030), 1036);
    }

    #[test]
    fn header_accessors_roundtrip() {
        let mut block = [0_u8; BLOCK_SIZE];
        init_block(&mut block, 1024);
        assert_eq!(hdr_block_number(&block), 3);
        assert_eq!(hdr_data_len(&block), BLOCK_HDR_SIZE);
        assert_eq!(hdr_first_rec_group(&block), 0);
        assert!(!hdr_flush_bit(&block));

        set_hdr_flush_bit(&mut block, true);
        assert!(hdr_flush_bit(&block));
        assert_eq!(hdr_block_number(&block), 3);

        set_hdr_data_len(&mut block, 500);
        set_hdr_first_rec_group(&mut block, 77);
        set_hdr_checkpoint_no(&mut block, 0x1_2345_6789);
        assert_eq!(hdr_data_len(&block), 500);
        assert_eq!(hdr_first_rec_group(&block), 77);
        assert_eq!(hdr_checkpoint_no(&block), 0x2345_6789);
    }

    #[test]
    fn formats() {
        let plain = BlockFormat::new(false);
        assert_eq!(plain.framing_size(), 16);
        assert_eq!(plain.payload_size(), 496);
        assert_eq!(plain.trailer_offset(), 508);

        let encrypted = BlockFormat::new(true);
        assert_eq!(encrypted.framing_size(), 20);
        assert_eq!(encrypted.payload_size(), 492);
        assert_eq!(encrypted.trailer_offset(), 504);
    }

    #[test]
    fn checksum_roundtrip_and_reject() {
        let mut block = [0_u8; BLOCK_SIZE];
        init_block(&mut block, 0);
        block[100] = 0xab;
        store_block_checksum(&mut block);
        verify_block(&block).expect("valid block");

        block[101] ^= 0x01;
        assert!(verify_block(&block).is_err());
    }

    #[test]
    fn file_header_roundtrip() {
        let header = FileHeader::for_new_log(1 << 20, 0);
        let encoded = header.encode();
        let decoded = FileHeader::decode(&encoded).expect("decode");
        assert_eq!(decoded.format, FORMAT_PHYSICAL);
        assert_eq!(decoded.file_size, 1 << 20);
        assert_eq!(decoded.creator, "FerroBase 0.1");
    }

    #[test]
    fn file_header_rejects_legacy_format() {
        let mut header = FileHeader::for_new_log(1 << 20, 0);
        header.format = 103;
        let err = FileHeader::decode(&header.encode()).expect_err("legacy");
        assert!(matches!(
            err,
            FerroError::UnsupportedFormat { format: 103, .. }
        ));
    }

    #[test]
    fn file_header_rejects_flagged_size() {
        let header = FileHeader::for_new_log(1 << 47 | 1 << 20, 0);
        assert!(FileHeader::decode(&header.encode()).is_err());
    }

    #[test]
    fn checkpoint_record_roundtrip() {
        let record = CheckpointRecord {
            lsn: 0xdead_beef_cafe,
            offset: (1 << 47) - 512,
            sequence_bit: 1,
        };
        let encoded = record.encode();
        assert_eq!(encoded.len(), 19);
        assert_eq!(encoded[0], 0xfe);
        let decoded = CheckpointRecord::decode(&encoded, 0).expect("decode");
        assert_eq!(decoded, record);
    }

    #[test]
    fn checkpoint_record_rejects_flip() {
        let record = CheckpointRecord {
            lsn: 42,
            offset: 0,
            sequence_bit: 1,
        };
        let mut encoded = record.encode();
        encoded[5] ^= 0x10;
        assert!(CheckpointRecord::decode(&encoded, 7).is_err());
    }

    #[test]
    fn varint_boundaries() {
        for value in [
            0,
            1,
            0x7f,
            0x80,
            0x3fff,
            0x4000,
            0x1f_ffff,
            0x20_0000,
            0xfff_ffff,
            0x1000_0000,
            u64::from(u32::MAX),
        ] {
            let mut buf = Vec::new();
            encode_varint(&mut buf, value);
            let (decoded, len) = decode_varint(&buf).expect("decode");
            assert_eq!(decoded, value, "value {value:#x}");
            assert_eq!(len, buf.len());
        }
    }

    #[test]
    fn file_id_record_roundtrip_short_and_long() {
        for path in ["a.ibd", "db1/some_fairly_long_table_name.ibd"] {
            let record = FileIdRecord {
                space_id: 4097,
                path: path.to_owned(),
            };
            let mut buf = Vec::new();
            record.encode(&mut buf);
            let (decoded, total) = FileIdRecord::decode(&buf).expect("decode");
            assert_eq!(decoded, record);
            assert_eq!(total, buf.len());
        }
    }

    #[test]
    fn scan_rejects_unaligned_stream() {
        assert!(scan_block_stream(&[0_u8; 100], BlockFormat::new(false)).is_err());
    }

    #[test]
    fn scan_roundtrips_payload() {
        let format = BlockFormat::new(false);
        let mut block = vec![0_u8; BLOCK_SIZE];
        init_block(&mut block, 0);
        block[BLOCK_HDR_SIZE..BLOCK_HDR_SIZE + 5].copy_from_slice(b"hello");
        set_hdr_data_len(&mut block, BLOCK_HDR_SIZE + 5);
        set_hdr_first_rec_group(&mut block, BLOCK_HDR_SIZE);
        store_block_checksum(&mut block);

        let scanned = scan_block_stream(&block, format).expect("scan");
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].data, b"hello");
        assert_eq!(scanned[0].first_rec_group, BLOCK_HDR_SIZE);
        assert!(!scanned[0].flush_start);
    }

    proptest! {
        #[test]
        fn prop_block_number_matches_formula(lsn in any::<u64>()) {
            let number = block_number_for_lsn(lsn);
            prop_assert!(number >= 1);
            prop_assert_eq!(u64::from(number), 1 + ((lsn >> 9) % (1 << 30)));
        }

        #[test]
        fn prop_single_bit_flip_rejected(bit in 0_usize..BLOCK_SIZE * 8) {
            let mut block = [0_u8; BLOCK_SIZE];
            init_block(&mut block, 4096);
            set_hdr_data_len(&mut block, 100);
            store_block_checksum(&mut block);

            block[bit / 8] ^= 1 << (bit % 8);
            prop_assert!(verify_block(&block).is_err());
        }

        #[test]
        fn prop_varint_roundtrip(value in 0_u64..(1 << 35)) {
            let mut buf = Vec::new();
            encode_varint(&mut buf, value);
            let (decoded, len) = decode_varint(&buf).expect("decode");
            prop_assert_eq!(decoded, value);
            prop_assert_eq!(len, buf.len());
        }
    }
}
