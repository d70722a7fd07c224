//! Variable-width bit packing, least-significant bit first within each byte.
//!
//! `write_bits` ORs into the destination. Fields written over stale bytes
//! come back corrupted, so every write path in this crate goes through a
//! [`BitWriter`], which zero-fills its region on construction.

use crate::error::{RelayError, Result};

fn check_range(buffer_len: usize, bit_offset: usize, width: u32) -> Result<()> {
    if width == 0 || width > 32 {
        return Err(RelayError::InvalidBitWidth(width));
    }
    let available = buffer_len * 8;
    match bit_offset.checked_add(width as usize) {
        Some(end) if end <= available => Ok(()),
        _ => Err(RelayError::BitRange {
            offset: bit_offset,
            width,
            available,
        }),
    }
}

/// Reads `width` bits starting at `bit_offset`.
pub fn read_bits(buffer: &[u8], bit_offset: usize, width: u32) -> Result<u32> {
    check_range(buffer.len(), bit_offset, width)?;

    let mut result = 0u64;
    let mut offset = bit_offset;
    let mut read = 0u32;
    while read < width {
        let shift = (offset % 8) as u32;
        let take = (8 - shift).min(width - read);
        let chunk = (buffer[offset / 8] as u64 >> shift) & ((1u64 << take) - 1);
        result |= chunk << read;
        read += take;
        offset += take as usize;
    }

    Ok(result as u32)
}

/// ORs the low `width` bits of `value` into `buffer` at `bit_offset`.
///
/// The destination bits must already be zero.
pub fn write_bits(buffer: &mut [u8], bit_offset: usize, width: u32, value: u32) -> Result<()> {
    check_range(buffer.len(), bit_offset, width)?;
    debug_assert!(width == 32 || value >> width == 0, "value {} wider than {} bits", value, width);

    let mut remaining = value as u64 & ((1u64 << width) - 1);
    let mut offset = bit_offset;
    let mut written = 0u32;
    while written < width {
        let shift = (offset % 8) as u32;
        let take = (8 - shift).min(width - written);
        let chunk = (remaining & ((1u64 << take) - 1)) as u8;
        buffer[offset / 8] |= chunk << shift;
        remaining >>= take;
        written += take;
        offset += take as usize;
    }

    Ok(())
}

/// Starting bit offset of each field, given the field widths in order.
pub fn bit_offsets_for(widths: &[u8]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(widths.len());
    let mut acc = 0usize;
    for &w in widths {
        offsets.push(acc);
        acc += w as usize;
    }
    offsets
}

pub fn total_bits(widths: &[u8]) -> usize {
    widths.iter().map(|&w| w as usize).sum()
}

pub fn bytes_for_bits(bits: usize) -> usize {
    bits.div_ceil(8)
}

/// Sequential writer over a region it owns exclusively.
pub struct BitWriter<'a> {
    buffer: &'a mut [u8],
    position: usize,
}

impl<'a> BitWriter<'a> {
    /// Zero-fills `buffer` so the OR-based writes start from a clean region.
    pub fn zeroed(buffer: &'a mut [u8]) -> Self {
        buffer.fill(0);
        Self { buffer, position: 0 }
    }

    /// Writes `value` in `width` bits; a zero width writes nothing.
    pub fn write(&mut self, width: u32, value: u32) -> Result<()> {
        if width == 0 {
            return Ok(());
        }
        write_bits(self.buffer, self.position, width, value)?;
        self.position += width as usize;
        Ok(())
    }

    pub fn write_at(&mut self, bit_offset: usize, width: u32, value: u32) -> Result<()> {
        if width == 0 {
            return Ok(());
        }
        write_bits(self.buffer, bit_offset, width, value)
    }

    pub fn bit_position(&self) -> usize {
        self.position
    }
}

pub struct BitReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, position: 0 }
    }

    pub fn read(&mut self, width: u32) -> Result<u32> {
        if width == 0 {
            return Ok(0);
        }
        let value = read_bits(self.buffer, self.position, width)?;
        self.position += width as usize;
        Ok(value)
    }

    pub fn bit_position(&self) -> usize {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_lsb_first_layout() {
        let mut buf = [0u8; 2];
        write_bits(&mut buf, 0, 3, 0b101).unwrap();
        write_bits(&mut buf, 3, 7, 0b1111111).unwrap();
        assert_eq!(buf, [0b1111_1101, 0b0000_0011]);
        assert_eq!(read_bits(&buf, 0, 3).unwrap(), 0b101);
        assert_eq!(read_bits(&buf, 3, 7).unwrap(), 0b1111111);
    }

    #[test]
    fn test_full_width_word() {
        let mut buf = [0u8; 6];
        write_bits(&mut buf, 5, 32, u32::MAX).unwrap();
        assert_eq!(read_bits(&buf, 5, 32).unwrap(), u32::MAX);
        assert_eq!(read_bits(&buf, 0, 5).unwrap(), 0);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut buf = [0u8; 2];
        assert!(matches!(
            write_bits(&mut buf, 10, 7, 1),
            Err(RelayError::BitRange { offset: 10, width: 7, available: 16 })
        ));
        assert!(matches!(read_bits(&buf, 0, 0), Err(RelayError::InvalidBitWidth(0))));
        assert!(matches!(read_bits(&buf, 0, 33), Err(RelayError::InvalidBitWidth(33))));
        assert!(read_bits(&buf, usize::MAX, 8).is_err());
    }

    #[test]
    fn test_or_write_hazard() {
        let mut buf = [0xFFu8; 1];
        write_bits(&mut buf, 0, 4, 0).unwrap();
        assert_eq!(read_bits(&buf, 0, 4).unwrap(), 0xF);

        let mut writer = BitWriter::zeroed(&mut buf);
        writer.write(4, 0).unwrap();
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn test_offsets_prefix_sum() {
        assert_eq!(bit_offsets_for(&[3, 5, 0, 9]), vec![0, 3, 8, 8]);
        assert_eq!(total_bits(&[3, 5, 0, 9]), 17);
        assert_eq!(bytes_for_bits(17), 3);
        assert_eq!(bytes_for_bits(16), 2);
    }

    #[test]
    fn test_sequential_writer_reader() {
        let widths = [1u32, 12, 7, 18, 0, 3];
        let values = [1u32, 4000, 99, 200_000, 0, 5];
        let mut buf = [0xAAu8; 6];
        let mut writer = BitWriter::zeroed(&mut buf);
        for (w, v) in widths.iter().zip(values.iter()) {
            writer.write(*w, *v).unwrap();
        }
        assert_eq!(writer.bit_position(), 41);

        let mut reader = BitReader::new(&buf);
        for (w, v) in widths.iter().zip(values.iter()) {
            assert_eq!(reader.read(*w).unwrap(), *v);
        }
    }

    proptest! {
        #[test]
        fn bits_round_trip(width in 1u32..=32, raw in any::<u32>(), offset in 0usize..64) {
            let value = if width == 32 { raw } else { raw & ((1u32 << width) - 1) };
            let mut buf = vec![0u8; 12];
            write_bits(&mut buf, offset, width, value).unwrap();
            prop_assert_eq!(read_bits(&buf, offset, width).unwrap(), value);
        }
    }
}
