//! Page checksum engine.
//!
//! MODI bootloaders verify each flash page with a bit-wise CRC-32 over the
//! polynomial `0x4C11DB7`, fed 4 bytes at a time: the running value is XORed
//! with the little-endian interpretation of the block, then shifted through
//! 32 rounds. An 8-byte data block contributes its first half and then its
//! second half, and the result is accumulated across the whole page before
//! the CRC-verify command is issued.
//!
//! This is not a standard CRC-32 variant (no reflection, no final XOR, data
//! folded in word-wise) and must match the device bit-for-bit.

/// CRC polynomial used by the MODI bootloader.
pub const CRC_POLY: u32 = 0x4C11DB7;

/// Fold one 4-byte block into the running checksum.
///
/// Blocks shorter than 4 bytes are zero-padded at the top, matching the
/// little-endian integer interpretation on the device side.
pub fn crc32_step(block: &[u8], running: u32) -> u32 {
    let mut word = [0u8; 4];
    let n = block.len().min(4);
    word[..n].copy_from_slice(&block[..n]);

    let mut crc = running ^ u32::from_le_bytes(word);
    for _ in 0..32 {
        if crc & (1 << 31) != 0 {
            crc = (crc << 1) ^ CRC_POLY;
        } else {
            crc <<= 1;
        }
    }
    crc
}

/// Accumulate one 8-byte data block: first half, then second half.
///
/// Order matters; the device folds the halves sequentially.
pub fn page_checksum(block: &[u8], running: u32) -> u32 {
    let half = block.len().min(4);
    let crc = crc32_step(&block[..half], running);
    crc32_step(&block[half..], crc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_step_deterministic() {
        let a = crc32_step(&[0xDE, 0xAD, 0xBE, 0xEF], 0);
        let b = crc32_step(&[0xDE, 0xAD, 0xBE, 0xEF], 0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_crc32_step_golden() {
        // 32 rounds over a zero seed and the identity word. Computed once
        // with the reference implementation; must never change.
        assert_eq!(crc32_step(&[0x01, 0x00, 0x00, 0x00], 0), 0x04C11DB7);
        assert_eq!(crc32_step(&[0x00, 0x00, 0x00, 0x00], 0), 0);
        assert_eq!(crc32_step(&[0x00, 0x00, 0x00, 0x80], 0), 0xA6E63D1D);
    }

    #[test]
    fn test_page_checksum_golden() {
        let data = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
        assert_eq!(page_checksum(&data, 0), 0x5E1633D7);
        assert_eq!(page_checksum(&[1, 2, 3, 4, 5, 6, 7, 8], 0), 0xCA10A083);
    }

    #[test]
    fn test_page_checksum_order_sensitive() {
        let ab = page_checksum(&[1, 2, 3, 4, 5, 6, 7, 8], 0);
        let ba = page_checksum(&[5, 6, 7, 8, 1, 2, 3, 4], 0);
        assert_ne!(ab, ba);
    }

    #[test]
    fn test_page_checksum_matches_two_steps() {
        let data = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
        let manual = crc32_step(&data[4..], crc32_step(&data[..4], 0));
        assert_eq!(page_checksum(&data, 0), manual);
    }

    #[test]
    fn test_short_tail_zero_padded() {
        // A 6-byte tail behaves like the same bytes padded with zeros.
        let short = page_checksum(&[1, 2, 3, 4, 5, 6], 0);
        let padded = page_checksum(&[1, 2, 3, 4, 5, 6, 0, 0], 0);
        assert_eq!(short, padded);
    }
}
