//! Double-SHA-256 and the ckpool byte conventions.
//!
//! Stratum v1 hardware expects hashes and headers in a "word-swapped" layout
//! inherited from ckpool: 32-byte values are sent with the bytes of each
//! 4-byte word reversed ([`flip_32`]), and the 80-byte block header is hashed
//! after un-swapping the prevhash and merkle root fields ([`flip_80`]). Both
//! operations are involutions, so the same functions convert in either
//! direction. Target arithmetic (compact `nbits` expansion and pool
//! difficulty) lives here as well.

use bitcoin::hashes::{sha256d, Hash};

use crate::u256::U256;

/// The classic pool difficulty-1 target, in compact form.
///
/// Expanded: 0x00000000ffff0000...0. Pool share targets are derived by
/// dividing this by the session difficulty.
pub const DIFF1_BITS: u32 = 0x1d00ffff;

/// Double SHA-256. Returns the raw 32-byte digest in internal byte order.
pub fn dsha256(data: &[u8]) -> [u8; 32] {
    sha256d::Hash::hash(data).to_byte_array()
}

/// Reverse the bytes within each 4-byte word of a 32-byte value, in place.
///
/// This is the word-swap applied to the previous-block hash before it goes
/// out in `mining.notify`, and to the merkle root before header assembly.
pub fn flip_32(value: &mut [u8; 32]) {
    for word in value.chunks_exact_mut(4) {
        word.reverse();
    }
}

/// [`flip_32`] on a copy.
pub fn flipped_32(value: [u8; 32]) -> [u8; 32] {
    let mut out = value;
    flip_32(&mut out);
    out
}

/// Word-swap the prevhash and merkle root fields of an 80-byte header,
/// in place. The version, ntime, nbits, and nonce scalars are untouched.
///
/// A header assembled in the miner-visible layout (word-swapped prevhash and
/// merkle root) becomes the consensus layout after this call, and vice versa.
pub fn flip_80(header: &mut [u8; 80]) {
    for word in header[4..68].chunks_exact_mut(4) {
        word.reverse();
    }
}

/// Expand a compact `nbits` value into a 256-bit target.
///
/// `exp = bits[0]`, `mant = bits[1..4]`, target = `mant << (8 * (exp - 3))`.
/// Values whose expansion does not fit in 256 bits saturate to `U256::MAX`.
pub fn target_from_bits(bits: u32) -> U256 {
    let exp = (bits >> 24) as usize;
    let mant = (bits & 0x00ff_ffff) as u64;

    if exp <= 3 {
        U256::from_u64(mant >> (8 * (3 - exp)))
    } else {
        U256::from_u64(mant)
            .checked_shl(8 * (exp - 3))
            .unwrap_or(U256::MAX)
    }
}

/// Compress a target back into compact `nbits` form.
pub fn compact_from_target(target: U256) -> u32 {
    let bytes = target.to_le_bytes();

    let mut size = 0usize;
    for i in (0..32).rev() {
        if bytes[i] != 0 {
            size = i + 1;
            break;
        }
    }
    if size == 0 {
        return 0;
    }

    let mut mant: u32 = if size >= 3 {
        (u32::from(bytes[size - 1]) << 16)
            | (u32::from(bytes[size - 2]) << 8)
            | u32::from(bytes[size - 3])
    } else {
        let mut v = 0u32;
        for i in (0..size).rev() {
            v = (v << 8) | u32::from(bytes[i]);
        }
        v << (8 * (3 - size))
    };

    // The compact format treats the high bit of the mantissa as a sign bit.
    if mant & 0x0080_0000 != 0 {
        mant >>= 8;
        size += 1;
    }

    ((size as u32) << 24) | mant
}

/// Derive a share target from a pool difficulty.
///
/// `floor(diff1_target / difficulty)`. Difficulties at or below zero yield
/// the maximum target (every hash qualifies). Fractional difficulties are
/// supported down to 1/65536.
pub fn difficulty_to_target(difficulty: f64) -> U256 {
    if difficulty <= 0.0 {
        return U256::MAX;
    }

    let scaled = (difficulty * 65536.0) as u64;
    (target_from_bits(DIFF1_BITS) << 16) / scaled.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flip_32_involution() {
        let mut value: [u8; 32] = core::array::from_fn(|i| i as u8);
        let original = value;
        flip_32(&mut value);
        assert_ne!(value, original);
        flip_32(&mut value);
        assert_eq!(value, original);
    }

    #[test]
    fn test_flip_32_word_swap() {
        let mut value = [0u8; 32];
        value[..4].copy_from_slice(&[0x6b, 0x64, 0x55, 0xfd]);
        flip_32(&mut value);
        assert_eq!(&value[..4], &[0xfd, 0x55, 0x64, 0x6b]);
    }

    #[test]
    fn test_flip_80_involution() {
        let mut header: [u8; 80] = core::array::from_fn(|i| (i * 3) as u8);
        let original = header;
        flip_80(&mut header);
        assert_ne!(header, original);
        flip_80(&mut header);
        assert_eq!(header, original);
    }

    #[test]
    fn test_flip_80_leaves_scalars_untouched() {
        let mut header: [u8; 80] = core::array::from_fn(|i| i as u8);
        let original = header;
        flip_80(&mut header);
        assert_eq!(&header[..4], &original[..4]);
        assert_eq!(&header[68..], &original[68..]);
        assert_ne!(&header[4..36], &original[4..36]);
        assert_ne!(&header[36..68], &original[36..68]);
    }

    /// The genesis block header must hash to the well-known genesis hash.
    #[test]
    fn test_dsha256_genesis_header() {
        let header = hex::decode(
            "0100000000000000000000000000000000000000000000000000000000000000\
             000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa\
             4b1e5e4a29ab5f49ffff001d1dac2b7c",
        )
        .unwrap();

        let mut hash = dsha256(&header);
        hash.reverse();
        assert_eq!(
            hex::encode(hash),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn test_target_from_diff1_bits() {
        let target = target_from_bits(DIFF1_BITS);
        let mut expected = [0u8; 32];
        // 0x00000000ffff0000...0 big-endian: 0xffff at byte offset 4..6
        expected[26] = 0xff;
        expected[27] = 0xff;
        assert_eq!(target, U256::from_le_bytes(expected));
    }

    #[test]
    fn test_bits_target_roundtrip() {
        // Compact values observed on the main chain.
        for bits in [0x1d00ffffu32, 0x1b0404cb, 0x1a05db8b, 0x170331db, 0x1703255c] {
            assert_eq!(compact_from_target(target_from_bits(bits)), bits);
        }
    }

    #[test]
    fn test_target_saturates_on_overflow() {
        assert_eq!(target_from_bits(0x21ffffff), U256::MAX);
        assert_eq!(target_from_bits(0xff123456), U256::MAX);
    }

    #[test]
    fn test_difficulty_one_is_diff1_target() {
        assert_eq!(difficulty_to_target(1.0), target_from_bits(DIFF1_BITS));
    }

    #[test]
    fn test_difficulty_scales_target_down() {
        let d1 = difficulty_to_target(1.0);
        assert_eq!(difficulty_to_target(2.0), d1 / 2u64);
        assert_eq!(difficulty_to_target(65536.0), d1 / 65536u64);
    }

    #[test]
    fn test_fractional_difficulty_scales_target_up() {
        let d1 = difficulty_to_target(1.0);
        assert_eq!(difficulty_to_target(0.5), d1 << 1);
    }

    #[test]
    fn test_nonpositive_difficulty_is_max_target() {
        assert_eq!(difficulty_to_target(0.0), U256::MAX);
        assert_eq!(difficulty_to_target(-3.0), U256::MAX);
    }
}
