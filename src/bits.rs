//! Bit-offset/bit-width access to packed storage.
//!
//! Every container reads and writes its fields through these helpers, so the
//! layout arithmetic lives in one place. The `try_` variants are bounds checked
//! and return an error, the plain variants are the hot path and only check in
//! debug builds (the slice indexing underneath still panics on a bad range).

use std::ops::Range;

use bitvec::prelude::*;

use crate::error::{FilterError, Result};

/// Packed storage as seen by one partition: little-endian bit order over words.
pub type Bits = BitSlice<u64, Lsb0>;

pub const WORD_BITS: usize = 64;

#[inline]
pub fn read_bits(bits: &Bits, offset: usize, width: usize) -> u64 {
    debug_assert!(width > 0 && width <= WORD_BITS);
    bits[offset..offset + width].load_le::<u64>()
}

#[inline]
pub fn write_bits(bits: &mut Bits, offset: usize, width: usize, value: u64) {
    debug_assert!(width > 0 && width <= WORD_BITS);
    debug_assert!(width == WORD_BITS || value >> width == 0);
    bits[offset..offset + width].store_le::<u64>(value);
}

pub fn try_read_bits(bits: &Bits, offset: usize, width: usize) -> Result<u64> {
    check_range(bits, offset, width)?;
    Ok(read_bits(bits, offset, width))
}

pub fn try_write_bits(bits: &mut Bits, offset: usize, width: usize, value: u64) -> Result<()> {
    check_range(bits, offset, width)?;
    write_bits(bits, offset, width, value & mask(width as u32));
    Ok(())
}

/// Moves `src` so that it starts at `dest`; overlapping ranges are fine.
#[inline]
pub fn move_bits(bits: &mut Bits, src: Range<usize>, dest: usize) {
    if !src.is_empty() && src.start != dest {
        bits.copy_within(src, dest);
    }
}

#[inline]
pub fn clear_bits(bits: &mut Bits, range: Range<usize>) {
    bits[range].fill(false);
}

/// Low `width` bits set.
#[inline]
pub const fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Number of bits needed to store values `0..=max`.
#[inline]
pub const fn bits_for(max: usize) -> usize {
    (usize::BITS - max.leading_zeros()) as usize
}

/// Words needed for `bits` bits once padded to `align_bits`.
#[inline]
pub fn padded_words(bits: usize, align_bits: usize) -> usize {
    bits.div_ceil(align_bits) * align_bits / WORD_BITS
}

fn check_range(bits: &Bits, offset: usize, width: usize) -> Result<()> {
    let in_bounds = offset
        .checked_add(width)
        .is_some_and(|end| end <= bits.len());
    if width == 0 || width > WORD_BITS || !in_bounds {
        return Err(FilterError::OutOfBounds {
            offset,
            width,
            len: bits.len(),
        });
    }
    Ok(())
}
