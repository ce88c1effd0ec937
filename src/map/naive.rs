//! Naive DDR3/DDR4 decoding: plain bit-field extraction with no channel or
//! rank interleaving. Physical layout, low to high:
//! `[word:3 | col:10 | bank:3-or-4 | row:16]`.

use crate::addr::{DramAddr, PhysAddr};
use crate::bits::{least_set_bit, ls_mask};

use super::{COL_BITS, MW_BITS, MappingProps};

const ROW_BITS: u32 = 16;
const BANK_OFF: u32 = MW_BITS + COL_BITS;

pub(super) fn map(addr: PhysAddr, bank_bits: u32) -> DramAddr {
    let row_off = BANK_OFF + bank_bits;
    if addr >> (row_off + ROW_BITS) != 0 {
        return DramAddr::BAD;
    }
    DramAddr {
        chan: 0,
        dimm: 0,
        rank: 0,
        bank: ((addr >> BANK_OFF) & ls_mask(bank_bits)) as u8,
        row: ((addr >> row_off) & ls_mask(ROW_BITS)) as u16,
        col: ((addr >> MW_BITS) & ls_mask(COL_BITS)) as u16,
    }
}

pub(super) fn map_reverse(addr: DramAddr, bank_bits: u32) -> PhysAddr {
    (PhysAddr::from(addr.row) << (BANK_OFF + bank_bits))
        + (PhysAddr::from(addr.bank) << BANK_OFF)
        + (PhysAddr::from(addr.col) << MW_BITS)
}

pub(super) fn twiddle_gran(mask: DramAddr, bank_bits: u32) -> u64 {
    let mut base = 1u64 << MW_BITS;
    if let Some(b) = least_set_bit(u64::from(mask.col)) {
        return base << b;
    }
    base <<= COL_BITS;
    if let Some(b) = least_set_bit(u64::from(mask.bank)) {
        return base << b;
    }
    base <<= bank_bits;
    if let Some(b) = least_set_bit(u64::from(mask.row)) {
        return base << b;
    }
    0
}

pub(super) fn props(bank_bits: u32) -> MappingProps {
    MappingProps {
        // The decoded column moves at cell grain.
        granularity: 1 << MW_BITS,
        bank_cnt: 1 << bank_bits,
        col_cnt: 1 << COL_BITS,
        cell_size: 1 << MW_BITS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::Mapping;

    #[test]
    fn ddr3_field_extraction() {
        let p: PhysAddr = 0x1_2345_6780;
        let da = Mapping::NaiveDdr3.map(p);
        assert_eq!(da.chan, 0);
        assert_eq!(da.dimm, 0);
        assert_eq!(da.rank, 0);
        assert_eq!(da.bank, ((p >> 13) & 7) as u8);
        assert_eq!(da.row, ((p >> 16) & 0xffff) as u16);
        assert_eq!(da.col, ((p >> 3) & 0x3ff) as u16);
        assert_eq!(Mapping::NaiveDdr3.map_reverse(da), p);
    }

    #[test]
    fn ddr4_has_one_more_bank_bit() {
        let p: PhysAddr = 0x1_2345_6780;
        let da = Mapping::NaiveDdr4.map(p);
        assert_eq!(da.bank, ((p >> 13) & 0xf) as u8);
        assert_eq!(da.row, ((p >> 17) & 0xffff) as u16);
        assert_eq!(Mapping::NaiveDdr4.map_reverse(da), p);
    }

    #[test]
    fn round_trips() {
        for m in [Mapping::NaiveDdr3, Mapping::NaiveDdr4] {
            for p in [0u64, 8, 0x1000, 0xdead_beef_8, 0x1_ffff_fff8] {
                let da = m.map(p);
                assert!(!da.is_bad());
                assert_eq!(m.map_reverse(da), p, "{p:#x}");
            }
        }
    }

    #[test]
    fn oversized_address_is_rejected() {
        // DDR3 decodes 3 + 10 + 3 + 16 = 32 bits of geometry.
        assert!(Mapping::NaiveDdr3.map(1 << 32).is_bad());
        assert!(!Mapping::NaiveDdr3.map((1 << 32) - 8).is_bad());
        assert!(Mapping::NaiveDdr4.map(1 << 33).is_bad());
    }

    #[test]
    fn twiddle_granularity_walks_fields() {
        let m = Mapping::NaiveDdr3;
        let mask = |bank, row, col| DramAddr { bank, row, col, ..DramAddr::default() };
        // Lowest column bit changes every cell.
        assert_eq!(m.twiddle_gran(mask(0, 0, 1)), 8);
        assert_eq!(m.twiddle_gran(mask(0, 0, 0b100)), 32);
        // Column beats bank even when both are set.
        assert_eq!(m.twiddle_gran(mask(1, 0, 1)), 8);
        assert_eq!(m.twiddle_gran(mask(1, 0, 0)), 1 << 13);
        assert_eq!(m.twiddle_gran(mask(0b100, 0, 0)), 1 << 15);
        assert_eq!(m.twiddle_gran(mask(0, 1, 0)), 1 << 16);
        assert_eq!(m.twiddle_gran(mask(0, 0x80, 0)), 1 << 23);
        assert_eq!(m.twiddle_gran(DramAddr::default()), 0);
        // DDR4's extra bank bit pushes the row field up one.
        assert_eq!(Mapping::NaiveDdr4.twiddle_gran(mask(0, 1, 0)), 1 << 17);
    }
}
