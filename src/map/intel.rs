//! Intel memory-controller decoding for Sandy Bridge and Ivy Bridge/Haswell
//! client parts, including the PCI-hole relocation the controller applies
//! below 4 GiB.
//!
//! Both decoders consume a physical address low to high: channel selection
//! bit(s) first, then the 3-bit word index, 10 column bits, optional DIMM
//! and rank selection, three bank bits XOR-folded with low row bits, and a
//! 16-bit row. Addresses with bits above the declared geometry decode to
//! [`DramAddr::BAD`].

use bitflags::bitflags;

use crate::addr::{BAD_PHYS, DramAddr, PhysAddr};
use crate::bits::{bit, least_set_bit, ls_mask, pop_bit};

use super::{COL_BITS, MW_BITS, MappingProps};

bitflags! {
    /// Controller geometry switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IntelGeom: u32 {
        /// Two ranks per DIMM.
        const DUALRANK = 1;
        /// Two DIMMs per channel.
        const DUALDIMM = 2;
        /// Two channels per controller.
        const DUALCHAN = 4;
    }
}

/// Per-controller options carried by the Intel mapping variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntelOpts {
    pub geom: IntelGeom,
    /// Base of the PCI hole; 0 disables hole handling.
    pub pcibase: PhysAddr,
    /// Top of physical memory; 0 disables hole handling.
    pub mem_top: PhysAddr,
}

impl IntelOpts {
    fn has_pcihole(&self) -> bool {
        self.pcibase != 0 && self.mem_top != 0
    }
}

const FOUR_GIB: u64 = 1 << 32;

/// Collapse the PCI hole: `[pcibase, 4 GiB)` is MMIO (no DRAM behind it),
/// memory above `tom` is what the controller relocated into the hole.
pub(crate) fn pcihole_remap(addr: PhysAddr, pcibase: PhysAddr, tom: PhysAddr) -> PhysAddr {
    if addr < tom {
        if addr >= pcibase && addr < FOUR_GIB { BAD_PHYS } else { addr }
    } else {
        pcibase + (addr - tom)
    }
}

pub(crate) fn pcihole_remap_reverse(addr: PhysAddr, pcibase: PhysAddr, tom: PhysAddr) -> PhysAddr {
    if addr >= pcibase && addr < FOUR_GIB { addr - pcibase + tom } else { addr }
}

fn decode_sandy(mut addr: u64, geom: IntelGeom) -> DramAddr {
    let mut d = DramAddr::default();
    if geom.contains(IntelGeom::DUALCHAN) {
        d.chan = bit(6, addr) as u8;
        addr = pop_bit(6, addr);
    }
    addr >>= MW_BITS;
    d.col = (addr & ls_mask(COL_BITS)) as u16;
    addr >>= COL_BITS;
    if geom.contains(IntelGeom::DUALDIMM) {
        d.dimm = bit(3, addr) as u8;
        addr = pop_bit(3, addr);
    }
    if geom.contains(IntelGeom::DUALRANK) {
        d.rank = bit(3, addr) as u8;
        addr = pop_bit(3, addr);
    }
    for i in 0..3 {
        d.bank |= ((bit(0, addr) ^ bit(3, addr)) as u8) << i;
        addr >>= 1;
    }
    d.row = (addr & ls_mask(16)) as u16;
    addr >>= 16;
    if addr != 0 { DramAddr::BAD } else { d }
}

fn encode_sandy(addr: DramAddr, geom: IntelGeom) -> u64 {
    let bank = u64::from(addr.bank);
    let row = u64::from(addr.row);
    let col = u64::from(addr.col);
    let mut v = row & ls_mask(16);
    if geom.contains(IntelGeom::DUALRANK) {
        v = (v << 1) | (u64::from(addr.rank) & 1);
    }
    if geom.contains(IntelGeom::DUALDIMM) {
        v = (v << 1) | (u64::from(addr.dimm) & 1);
    }
    for i in (0..3).rev() {
        v = (v << 1) | (bit(i, bank) ^ bit(i, row));
    }
    if geom.contains(IntelGeom::DUALCHAN) {
        // The column is split around the channel bit: three bits below it,
        // seven above.
        v = (v << 7) | ((col >> 3) & ls_mask(7));
        v = (v << 1) | (u64::from(addr.chan) & 1);
        v = (v << 3) | (col & ls_mask(3));
    } else {
        v = (v << COL_BITS) | (col & ls_mask(COL_BITS));
    }
    v << MW_BITS
}

fn decode_ivyhaswell(mut addr: u64, geom: IntelGeom) -> DramAddr {
    let mut d = DramAddr::default();
    if geom.contains(IntelGeom::DUALCHAN) {
        d.chan = (bit(7, addr)
            ^ bit(8, addr)
            ^ bit(9, addr)
            ^ bit(12, addr)
            ^ bit(13, addr)
            ^ bit(18, addr)
            ^ bit(19, addr)) as u8;
        addr = pop_bit(7, addr);
    }
    addr >>= MW_BITS;
    d.col = (addr & ls_mask(COL_BITS)) as u16;
    addr >>= COL_BITS;
    if geom.contains(IntelGeom::DUALDIMM) {
        d.dimm = bit(2, addr) as u8;
        addr = pop_bit(2, addr);
    }
    if geom.contains(IntelGeom::DUALRANK) {
        d.rank = (bit(2, addr) ^ bit(6, addr)) as u8;
        addr = pop_bit(2, addr);
    }
    for i in 0..2 {
        d.bank |= ((bit(0, addr) ^ bit(3, addr)) as u8) << i;
        addr >>= 1;
    }
    let fold = if geom.contains(IntelGeom::DUALRANK) { 4 } else { 3 };
    d.bank |= ((bit(0, addr) ^ bit(fold, addr)) as u8) << 2;
    addr >>= 1;
    d.row = (addr & ls_mask(16)) as u16;
    addr >>= 16;
    if addr != 0 { DramAddr::BAD } else { d }
}

fn encode_ivyhaswell(addr: DramAddr, geom: IntelGeom) -> u64 {
    let bank = u64::from(addr.bank);
    let row = u64::from(addr.row);
    let col = u64::from(addr.col);
    let mut v = row & ls_mask(16);
    if geom.contains(IntelGeom::DUALRANK) {
        v = (v << 1) | (bit(2, bank) ^ bit(3, row));
        v = (v << 1) | ((u64::from(addr.rank) & 1) ^ bit(2, row));
    } else {
        v = (v << 1) | (bit(2, bank) ^ bit(2, row));
    }
    if geom.contains(IntelGeom::DUALDIMM) {
        v = (v << 1) | (u64::from(addr.dimm) & 1);
    }
    for i in (0..2).rev() {
        v = (v << 1) | (bit(i, bank) ^ bit(i, row));
    }
    if geom.contains(IntelGeom::DUALCHAN) {
        // Channel-bit reconstruction: the selection parity over the already
        // rebuilt upper bits, taken at their post-shift positions.
        v = (v << 6) | ((col >> 4) & ls_mask(6));
        v <<= 1;
        v |= (u64::from(addr.chan) & 1)
            ^ bit(1, v)
            ^ bit(2, v)
            ^ bit(5, v)
            ^ bit(6, v)
            ^ bit(11, v)
            ^ bit(12, v);
        v = (v << 4) | (col & ls_mask(4));
    } else {
        v = (v << COL_BITS) | (col & ls_mask(COL_BITS));
    }
    v << MW_BITS
}

pub(super) fn map_sandy(addr: PhysAddr, o: &IntelOpts) -> DramAddr {
    let addr = if o.has_pcihole() { pcihole_remap(addr, o.pcibase, o.mem_top) } else { addr };
    if addr == BAD_PHYS {
        return DramAddr::BAD;
    }
    decode_sandy(addr, o.geom)
}

pub(super) fn map_reverse_sandy(addr: DramAddr, o: &IntelOpts) -> PhysAddr {
    let ret = encode_sandy(addr, o.geom);
    if o.has_pcihole() { pcihole_remap_reverse(ret, o.pcibase, o.mem_top) } else { ret }
}

pub(super) fn map_ivyhaswell(addr: PhysAddr, o: &IntelOpts) -> DramAddr {
    let addr = if o.has_pcihole() { pcihole_remap(addr, o.pcibase, o.mem_top) } else { addr };
    if addr == BAD_PHYS {
        return DramAddr::BAD;
    }
    decode_ivyhaswell(addr, o.geom)
}

pub(super) fn map_reverse_ivyhaswell(addr: DramAddr, o: &IntelOpts) -> PhysAddr {
    let ret = encode_ivyhaswell(addr, o.geom);
    if o.has_pcihole() { pcihole_remap_reverse(ret, o.pcibase, o.mem_top) } else { ret }
}

/// Stride of the lowest masked bit when the field sits `base` up in the
/// address, provided that bit lies below `max_bits` (0 = no limit).
fn contiguous_twiddle(mask: u64, base: u64, max_bits: u32) -> Option<u64> {
    let lsb = least_set_bit(mask)?;
    if max_bits == 0 || lsb < max_bits { Some(base << lsb) } else { None }
}

pub(super) fn twiddle_gran_sandy(mask: DramAddr, o: &IntelOpts) -> u64 {
    let dchan = u32::from(o.geom.contains(IntelGeom::DUALCHAN));
    let ddimm = u32::from(o.geom.contains(IntelGeom::DUALDIMM));
    let drank = u32::from(o.geom.contains(IntelGeom::DUALRANK));
    let base = 1u64 << MW_BITS;
    // Column bits below the channel bit.
    if let Some(g) = contiguous_twiddle(u64::from(mask.col), base, 3) {
        return g;
    }
    if dchan != 0 && mask.chan != 0 {
        return base << 3;
    }
    // Column bits above it are displaced by the channel bit when present.
    if let Some(g) = contiguous_twiddle(u64::from(mask.col), base << dchan, 0) {
        return g;
    }
    let base = base << (COL_BITS + dchan);
    if let Some(g) = contiguous_twiddle(u64::from(mask.bank), base, 0) {
        return g;
    }
    let base = base << 3;
    if ddimm != 0 && mask.dimm != 0 {
        return base;
    }
    if drank != 0 && mask.rank != 0 {
        return base << ddimm;
    }
    let base = base << (ddimm + drank);
    contiguous_twiddle(u64::from(mask.row), base, 0).unwrap_or(0)
}

pub(super) fn twiddle_gran_ivyhaswell(mask: DramAddr, o: &IntelOpts) -> u64 {
    let dchan = u32::from(o.geom.contains(IntelGeom::DUALCHAN));
    let ddimm = u32::from(o.geom.contains(IntelGeom::DUALDIMM));
    let drank = u32::from(o.geom.contains(IntelGeom::DUALRANK));
    let base = 1u64 << MW_BITS;
    if let Some(g) = contiguous_twiddle(u64::from(mask.col), base, 4) {
        return g;
    }
    if dchan != 0 && mask.chan != 0 {
        return base << 4;
    }
    if let Some(g) = contiguous_twiddle(u64::from(mask.col), base << dchan, 0) {
        return g;
    }
    let base = base << (COL_BITS + dchan);
    // Low two bank bits sit directly above the column.
    if let Some(g) = contiguous_twiddle(u64::from(mask.bank), base, 2) {
        return g;
    }
    if ddimm != 0 && mask.dimm != 0 {
        return base << 2;
    }
    if drank != 0 && mask.rank != 0 {
        return base << (2 + ddimm);
    }
    if bit(2, u64::from(mask.bank)) != 0 {
        return base << (2 + ddimm + drank);
    }
    let base = base << (3 + ddimm + drank);
    contiguous_twiddle(u64::from(mask.row), base, 0).unwrap_or(0)
}

pub(super) fn props_sandy(o: &IntelOpts) -> MappingProps {
    MappingProps {
        granularity: if o.geom.contains(IntelGeom::DUALCHAN) { 1 << 6 } else { 1 << 13 },
        bank_cnt: 8,
        col_cnt: 1 << COL_BITS,
        cell_size: 1 << MW_BITS,
    }
}

pub(super) fn props_ivyhaswell(o: &IntelOpts) -> MappingProps {
    MappingProps {
        granularity: if o.geom.contains(IntelGeom::DUALCHAN) { 1 << 7 } else { 1 << 13 },
        bank_cnt: 8,
        col_cnt: 1 << COL_BITS,
        cell_size: 1 << MW_BITS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::Mapping;

    fn opts(geom: IntelGeom) -> IntelOpts {
        IntelOpts { geom, ..IntelOpts::default() }
    }

    fn all_geoms() -> impl Iterator<Item = IntelGeom> {
        (0u32..8).map(|g| IntelGeom::from_bits_truncate(g))
    }

    #[test]
    fn sandy_dualchan_example() {
        let m = Mapping::IntelSandy(opts(IntelGeom::DUALCHAN));
        let da = m.map(0x4000_0040);
        assert_eq!(da.chan, 1);
        assert_eq!(da.col, 0);
        assert_eq!(da.bank, 0);
        assert_eq!(da.row, 0x2000);
        assert_eq!(m.map_reverse(da), 0x4000_0040);
    }

    #[test]
    fn sandy_single_chan_is_plain_split() {
        let m = Mapping::IntelSandy(opts(IntelGeom::empty()));
        let p: PhysAddr = 0x0123_4567 & !7;
        let da = m.map(p);
        assert_eq!(da.col, ((p >> 3) & 0x3ff) as u16);
        assert_eq!(da.row, (p >> 16) as u16);
        // Bank bits are folded with the low row bits.
        let raw = ((p >> 13) & 7) as u8;
        let fold = (da.row & 7) as u8;
        assert_eq!(da.bank, raw ^ fold);
        assert_eq!(m.map_reverse(da), p);
    }

    #[test]
    fn round_trips_over_all_geometries() {
        // A deterministic xorshift walk over in-range addresses.
        let mut x = 0x9e37_79b9_7f4a_7c15u64;
        let mut step = || {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            x
        };
        for geom in all_geoms() {
            let extra = geom.bits().count_ones(); // one address bit per enabled switch
            let sandy = Mapping::IntelSandy(opts(geom));
            let ivy = Mapping::IntelIvyHaswell(opts(geom));
            for _ in 0..500 {
                let p = (step() & ls_mask(32 + extra)) & !7;
                for m in [&sandy, &ivy] {
                    let da = m.map(p);
                    assert!(!da.is_bad(), "{geom:?} {p:#x}");
                    assert_eq!(m.map_reverse(da), p, "{geom:?} {p:#x}");
                }
            }
        }
    }

    #[test]
    fn reverse_then_forward_over_all_geometries() {
        let mut x = 0xdead_beef_cafe_f00du64;
        let mut step = || {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            x
        };
        for geom in all_geoms() {
            let sandy = Mapping::IntelSandy(opts(geom));
            let ivy = Mapping::IntelIvyHaswell(opts(geom));
            for _ in 0..500 {
                let r = step();
                let da = DramAddr {
                    chan: (r & 1) as u8 & u8::from(geom.contains(IntelGeom::DUALCHAN)),
                    dimm: ((r >> 1) & 1) as u8 & u8::from(geom.contains(IntelGeom::DUALDIMM)),
                    rank: ((r >> 2) & 1) as u8 & u8::from(geom.contains(IntelGeom::DUALRANK)),
                    bank: ((r >> 3) & 7) as u8,
                    row: (r >> 16) as u16,
                    col: ((r >> 32) & 0x3ff) as u16,
                };
                for m in [&sandy, &ivy] {
                    assert_eq!(m.map(m.map_reverse(da)), da, "{geom:?} {da}");
                }
            }
        }
    }

    #[test]
    fn oversized_address_is_rejected() {
        let m = Mapping::IntelSandy(opts(IntelGeom::empty()));
        // 3 + 10 + 3 + 16 = 32 decoded bits.
        assert!(m.map(1 << 32).is_bad());
        assert!(!m.map((1 << 32) - 8).is_bad());
        let m = Mapping::IntelIvyHaswell(opts(IntelGeom::all()));
        assert!(!m.map((1 << 35) - 8).is_bad());
        assert!(m.map(1 << 35).is_bad());
    }

    #[test]
    fn pcihole() {
        let pcibase: PhysAddr = 0xc000_0000;
        let tom: PhysAddr = 0x1_0000_0000;
        assert_eq!(pcihole_remap(0xc000_1000, pcibase, tom), BAD_PHYS);
        assert_eq!(pcihole_remap(0x1_0000_1000, pcibase, tom), 0xc000_1000);
        assert_eq!(pcihole_remap(0xb000_0000, pcibase, tom), 0xb000_0000);
        assert_eq!(pcihole_remap_reverse(0xc000_1000, pcibase, tom), 0x1_0000_1000);
        assert_eq!(pcihole_remap_reverse(0xb000_0000, pcibase, tom), 0xb000_0000);
    }

    #[test]
    fn pcihole_round_trip_through_mapping() {
        let o = IntelOpts {
            geom: IntelGeom::DUALCHAN,
            pcibase: 0xc000_0000,
            mem_top: 0x1_0000_0000,
        };
        let m = Mapping::IntelSandy(o);
        assert!(m.map(0xc000_1000).is_bad());
        for p in [0x1_0000_1000u64, 0x4000_0040, 0x1_3fff_fff8] {
            let da = m.map(p);
            assert!(!da.is_bad());
            assert_eq!(m.map_reverse(da), p, "{p:#x}");
        }
    }

    #[test]
    fn sandy_twiddle_granularity() {
        let mask = |chan: u8, dimm: u8, rank: u8, bank: u8, row: u16, col: u16| DramAddr {
            chan,
            dimm,
            rank,
            bank,
            row,
            col,
        };
        let plain = Mapping::IntelSandy(opts(IntelGeom::empty()));
        assert_eq!(plain.twiddle_gran(mask(0, 0, 0, 0, 0, 1)), 8);
        assert_eq!(plain.twiddle_gran(mask(0, 0, 0, 0, 0, 8)), 64);
        assert_eq!(plain.twiddle_gran(mask(0, 0, 0, 1, 0, 0)), 1 << 13);
        assert_eq!(plain.twiddle_gran(mask(0, 0, 0, 0, 1, 0)), 1 << 16);
        assert_eq!(plain.twiddle_gran(mask(0, 0, 0, 0, 0, 0)), 0);

        let dual = Mapping::IntelSandy(opts(IntelGeom::DUALCHAN));
        // Column bits 0..2 sit below the channel bit, bit 3 above it.
        assert_eq!(dual.twiddle_gran(mask(0, 0, 0, 0, 0, 1)), 8);
        assert_eq!(dual.twiddle_gran(mask(1, 0, 0, 0, 0, 0)), 64);
        assert_eq!(dual.twiddle_gran(mask(0, 0, 0, 0, 0, 8)), 128);
        assert_eq!(dual.twiddle_gran(mask(0, 0, 0, 1, 0, 0)), 1 << 14);
        assert_eq!(dual.twiddle_gran(mask(0, 0, 0, 0, 1, 0)), 1 << 17);

        let full = Mapping::IntelSandy(opts(IntelGeom::all()));
        assert_eq!(full.twiddle_gran(mask(0, 0, 0, 1, 0, 0)), 1 << 14);
        assert_eq!(full.twiddle_gran(mask(0, 1, 0, 0, 0, 0)), 1 << 17);
        assert_eq!(full.twiddle_gran(mask(0, 0, 1, 0, 0, 0)), 1 << 18);
        assert_eq!(full.twiddle_gran(mask(0, 0, 0, 0, 1, 0)), 1 << 19);
    }

    #[test]
    fn ivyhaswell_twiddle_granularity() {
        let mask = |chan: u8, dimm: u8, rank: u8, bank: u8, row: u16, col: u16| DramAddr {
            chan,
            dimm,
            rank,
            bank,
            row,
            col,
        };
        let dual = Mapping::IntelIvyHaswell(opts(IntelGeom::DUALCHAN));
        // Column bits 0..3 sit below the channel bit at physical bit 7.
        assert_eq!(dual.twiddle_gran(mask(0, 0, 0, 0, 0, 1)), 8);
        assert_eq!(dual.twiddle_gran(mask(0, 0, 0, 0, 0, 8)), 64);
        assert_eq!(dual.twiddle_gran(mask(1, 0, 0, 0, 0, 0)), 128);
        assert_eq!(dual.twiddle_gran(mask(0, 0, 0, 0, 0, 16)), 256);
        assert_eq!(dual.twiddle_gran(mask(0, 0, 0, 1, 0, 0)), 1 << 14);
        // The high bank bit lands above dimm/rank selection.
        assert_eq!(dual.twiddle_gran(mask(0, 0, 0, 4, 0, 0)), 1 << 16);
        assert_eq!(dual.twiddle_gran(mask(0, 0, 0, 0, 1, 0)), 1 << 17);

        let full = Mapping::IntelIvyHaswell(opts(IntelGeom::all()));
        assert_eq!(full.twiddle_gran(mask(0, 0, 0, 1, 0, 0)), 1 << 14);
        assert_eq!(full.twiddle_gran(mask(0, 1, 0, 0, 0, 0)), 1 << 16);
        assert_eq!(full.twiddle_gran(mask(0, 0, 1, 0, 0, 0)), 1 << 17);
        assert_eq!(full.twiddle_gran(mask(0, 0, 0, 4, 0, 0)), 1 << 18);
        assert_eq!(full.twiddle_gran(mask(0, 0, 0, 0, 1, 0)), 1 << 19);
    }
}
