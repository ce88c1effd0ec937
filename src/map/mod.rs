//! Memory-controller mappings: the decoding function physical → DRAM.
//!
//! Each variant is a pure, invertible bit permutation. The variant set is
//! closed, so dispatch is a plain enum match; per-variant controller
//! options ride along as payloads.

mod intel;
mod naive;

pub use intel::{IntelGeom, IntelOpts};

use crate::addr::{DramAddr, PhysAddr};

pub(crate) const MW_BITS: u32 = 3;
pub(crate) const COL_BITS: u32 = 10;

/// Static geometry of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingProps {
    /// Controller addressing grain: the physical stride used to derive the
    /// entry length of a buffer index.
    pub granularity: PhysAddr,
    pub bank_cnt: u32,
    pub col_cnt: u32,
    pub cell_size: u32,
}

impl MappingProps {
    /// Length of one DRAM row in bytes.
    pub fn row_len(&self) -> usize {
        self.col_cnt as usize * self.cell_size as usize
    }
}

/// A memory-controller decoding function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mapping {
    NaiveDdr3,
    NaiveDdr4,
    IntelSandy(IntelOpts),
    IntelIvyHaswell(IntelOpts),
}

impl Mapping {
    /// Decode a physical address. Addresses outside the declared geometry
    /// (or inside the PCI hole) yield [`DramAddr::BAD`].
    pub fn map(&self, addr: PhysAddr) -> DramAddr {
        match self {
            Self::NaiveDdr3 => naive::map(addr, 3),
            Self::NaiveDdr4 => naive::map(addr, 4),
            Self::IntelSandy(o) => intel::map_sandy(addr, o),
            Self::IntelIvyHaswell(o) => intel::map_ivyhaswell(addr, o),
        }
    }

    /// Rebuild the physical address of a reachable DRAM address.
    pub fn map_reverse(&self, addr: DramAddr) -> PhysAddr {
        match self {
            Self::NaiveDdr3 => naive::map_reverse(addr, 3),
            Self::NaiveDdr4 => naive::map_reverse(addr, 4),
            Self::IntelSandy(o) => intel::map_reverse_sandy(addr, o),
            Self::IntelIvyHaswell(o) => intel::map_reverse_ivyhaswell(addr, o),
        }
    }

    /// Smallest physical stride at which any output bit named by `mask` can
    /// change, or 0 for an empty mask.
    pub fn twiddle_gran(&self, mask: DramAddr) -> u64 {
        match self {
            Self::NaiveDdr3 => naive::twiddle_gran(mask, 3),
            Self::NaiveDdr4 => naive::twiddle_gran(mask, 4),
            Self::IntelSandy(o) => intel::twiddle_gran_sandy(mask, o),
            Self::IntelIvyHaswell(o) => intel::twiddle_gran_ivyhaswell(mask, o),
        }
    }

    pub fn props(&self) -> MappingProps {
        match self {
            Self::NaiveDdr3 => naive::props(3),
            Self::NaiveDdr4 => naive::props(4),
            Self::IntelSandy(o) => intel::props_sandy(o),
            Self::IntelIvyHaswell(o) => intel::props_ivyhaswell(o),
        }
    }
}
