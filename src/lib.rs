//! DRAM address decoding for physical-memory experiments.
//!
//! Given a virtual-memory buffer, this library reveals the DRAM geometry
//! behind each byte — channel, DIMM, rank, bank, row and column — and
//! builds an index that can be queried in both directions.
//!
//! Three pieces fit together:
//!
//! - a decoding pipeline ([`MemorySystem`]): a controller [`Mapping`]
//!   (naive DDR3/DDR4, Intel Sandy Bridge, Intel Ivy Bridge/Haswell)
//!   composed with a chain of [`Remapping`]s (rank mirroring, RAS XOR),
//!   every stage invertible;
//! - a translation oracle ([`Translator`]): the kernel pagemap reader or a
//!   contiguity heuristic supplies virtual→physical translations;
//! - the indexer ([`BufferMap`]): PTE and DRAM-range tables answering
//!   point, nearest-same-level and range-iteration queries in O(log n).
//!
//! Pipelines are described by a small configuration language so
//! experiments can switch CPU variants and DRAM quirks without
//! recompiling:
//!
//! ```
//! use ramses::{BufMapFlags, BufferMap, HeuristicTranslator, MemorySystem};
//!
//! let msys = MemorySystem::load("map:naive:ddr3;remap:rankmirror:ddr3")?;
//! let mut buf = vec![0u8; 64 << 10];
//! let trans = HeuristicTranslator::new(12, 0x8000_0000);
//! let bm = BufferMap::build(&mut buf, &trans, &msys, BufMapFlags::NOCLOBBER)?;
//! for entry in bm.entries(Default::default(), bm.end_pos()).take(4) {
//!     println!("{:#x} -> {}", entry.virtp, entry.dramaddr);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod bits;

pub mod addr;
pub mod bufmap;
pub mod map;
pub mod msys;
pub mod remap;
pub mod search;
pub mod translate;

pub use addr::{BAD_PHYS, DramAddr, DramLevel, PhysAddr};
pub use bufmap::{AddrEntry, BmPos, BufMapFlags, BufferMap, BuildError, DramRange, Entries, Pte};
pub use map::{IntelGeom, IntelOpts, Mapping, MappingProps};
pub use msys::{MemorySystem, ParseError, ParseErrorKind};
pub use remap::Remapping;
pub use translate::{HeuristicTranslator, PagemapTranslator, TranslateError, Translator};
