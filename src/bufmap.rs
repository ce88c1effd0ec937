//! The buffer-to-DRAM index.
//!
//! A [`BufferMap`] ties a virtual-memory buffer to the DRAM geometry behind
//! it: a PTE table sorted by physical address and a table of maximal DRAM
//! ranges sorted in DRAM order. Together they answer "what DRAM address is
//! byte X" and "which byte is DRAM address Y" in logarithmic time.

use core::cmp::Ordering;

use bitflags::bitflags;
use log::{debug, warn};
use thiserror::Error;
use zerocopy::FromBytes;

use crate::addr::{BAD_PHYS, DramAddr, DramLevel, PhysAddr};
use crate::map::MappingProps;
use crate::msys::MemorySystem;
use crate::search::{bisect_idx, bisect_slice_by};
use crate::translate::{TranslateError, Translator};

bitflags! {
    /// Construction switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufMapFlags: u32 {
        /// Do not use the buffer as scratch space.
        const NOCLOBBER = 1;
        /// Zero the buffer after scratch use.
        const ZEROFILL = 2;
    }
}

/// One page of the buffer: virtual address and the physical frame behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte {
    pub va: usize,
    pub pa: PhysAddr,
}

/// A maximal run of buffer entries contiguous in DRAM: same bank,
/// consecutive columns, wrapping into the next row as needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DramRange {
    pub start: DramAddr,
    pub entry_cnt: usize,
}

/// Position of an entry in a [`BufferMap`]: range index and entry index
/// within the range. End-of-buffer is `(range_cnt, 0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct BmPos {
    pub ri: usize,
    pub ei: usize,
}

/// Virtual↔DRAM pairing of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrEntry {
    pub virtp: usize,
    pub dramaddr: DramAddr,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("cannot index an empty buffer")]
    EmptyBuffer,
    #[error("bulk translation returned {got} of {expected} pages")]
    ShortTranslation { expected: usize, got: usize },
    #[error(transparent)]
    Translate(#[from] TranslateError),
}

/// Index between a virtual buffer and the DRAM address space.
#[derive(Debug)]
pub struct BufferMap<'m> {
    bufbase: usize,
    ptes: Vec<Pte>,
    ranges: Vec<DramRange>,
    page_size: usize,
    entry_len: usize,
    msys: &'m MemorySystem,
}

/// Byte distance between two same-bank DRAM addresses in row/column space.
fn rc_diff(a: DramAddr, b: DramAddr, props: &MappingProps) -> i64 {
    ((i64::from(a.row) - i64::from(b.row)) * i64::from(props.col_cnt)
        + (i64::from(a.col) - i64::from(b.col)))
        * i64::from(props.cell_size)
}

impl<'m> BufferMap<'m> {
    /// Build the index for `buf`.
    ///
    /// Unless [`BufMapFlags::NOCLOBBER`] is set the buffer doubles as
    /// scratch space for the intermediate translation and resolution
    /// arrays whenever they fit strictly inside it (pass
    /// [`BufMapFlags::ZEROFILL`] to clear the leftovers); the contents are
    /// otherwise untouched. Construction is all-or-nothing.
    pub fn build<T: Translator + ?Sized>(
        buf: &mut [u8],
        trans: &T,
        msys: &'m MemorySystem,
        flags: BufMapFlags,
    ) -> Result<Self, BuildError> {
        let len = buf.len();
        if len == 0 {
            return Err(BuildError::EmptyBuffer);
        }
        let page_size = trans.page_size();
        let pte_cnt = len.div_ceil(page_size);
        let entry_len = msys.granularity(page_size);
        debug_assert!(entry_len > 0 && page_size % entry_len == 0);
        let bufbase = buf.as_ptr() as usize;
        let buf_base = bufbase & !(page_size - 1);
        let clobber = !flags.contains(BufMapFlags::NOCLOBBER);

        // Translate every page, in bulk when the buffer can hold the
        // physical-address array.
        let mut ptes: Vec<Pte> = Vec::with_capacity(pte_cnt);
        let mut translated = false;
        if clobber && pte_cnt * size_of::<PhysAddr>() < len {
            if let Ok((pas, _)) = <[PhysAddr]>::mut_from_prefix_with_elems(&mut *buf, pte_cnt) {
                let got = trans.translate_range(buf_base, pte_cnt, pas)?;
                if got != pte_cnt {
                    return Err(BuildError::ShortTranslation { expected: pte_cnt, got });
                }
                ptes.extend(
                    pas.iter()
                        .enumerate()
                        .map(|(i, &pa)| Pte { va: buf_base + i * page_size, pa }),
                );
                translated = true;
            }
        }
        if !translated {
            for i in 0..pte_cnt {
                let va = buf_base + i * page_size;
                let pa = match trans.translate(va) {
                    Ok(pa) => pa,
                    Err(TranslateError::NotResident) => {
                        warn!("page at {va:#x} not resident, recording as unmapped");
                        BAD_PHYS
                    }
                    Err(e) => return Err(e.into()),
                };
                ptes.push(Pte { va, pa });
            }
        }
        ptes.sort_unstable_by_key(|p| p.pa);

        // Resolve every entry to DRAM, sort into DRAM order, coalesce.
        let per_page = page_size / entry_len;
        let ecnt = pte_cnt * per_page;
        let props = msys.mapping().props();
        let ranges = {
            let mut heap: Vec<DramAddr> = Vec::new();
            let das: &mut [DramAddr] = if clobber && ecnt * size_of::<DramAddr>() < len {
                match <[DramAddr]>::mut_from_prefix_with_elems(&mut *buf, ecnt) {
                    Ok((scratch, _)) => scratch,
                    Err(_) => {
                        heap = vec![DramAddr::default(); ecnt];
                        &mut heap
                    }
                }
            } else {
                heap = vec![DramAddr::default(); ecnt];
                &mut heap
            };
            let mut idx = 0;
            for pte in &ptes {
                for k in 0..per_page {
                    das[idx] = if pte.pa == BAD_PHYS {
                        DramAddr::BAD
                    } else {
                        msys.resolve(pte.pa + (k * entry_len) as u64)
                    };
                    idx += 1;
                }
            }
            das.sort_unstable();

            let mut ranges = vec![DramRange { start: das[0], entry_cnt: 1 }];
            let mut last = das[0];
            for &cur in &das[1..] {
                if last.same(DramLevel::Bank, cur)
                    && rc_diff(cur, last, &props) == entry_len as i64
                {
                    let top = ranges.len() - 1;
                    ranges[top].entry_cnt += 1;
                } else {
                    ranges.push(DramRange { start: cur, entry_cnt: 1 });
                }
                last = cur;
            }
            ranges
        };

        if flags.contains(BufMapFlags::ZEROFILL) && clobber {
            buf.fill(0);
        }

        debug!(
            "indexed {pte_cnt} pages into {} ranges ({ecnt} entries of {entry_len} bytes)",
            ranges.len()
        );
        Ok(Self { bufbase, ptes, ranges, page_size, entry_len, msys })
    }

    pub fn bufbase(&self) -> usize {
        self.bufbase
    }

    pub fn ptes(&self) -> &[Pte] {
        &self.ptes
    }

    pub fn ranges(&self) -> &[DramRange] {
        &self.ranges
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Largest memory size contiguous in both physical and DRAM space.
    pub fn entry_len(&self) -> usize {
        self.entry_len
    }

    pub fn msys(&self) -> &'m MemorySystem {
        self.msys
    }

    /// Length of one DRAM row in bytes.
    pub fn row_len(&self) -> usize {
        self.msys.mapping().props().row_len()
    }

    pub fn entries_per_row(&self) -> usize {
        self.row_len() / self.entry_len
    }

    /// The past-the-end position.
    pub fn end_pos(&self) -> BmPos {
        BmPos { ri: self.ranges.len(), ei: 0 }
    }

    /// DRAM address of the entry at `pos`, [`DramAddr::BAD`] when out of
    /// bounds. Pure arithmetic on the range's geometric shape.
    pub fn addr(&self, pos: BmPos) -> DramAddr {
        let Some(range) = self.ranges.get(pos.ri) else {
            return DramAddr::BAD;
        };
        if pos.ei >= range.entry_cnt {
            return DramAddr::BAD;
        }
        let props = self.msys.mapping().props();
        let cell_off = pos.ei * self.entry_len / props.cell_size as usize;
        let cells = range.start.col as usize + cell_off;
        let mut da = range.start;
        da.row = da.row.wrapping_add((cells / props.col_cnt as usize) as u16);
        da.col = (cells % props.col_cnt as usize) as u16;
        da
    }

    /// Step one entry forward, wrapping into the next range.
    pub fn next_pos(&self, p: BmPos) -> BmPos {
        if p.ri >= self.ranges.len() {
            self.end_pos()
        } else if p.ei + 1 >= self.ranges[p.ri].entry_cnt {
            BmPos { ri: p.ri + 1, ei: 0 }
        } else {
            BmPos { ri: p.ri, ei: p.ei + 1 }
        }
    }

    /// Step one entry backward; saturates at the origin.
    pub fn prev_pos(&self, p: BmPos) -> BmPos {
        if p.ei > 0 {
            BmPos { ri: p.ri, ei: p.ei - 1 }
        } else if p.ri > 0 {
            BmPos { ri: p.ri - 1, ei: self.ranges[p.ri - 1].entry_cnt - 1 }
        } else {
            BmPos { ri: 0, ei: 0 }
        }
    }

    /// Position of the first entry past `p` that differs from it at
    /// `level` — the next row, bank, rank, DIMM or channel boundary.
    /// Row advances are geometric within ranges; coarser levels skip whole
    /// ranges (one range never spans banks).
    pub fn next(&self, p: BmPos, level: DramLevel) -> BmPos {
        let ida = self.addr(p);
        if ida.is_bad() {
            return p;
        }
        let props = self.msys.mapping().props();
        let mut colents =
            (props.col_cnt as usize - ida.col as usize) * props.cell_size as usize
                / self.entry_len;
        let mut ri = p.ri;
        let mut ei = p.ei;
        let mut da = ida;
        while !da.is_bad() && ida.same(level, da) {
            if level == DramLevel::Row {
                let rements = self.ranges[ri].entry_cnt - ei;
                if rements > colents {
                    debug_assert!(colents > 0);
                    ei += colents;
                    colents = 0;
                } else {
                    colents -= rements;
                    ri += 1;
                    ei = 0;
                }
            } else {
                ri += 1;
                ei = 0;
            }
            da = self.addr(BmPos { ri, ei });
        }
        BmPos { ri, ei }
    }

    /// Number of entries in `[start, end)`.
    pub fn entry_cnt_between(&self, start: BmPos, end: BmPos) -> usize {
        let mut ret = 0;
        let mut ri = start.ri;
        let mut ei = start.ei;
        while ri < self.ranges.len() && ri < end.ri {
            ret += self.ranges[ri].entry_cnt - ei;
            ri += 1;
            ei = 0;
        }
        if ri < self.ranges.len() {
            ret += end.ei.saturating_sub(ei);
        }
        ret
    }

    /// Locate the entry holding DRAM address `addr`.
    ///
    /// A needle whose column falls inside an entry's span counts as that
    /// entry; lookups never match across ranges.
    pub fn find(&self, addr: DramAddr) -> Option<BmPos> {
        let (found, ri) = bisect_slice_by(&self.ranges, |r| addr.cmp(&r.start));
        if found {
            return Some(BmPos { ri, ei: 0 });
        }
        let cell_size = self.msys.mapping().props().cell_size as usize;
        let (found, ei) = bisect_idx(self.ranges[ri].entry_cnt, |ei| {
            let estart = self.addr(BmPos { ri, ei });
            let ord = addr.cmp(&estart);
            if ord == Ordering::Greater
                && addr.same(DramLevel::Row, estart)
                && (addr.col - estart.col) as usize * cell_size < self.entry_len
            {
                return Ordering::Equal;
            }
            ord
        });
        found.then_some(BmPos { ri, ei })
    }

    /// Locate any entry on the same DRAM unit as `addr` at `level`.
    pub fn find_same(&self, addr: DramAddr, level: DramLevel) -> Option<BmPos> {
        let same_first = |e: DramAddr| {
            if addr.same(level, e) { Ordering::Equal } else { addr.cmp(&e) }
        };
        let (found, ri) =
            bisect_idx(self.ranges.len(), |ri| same_first(self.addr(BmPos { ri, ei: 0 })));
        if found {
            return Some(BmPos { ri, ei: 0 });
        }
        // A row can start in the middle of a range; anything coarser is
        // decided at range granularity.
        if level != DramLevel::Row {
            return None;
        }
        let (found, ei) = bisect_idx(self.ranges[ri].entry_cnt, |ei| {
            same_first(self.addr(BmPos { ri, ei }))
        });
        found.then_some(BmPos { ri, ei })
    }

    /// Index of the PTE covering physical address `pa`.
    pub fn find_pte(&self, pa: PhysAddr) -> Option<usize> {
        let frame = pa - pa % self.page_size as u64;
        let (found, pos) = bisect_slice_by(&self.ptes, |p| frame.cmp(&p.pa));
        found.then_some(pos)
    }

    /// Virtual↔DRAM pairing of the entry at `pos`.
    pub fn entry(&self, pos: BmPos) -> Option<AddrEntry> {
        let da = self.addr(pos);
        if da.is_bad() {
            return None;
        }
        let pa = self.msys.resolve_reverse(da);
        let pte = self.find_pte(pa).map(|i| self.ptes[i])?;
        debug_assert!(pa >= pte.pa && pa - pte.pa < self.page_size as u64);
        Some(AddrEntry {
            virtp: pte.va + (pa % self.page_size as u64) as usize,
            dramaddr: da,
        })
    }

    /// Iterate entries from `start` up to (not including) `end`, stopping
    /// early at the first unmapped entry.
    pub fn entries(&self, start: BmPos, end: BmPos) -> Entries<'_, 'm> {
        Entries { bm: self, pos: start, end }
    }
}

/// Iterator over [`AddrEntry`]s of a [`BufferMap`].
#[derive(Debug, Clone)]
pub struct Entries<'a, 'm> {
    bm: &'a BufferMap<'m>,
    pos: BmPos,
    end: BmPos,
}

impl Iterator for Entries<'_, '_> {
    type Item = AddrEntry;

    fn next(&mut self) -> Option<AddrEntry> {
        if self.pos >= self.end {
            return None;
        }
        let entry = self.bm.entry(self.pos)?;
        self.pos = self.bm.next_pos(self.pos);
        Some(entry)
    }
}
