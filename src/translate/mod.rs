//! Virtual→physical address translation oracles.

mod heuristic;
mod pagemap;

pub use heuristic::HeuristicTranslator;
pub use pagemap::PagemapTranslator;

use std::io;

use thiserror::Error;

use crate::addr::{BAD_PHYS, PhysAddr};

#[derive(Debug, Error)]
pub enum TranslateError {
    /// The page is present in the address space but not resident in memory.
    #[error("page is mapped but not resident")]
    NotResident,
    #[error("translation source read failed")]
    Io(#[from] io::Error),
}

/// Source of virtual→physical translations for a buffer.
pub trait Translator {
    /// log₂ of the translation granularity.
    fn page_shift(&self) -> u32;

    /// Translate a single virtual address.
    fn translate(&self, va: usize) -> Result<PhysAddr, TranslateError>;

    /// Translate `npages` consecutive pages starting at `va` (truncated to
    /// page alignment) into `out`. Unmapped pages are encoded as
    /// [`BAD_PHYS`]; fewer than `npages` results only on error.
    fn translate_range(
        &self,
        va: usize,
        npages: usize,
        out: &mut [PhysAddr],
    ) -> Result<usize, TranslateError> {
        let page_size = 1usize << self.page_shift();
        let va = va & !(page_size - 1);
        for (i, slot) in out.iter_mut().enumerate().take(npages) {
            *slot = match self.translate(va + i * page_size) {
                Ok(pa) => pa,
                Err(TranslateError::NotResident) => BAD_PHYS,
                Err(e) => return Err(e),
            };
        }
        Ok(npages)
    }

    /// Translation granularity in bytes.
    fn page_size(&self) -> usize {
        1usize << self.page_shift()
    }
}
