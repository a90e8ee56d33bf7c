//! # Cache Controller
//!
//! Two cache levels sit between the host and the shared memory: a local,
//! virtually indexed cache and an outer, physically indexed one. Data written
//! by the host travels local → outer → memory, data written by the remote side
//! travels the other way, which fixes the order of operations:
//!
//! * **clean**: local first (per populated page), then outer;
//! * **invalidate**: outer first, then local.

use crate::addresses::{PAGE_SIZE, PhysicalRange, VirtualRange};
use crate::host::HostMemory;
use crate::session::ProcessId;

/// Cache maintenance primitives of the host CPU.
pub trait CacheMaintenance {
    fn clean_local(&self, range: VirtualRange);
    fn invalidate_local(&self, range: VirtualRange);
    fn clean_outer(&self, range: PhysicalRange);
    fn invalidate_outer(&self, range: PhysicalRange);
}

/// A virtual range in a particular address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MappedRange {
    pub pid: ProcessId,
    pub range: VirtualRange,
}

/// Sequences cache maintenance over the mappings of one resource.
pub struct CacheController<'a, H, C> {
    host: &'a H,
    cache: &'a C,
}

impl<'a, H: HostMemory, C: CacheMaintenance> CacheController<'a, H, C> {
    pub const fn new(host: &'a H, cache: &'a C) -> Self {
        Self { host, cache }
    }

    /// Writes dirty lines of `ranges` back to memory.
    ///
    /// Returns the number of local pages cleaned.
    pub fn clean(&self, ranges: &[MappedRange], physical: PhysicalRange) -> usize {
        let pages = self.for_each_populated_page(ranges, |page| self.cache.clean_local(page));
        self.cache.clean_outer(physical);
        pages
    }

    /// Discards cached lines of `ranges` so the next access reads memory.
    ///
    /// Returns the number of local pages invalidated.
    pub fn invalidate(&self, ranges: &[MappedRange], physical: PhysicalRange) -> usize {
        self.cache.invalidate_outer(physical);
        self.for_each_populated_page(ranges, |page| self.cache.invalidate_local(page))
    }

    fn for_each_populated_page(
        &self,
        ranges: &[MappedRange],
        mut f: impl FnMut(VirtualRange),
    ) -> usize {
        let mut count = 0;
        for mapped in ranges {
            for page in mapped.range.pages() {
                if self.host.is_populated(mapped.pid, page) {
                    f(VirtualRange::new(page, PAGE_SIZE));
                    count += 1;
                }
            }
        }
        count
    }
}
