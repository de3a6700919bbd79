/// Physical Page Allocator - "The Shared Pages"
///
/// Hands out page-aligned, physically contiguous regions that both the host
/// and the LWK can address. Queues and boot-parameter blocks live here.

use super::{PageAllocator, TransportError};
use crate::types::{PhysAddr, PAGE_SIZE};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

/// Allocated region descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRegion {
    pub address: u64,
    pub pages: usize,
}

/// Recently freed regions, bucketed by page count for quick reuse
struct PagePool {
    by_pages: HashMap<usize, Vec<u64>>,
}

impl PagePool {
    const MAX_PER_BUCKET: usize = 64;

    fn new() -> Self {
        Self {
            by_pages: HashMap::new(),
        }
    }

    fn allocate(&mut self, pages: usize) -> Option<u64> {
        self.by_pages.get_mut(&pages).and_then(|v| v.pop())
    }

    fn free(&mut self, address: u64, pages: usize) -> bool {
        let bucket = self.by_pages.entry(pages).or_default();
        if bucket.len() < Self::MAX_PER_BUCKET {
            bucket.push(address);
            true
        } else {
            false
        }
    }
}

/// Bump allocator over a fixed window with a reuse pool
pub struct PhysPageAllocator {
    regions: RwLock<HashMap<u64, PageRegion>>,
    next_address: Mutex<u64>,
    base_address: u64,
    limit: u64,
    pool: Mutex<PagePool>,
}

impl PhysPageAllocator {
    /// Manage `window` bytes starting at `base_address`
    pub fn new(base_address: u64, window: u64) -> Self {
        log::info!(
            "Initializing page allocator at 0x{:x} ({} KiB)",
            base_address,
            window >> 10
        );

        Self {
            regions: RwLock::new(HashMap::new()),
            next_address: Mutex::new(base_address),
            base_address,
            limit: base_address + window,
            pool: Mutex::new(PagePool::new()),
        }
    }

    pub fn base(&self) -> u64 {
        self.base_address
    }

    pub fn region(&self, address: PhysAddr) -> Option<PageRegion> {
        self.regions.read().get(&address.0).copied()
    }

    /// Total allocated memory in bytes
    pub fn total_allocated(&self) -> usize {
        self.regions
            .read()
            .values()
            .map(|r| r.pages * PAGE_SIZE)
            .sum()
    }

    pub fn allocation_count(&self) -> usize {
        self.regions.read().len()
    }
}

impl PageAllocator for PhysPageAllocator {
    fn alloc_pages(&self, count: usize) -> Result<PhysAddr, TransportError> {
        if count == 0 {
            return Err(TransportError::Failed("zero-page allocation".into()));
        }

        let address = if let Some(pooled) = self.pool.lock().allocate(count) {
            log::trace!("Reusing pooled pages at 0x{:x}", pooled);
            pooled
        } else {
            let mut next = self.next_address.lock();
            let bytes = (count * PAGE_SIZE) as u64;
            if *next + bytes > self.limit {
                return Err(TransportError::OutOfMemory(count));
            }
            let address = *next;
            *next += bytes;
            address
        };

        self.regions.write().insert(
            address,
            PageRegion {
                address,
                pages: count,
            },
        );
        log::debug!("Allocated {} pages at 0x{:x}", count, address);

        Ok(PhysAddr(address))
    }

    fn free_pages(&self, addr: PhysAddr, count: usize) {
        let removed = self.regions.write().remove(&addr.0);
        match removed {
            Some(region) => {
                if region.pages != count {
                    log::warn!(
                        "Freeing 0x{:x} with {} pages, allocated with {}",
                        addr.0,
                        count,
                        region.pages
                    );
                }
                if !self.pool.lock().free(addr.0, region.pages) {
                    log::trace!("Pool bucket full, dropping 0x{:x}", addr.0);
                }
                log::debug!("Freed {} pages at 0x{:x}", region.pages, addr.0);
            }
            None => log::warn!("Attempted to free invalid address: 0x{:x}", addr.0),
        }
    }
}

impl Default for PhysPageAllocator {
    fn default() -> Self {
        // Shared window just below the LWK memory
        Self::new(0x1000_0000, 256 << 20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_page_aligned_and_disjoint() {
        let alloc = PhysPageAllocator::default();
        let a = alloc.alloc_pages(4).unwrap();
        let b = alloc.alloc_pages(1).unwrap();
        assert_eq!(a.0 % PAGE_SIZE as u64, 0);
        assert!(b.0 >= a.0 + 4 * PAGE_SIZE as u64);
        assert_eq!(alloc.total_allocated(), 5 * PAGE_SIZE);
    }

    #[test]
    fn freed_pages_are_reused() {
        let alloc = PhysPageAllocator::default();
        let a = alloc.alloc_pages(2).unwrap();
        alloc.free_pages(a, 2);
        assert_eq!(alloc.allocation_count(), 0);
        let b = alloc.alloc_pages(2).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn window_exhaustion() {
        let alloc = PhysPageAllocator::new(0x10000, 2 * PAGE_SIZE as u64);
        alloc.alloc_pages(2).unwrap();
        assert_eq!(alloc.alloc_pages(1), Err(TransportError::OutOfMemory(1)));
    }
}
