// Free-space map and extent allocation.
//
// The map is advisory: it may overstate a page's free bytes between
// compactions, so callers revalidate after pinning. It exists to place
// new rows without walking a table's whole page chain.

use crate::common::PageId;
use crate::error::Result;
use crate::storage::disk::DiskManager;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Aggregate free-space statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct SpaceStats {
    /// (total free − largest contiguous extent) / total free, in [0, 1].
    pub fragmentation: f64,
    /// Number of contiguous page runs with tracked free space.
    pub extent_count: usize,
    /// Sum of tracked free bytes.
    pub free_bytes_total: u64,
}

pub struct SpaceManager {
    disk: Arc<DiskManager>,
    free_map: RwLock<HashMap<PageId, u16>>,
}

impl SpaceManager {
    pub fn new(disk: Arc<DiskManager>) -> Self {
        Self {
            disk,
            free_map: RwLock::new(HashMap::new()),
        }
    }

    /// Record (or update) a page's free-byte count.
    pub fn mark(&self, page_id: PageId, free_bytes: usize) {
        self.free_map
            .write()
            .insert(page_id, free_bytes.min(u16::MAX as usize) as u16);
    }

    /// Drop a page from the map (deallocated or no longer tracked).
    pub fn forget(&self, page_id: PageId) {
        self.free_map.write().remove(&page_id);
    }

    /// Tracked free bytes for one page, if known.
    pub fn free_bytes(&self, page_id: PageId) -> Option<usize> {
        self.free_map.read().get(&page_id).map(|&b| b as usize)
    }

    /// Best-fit page with at least `bytes` free, per the advisory map.
    /// The caller must revalidate against the pinned page.
    pub fn find_page_with_free(&self, bytes: usize) -> Option<PageId> {
        let map = self.free_map.read();
        map.iter()
            .filter(|(_, &free)| free as usize >= bytes)
            .min_by_key(|(_, &free)| free)
            .map(|(&id, _)| id)
    }

    /// Allocate `n` pages, preferring a contiguous run. File extension
    /// naturally yields consecutive ids; free-list reuse may not, in
    /// which case the result is the best contiguous prefix plus a tail.
    pub fn allocate_extent(&self, n: usize) -> Result<Vec<PageId>> {
        let mut pages = Vec::with_capacity(n);
        for _ in 0..n {
            pages.push(self.disk.allocate_page()?);
        }
        pages.sort_unstable();
        Ok(pages)
    }

    pub fn stats(&self) -> SpaceStats {
        let map = self.free_map.read();
        if map.is_empty() {
            return SpaceStats {
                fragmentation: 0.0,
                extent_count: 0,
                free_bytes_total: 0,
            };
        }
        let mut ids: Vec<PageId> = map.keys().copied().collect();
        ids.sort_unstable();
        let mut extent_count = 0usize;
        let mut largest_extent = 0u64;
        let mut current_extent = 0u64;
        let mut total = 0u64;
        let mut prev: Option<PageId> = None;
        for id in ids {
            let free = map[&id] as u64;
            total += free;
            match prev {
                Some(p) if id == p + 1 => current_extent += free,
                _ => {
                    extent_count += 1;
                    current_extent = free;
                }
            }
            largest_extent = largest_extent.max(current_extent);
            prev = Some(id);
        }
        let fragmentation = if total == 0 {
            0.0
        } else {
            ((total - largest_extent) as f64 / total as f64).clamp(0.0, 1.0)
        };
        SpaceStats {
            fragmentation,
            extent_count,
            free_bytes_total: total,
        }
    }
}
