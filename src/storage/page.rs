// Fixed-size page with a slotted layout.
//
// Header (big-endian):
//   0..2    page type
//   2..10   LSN, reserved for write-ahead logging; opaque here
//   10..12  free-space pointer (start of the cell content area)
//   12..14  slot count
//   14..16  flags
//   16..20  next page in the owning chain (reserved area)
//   20..22  fragmented bytes inside the cell area (reserved area)
//   22..24  spare
//   24..    slot directory, 4 bytes per entry (cell offset, cell length),
//           growing upward; cell content grows downward from the page end.
//
// A slot with length 0 is a tombstone. Slot ids are directory positions
// and never shift; compaction only drops trailing tombstones.

use crate::common::{PageId, SlotId, INVALID_PAGE_ID};
use crate::error::{DbError, Result};

pub const PAGE_HEADER_SIZE: usize = 24;
pub const SLOT_SIZE: usize = 4;

const OFF_PAGE_TYPE: usize = 0;
const OFF_LSN: usize = 2;
const OFF_FREE_PTR: usize = 10;
const OFF_SLOT_COUNT: usize = 12;
const OFF_FLAGS: usize = 14;
const OFF_NEXT_PAGE: usize = 16;
const OFF_FRAGMENT: usize = 20;

/// Page type discriminants as stored on disk.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Free = 0,
    Meta = 1,
    Internal = 2,
    IndexInternal = 5,
    Overflow = 7,
    IndexLeaf = 10,
    Leaf = 13,
}

impl PageType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(PageType::Free),
            1 => Some(PageType::Meta),
            2 => Some(PageType::Internal),
            5 => Some(PageType::IndexInternal),
            7 => Some(PageType::Overflow),
            10 => Some(PageType::IndexLeaf),
            13 => Some(PageType::Leaf),
            _ => None,
        }
    }
}

/// An in-memory page image. Owned by a buffer-pool frame for its
/// residency; accessors keep all offset arithmetic in one place.
#[derive(Debug, Clone)]
pub struct Page {
    id: PageId,
    data: Vec<u8>,
}

impl Page {
    pub fn new(id: PageId, page_size: usize) -> Self {
        Self {
            id,
            data: vec![0u8; page_size],
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn get_u16(&self, offset: usize) -> u16 {
        u16::from_be_bytes(self.data[offset..offset + 2].try_into().unwrap())
    }

    fn set_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    pub fn page_type(&self) -> Option<PageType> {
        PageType::from_u16(self.get_u16(OFF_PAGE_TYPE))
    }

    pub fn set_page_type(&mut self, ptype: PageType) {
        self.set_u16(OFF_PAGE_TYPE, ptype as u16);
    }

    pub fn lsn(&self) -> u64 {
        u64::from_be_bytes(self.data[OFF_LSN..OFF_LSN + 8].try_into().unwrap())
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        self.data[OFF_LSN..OFF_LSN + 8].copy_from_slice(&lsn.to_be_bytes());
    }

    pub fn free_space_ptr(&self) -> usize {
        self.get_u16(OFF_FREE_PTR) as usize
    }

    fn set_free_space_ptr(&mut self, ptr: usize) {
        self.set_u16(OFF_FREE_PTR, ptr as u16);
    }

    pub fn slot_count(&self) -> usize {
        self.get_u16(OFF_SLOT_COUNT) as usize
    }

    fn set_slot_count(&mut self, count: usize) {
        self.set_u16(OFF_SLOT_COUNT, count as u16);
    }

    pub fn flags(&self) -> u16 {
        self.get_u16(OFF_FLAGS)
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.set_u16(OFF_FLAGS, flags);
    }

    pub fn next_page(&self) -> PageId {
        u32::from_be_bytes(self.data[OFF_NEXT_PAGE..OFF_NEXT_PAGE + 4].try_into().unwrap())
    }

    pub fn set_next_page(&mut self, next: PageId) {
        self.data[OFF_NEXT_PAGE..OFF_NEXT_PAGE + 4].copy_from_slice(&next.to_be_bytes());
    }

    /// Bytes lost to holes in the cell area (tombstoned cells, shrunk
    /// updates). Conservative until the next compaction.
    pub fn fragmented_bytes(&self) -> usize {
        self.get_u16(OFF_FRAGMENT) as usize
    }

    fn set_fragmented_bytes(&mut self, bytes: usize) {
        self.set_u16(OFF_FRAGMENT, bytes as u16);
    }

    fn add_fragment(&mut self, bytes: usize) {
        let total = self.fragmented_bytes() + bytes;
        self.set_fragmented_bytes(total);
    }

    /// Reset this page to an empty slotted page of the given type.
    pub fn init_slotted(&mut self, ptype: PageType) {
        let size = self.data.len();
        self.data[..PAGE_HEADER_SIZE].fill(0);
        self.set_page_type(ptype);
        self.set_free_space_ptr(size);
        self.set_slot_count(0);
        self.set_next_page(INVALID_PAGE_ID);
        self.set_fragmented_bytes(0);
    }

    fn slot_entry_offset(&self, slot: SlotId) -> usize {
        PAGE_HEADER_SIZE + slot as usize * SLOT_SIZE
    }

    /// Raw (offset, length) for a slot; `None` if out of range.
    /// Length 0 means tombstone.
    pub fn slot(&self, slot: SlotId) -> Option<(usize, usize)> {
        if (slot as usize) >= self.slot_count() {
            return None;
        }
        let off = self.slot_entry_offset(slot);
        let cell_off = u16::from_be_bytes(self.data[off..off + 2].try_into().unwrap()) as usize;
        let cell_len = u16::from_be_bytes(self.data[off + 2..off + 4].try_into().unwrap()) as usize;
        Some((cell_off, cell_len))
    }

    fn set_slot(&mut self, slot: SlotId, cell_off: usize, cell_len: usize) {
        let off = self.slot_entry_offset(slot);
        self.data[off..off + 2].copy_from_slice(&(cell_off as u16).to_be_bytes());
        self.data[off + 2..off + 4].copy_from_slice(&(cell_len as u16).to_be_bytes());
    }

    /// Contiguous free bytes between the slot directory and the cell area.
    pub fn contiguous_free(&self) -> usize {
        let dir_end = PAGE_HEADER_SIZE + self.slot_count() * SLOT_SIZE;
        self.free_space_ptr().saturating_sub(dir_end)
    }

    /// Contiguous plus fragmented free bytes; what compaction can recover.
    pub fn total_free(&self) -> usize {
        self.contiguous_free() + self.fragmented_bytes()
    }

    /// Whether a new cell of `len` bytes fits without compaction.
    pub fn can_insert(&self, len: usize) -> bool {
        self.contiguous_free() >= len + SLOT_SIZE
    }

    /// Whether a new cell of `len` bytes fits after compaction.
    pub fn could_insert_after_compaction(&self, len: usize) -> bool {
        self.total_free() >= len + SLOT_SIZE
    }

    /// Append a cell, returning its new slot id. The caller has already
    /// checked `can_insert` (compacting first if necessary).
    pub fn insert_cell(&mut self, bytes: &[u8]) -> Result<SlotId> {
        if !self.can_insert(bytes.len()) {
            return Err(DbError::Storage(format!(
                "page {}: no room for {}-byte cell",
                self.id,
                bytes.len()
            )));
        }
        let slot = self.slot_count() as SlotId;
        let cell_off = self.free_space_ptr() - bytes.len();
        self.data[cell_off..cell_off + bytes.len()].copy_from_slice(bytes);
        self.set_free_space_ptr(cell_off);
        self.set_slot_count(slot as usize + 1);
        self.set_slot(slot, cell_off, bytes.len());
        Ok(slot)
    }

    /// Cell contents; `None` for tombstones and out-of-range slots.
    pub fn cell(&self, slot: SlotId) -> Option<&[u8]> {
        match self.slot(slot) {
            Some((_, 0)) | None => None,
            Some((off, len)) => Some(&self.data[off..off + len]),
        }
    }

    /// Replace a cell's contents keeping its slot id.
    ///
    /// Shrinking rewrites in place and records the slack as
    /// fragmentation; growing moves the cell within the page (compacting
    /// first if that makes room). Errors if the page cannot hold the new
    /// image at all.
    pub fn replace_cell(&mut self, slot: SlotId, bytes: &[u8]) -> Result<()> {
        let (off, len) = self
            .slot(slot)
            .ok_or_else(|| DbError::Storage(format!("page {}: bad slot {}", self.id, slot)))?;
        if len == 0 {
            return Err(DbError::Storage(format!(
                "page {}: replace of tombstoned slot {}",
                self.id, slot
            )));
        }
        if bytes.len() <= len {
            self.data[off..off + bytes.len()].copy_from_slice(bytes);
            self.set_slot(slot, off, bytes.len());
            self.add_fragment(len - bytes.len());
            return Ok(());
        }
        // Needs relocation within the page.
        if self.contiguous_free() < bytes.len() {
            if self.fragmented_bytes() + len + self.contiguous_free() < bytes.len() {
                return Err(DbError::Storage(format!(
                    "page {}: cell grew past page capacity",
                    self.id
                )));
            }
            // Tombstone the old image first so compaction reclaims it too.
            self.set_slot(slot, off, 0);
            self.add_fragment(len);
            self.compact();
            // Compaction may have trimmed the directory past our slot;
            // revive it (intervening entries are tombstones already).
            if self.slot_count() <= slot as usize {
                self.set_slot_count(slot as usize + 1);
            }
            if self.contiguous_free() < bytes.len() {
                return Err(DbError::Storage(format!(
                    "page {}: cell grew past page capacity",
                    self.id
                )));
            }
            let cell_off = self.free_space_ptr() - bytes.len();
            self.data[cell_off..cell_off + bytes.len()].copy_from_slice(bytes);
            self.set_free_space_ptr(cell_off);
            self.set_slot(slot, cell_off, bytes.len());
            return Ok(());
        }
        let cell_off = self.free_space_ptr() - bytes.len();
        self.data[cell_off..cell_off + bytes.len()].copy_from_slice(bytes);
        self.set_free_space_ptr(cell_off);
        self.set_slot(slot, cell_off, bytes.len());
        self.add_fragment(len);
        Ok(())
    }

    /// Write a cell back into a tombstoned slot, keeping its id. Used by
    /// rollback to restore a deleted row under its original record id.
    pub fn revive_cell(&mut self, slot: SlotId, bytes: &[u8]) -> Result<()> {
        match self.slot(slot) {
            Some((_, 0)) => {}
            Some(_) => {
                return Err(DbError::Storage(format!(
                    "page {}: revive of live slot {}",
                    self.id, slot
                )))
            }
            None => {
                return Err(DbError::Storage(format!(
                    "page {}: bad slot {}",
                    self.id, slot
                )))
            }
        }
        if self.contiguous_free() < bytes.len() {
            self.compact();
            if self.slot_count() <= slot as usize {
                self.set_slot_count(slot as usize + 1);
            }
            if self.contiguous_free() < bytes.len() {
                return Err(DbError::Storage(format!(
                    "page {}: no room to restore slot {}",
                    self.id, slot
                )));
            }
        }
        let cell_off = self.free_space_ptr() - bytes.len();
        self.data[cell_off..cell_off + bytes.len()].copy_from_slice(bytes);
        self.set_free_space_ptr(cell_off);
        self.set_slot(slot, cell_off, bytes.len());
        Ok(())
    }

    /// Tombstone a slot. The slot id stays valid (and dead) until
    /// compaction drops trailing tombstones.
    pub fn delete_cell(&mut self, slot: SlotId) -> Result<()> {
        let (off, len) = self
            .slot(slot)
            .ok_or_else(|| DbError::Storage(format!("page {}: bad slot {}", self.id, slot)))?;
        if len == 0 {
            return Ok(());
        }
        self.set_slot(slot, off, 0);
        self.add_fragment(len);
        Ok(())
    }

    /// Rewrite all live cells contiguously at the page tail, reset the
    /// fragment counter, and drop trailing tombstones from the directory.
    pub fn compact(&mut self) {
        let size = self.data.len();
        let count = self.slot_count();
        let mut live: Vec<(SlotId, usize, usize)> = (0..count)
            .filter_map(|s| {
                let slot = s as SlotId;
                match self.slot(slot) {
                    Some((off, len)) if len > 0 => Some((slot, off, len)),
                    _ => None,
                }
            })
            .collect();
        // Pack from the tail, preserving relative cell order by offset.
        live.sort_by(|a, b| b.1.cmp(&a.1));
        let mut write_ptr = size;
        let mut scratch = vec![0u8; size];
        let mut moved: Vec<(SlotId, usize, usize)> = Vec::with_capacity(live.len());
        for (slot, off, len) in live {
            write_ptr -= len;
            scratch[write_ptr..write_ptr + len].copy_from_slice(&self.data[off..off + len]);
            moved.push((slot, write_ptr, len));
        }
        self.data[write_ptr..size].copy_from_slice(&scratch[write_ptr..size]);
        for (slot, off, len) in moved {
            self.set_slot(slot, off, len);
        }
        self.set_free_space_ptr(write_ptr);
        self.set_fragmented_bytes(0);
        // Trailing tombstones can go; interior ones keep slot ids stable.
        let mut count = self.slot_count();
        while count > 0 {
            match self.slot((count - 1) as SlotId) {
                Some((_, 0)) => count -= 1,
                _ => break,
            }
        }
        self.set_slot_count(count);
    }

    /// Slot ids of live (non-tombstone) cells in directory order.
    pub fn live_slots(&self) -> impl Iterator<Item = SlotId> + '_ {
        (0..self.slot_count() as u16).filter(|s| self.cell(*s).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_page() -> Page {
        let mut page = Page::new(5, 4096);
        page.init_slotted(PageType::Leaf);
        page
    }

    #[test]
    fn test_header_round_trip() {
        let mut page = leaf_page();
        page.set_lsn(0xDEADBEEF);
        page.set_next_page(42);
        assert_eq!(page.page_type(), Some(PageType::Leaf));
        assert_eq!(page.lsn(), 0xDEADBEEF);
        assert_eq!(page.next_page(), 42);
        assert_eq!(page.free_space_ptr(), 4096);
        assert_eq!(page.slot_count(), 0);
    }

    #[test]
    fn test_insert_and_read_cells() {
        let mut page = leaf_page();
        let a = page.insert_cell(b"alpha").unwrap();
        let b = page.insert_cell(b"beta").unwrap();
        assert_eq!(page.cell(a).unwrap(), b"alpha");
        assert_eq!(page.cell(b).unwrap(), b"beta");
        assert_eq!(page.slot_count(), 2);
        // Directory end never crosses the free-space pointer.
        assert!(PAGE_HEADER_SIZE + page.slot_count() * SLOT_SIZE <= page.free_space_ptr());
    }

    #[test]
    fn test_delete_leaves_tombstone() {
        let mut page = leaf_page();
        let a = page.insert_cell(b"alpha").unwrap();
        let b = page.insert_cell(b"beta").unwrap();
        page.delete_cell(a).unwrap();
        assert!(page.cell(a).is_none());
        assert_eq!(page.cell(b).unwrap(), b"beta");
        assert_eq!(page.slot_count(), 2);
        assert_eq!(page.fragmented_bytes(), 5);
    }

    #[test]
    fn test_compact_reclaims_and_preserves_slots() {
        let mut page = leaf_page();
        let a = page.insert_cell(b"alpha").unwrap();
        let b = page.insert_cell(b"beta").unwrap();
        let c = page.insert_cell(b"gamma").unwrap();
        page.delete_cell(b).unwrap();
        let free_before = page.contiguous_free();
        page.compact();
        assert_eq!(page.fragmented_bytes(), 0);
        assert!(page.contiguous_free() > free_before);
        // Interior tombstone slot survives, ids unchanged.
        assert_eq!(page.cell(a).unwrap(), b"alpha");
        assert!(page.cell(b).is_none());
        assert_eq!(page.cell(c).unwrap(), b"gamma");
        assert_eq!(page.slot_count(), 3);
    }

    #[test]
    fn test_compact_drops_trailing_tombstones() {
        let mut page = leaf_page();
        let _a = page.insert_cell(b"alpha").unwrap();
        let b = page.insert_cell(b"beta").unwrap();
        let c = page.insert_cell(b"gamma").unwrap();
        page.delete_cell(b).unwrap();
        page.delete_cell(c).unwrap();
        page.compact();
        assert_eq!(page.slot_count(), 1);
    }

    #[test]
    fn test_replace_in_place_and_grow() {
        let mut page = leaf_page();
        let a = page.insert_cell(b"a longer payload").unwrap();
        page.replace_cell(a, b"short").unwrap();
        assert_eq!(page.cell(a).unwrap(), b"short");
        assert!(page.fragmented_bytes() > 0);
        page.replace_cell(a, b"now much longer than before").unwrap();
        assert_eq!(page.cell(a).unwrap(), b"now much longer than before");
    }

    #[test]
    fn test_fill_page_until_full() {
        let mut page = leaf_page();
        let payload = [0u8; 64];
        let mut inserted = 0;
        while page.can_insert(payload.len()) {
            page.insert_cell(&payload).unwrap();
            inserted += 1;
        }
        assert!(inserted >= 50);
        assert!(page.insert_cell(&payload).is_err());
        // Every live cell sits inside [free_space_ptr, size).
        for slot in 0..page.slot_count() as u16 {
            let (off, len) = page.slot(slot).unwrap();
            assert!(off >= page.free_space_ptr());
            assert!(off + len <= page.size());
        }
    }

    #[test]
    fn test_grow_with_compaction_path() {
        let mut page = Page::new(1, 512);
        page.init_slotted(PageType::Leaf);
        // Fill the page almost entirely, then free most of it.
        let a = page.insert_cell(&[1u8; 150]).unwrap();
        let b = page.insert_cell(&[2u8; 150]).unwrap();
        let c = page.insert_cell(&[3u8; 150]).unwrap();
        page.delete_cell(a).unwrap();
        page.delete_cell(c).unwrap();
        // Growing b needs the fragmented space back.
        page.replace_cell(b, &[9u8; 300]).unwrap();
        assert_eq!(page.cell(b).unwrap(), &[9u8; 300][..]);
    }
}
