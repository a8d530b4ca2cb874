use std::collections::HashMap;

use crate::errors::{DatabaseError, Result};
use crate::page::Page;

/// One stripe: the column pages sharing a single `pages_id`, kept
/// row-aligned by a shared bytes-used offset. Individual columns may be
/// evicted to disk (their slot becomes `None`) and refilled later without
/// disturbing their siblings.
#[derive(Debug)]
pub struct PageEntry {
    pages: Vec<Option<Page>>,
    bytes: usize,
}

impl PageEntry {
    /// Fresh stripe with every column page allocated. Open stripes are
    /// created pinned so they cannot be evicted while records are still
    /// being appended.
    pub fn new(tcols: usize, page_size: usize, record_size: usize, pinned: bool) -> PageEntry {
        let pages = (0..tcols)
            .map(|_| {
                let mut page = Page::new(page_size, record_size);
                if pinned {
                    page.pin_count = 1;
                }
                Some(page)
            })
            .collect();

        PageEntry { pages, bytes: 0 }
    }

    /// Empty shell for a stripe whose pages live on disk.
    pub fn vacant(tcols: usize) -> PageEntry {
        PageEntry {
            pages: (0..tcols).map(|_| None).collect(),
            bytes: 0,
        }
    }

    pub fn has_capacity(&self, page_size: usize, record_size: usize) -> bool {
        self.bytes + record_size <= page_size
    }

    /// Write one value per column, keeping all pages at the same offset.
    /// Only valid on fully resident (open) stripes.
    pub fn write_vals(&mut self, vals: &[i128]) -> Result<usize> {
        debug_assert_eq!(vals.len(), self.pages.len());

        let mut offset = 0;
        for (page, value) in self.pages.iter_mut().zip(vals.iter()) {
            let page = page.as_mut().ok_or(DatabaseError::PageFull)?;
            offset = page.write(*value)?;
        }

        debug_assert_eq!(offset, self.bytes);
        self.bytes = self
            .pages
            .iter()
            .flatten()
            .next()
            .map(|p| p.bytes_used())
            .unwrap_or(self.bytes);
        Ok(offset)
    }

    pub fn page(&self, col: usize) -> Option<&Page> {
        self.pages.get(col).and_then(|slot| slot.as_ref())
    }

    pub fn page_mut(&mut self, col: usize) -> Option<&mut Page> {
        self.pages.get_mut(col).and_then(|slot| slot.as_mut())
    }

    /// Remove one column page (eviction hands it to the disk writer).
    pub fn take_page(&mut self, col: usize) -> Option<Page> {
        self.pages.get_mut(col).and_then(|slot| slot.take())
    }

    /// Refill one column slot from a page loaded off disk.
    pub fn put_page(&mut self, col: usize, page: Page) {
        self.bytes = self.bytes.max(page.bytes_used());
        self.pages[col] = Some(page);
    }

    /// True when every column has been evicted.
    pub fn is_vacant(&self) -> bool {
        self.pages.iter().all(|slot| slot.is_none())
    }

    pub fn resident_pages(&self) -> usize {
        self.pages.iter().flatten().count()
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes
    }

    pub fn num_cols(&self) -> usize {
        self.pages.len()
    }

    /// Pin or unpin every resident page. Used when a stripe opens or seals.
    pub fn set_pinned(&mut self, pinned: bool) {
        for page in self.pages.iter_mut().flatten() {
            page.pin_count = u32::from(pinned);
        }
    }
}

/// In-memory materialization layer: `pages_id -> PageEntry`.
#[derive(Debug)]
pub struct PageTable {
    entries: HashMap<u64, PageEntry>,
    tcols: usize,
}

impl PageTable {
    pub fn new(tcols: usize) -> PageTable {
        PageTable {
            entries: HashMap::new(),
            tcols,
        }
    }

    /// Allocate a fresh, pinned stripe under the given id.
    pub fn create_stripe(&mut self, pages_id: u64, page_size: usize, record_size: usize) {
        self.entries.insert(
            pages_id,
            PageEntry::new(self.tcols, page_size, record_size, true),
        );
    }

    pub fn get(&self, pages_id: u64) -> Option<&PageEntry> {
        self.entries.get(&pages_id)
    }

    pub fn get_mut(&mut self, pages_id: u64) -> Option<&mut PageEntry> {
        self.entries.get_mut(&pages_id)
    }

    /// Entry for a stripe being rematerialized from disk.
    pub fn ensure_entry(&mut self, pages_id: u64) -> &mut PageEntry {
        let tcols = self.tcols;
        self.entries
            .entry(pages_id)
            .or_insert_with(|| PageEntry::vacant(tcols))
    }

    pub fn remove(&mut self, pages_id: u64) -> Option<PageEntry> {
        self.entries.remove(&pages_id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&u64, &mut PageEntry)> {
        self.entries.iter_mut()
    }

    pub fn contains(&self, pages_id: u64) -> bool {
        self.entries.contains_key(&pages_id)
    }
}
