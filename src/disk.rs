use std::fs;
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::config::{Config, INDIR_COL, NUM_METADATA_COLS, RID_COL};
use crate::errors::{DatabaseError, Result};
use crate::page::Page;
use crate::rid::Rid;

/// Persists individual column pages as files named by `(kind, pages_id,
/// col)` under `<db>/pages/`, with a staging twin under `<db>/pages/temp/`
/// for in-flight merges. Stateless apart from the paths, so handles are
/// cheap to clone per thread.
#[derive(Clone, Debug)]
pub struct Disk {
    pages_dir: PathBuf,
    temp_dir: PathBuf,
    page_size: usize,
    record_size: usize,
}

impl Disk {
    pub fn new(db_path: &Path, config: &Config) -> Result<Disk> {
        let pages_dir = db_path.join("pages");
        let temp_dir = pages_dir.join("temp");
        fs::create_dir_all(&temp_dir)?;

        Ok(Disk {
            pages_dir,
            temp_dir,
            page_size: config.page_size,
            record_size: config.record_size,
        })
    }

    fn file_name(pages_id: u64, col: usize) -> String {
        let kind = if pages_id % 2 == 0 { "base" } else { "tail" };
        format!("{}_{}_{}.bin", kind, pages_id, col)
    }

    fn page_path(&self, pages_id: u64, col: usize) -> PathBuf {
        self.pages_dir.join(Self::file_name(pages_id, col))
    }

    fn temp_path(&self, pages_id: u64, col: usize) -> PathBuf {
        self.temp_dir.join(Self::file_name(pages_id, col))
    }

    /// Read one column page back into memory. Fails with `NotFound` when the
    /// file does not exist (expected for stripes that were never spilled).
    pub fn get_page(&self, pages_id: u64, col: usize) -> Result<Page> {
        let path = self.page_path(pages_id, col);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DatabaseError::NotFound { pages_id, col });
            }
            Err(e) => return Err(e.into()),
        };

        trace!(pages_id, col, "page loaded from disk");
        Page::from_file_bytes(&bytes, self.page_size, self.record_size)
    }

    pub fn put_page(&self, page: &Page, pages_id: u64, col: usize) -> Result<()> {
        fs::write(self.page_path(pages_id, col), page.to_file_bytes())?;
        trace!(pages_id, col, "page written to disk");
        Ok(())
    }

    /// Write a merged page into the staging area.
    pub fn put_staged(&self, page: &Page, pages_id: u64, col: usize) -> Result<()> {
        fs::write(self.temp_path(pages_id, col), page.to_file_bytes())?;
        Ok(())
    }

    /// Read a page back out of the staging area (finalization patches
    /// staged pages for rows that moved mid-merge).
    pub fn get_staged(&self, pages_id: u64, col: usize) -> Result<Page> {
        let bytes = match fs::read(self.temp_path(pages_id, col)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DatabaseError::NotFound { pages_id, col });
            }
            Err(e) => return Err(e.into()),
        };
        Page::from_file_bytes(&bytes, self.page_size, self.record_size)
    }

    /// Atomically move a staged page over the live one.
    pub fn promote_staged(&self, pages_id: u64, col: usize) -> Result<()> {
        fs::rename(self.temp_path(pages_id, col), self.page_path(pages_id, col))?;
        Ok(())
    }

    pub fn page_exists(&self, pages_id: u64, col: usize) -> bool {
        self.page_path(pages_id, col).exists()
    }

    /// Delete every column file of a stripe. Missing files are fine.
    pub fn remove_stripe(&self, pages_id: u64, tcols: usize) {
        for col in 0..tcols {
            let _ = fs::remove_file(self.page_path(pages_id, col));
        }
    }

    /// Stream `(rid, indir, projected data values)` for every record in the
    /// given base stripes, straight off disk. The indirection cell is always
    /// included so callers can skip tombstoned rows. Stripes with no RID
    /// page on disk are skipped.
    pub fn scan_base_records(&self, pages_ids: Vec<u64>, index_cols: Vec<usize>) -> BaseScan<'_> {
        BaseScan {
            disk: self,
            stripes: pages_ids,
            index_cols,
            next_stripe: 0,
            current: None,
            row: 0,
        }
    }
}

/// One record yielded by [`Disk::scan_base_records`].
#[derive(Debug)]
pub struct ScannedBase {
    pub rid: Rid,
    pub indir: Rid,
    /// Data values for the requested columns, in request order.
    pub values: Vec<i64>,
}

struct LoadedStripe {
    rid_page: Page,
    indir_page: Page,
    col_pages: Vec<Page>,
    rows: usize,
}

/// Iterator over base records on disk; the Rust rendering of a generator.
pub struct BaseScan<'a> {
    disk: &'a Disk,
    stripes: Vec<u64>,
    index_cols: Vec<usize>,
    next_stripe: usize,
    current: Option<LoadedStripe>,
    row: usize,
}

impl BaseScan<'_> {
    fn load_next_stripe(&mut self) -> Result<bool> {
        while self.next_stripe < self.stripes.len() {
            let pages_id = self.stripes[self.next_stripe];
            self.next_stripe += 1;
            debug_assert_eq!(pages_id % 2, 0);

            let rid_page = match self.disk.get_page(pages_id, RID_COL) {
                Ok(page) => page,
                Err(DatabaseError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            let indir_page = self.disk.get_page(pages_id, INDIR_COL)?;

            let mut col_pages = Vec::with_capacity(self.index_cols.len());
            for &col in &self.index_cols {
                col_pages.push(self.disk.get_page(pages_id, NUM_METADATA_COLS + col)?);
            }

            let rows = rid_page.num_records();
            self.current = Some(LoadedStripe {
                rid_page,
                indir_page,
                col_pages,
                rows,
            });
            self.row = 0;
            return Ok(true);
        }

        Ok(false)
    }
}

impl Iterator for BaseScan<'_> {
    type Item = Result<ScannedBase>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let need_stripe = match &self.current {
                Some(stripe) => self.row >= stripe.rows,
                None => true,
            };

            if need_stripe {
                match self.load_next_stripe() {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(e) => return Some(Err(e)),
                }
            }

            let stripe = self.current.as_ref()?;
            if stripe.rows == 0 {
                self.current = None;
                continue;
            }

            let offset = self.row * self.disk.record_size;
            self.row += 1;

            let rid = Rid::from_value(stripe.rid_page.read(offset));
            let indir = Rid::from_value(stripe.indir_page.read(offset));
            let values = stripe
                .col_pages
                .iter()
                .map(|page| page.read(offset) as i64)
                .collect();

            return Some(Ok(ScannedBase { rid, indir, values }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RECORD_SIZE, SCHEMA_COL, TIME_COL};

    fn disk() -> (tempfile::TempDir, Disk) {
        let dir = tempfile::tempdir().unwrap();
        let disk = Disk::new(dir.path(), &Config::default()).unwrap();
        (dir, disk)
    }

    #[test]
    fn missing_page_is_not_found() {
        let (_dir, disk) = disk();
        assert!(matches!(
            disk.get_page(2, 0),
            Err(DatabaseError::NotFound { pages_id: 2, col: 0 })
        ));
    }

    #[test]
    fn page_round_trips_through_files() {
        let (_dir, disk) = disk();
        let cfg = Config::default();

        let mut page = Page::new(cfg.page_size, cfg.record_size);
        page.write(11).unwrap();
        page.write(-22).unwrap();

        disk.put_page(&page, 4, 1).unwrap();
        let loaded = disk.get_page(4, 1).unwrap();
        assert_eq!(loaded.read(0), 11);
        assert_eq!(loaded.read(RECORD_SIZE), -22);
        assert_eq!(loaded.num_records(), 2);
    }

    #[test]
    fn staged_pages_promote_over_live() {
        let (_dir, disk) = disk();
        let cfg = Config::default();

        let mut live = Page::new(cfg.page_size, cfg.record_size);
        live.write(1).unwrap();
        disk.put_page(&live, 6, 0).unwrap();

        let mut staged = Page::new(cfg.page_size, cfg.record_size);
        staged.write(2).unwrap();
        disk.put_staged(&staged, 6, 0).unwrap();
        disk.promote_staged(6, 0).unwrap();

        assert_eq!(disk.get_page(6, 0).unwrap().read(0), 2);
    }

    #[test]
    fn scan_streams_base_records() {
        let (_dir, disk) = disk();
        let cfg = Config::default();
        let tcols = NUM_METADATA_COLS + 2;

        // Two base stripes of two records each, columns laid out by hand.
        for (pages_id, start) in [(0u64, 0i128), (2u64, 100i128)] {
            let mut pages: Vec<Page> = (0..tcols)
                .map(|_| Page::new(cfg.page_size, cfg.record_size))
                .collect();

            for row in 0..2 {
                let rid = Rid::from_parts(
                    1000 + start as u64 + row as u64,
                    pages_id,
                    row * cfg.record_size,
                    true,
                    false,
                );
                pages[INDIR_COL].write(rid.as_value()).unwrap();
                pages[RID_COL].write(rid.as_value()).unwrap();
                pages[TIME_COL].write(0).unwrap();
                pages[SCHEMA_COL].write(0).unwrap();
                pages[NUM_METADATA_COLS].write(start + row as i128).unwrap();
                pages[NUM_METADATA_COLS + 1]
                    .write(10 * (start + row as i128))
                    .unwrap();
            }

            for (col, page) in pages.iter().enumerate() {
                disk.put_page(page, pages_id, col).unwrap();
            }
        }

        let scanned: Vec<ScannedBase> = disk
            .scan_base_records(vec![0, 2], vec![0, 1])
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(scanned.len(), 4);
        assert_eq!(scanned[0].values, vec![0, 0]);
        assert_eq!(scanned[1].values, vec![1, 10]);
        assert_eq!(scanned[2].values, vec![100, 1000]);
        assert_eq!(scanned[3].values, vec![101, 1010]);
        assert!(scanned.iter().all(|s| s.rid.is_base()));
    }

    #[test]
    fn scan_skips_unflushed_stripes() {
        let (_dir, disk) = disk();
        let records: Vec<_> = disk
            .scan_base_records(vec![8, 10], vec![0])
            .collect();
        assert!(records.is_empty());
    }
}
