use serde::{Deserialize, Serialize};

use crate::errors::{DatabaseError, Result};

/// Size of a physical page payload in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Width of a stored value in bytes. Values are big-endian signed integers,
/// wide enough that a packed RID and a data value share the same cell type.
pub const RECORD_SIZE: usize = 16;

/// Index (zero-based) of the INDIRECTION column.
/// Base: RID of the latest tail. Tail: RID of the previous version.
pub const INDIR_COL: usize = 0;

/// Index of the RID column (the record's own identifier).
pub const RID_COL: usize = 1;

/// Index of the TIME column (millisecond wall-clock stamp).
pub const TIME_COL: usize = 2;

/// Index of the SCHEMA column (bitmap of ever-updated data columns).
pub const SCHEMA_COL: usize = 3;

/// Number of metadata columns. Data columns follow them physically.
pub const NUM_METADATA_COLS: usize = 4;

/// Sentinel schema encoding meaning "latest state lives in the base record".
/// Written by the merge; replaced by ordinary bits on the next update.
pub const SCHEMA_MERGED: i128 = -1;

/// Number of tail records that trigger a background merge.
pub const MERGE_UPDATE_THRESHOLD: usize = 256;

/// Base stripes consolidated per merge batch.
pub const MERGE_BATCH_SIZE: usize = 8;

/// UIDs reserved per trip to the counter file.
pub const UID_BATCH_SIZE: i64 = 10_000;

/// Default B+-tree node fanout (maximum keys per node).
pub const DEFAULT_FANOUT: usize = 32;

/// Which end of the recency queue loses a page when the pool is over
/// capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionPolicy {
    Lru,
    Mru,
}

/// Engine tuning knobs. One `Config` is shared by a database and all of its
/// tables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Page payload size in bytes.
    pub page_size: usize,

    /// Stored value width in bytes.
    pub record_size: usize,

    /// Maximum resident column pages per table. `None` disables eviction.
    pub max_buffer_pages: Option<usize>,

    pub eviction_policy: EvictionPolicy,

    /// Tail writes between background merges.
    pub merge_update_threshold: usize,

    /// Base stripes consolidated per merge batch.
    pub merge_batch_size: usize,

    /// UIDs reserved per counter-file write.
    pub uid_batch_size: i64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            page_size: PAGE_SIZE,
            record_size: RECORD_SIZE,
            max_buffer_pages: None,
            eviction_policy: EvictionPolicy::Lru,
            merge_update_threshold: MERGE_UPDATE_THRESHOLD,
            merge_batch_size: MERGE_BATCH_SIZE,
            uid_batch_size: UID_BATCH_SIZE,
        }
    }
}

impl Config {
    /// Check the knobs against the RID layout. The offset field is 12 bits,
    /// so a page may not span more than 4096 bytes; a cell must be wide
    /// enough to carry a packed RID and narrow enough to decode into `i128`.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.page_size > PAGE_SIZE {
            return Err(DatabaseError::Metadata(format!(
                "page_size must be in 1..={}, got {}",
                PAGE_SIZE, self.page_size
            )));
        }
        if !(13..=16).contains(&self.record_size) {
            return Err(DatabaseError::Metadata(format!(
                "record_size must be in 13..=16, got {}",
                self.record_size
            )));
        }
        if self.page_size % self.record_size != 0 {
            return Err(DatabaseError::Metadata(format!(
                "page_size {} is not a multiple of record_size {}",
                self.page_size, self.record_size
            )));
        }
        if self.merge_batch_size == 0 || self.merge_update_threshold == 0 {
            return Err(DatabaseError::Metadata(
                "merge_batch_size and merge_update_threshold must be nonzero".into(),
            ));
        }
        if self.uid_batch_size <= 0 {
            return Err(DatabaseError::Metadata(
                "uid_batch_size must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn records_per_page(&self) -> usize {
        self.page_size / self.record_size
    }
}
