use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{DatabaseError, Result};

/// Bits reserved for the unique part of a record identifier.
pub const UID_BITS: u32 = 48;

/// Bits reserved for the stripe identifier.
pub const PAGES_ID_BITS: u32 = 36;

/// Bits reserved for the byte offset within a column page.
pub const OFFSET_BITS: u32 = 12;

const TOMBSTONE_SHIFT: u32 = 0;
const IS_BASE_SHIFT: u32 = 1;
const OFFSET_SHIFT: u32 = 2;
const PAGES_ID_SHIFT: u32 = OFFSET_SHIFT + OFFSET_BITS;
const UID_SHIFT: u32 = PAGES_ID_SHIFT + PAGES_ID_BITS;

const OFFSET_MASK: u128 = (1 << OFFSET_BITS) - 1;
const PAGES_ID_MASK: u128 = (1 << PAGES_ID_BITS) - 1;
const UID_MASK: u128 = (1 << UID_BITS) - 1;

/// A record identifier. Packs `(uid, pages_id, offset, is_base, tombstone)`
/// into one 128-bit integer, so a RID stored in a metadata column is its own
/// address: `pages_id` names the stripe and `offset` the byte position
/// inside each of the stripe's column pages.
///
/// The all-zero value is reserved as the null RID that terminates a tail
/// chain. No live RID encodes to zero: base RIDs carry the `is_base` bit and
/// tail RIDs live in odd-numbered stripes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rid(u128);

impl Rid {
    /// The chain terminator.
    pub const NULL: Rid = Rid(0);

    pub fn from_parts(
        uid: u64,
        pages_id: u64,
        offset: usize,
        is_base: bool,
        tombstone: bool,
    ) -> Rid {
        debug_assert!(u128::from(uid) <= UID_MASK);
        debug_assert!(u128::from(pages_id) <= PAGES_ID_MASK);
        debug_assert!(offset as u128 <= OFFSET_MASK);
        debug_assert_eq!(pages_id % 2 == 0, is_base, "stripe parity must encode kind");

        let mut raw = (u128::from(uid) & UID_MASK) << UID_SHIFT;
        raw |= (u128::from(pages_id) & PAGES_ID_MASK) << PAGES_ID_SHIFT;
        raw |= (offset as u128 & OFFSET_MASK) << OFFSET_SHIFT;
        raw |= u128::from(is_base) << IS_BASE_SHIFT;
        raw |= u128::from(tombstone) << TOMBSTONE_SHIFT;
        Rid(raw)
    }

    pub fn uid(self) -> u64 {
        ((self.0 >> UID_SHIFT) & UID_MASK) as u64
    }

    pub fn pages_id(self) -> u64 {
        ((self.0 >> PAGES_ID_SHIFT) & PAGES_ID_MASK) as u64
    }

    /// Byte offset of this record within each column page of its stripe.
    pub fn offset(self) -> usize {
        ((self.0 >> OFFSET_SHIFT) & OFFSET_MASK) as usize
    }

    pub fn is_base(self) -> bool {
        (self.0 >> IS_BASE_SHIFT) & 1 == 1
    }

    pub fn tombstone(self) -> bool {
        (self.0 >> TOMBSTONE_SHIFT) & 1 == 1
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// `(pages_id, offset)` location of the record.
    pub fn loc(self) -> (u64, usize) {
        (self.pages_id(), self.offset())
    }

    /// Copy of this RID with the tombstone bit set.
    pub fn with_tombstone(self) -> Rid {
        Rid(self.0 | 1 << TOMBSTONE_SHIFT)
    }

    /// The cell value written into pages. RIDs use at most 98 bits, so the
    /// value is always non-negative.
    pub fn as_value(self) -> i128 {
        self.0 as i128
    }

    pub fn from_value(value: i128) -> Rid {
        Rid(value as u128)
    }
}

impl fmt::Debug for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rid")
            .field("uid", &self.uid())
            .field("pages_id", &self.pages_id())
            .field("offset", &self.offset())
            .field("is_base", &self.is_base())
            .field("tombstone", &self.tombstone())
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct CounterFile {
    last_uid: i64,
}

/// Persistent monotone counter. Counts *down* from the top of its space and
/// reserves values in batches: the batch floor is written to disk before any
/// value from the batch is handed out, so a crash can never lead to reuse.
/// The next session simply burns whatever was left of the last batch.
///
/// The stripe-id counters step by 2 with a fixed starting parity, which is
/// how `pages_id` parity encodes base (even) versus tail (odd).
pub struct UidGenerator {
    name: String,
    path: PathBuf,
    batch: i64,
    step: i64,
    state: Mutex<GenState>,
}

struct GenState {
    /// Next value to hand out. May be below `reserved_floor`, in which case
    /// another batch must be reserved (and persisted) first.
    current: i64,

    /// Lowest value covered by the batch on disk.
    reserved_floor: i64,
}

impl UidGenerator {
    /// Counter for record UIDs: `{dir}/rid_gen.json`.
    pub fn rid(dir: &Path, batch: i64) -> Result<UidGenerator> {
        let start = (1i64 << UID_BITS) - 1;
        UidGenerator::new("rid", dir, start, 1, batch)
    }

    /// Counter for base stripe ids (even): `{dir}/base_pages_id_gen.json`.
    pub fn base_pages_id(dir: &Path, batch: i64) -> Result<UidGenerator> {
        let start = (1i64 << PAGES_ID_BITS) - 2;
        UidGenerator::new("base_pages_id", dir, start, 2, batch)
    }

    /// Counter for tail stripe ids (odd): `{dir}/tail_pages_id_gen.json`.
    pub fn tail_pages_id(dir: &Path, batch: i64) -> Result<UidGenerator> {
        let start = (1i64 << PAGES_ID_BITS) - 1;
        UidGenerator::new("tail_pages_id", dir, start, 2, batch)
    }

    fn new(name: &str, dir: &Path, start: i64, step: i64, batch: i64) -> Result<UidGenerator> {
        let path = dir.join(format!("{}_gen.json", name));

        let state = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let saved: CounterFile = serde_json::from_str(&contents)?;

            // Everything at or above the persisted floor may have been
            // issued by a previous session.
            GenState {
                current: saved.last_uid - step,
                reserved_floor: saved.last_uid,
            }
        } else {
            GenState {
                current: start,
                reserved_floor: start + step,
            }
        };

        Ok(UidGenerator {
            name: name.to_string(),
            path,
            batch,
            step,
            state: Mutex::new(state),
        })
    }

    /// Hand out the next identifier, reserving (and persisting) a fresh
    /// batch when the current one is exhausted.
    pub fn next(&self) -> Result<u64> {
        let mut st = self.state.lock().expect("uid generator mutex poisoned");

        if st.current < 0 {
            return Err(DatabaseError::CapacityExhausted(self.name.clone()));
        }

        if st.current < st.reserved_floor {
            let parity_floor = if self.step == 2 { st.current & 1 } else { 0 };
            let floor = (st.current - (self.batch - 1) * self.step).max(parity_floor);
            self.save(floor)?;
            st.reserved_floor = floor;
            debug!(name = %self.name, floor, "reserved uid batch");
        }

        let uid = st.current;
        st.current -= self.step;
        Ok(uid as u64)
    }

    /// Persist the exact position so a clean shutdown wastes no identifiers.
    pub fn save_position(&self) -> Result<()> {
        let st = self.state.lock().expect("uid generator mutex poisoned");
        self.save(st.current + self.step)
    }

    fn save(&self, floor: i64) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let contents = serde_json::to_string(&CounterFile { last_uid: floor })?;
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
