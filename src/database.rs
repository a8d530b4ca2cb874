use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{Config, NUM_METADATA_COLS};
use crate::disk::Disk;
use crate::errors::{DatabaseError, Result};
use crate::index::{IndexConfig, IndexKind};
use crate::rid::UidGenerator;
use crate::table::Table;

const METADATA_FILE: &str = "metadata.json";

#[derive(Serialize, Deserialize)]
struct TableMeta {
    num_columns: usize,
    key_index: usize,
    index_cols: Vec<usize>,
    index_kind: IndexKind,
    fanout: usize,
    delete_tracker: Vec<i64>,
    base_pages_ids: Vec<u64>,
    tail_pages_ids: Vec<u64>,
}

#[derive(Serialize, Deserialize)]
struct Metadata {
    page_size: usize,
    record_size: usize,
    tables: HashMap<String, TableMeta>,
}

/// Table registry plus the open/close lifecycle: directory layout,
/// `metadata.json`, the persistent UID generators, and index rebuild on
/// open.
pub struct Database {
    path: Option<PathBuf>,
    config: Arc<Config>,
    tables: HashMap<String, Arc<Table>>,

    rid_gen: Option<Arc<UidGenerator>>,
    base_id_gen: Option<Arc<UidGenerator>>,
    tail_id_gen: Option<Arc<UidGenerator>>,
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    pub fn new() -> Database {
        Database::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Database {
        Database {
            path: None,
            config: Arc::new(config),
            tables: HashMap::new(),
            rid_gen: None,
            base_id_gen: None,
            tail_id_gen: None,
        }
    }

    /// Open (or create) the database at `path` and restore any tables
    /// recorded in its metadata.
    pub fn open<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        self.config.validate()?;

        fs::create_dir_all(path.join("pages").join("temp"))?;

        let metadata = self.load_metadata(&path)?;
        if let Some(meta) = &metadata {
            // Page geometry is baked into every file on disk; the stored
            // values win over whatever this session was configured with.
            if meta.page_size != self.config.page_size
                || meta.record_size != self.config.record_size
            {
                warn!(
                    stored_page_size = meta.page_size,
                    stored_record_size = meta.record_size,
                    "config differs from stored geometry; using stored values"
                );
                let mut config = (*self.config).clone();
                config.page_size = meta.page_size;
                config.record_size = meta.record_size;
                self.config = Arc::new(config);
            }
        }

        let batch = self.config.uid_batch_size;
        self.rid_gen = Some(Arc::new(UidGenerator::rid(&path, batch)?));
        self.base_id_gen = Some(Arc::new(UidGenerator::base_pages_id(&path, batch)?));
        self.tail_id_gen = Some(Arc::new(UidGenerator::tail_pages_id(&path, batch)?));
        self.path = Some(path.clone());

        if let Some(meta) = metadata {
            for (name, table_meta) in meta.tables {
                self.restore_table(name, table_meta)?;
            }
        }

        info!(path = %path.display(), tables = self.tables.len(), "database open");
        Ok(())
    }

    /// Merge, flush, and persist everything, then drop the registry. The
    /// closing merge is what makes base records on disk carry latest
    /// values, so the next open can rebuild indexes from a base scan.
    pub fn close(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };

        for table in self.tables.values() {
            table.shutdown_merge();
            table.prepare_for_close();
            table.force_merge()?;
            table.flush()?;
        }

        self.save_metadata(&path)?;

        for gen in [&self.rid_gen, &self.base_id_gen, &self.tail_id_gen]
            .into_iter()
            .flatten()
        {
            gen.save_position()?;
        }

        info!(path = %path.display(), "database closed");
        self.tables.clear();
        self.path = None;
        self.rid_gen = None;
        self.base_id_gen = None;
        self.tail_id_gen = None;
        Ok(())
    }

    /// Create a new table. Fails if the name is taken or the database is
    /// not open.
    pub fn create_table(
        &mut self,
        name: &str,
        num_columns: usize,
        key_index: usize,
    ) -> Result<Arc<Table>> {
        self.create_table_with(name, num_columns, key_index, IndexConfig::default())
    }

    pub fn create_table_with(
        &mut self,
        name: &str,
        num_columns: usize,
        key_index: usize,
        index_config: IndexConfig,
    ) -> Result<Arc<Table>> {
        if self.tables.contains_key(name) {
            return Err(DatabaseError::Metadata(format!(
                "table '{}' already exists",
                name
            )));
        }

        let table = Arc::new(self.build_table(
            name.to_string(),
            num_columns,
            key_index,
            index_config,
            HashSet::new(),
        )?);
        self.tables.insert(name.to_string(), table.clone());
        Ok(table)
    }

    /// Remove a table and delete its page files.
    pub fn drop_table(&mut self, name: &str) -> Result<()> {
        let table = self
            .tables
            .remove(name)
            .ok_or_else(|| DatabaseError::Metadata(format!("table '{}' does not exist", name)))?;

        table.shutdown_merge();

        let Some(path) = &self.path else {
            return Ok(());
        };
        let disk = Disk::new(path, &self.config)?;
        let tcols = table.num_columns + NUM_METADATA_COLS;
        for pages_id in table
            .base_stripe_ids()
            .into_iter()
            .chain(table.tail_stripe_ids())
        {
            disk.remove_stripe(pages_id, tcols);
        }

        info!(table = name, "table dropped");
        Ok(())
    }

    pub fn get_table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.get(name).cloned()
    }

    // Helpers ------------------------

    fn build_table(
        &self,
        name: String,
        num_columns: usize,
        key_index: usize,
        index_config: IndexConfig,
        deleted: HashSet<i64>,
    ) -> Result<Table> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| DatabaseError::Metadata("database is not open".into()))?;

        let (Some(rid_gen), Some(base_id_gen), Some(tail_id_gen)) =
            (&self.rid_gen, &self.base_id_gen, &self.tail_id_gen)
        else {
            return Err(DatabaseError::Metadata("database is not open".into()));
        };

        Table::new(
            name,
            num_columns,
            key_index,
            path,
            self.config.clone(),
            index_config,
            rid_gen.clone(),
            base_id_gen.clone(),
            tail_id_gen.clone(),
            deleted,
        )
    }

    fn restore_table(&mut self, name: String, meta: TableMeta) -> Result<()> {
        let index_config = IndexConfig {
            kind: meta.index_kind,
            fanout: meta.fanout,
            index_columns: meta.index_cols.clone(),
        };

        let table = self.build_table(
            name.clone(),
            meta.num_columns,
            meta.key_index,
            index_config,
            meta.delete_tracker.iter().copied().collect(),
        )?;

        table.restore_stripes(meta.base_pages_ids, meta.tail_pages_ids);
        table.rebuild_indexes()?;

        self.tables.insert(name, Arc::new(table));
        Ok(())
    }

    fn load_metadata(&self, path: &Path) -> Result<Option<Metadata>> {
        let metadata_path = path.join(METADATA_FILE);
        if !metadata_path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(metadata_path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn save_metadata(&self, path: &Path) -> Result<()> {
        let tables = self
            .tables
            .iter()
            .map(|(name, table)| {
                let index_config = table.index_config();
                (
                    name.clone(),
                    TableMeta {
                        num_columns: table.num_columns,
                        key_index: table.key_column(),
                        index_cols: table.indexed_columns(),
                        index_kind: index_config.kind,
                        fanout: index_config.fanout,
                        delete_tracker: table.delete_tracker(),
                        base_pages_ids: table.base_stripe_ids(),
                        tail_pages_ids: table.tail_stripe_ids(),
                    },
                )
            })
            .collect();

        let metadata = Metadata {
            page_size: self.config.page_size,
            record_size: self.config.record_size,
            tables,
        };

        let metadata_path = path.join(METADATA_FILE);
        let tmp = metadata_path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string(&metadata)?)?;
        fs::rename(&tmp, metadata_path)?;
        Ok(())
    }
}
