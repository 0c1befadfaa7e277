//! Store Module
//!
//! The embedding handle: table catalog, open tables and the maintenance
//! worker. Dropping the store stops the worker and syncs every WAL.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::catalog::{Catalog, TableDescriptor};
use crate::config::Config;
use crate::error::{CellarError, Result};
use crate::maintenance::{MaintenanceWorker, TableRegistry};
use crate::query::{RowScanner, Scan};
use crate::table::Table;

/// Handle to a CellarDB data directory
pub struct Store {
    config: Config,
    tables_dir: PathBuf,
    /// Serializes schema changes
    catalog: Mutex<Catalog>,
    tables: TableRegistry,
    worker: Option<MaintenanceWorker>,
}

impl Store {
    const TABLES_DIR: &'static str = "tables";

    /// Open or create a store
    ///
    /// On startup:
    /// 1. Load the catalog
    /// 2. Remove table directories the catalog does not know
    /// 3. Open every table (WAL replay happens per table)
    /// 4. Start the maintenance worker if enabled
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let tables_dir = config.data_dir.join(Self::TABLES_DIR);
        fs::create_dir_all(&tables_dir)?;

        let catalog = Catalog::load_or_create(&config.data_dir)?;
        let tables: TableRegistry = Arc::new(RwLock::new(HashMap::new()));

        let worker = if config.background_maintenance {
            Some(MaintenanceWorker::start(
                Arc::clone(&tables),
                config.compaction.clone(),
                config.wal_sync_strategy.max_unsynced_age(),
            )?)
        } else {
            None
        };
        let sender = worker.as_ref().map(|w| w.sender());

        // Leftovers of an interrupted create or delete
        for entry in fs::read_dir(&tables_dir)? {
            let path = entry?.path();
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
            if let Some(name) = name {
                if path.is_dir() && !catalog.contains(&name) {
                    warn!(table = %name, "Removing table directory missing from catalog");
                    fs::remove_dir_all(&path)?;
                }
            }
        }

        {
            let mut open = tables.write();
            for descriptor in catalog.list() {
                let dir = tables_dir.join(&descriptor.name);
                let table = Table::open(&descriptor, &dir, &config, sender.clone())?;
                open.insert(descriptor.name.clone(), Arc::new(table));
            }
        }

        info!(
            data_dir = %config.data_dir.display(),
            tables = tables.read().len(),
            background = config.background_maintenance,
            "Store opened"
        );

        Ok(Self {
            config,
            tables_dir,
            catalog: Mutex::new(catalog),
            tables,
            worker,
        })
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified data directory
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(Config::builder().data_dir(path).build())
    }

    // =========================================================================
    // Table Management
    // =========================================================================

    /// Create a table with the given column families
    pub fn create_table(&self, name: &str, families: &[&str]) -> Result<Arc<Table>> {
        let descriptor = TableDescriptor::new(name, families)?;
        let mut catalog = self.catalog.lock();
        if catalog.contains(name) {
            return Err(CellarError::AlreadyExists(name.to_string()));
        }

        let dir = self.table_dir(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        let sender = self.worker.as_ref().map(|w| w.sender());
        let table = Arc::new(Table::open(&descriptor, &dir, &self.config, sender)?);

        if let Err(e) = catalog.insert(descriptor.clone()) {
            drop(table);
            let _ = fs::remove_dir_all(&dir);
            return Err(e);
        }
        self.tables.write().insert(name.to_string(), Arc::clone(&table));

        info!(table = name, families = ?descriptor.families, "Table created");
        Ok(table)
    }

    /// Delete a table and all of its data
    ///
    /// Buffered writes are discarded; in-flight flushes and compactions are
    /// waited for (compactions are aborted).
    pub fn delete_table(&self, name: &str) -> Result<()> {
        let mut catalog = self.catalog.lock();
        if !catalog.contains(name) {
            return Err(CellarError::NotFound(name.to_string()));
        }

        let table = self.tables.write().remove(name);
        if let Some(table) = &table {
            table.begin_delete();
        }
        catalog.remove(name)?;
        drop(table);

        let dir = self.table_dir(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        info!(table = name, "Table deleted");
        Ok(())
    }

    /// Whether the catalog holds `name`
    pub fn table_exists(&self, name: &str) -> bool {
        self.catalog.lock().contains(name)
    }

    /// Flush and take a table offline
    pub fn disable_table(&self, name: &str) -> Result<()> {
        let table = self.table(name)?;
        let mut catalog = self.catalog.lock();
        if catalog.get(name).map(|d| !d.enabled).unwrap_or(false) {
            return Ok(());
        }
        table.flush()?;
        catalog.set_enabled(name, false)?;
        table.set_enabled(false)?;
        info!(table = name, "Table disabled");
        Ok(())
    }

    /// Bring a disabled table back online
    pub fn enable_table(&self, name: &str) -> Result<()> {
        let table = self.table(name)?;
        let mut catalog = self.catalog.lock();
        catalog.set_enabled(name, true)?;
        table.set_enabled(true)?;
        info!(table = name, "Table enabled");
        Ok(())
    }

    /// Descriptors of every table, sorted by name
    pub fn list_tables(&self) -> Vec<TableDescriptor> {
        self.catalog.lock().list()
    }

    pub fn describe_table(&self, name: &str) -> Result<TableDescriptor> {
        self.catalog
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| CellarError::NotFound(name.to_string()))
    }

    /// Handle to an open table
    pub fn table(&self, name: &str) -> Result<Arc<Table>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CellarError::NotFound(name.to_string()))
    }

    // =========================================================================
    // Data Operations
    // =========================================================================

    pub fn put(&self, table: &str, row: &[u8], family: &str, qualifier: &[u8], value: &[u8]) -> Result<()> {
        self.table(table)?.put(row, family, qualifier, value)
    }

    pub fn delete(&self, table: &str, row: &[u8], family: &str, qualifier: &[u8]) -> Result<()> {
        self.table(table)?.delete(row, family, qualifier)
    }

    /// Delete every column of a row; returns how many were visible
    pub fn delete_row(&self, table: &str, row: &[u8]) -> Result<usize> {
        self.table(table)?.delete_row(row)
    }

    /// `Ok(None)` when the column has no visible value
    pub fn get(&self, table: &str, row: &[u8], family: &str, qualifier: &[u8]) -> Result<Option<Vec<u8>>> {
        self.table(table)?.get(row, family, qualifier)
    }

    /// Scan rows in `[start, end)`; an empty `end` means unbounded
    pub fn scan(&self, table: &str, start: &[u8], end: &[u8]) -> Result<RowScanner> {
        self.table(table)?.scan(Scan::range(start, end))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stop background work and sync every WAL
    pub fn close(mut self) -> Result<()> {
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }
        for table in self.tables.read().values() {
            table.sync_wal()?;
        }
        info!(data_dir = %self.config.data_dir.display(), "Store closed");
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    fn table_dir(&self, name: &str) -> PathBuf {
        self.tables_dir.join(name)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }
        for table in self.tables.read().values() {
            if let Err(e) = table.sync_wal() {
                warn!(table = table.name(), error = %e, "Failed to sync WAL on drop");
            }
        }
    }
}
