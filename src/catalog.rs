//! Table catalog
//!
//! Persistent list of table descriptors in `{data_dir}/catalog.bin`,
//! rewritten atomically on every schema change.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{CellarError, Result};
use crate::fsutil::{read_framed, write_framed};

const CATALOG_MAGIC: &[u8; 4] = b"CLCT";
const CATALOG_VERSION: u16 = 1;
const CATALOG_FILE: &str = "catalog.bin";

/// Schema and status of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    /// Column families, sorted and unique
    pub families: Vec<String>,
    pub created_at_ms: u64,
    pub enabled: bool,
}

impl TableDescriptor {
    /// Validate and normalize a new descriptor
    pub fn new(name: &str, families: &[&str]) -> Result<Self> {
        validate_name(name)?;
        if families.is_empty() {
            return Err(CellarError::InvalidArgument(format!(
                "table '{}' needs at least one column family",
                name
            )));
        }
        let mut families: Vec<String> = families.iter().map(|f| f.to_string()).collect();
        if let Some(bad) = families.iter().find(|f| f.is_empty() || f.contains('\0')) {
            return Err(CellarError::InvalidArgument(format!("invalid column family '{}'", bad)));
        }
        families.sort();
        families.dedup();

        let created_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Ok(Self {
            name: name.to_string(),
            families,
            created_at_ms,
            enabled: true,
        })
    }

    pub fn has_family(&self, family: &str) -> bool {
        self.families.binary_search_by(|f| f.as_str().cmp(family)).is_ok()
    }
}

/// Table names double as directory names
fn validate_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || name.len() > 255;
    if invalid {
        return Err(CellarError::InvalidArgument(format!("invalid table name '{}'", name)));
    }
    Ok(())
}

/// In-memory catalog mirrored to disk
#[derive(Debug)]
pub struct Catalog {
    path: PathBuf,
    tables: BTreeMap<String, TableDescriptor>,
}

impl Catalog {
    /// Load `catalog.bin` from `data_dir`, or start empty
    pub fn load_or_create(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CATALOG_FILE);
        let tables = match read_framed::<Vec<TableDescriptor>>(&path, CATALOG_MAGIC, CATALOG_VERSION)? {
            None => BTreeMap::new(),
            Some(Ok(list)) => list.into_iter().map(|d| (d.name.clone(), d)).collect(),
            Some(Err(e)) => {
                return Err(CellarError::CatalogCorruption(format!("{}: {}", path.display(), e)));
            }
        };
        Ok(Self { path, tables })
    }

    fn persist(&self) -> Result<()> {
        let list: Vec<&TableDescriptor> = self.tables.values().collect();
        write_framed(&self.path, CATALOG_MAGIC, CATALOG_VERSION, &list)
    }

    /// Add a descriptor and persist
    pub fn insert(&mut self, descriptor: TableDescriptor) -> Result<()> {
        if self.tables.contains_key(&descriptor.name) {
            return Err(CellarError::AlreadyExists(descriptor.name));
        }
        let name = descriptor.name.clone();
        self.tables.insert(name.clone(), descriptor);
        if let Err(e) = self.persist() {
            self.tables.remove(&name);
            return Err(e);
        }
        Ok(())
    }

    /// Remove a descriptor and persist
    pub fn remove(&mut self, name: &str) -> Result<TableDescriptor> {
        let removed = self
            .tables
            .remove(name)
            .ok_or_else(|| CellarError::NotFound(name.to_string()))?;
        if let Err(e) = self.persist() {
            self.tables.insert(name.to_string(), removed);
            return Err(e);
        }
        Ok(removed)
    }

    /// Flip the enabled flag and persist
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<()> {
        let descriptor = self
            .tables
            .get_mut(name)
            .ok_or_else(|| CellarError::NotFound(name.to_string()))?;
        if descriptor.enabled == enabled {
            return Ok(());
        }
        descriptor.enabled = enabled;
        if let Err(e) = self.persist() {
            if let Some(d) = self.tables.get_mut(name) {
                d.enabled = !enabled;
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Descriptors sorted by name
    pub fn list(&self) -> Vec<TableDescriptor> {
        self.tables.values().cloned().collect()
    }
}
