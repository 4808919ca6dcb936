//! Durable lease backends.
//!
//! The lease store only ever talks to a [`LeaseBackend`]: load every row at
//! startup, upsert rows keyed by MAC, look one up, and flush. Backend calls
//! are blocking and are run off the async runtime by the caller.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{StorageConfig, StorageDriver};
use crate::error::{Error, Result};
use crate::lease::Lease;
use crate::packet::MacAddress;

/// Row-level persistence for leases.
pub trait LeaseBackend: Send + Sync + fmt::Debug {
    /// Every stored lease, in any order.
    fn load_all(&self) -> Result<Vec<Lease>>;

    /// Inserts or replaces the rows for the given leases' MACs.
    fn upsert(&self, leases: &[Lease]) -> Result<()>;

    fn get(&self, mac: &MacAddress) -> Result<Option<Lease>>;

    /// Makes every upserted row durable.
    fn flush(&self) -> Result<()>;
}

/// Opens the backend selected by the storage configuration.
pub fn open_backend(storage: &StorageConfig) -> Result<Arc<dyn LeaseBackend>> {
    match storage.driver {
        StorageDriver::Json => {
            info!("Using JSON lease file {}", storage.path);
            Ok(Arc::new(JsonFileBackend::open(&storage.path)?))
        }
        StorageDriver::Memory => {
            info!("Using in-memory lease table; leases will not survive a restart");
            Ok(Arc::new(MemoryBackend::default()))
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Leases held in process memory only.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    rows: Mutex<BTreeMap<MacAddress, Lease>>,
}

impl LeaseBackend for MemoryBackend {
    fn load_all(&self) -> Result<Vec<Lease>> {
        Ok(lock(&self.rows).values().cloned().collect())
    }

    fn upsert(&self, leases: &[Lease]) -> Result<()> {
        let mut rows = lock(&self.rows);
        for lease in leases {
            rows.insert(lease.mac_address, lease.clone());
        }
        Ok(())
    }

    fn get(&self, mac: &MacAddress) -> Result<Option<Lease>> {
        Ok(lock(&self.rows).get(mac).cloned())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// On-disk format of the lease file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LeaseFile {
    leases: Vec<Lease>,
}

#[derive(Debug, Default)]
struct JsonTable {
    rows: BTreeMap<MacAddress, Lease>,
    dirty: bool,
}

/// Leases kept in a pretty-printed JSON file, rewritten atomically
/// (temp file + rename) on flush.
#[derive(Debug)]
pub struct JsonFileBackend {
    path: PathBuf,
    table: Mutex<JsonTable>,
}

impl JsonFileBackend {
    /// Reads the file if it exists; a missing file is an empty table.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut rows = BTreeMap::new();

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let file: LeaseFile = serde_json::from_str(&content)?;
            for lease in file.leases {
                rows.insert(lease.mac_address, lease);
            }
        }

        Ok(Self {
            path,
            table: Mutex::new(JsonTable { rows, dirty: false }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LeaseBackend for JsonFileBackend {
    fn load_all(&self) -> Result<Vec<Lease>> {
        Ok(lock(&self.table).rows.values().cloned().collect())
    }

    fn upsert(&self, leases: &[Lease]) -> Result<()> {
        let mut table = lock(&self.table);
        for lease in leases {
            table.rows.insert(lease.mac_address, lease.clone());
        }
        table.dirty |= !leases.is_empty();
        Ok(())
    }

    fn get(&self, mac: &MacAddress) -> Result<Option<Lease>> {
        Ok(lock(&self.table).rows.get(mac).cloned())
    }

    fn flush(&self) -> Result<()> {
        let mut table = lock(&self.table);
        if !table.dirty {
            return Ok(());
        }

        let file = LeaseFile {
            leases: table.rows.values().cloned().collect(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, content).map_err(|error| {
            Error::Persistence(format!("failed to write {}: {}", tmp_path.display(), error))
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|error| {
            Error::Persistence(format!(
                "failed to replace {}: {}",
                self.path.display(),
                error
            ))
        })?;

        table.dirty = false;
        Ok(())
    }
}
