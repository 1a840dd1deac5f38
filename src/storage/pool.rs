//! Connection pool over one data directory.
//!
//! Each [`Storage`] owns a single SQLite connection. The pool hands out
//! storages under a semaphore so reads run side by side and writers only
//! meet inside SQLite, where `BEGIN IMMEDIATE` plus row versions decide who
//! wins. File-backed databases run in WAL mode so readers never wait on a
//! writer. An in-memory database lives and dies with its one connection,
//! so its pool holds exactly one.

use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

use super::{EventSink, Storage};
use crate::{Error, Result};

/// Connections a file-backed pool opens at most.
pub const DEFAULT_MAX_CONNECTIONS: usize = 8;

/// Bounded set of storages sharing one database and one set of sinks.
pub struct StoragePool {
    root: Option<PathBuf>,
    sinks: Vec<Arc<dyn EventSink>>,
    max_connections: usize,
    permits: Semaphore,
    idle: Mutex<Vec<Storage>>,
}

impl StoragePool {
    /// Seed a pool with an open storage. Further connections reopen its
    /// data directory and deliver events to the same sinks.
    pub fn new(storage: Storage, max_connections: usize) -> Self {
        let max_connections = match storage.root() {
            Some(_) => max_connections.max(1),
            None => 1,
        };
        Self {
            root: storage.root().map(PathBuf::from),
            sinks: storage.sinks.clone(),
            max_connections,
            permits: Semaphore::new(max_connections),
            idle: Mutex::new(vec![storage]),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Wait for a free slot and take an idle storage, opening one if none is left.
    pub async fn acquire(&self) -> Result<PooledStorage<'_>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Other("storage pool is closed".to_string()))?;
        let reused = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        let storage = match reused {
            Some(storage) => storage,
            None => self.open()?,
        };
        Ok(PooledStorage {
            pool: self,
            storage: Some(storage),
            _permit: permit,
        })
    }

    fn open(&self) -> Result<Storage> {
        let dir = self
            .root
            .as_deref()
            .ok_or_else(|| Error::Other("in-memory storage has a single connection".to_string()))?;
        let mut storage = Storage::open_in_dir(dir)?;
        storage.sinks = self.sinks.clone();
        debug!(dir = %dir.display(), "opened pooled connection");
        Ok(storage)
    }

    fn release(&self, storage: Storage) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(storage);
    }
}

/// A storage on loan from a [`StoragePool`]; returned when dropped.
pub struct PooledStorage<'pool> {
    pool: &'pool StoragePool,
    storage: Option<Storage>,
    _permit: SemaphorePermit<'pool>,
}

impl Deref for PooledStorage<'_> {
    type Target = Storage;

    fn deref(&self) -> &Storage {
        self.storage.as_ref().unwrap_or_else(|| unreachable!("storage taken before drop"))
    }
}

impl DerefMut for PooledStorage<'_> {
    fn deref_mut(&mut self) -> &mut Storage {
        self.storage.as_mut().unwrap_or_else(|| unreachable!("storage taken before drop"))
    }
}

impl Drop for PooledStorage<'_> {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            self.pool.release(storage);
        }
    }
}
