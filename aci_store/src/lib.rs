//! The snapshot store: a single-file, transactional key/value store holding one collection run
//!
//! Keys and values are both strings: keys are `<prefix>:<distinguished name>` (or a bare prefix
//! for count records, or `meta`), values are the JSON text of the record. The store is backed by
//! [`redb`], which gives atomic, durable commits and serializes concurrent write transactions
//! internally, so a [`SnapshotStore`] can be shared behind an `Arc` by any number of writers.
//!
//! Writes only happen through [`SnapshotStore::transact`]. Every write made inside the closure
//! is committed together when it returns `Ok`, and none of them are applied when it returns
//! `Err`.

use std::{
    fmt::Debug,
    io,
    path::{Path, PathBuf},
};

use redb::{Database, ReadableTableMetadata, Table, TableDefinition};
use tracing::{debug, info, warn};

const SNAPSHOT_TABLE: TableDefinition<'_, &str, &str> = TableDefinition::new("snapshot");

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("snapshot store at {} is unavailable: {source}", path.display())]
    StoreUnavailable {
        path: PathBuf,
        #[source]
        source: redb::DatabaseError,
    },

    #[error("failed to remove stale snapshot store at {}: {source}", path.display())]
    RemoveStale {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("snapshot store transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),

    #[error("snapshot store table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("snapshot store storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("snapshot store commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("snapshot store compaction error: {0}")]
    Compaction(#[from] redb::CompactionError),
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Handle to an open snapshot store file
pub struct SnapshotStore {
    db: Database,
    path: PathBuf,
}

impl Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SnapshotStore {
    /// Open the store at `path`, creating it if it does not exist
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = Database::create(&path).map_err(|source| Error::StoreUnavailable {
            path: path.clone(),
            source,
        })?;

        // create the table up front so that reads against an empty store see an empty table
        let txn = db.begin_write()?;
        let _ = txn.open_table(SNAPSHOT_TABLE)?;
        txn.commit()?;

        debug!(path = %path.display(), "opened snapshot store");
        Ok(Self { db, path })
    }

    /// Open an empty store at `path`, removing whatever was left there by a previous run
    pub fn create_fresh(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::remove_file(path) {
            Ok(()) => info!(path = %path.display(), "removed stale snapshot store"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(Error::RemoveStale {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
        Self::open(path)
    }

    /// Path of the underlying store file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` inside a single write transaction
    ///
    /// The transaction commits if `f` returns `Ok` and is rolled back if it returns `Err`. Calls
    /// from different threads are serialized: a caller blocks until the store is free, so this
    /// should not be called directly from an async task.
    pub fn transact<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut SnapshotTxn<'_>) -> Result<T, E>,
        E: From<Error>,
    {
        let txn = self.db.begin_write().map_err(Error::from)?;
        let out = {
            let table = txn.open_table(SNAPSHOT_TABLE).map_err(Error::from)?;
            let mut view = SnapshotTxn { table, written: 0 };
            f(&mut view)
        };
        match out {
            Ok(v) => {
                txn.commit().map_err(Error::from)?;
                Ok(v)
            }
            Err(e) => {
                if let Err(abort_err) = txn.abort() {
                    warn!(error = %abort_err, "failed to abort snapshot store transaction");
                }
                Err(e)
            }
        }
    }

    /// Get the value stored under `key`
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SNAPSHOT_TABLE)?;
        Ok(table.get(key)?.map(|v| v.value().to_owned()))
    }

    /// All entries whose key starts with `prefix`, in key order
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SNAPSHOT_TABLE)?;
        let mut entries = Vec::new();
        for entry in table.range::<&str>(prefix..)? {
            let (k, v) = entry?;
            let k = k.value();
            if !k.starts_with(prefix) {
                break;
            }
            entries.push((k.to_owned(), v.value().to_owned()));
        }
        Ok(entries)
    }

    /// All entries in the store, in key order
    pub fn entries(&self) -> Result<Vec<(String, String)>> {
        self.scan_prefix("")
    }

    /// All keys in the store, in key order
    pub fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries()?.into_iter().map(|(k, _)| k).collect())
    }

    pub fn len(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SNAPSHOT_TABLE)?;
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Reclaim space left behind by committed transactions
    ///
    /// Returns `true` if the file was compacted.
    pub fn compact(&mut self) -> Result<bool> {
        let compacted = self.db.compact()?;
        debug!(path = %self.path.display(), compacted, "compacted snapshot store");
        Ok(compacted)
    }

    /// Release the store file
    ///
    /// Every commit is already durable, so there is nothing left to flush.
    pub fn close(self) {
        debug!(path = %self.path.display(), "closed snapshot store");
    }
}

/// Mutable view of the store inside a [`SnapshotStore::transact`] call
pub struct SnapshotTxn<'t> {
    table: Table<'t, &'static str, &'static str>,
    written: usize,
}

impl Debug for SnapshotTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotTxn")
            .field("written", &self.written)
            .finish_non_exhaustive()
    }
}

impl SnapshotTxn<'_> {
    /// Insert or replace the value under `key`
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.table.insert(key, value)?;
        self.written += 1;
        Ok(())
    }

    /// Number of `set` calls made so far in this transaction
    pub fn written(&self) -> usize {
        self.written
    }
}
