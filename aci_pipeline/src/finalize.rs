//! Seal a populated snapshot with its metadata record
//!
//! Finalization is the only writer once collection has finished: it takes sole ownership of the
//! store, so it cannot run while any collection task still holds a handle.

use std::{path::PathBuf, sync::Arc};

use aci_store::SnapshotStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Version of the layout of keys and records in a snapshot
pub const SCHEMA_VERSION: u32 = 1;

/// Version of this collector, recorded in every snapshot it produces
pub const COLLECTOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Key of the metadata record
pub const METADATA_KEY: &str = "meta";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("the snapshot store is still in use by {holders} other handle(s)")]
    StoreStillShared { holders: usize },

    #[error("failed to serialize snapshot metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("failed to write snapshot metadata: {0}")]
    Store(#[from] aci_store::Error),
}

/// Describes the snapshot as a whole; stored under [`METADATA_KEY`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub collector_version: String,
    pub schema_version: u32,
    pub timestamp: DateTime<Utc>,
}

impl SnapshotMetadata {
    /// Metadata for a snapshot completed now
    pub fn now() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            collector_version: COLLECTOR_VERSION.to_owned(),
            schema_version: SCHEMA_VERSION,
            timestamp,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Finalizer {
    metadata: SnapshotMetadata,
    compact: bool,
}

impl Finalizer {
    pub fn new(metadata: SnapshotMetadata) -> Self {
        Self {
            metadata,
            compact: true,
        }
    }

    /// Whether to compact the database file before closing it, on by default
    pub fn with_compaction(mut self, compact: bool) -> Self {
        self.compact = compact;
        self
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    /// Write the metadata record, then compact and close the store
    ///
    /// Returns the path of the sealed database file. Fails without writing anything if `store`
    /// is not the last handle to the store.
    pub fn finalize(&self, store: Arc<SnapshotStore>) -> Result<PathBuf, Error> {
        let mut store = Arc::try_unwrap(store).map_err(|shared| Error::StoreStillShared {
            holders: Arc::strong_count(&shared) - 1,
        })?;

        let meta = serde_json::to_string(&self.metadata)?;
        store.transact(|txn| txn.set(METADATA_KEY, &meta))?;
        debug!(key = METADATA_KEY, %meta, "wrote snapshot metadata");

        if self.compact {
            let compacted = store.compact()?;
            debug!(compacted, "compacted snapshot store");
        }

        let path = store.path().to_path_buf();
        store.close();
        info!(path = %path.display(), "snapshot finalized");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn metadata_is_written_in_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path().join("data.db")).unwrap();

        let path = Finalizer::new(SnapshotMetadata::at(at()))
            .finalize(Arc::new(store))
            .unwrap();

        let store = SnapshotStore::open(&path).unwrap();
        let raw = store.get(METADATA_KEY).unwrap().unwrap();
        assert_eq!(
            raw,
            format!(
                r#"{{"collectorVersion":"{COLLECTOR_VERSION}","schemaVersion":1,"timestamp":"2024-05-01T12:30:00Z"}}"#
            )
        );
        let parsed: SnapshotMetadata = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, SnapshotMetadata::at(at()));
    }

    #[test]
    fn finalize_keeps_collected_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path().join("data.db")).unwrap();
        store
            .transact(|txn| txn.set("fvTenant:uni/tn-A", r#"{"dn":"uni/tn-A"}"#))
            .unwrap();

        let path = Finalizer::new(SnapshotMetadata::now())
            .with_compaction(false)
            .finalize(Arc::new(store))
            .unwrap();

        let store = SnapshotStore::open(path).unwrap();
        assert_eq!(store.keys().unwrap(), vec!["fvTenant:uni/tn-A", "meta"]);
    }

    #[test]
    fn shared_store_is_not_finalized() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SnapshotStore::open(dir.path().join("data.db")).unwrap());
        let other = Arc::clone(&store);

        let err = Finalizer::new(SnapshotMetadata::now())
            .finalize(store)
            .unwrap_err();

        assert!(matches!(err, Error::StoreStillShared { holders: 1 }));
        assert!(other.get(METADATA_KEY).unwrap().is_none());
    }
}
