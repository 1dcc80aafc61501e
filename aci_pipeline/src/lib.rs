//! The snapshot collection pipeline: turn a [`Catalog`] of APIC resources into a sealed
//! snapshot store and hand it to an [`ArchiveSink`].

pub mod archive;
pub mod catalog;
pub mod extract;
pub mod finalize;
pub mod orchestrator;

use std::{num::NonZeroUsize, path::PathBuf, sync::Arc};

use aci_client::ApiClient;
use aci_store::SnapshotStore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use archive::{ArchiveError, ArchiveSink, ZipArchiver};
pub use catalog::{Catalog, Error as CatalogError, RecordKind, ResourceDescriptor};
pub use extract::{ExtractError, ExtractionRule, Record, RuleError};
pub use finalize::{Finalizer, SnapshotMetadata};
pub use orchestrator::{CompletionReport, Orchestrator, TaskError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid catalog: {0}")]
    Catalog(#[from] CatalogError),

    #[error("snapshot store error: {0}")]
    Store(#[from] aci_store::Error),

    #[error(transparent)]
    Collection(#[from] orchestrator::Error),

    #[error("failed to finalize snapshot: {0}")]
    Finalize(#[from] finalize::Error),

    #[error("failed to archive snapshot: {0}")]
    Archive(#[from] ArchiveError),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Where and how a collection run writes its output
#[derive(Debug, Clone)]
pub struct CollectConfig {
    /// The snapshot database, removed and recreated at the start of every run
    pub store_path: PathBuf,
    /// Files archived alongside the database, e.g., the run's log file
    pub extra_files: Vec<PathBuf>,
    pub concurrency_limit: Option<NonZeroUsize>,
    pub compact: bool,
}

impl CollectConfig {
    pub fn new(store_path: impl Into<PathBuf>) -> Self {
        Self {
            store_path: store_path.into(),
            extra_files: vec![],
            concurrency_limit: None,
            compact: true,
        }
    }

    pub fn with_extra_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.extra_files.push(path.into());
        self
    }

    pub fn with_concurrency_limit(mut self, limit: Option<NonZeroUsize>) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn with_compaction(mut self, compact: bool) -> Self {
        self.compact = compact;
        self
    }
}

/// The result of a successful collection run
#[derive(Debug)]
pub struct CollectOutcome {
    /// Location of the artifact produced by the [`ArchiveSink`]
    pub archive: PathBuf,
    /// The files that were archived
    pub archived_files: Vec<PathBuf>,
    pub report: CompletionReport,
}

/// Run a complete collection: fresh store, fetch every resource, seal, archive
///
/// On failure the store is closed without metadata and nothing is archived; the store file is
/// left on disk.
pub async fn collect(
    catalog: &Catalog,
    client: Arc<dyn ApiClient>,
    sink: Arc<dyn ArchiveSink>,
    config: CollectConfig,
    shutdown: CancellationToken,
) -> Result<CollectOutcome> {
    catalog.validate()?;
    let mut archived_files = vec![config.store_path.clone()];
    archived_files.extend(config.extra_files.iter().cloned());
    archive::entry_names(&archived_files)?;

    let store_path = config.store_path.clone();
    let store = tokio::task::spawn_blocking(move || SnapshotStore::create_fresh(store_path))
        .await??;
    let store = Arc::new(store);
    info!(path = %store.path().display(), "created snapshot store");

    let mut orchestrator = Orchestrator::new(client, Arc::clone(&store)).with_shutdown(shutdown);
    if let Some(limit) = config.concurrency_limit {
        orchestrator = orchestrator.with_concurrency_limit(limit);
    }
    let report = match orchestrator.run(catalog).await {
        Ok(report) => report,
        Err(e) => {
            drop(orchestrator);
            match Arc::try_unwrap(store) {
                Ok(store) => store.close(),
                Err(_) => error!("snapshot store still shared after failed collection"),
            }
            return Err(e.into());
        }
    };
    drop(orchestrator);

    let finalizer = Finalizer::new(SnapshotMetadata::now()).with_compaction(config.compact);
    let db_path = tokio::task::spawn_blocking(move || finalizer.finalize(store)).await??;

    archived_files[0] = db_path;
    let files = archived_files.clone();
    let archive = tokio::task::spawn_blocking(move || sink.archive(&files)).await??;

    Ok(CollectOutcome {
        archive,
        archived_files,
        report,
    })
}
