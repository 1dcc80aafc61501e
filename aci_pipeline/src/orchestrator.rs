//! Drive one collection task per catalog entry and aggregate their outcomes
//!
//! Every descriptor gets its own tokio task, spawned eagerly into a [`JoinSet`]. A task fetches
//! its class, extracts the records and writes them to the shared [`SnapshotStore`] in a single
//! transaction. The store is only touched from the blocking pool and never across a network
//! call.
//!
//! The first fatal failure cancels a shared [`CancellationToken`]; tasks that have not finished
//! yet stop at their next suspension point. [`Orchestrator::run`] always joins every task before
//! it returns, so nothing is left writing to the store once it has.

use std::{
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use aci_client::ApiClient;
use aci_store::SnapshotStore;
use tokio::{
    sync::Semaphore,
    task::{JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    catalog::{Catalog, ResourceDescriptor, effective_rule},
    extract::{ExtractError, Record, extract},
};

/// A failure of a single collection task that aborts the whole run
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("failed to fetch '{class}' (prefix '{prefix}'): {source}")]
    Fetch {
        class: String,
        prefix: String,
        #[source]
        source: aci_client::Error,
    },

    #[error("data integrity failure for '{class}' (prefix '{prefix}'): {source}")]
    DataIntegrity {
        class: String,
        prefix: String,
        #[source]
        source: ExtractError,
    },

    #[error("failed to persist '{class}' (prefix '{prefix}'): {source}")]
    Store {
        class: String,
        prefix: String,
        #[source]
        source: aci_store::Error,
    },

    #[error("collection task panicked: {0}")]
    Panicked(#[source] JoinError),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("collection aborted: {first}")]
    Aborted {
        /// The failure that triggered the abort
        first: Box<TaskError>,
        /// What had been collected by the time every task was joined
        report: CompletionReport,
    },

    #[error("collection cancelled before all resources were collected")]
    Cancelled { report: CompletionReport },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A resource whose records were written to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedResource {
    pub class: String,
    pub prefix: String,
    pub records: usize,
    pub elapsed: Duration,
}

/// An optional resource whose fetch failed; it contributed no records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedResource {
    pub class: String,
    pub prefix: String,
    pub reason: String,
}

/// Summary of a collection run, sorted by output prefix
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionReport {
    pub collected: Vec<CollectedResource>,
    pub skipped: Vec<SkippedResource>,
    /// Output prefixes of the tasks that stopped because the run was cancelled
    pub cancelled: Vec<String>,
}

impl CompletionReport {
    /// Number of records written across all collected resources
    pub fn total_records(&self) -> usize {
        self.collected.iter().map(|c| c.records).sum()
    }

    fn add(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Collected(c) => self.collected.push(c),
            TaskOutcome::Skipped(s) => self.skipped.push(s),
            TaskOutcome::Cancelled(prefix) => self.cancelled.push(prefix),
        }
    }

    fn sort(&mut self) {
        self.collected.sort_by(|a, b| a.prefix.cmp(&b.prefix));
        self.skipped.sort_by(|a, b| a.prefix.cmp(&b.prefix));
        self.cancelled.sort();
    }
}

#[derive(Debug)]
enum TaskOutcome {
    Collected(CollectedResource),
    Skipped(SkippedResource),
    Cancelled(String),
}

/// Runs a [`Catalog`] against an [`ApiClient`], writing into a [`SnapshotStore`]
#[derive(Debug)]
pub struct Orchestrator {
    client: Arc<dyn ApiClient>,
    store: Arc<SnapshotStore>,
    concurrency_limit: Option<NonZeroUsize>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Create an [`Orchestrator`] with no bound on in-flight fetches
    pub fn new(client: Arc<dyn ApiClient>, store: Arc<SnapshotStore>) -> Self {
        Self {
            client,
            store,
            concurrency_limit: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Allow at most `limit` fetches in flight at once
    pub fn with_concurrency_limit(mut self, limit: NonZeroUsize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    /// Stop the run when `shutdown` is cancelled, e.g., on `ctrl+c`
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Collect every resource in `catalog`
    ///
    /// Returns once every task has finished. Tolerated failures of optional resources are
    /// listed in the report; any other failure aborts the run.
    pub async fn run(&self, catalog: &Catalog) -> Result<CompletionReport> {
        let cancel = self.shutdown.child_token();
        let limiter = self
            .concurrency_limit
            .map(|n| Arc::new(Semaphore::new(n.get())));

        info!(resources = catalog.len(), limit = ?self.concurrency_limit, "starting collection");
        let mut tasks = JoinSet::new();
        for descriptor in catalog {
            tasks.spawn(collect_resource(
                descriptor.clone(),
                Arc::clone(&self.client),
                Arc::clone(&self.store),
                limiter.as_ref().map(Arc::clone),
                cancel.clone(),
            ));
        }

        let mut report = CompletionReport::default();
        let mut first_failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(TaskError::Panicked).and_then(|r| r) {
                Ok(outcome) => report.add(outcome),
                Err(e) => {
                    error!(error = %e, "fatal collection failure");
                    if first_failure.is_none() {
                        cancel.cancel();
                        first_failure = Some(e);
                    }
                }
            }
        }
        report.sort();

        if let Some(first) = first_failure {
            return Err(Error::Aborted {
                first: Box::new(first),
                report,
            });
        }
        if self.shutdown.is_cancelled() && !report.cancelled.is_empty() {
            warn!(
                cancelled = report.cancelled.len(),
                "collection cancelled by shutdown"
            );
            return Err(Error::Cancelled { report });
        }
        info!(
            collected = report.collected.len(),
            skipped = report.skipped.len(),
            records = report.total_records(),
            "collection complete"
        );
        Ok(report)
    }
}

async fn collect_resource(
    descriptor: ResourceDescriptor,
    client: Arc<dyn ApiClient>,
    store: Arc<SnapshotStore>,
    limiter: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
) -> Result<TaskOutcome, TaskError> {
    let class = descriptor.resource_class();
    let prefix = descriptor.output_prefix();
    let cancelled = || Ok(TaskOutcome::Cancelled(prefix.to_owned()));

    let _permit = match limiter {
        Some(sem) => tokio::select! {
            biased;
            _ = cancel.cancelled() => return cancelled(),
            permit = sem.acquire_owned() => match permit {
                Ok(p) => Some(p),
                // the semaphore is never closed
                Err(_) => return cancelled(),
            },
        },
        None => None,
    };

    debug!(class, prefix, "fetching");
    let start = Instant::now();
    let result = fetch_and_persist(&descriptor, client.as_ref(), store, &cancel, start).await;
    let (outcome, records) = match &result {
        Ok(TaskOutcome::Collected(c)) => ("collected", c.records),
        Ok(TaskOutcome::Skipped(_)) => ("skipped", 0),
        Ok(TaskOutcome::Cancelled(_)) => ("cancelled", 0),
        Err(_) => ("failed", 0),
    };
    let elapsed = start.elapsed();
    debug!(class, prefix, outcome, records, ?elapsed, "fetched");
    result
}

async fn fetch_and_persist(
    descriptor: &ResourceDescriptor,
    client: &dyn ApiClient,
    store: Arc<SnapshotStore>,
    cancel: &CancellationToken,
    start: Instant,
) -> Result<TaskOutcome, TaskError> {
    let class = descriptor.resource_class();
    let prefix = descriptor.output_prefix();
    let cancelled = || Ok(TaskOutcome::Cancelled(prefix.to_owned()));

    let fetched = tokio::select! {
        biased;
        _ = cancel.cancelled() => return cancelled(),
        res = client.get(class, descriptor.query_modifiers()) => res,
    };
    let response = match fetched {
        Ok(response) => response,
        Err(source) if descriptor.is_optional() => {
            warn!(class, prefix, error = %source, "skipping optional resource after failed fetch");
            return Ok(TaskOutcome::Skipped(SkippedResource {
                class: class.to_owned(),
                prefix: prefix.to_owned(),
                reason: source.to_string(),
            }));
        }
        Err(source) => {
            return Err(TaskError::Fetch {
                class: class.to_owned(),
                prefix: prefix.to_owned(),
                source,
            });
        }
    };

    let records = extract(&response, &effective_rule(descriptor), descriptor.kind())
        .map_err(|source| TaskError::DataIntegrity {
            class: class.to_owned(),
            prefix: prefix.to_owned(),
            source,
        })?;
    let count = records.len();

    if cancel.is_cancelled() {
        return cancelled();
    }
    if !records.is_empty() {
        let store_prefix = prefix.to_owned();
        tokio::task::spawn_blocking(move || persist(&store, &store_prefix, &records))
            .await
            .map_err(TaskError::Panicked)?
            .map_err(|source| TaskError::Store {
                class: class.to_owned(),
                prefix: prefix.to_owned(),
                source,
            })?;
    }

    Ok(TaskOutcome::Collected(CollectedResource {
        class: class.to_owned(),
        prefix: prefix.to_owned(),
        records: count,
        elapsed: start.elapsed(),
    }))
}

/// Write all of `records` under `prefix` in one transaction
fn persist(store: &SnapshotStore, prefix: &str, records: &[Record]) -> aci_store::Result<()> {
    store.transact(|txn| {
        for record in records {
            txn.set(&record.key(prefix), &record.to_json())?;
        }
        Ok(())
    })
}
