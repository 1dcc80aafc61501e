use std::{num::NonZeroUsize, path::PathBuf, sync::Arc};

use aci_client::{Client, ClientOptions};
use aci_pipeline::{
    Catalog, CollectConfig, CollectOutcome, ZipArchiver, archive::remove_files, collect,
};
use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::common::ApicConfig;

/// Where the collection run writes its output
#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    /// The zip file the snapshot is delivered in
    #[clap(
        short = 'o',
        long = "output",
        env = "ACI_COLLECTOR_OUTPUT",
        default_value = "aci-vetr-data.zip"
    )]
    pub(crate) output: PathBuf,

    /// Maximum number of requests in flight against the APIC, unbounded if unset
    #[clap(long = "concurrency", env = "ACI_COLLECTOR_CONCURRENCY")]
    pub(crate) concurrency: Option<NonZeroUsize>,

    /// Intermediate snapshot database, recreated on every run
    #[clap(long = "db-file", default_value = "data.db")]
    pub(crate) db_file: PathBuf,

    /// Log file of the run, archived with the snapshot
    #[clap(long = "log-file", default_value = "collector.log")]
    pub(crate) log_file: PathBuf,

    /// Keep the database and log file after they have been archived
    #[clap(long = "keep-files")]
    pub(crate) keep_files: bool,
}

pub(crate) async fn command(apic: ApicConfig, config: Config) -> anyhow::Result<()> {
    let (username, password) = apic.credentials()?;
    let options = ClientOptions {
        request_timeout: apic.request_timeout,
        ..ClientOptions::default()
    };
    let client = Client::with_options(apic.base_url()?, options)
        .context("building the APIC client")?
        .with_credentials(&username, password);

    info!(apic = %client.base_url(), user = %username, "logging in to the APIC");
    client.login().await.context("logging in to the APIC")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(shutdown.clone()));

    let collect_config = CollectConfig::new(&config.db_file)
        .with_extra_file(&config.log_file)
        .with_concurrency_limit(config.concurrency);
    let CollectOutcome {
        archive,
        archived_files,
        report,
    } = collect(
        &Catalog::aci_default(),
        Arc::new(client),
        Arc::new(ZipArchiver::new(&config.output)),
        collect_config,
        shutdown,
    )
    .await
    .with_context(|| {
        format!(
            "snapshot not created, {} and {} are kept for troubleshooting",
            config.db_file.display(),
            config.log_file.display()
        )
    })?;

    for skipped in &report.skipped {
        warn!(class = %skipped.class, reason = %skipped.reason, "resource not collected");
    }
    info!(
        records = report.total_records(),
        classes = report.collected.len(),
        archive = %archive.display(),
        "collection complete"
    );

    if !config.keep_files {
        remove_files(&archived_files);
    }

    println!(
        "Collection complete. Provide {} to Cisco Services for analysis.",
        archive.display()
    );
    Ok(())
}

async fn cancel_on_ctrl_c(shutdown: CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        res = tokio::signal::ctrl_c() => {
            if res.is_ok() {
                warn!("received ctrl+c, cancelling collection");
                shutdown.cancel();
            }
        }
    }
}
