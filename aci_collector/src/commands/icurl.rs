use std::path::Path;

use aci_pipeline::{Catalog, catalog::icurl_script};
use anyhow::Context;
use tracing::info;

use super::common::ApicConfig;

/// Name of the script written in icurl mode
pub(crate) const SCRIPT_FILE: &str = "vetr-collector.sh";

pub(crate) fn command(apic: &ApicConfig) -> anyhow::Result<()> {
    write_script(apic, Path::new(SCRIPT_FILE))?;
    println!("Wrote {SCRIPT_FILE}. Run it on the APIC to collect the fabric snapshot.");
    Ok(())
}

fn write_script(apic: &ApicConfig, path: &Path) -> anyhow::Result<()> {
    let host = apic.authority()?;
    let script = icurl_script(&Catalog::aci_default(), &host);
    std::fs::write(path, script).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), host, "icurl script written");
    Ok(())
}
