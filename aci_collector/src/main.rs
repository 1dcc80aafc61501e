//! Entrypoint of the aci-vetr-collector binary

use dotenvy::dotenv;

mod commands {
    pub(crate) mod collect;
    pub(crate) mod common;
    pub(crate) mod icurl;
}
mod logging;

#[derive(Debug, Clone, Copy)]
enum ReturnCode {
    Failure = 1,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "aci-vetr-collector",
    version,
    about = "Collects a snapshot of an ACI fabric from its APIC",
    long_about = r#"Collects a snapshot of an ACI fabric from its APIC

The snapshot is written to a zip file to be analyzed offline.

Examples:
    # Collect from an APIC
    aci-vetr-collector -a apic1.example.com -u admin -p "$APIC_PASSWORD"

    # Write an icurl script to run on the APIC itself instead of collecting remotely
    aci-vetr-collector -a apic1.example.com --icurl

    # Collect with full debug output on the console
    LOG_FILTER=debug aci-vetr-collector -a apic1.example.com -u admin -p secret
"#
)]
struct Config {
    #[clap(flatten)]
    apic: commands::common::ApicConfig,

    /// Write an icurl script for the APIC to `vetr-collector.sh` instead of collecting
    #[clap(long = "icurl")]
    icurl: bool,

    #[clap(flatten)]
    collect: commands::collect::Config,

    #[clap(flatten)]
    logging: logging::LoggingConfig,
}

fn main() -> Result<(), std::io::Error> {
    // load all environment variables from .env before doing anything
    load_dotenv();

    let config: Config = clap::Parser::parse();

    let tokio_runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    tokio_runtime.block_on(async move {
        let log_file = (!config.icurl).then(|| config.collect.log_file.as_path());
        if let Err(e) = logging::init(&config.logging, log_file) {
            eprintln!("Initializing logs failed: {e:#}");
            std::process::exit(ReturnCode::Failure as _);
        }

        if config.icurl {
            if let Err(e) = commands::icurl::command(&config.apic) {
                eprintln!("Writing icurl script failed: {e:#}");
                std::process::exit(ReturnCode::Failure as _)
            }
        } else if let Err(e) = commands::collect::command(config.apic, config.collect).await {
            eprintln!("Collection failed: {e:#}");
            std::process::exit(ReturnCode::Failure as _)
        }
    });

    Ok(())
}

/// Source the .env file before initialising the Config struct - this sets
/// any envs in the file, which the Config struct then uses.
///
/// Precedence is given to existing env variables.
fn load_dotenv() {
    match dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            // a missing env file is not an error
        }
        Err(e) => {
            eprintln!("FATAL Error loading config from: {e}");
            eprintln!("Aborting");
            std::process::exit(ReturnCode::Failure as _);
        }
    };
}
