use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use secrecy::{ExposeSecret, Secret};
use url::Url;

/// How to reach and authenticate against the APIC
#[derive(Debug, Parser)]
pub(crate) struct ApicConfig {
    /// Hostname or IP address of the APIC, optionally with a scheme and port
    #[clap(short = 'a', long = "apic", env = "ACI_COLLECTOR_APIC")]
    pub(crate) host: String,

    /// APIC username
    #[clap(short = 'u', long = "username", env = "ACI_COLLECTOR_USERNAME")]
    pub(crate) username: Option<String>,

    /// APIC password
    #[clap(
        short = 'p',
        long = "password",
        env = "ACI_COLLECTOR_PASSWORD",
        hide_env_values = true
    )]
    pub(crate) password: Option<Secret<String>>,

    /// Timeout of a single request to the APIC
    #[clap(
        long = "request-timeout",
        env = "ACI_COLLECTOR_REQUEST_TIMEOUT",
        default_value = "90s",
        value_parser = humantime::parse_duration,
    )]
    pub(crate) request_timeout: Duration,
}

impl ApicConfig {
    /// The APIC base URL; `https` is assumed when `host` has no scheme
    pub(crate) fn base_url(&self) -> anyhow::Result<Url> {
        let host = self.host.trim().trim_end_matches('/');
        if host.is_empty() {
            bail!("the APIC host must not be empty");
        }
        let url = if host.contains("://") {
            host.to_owned()
        } else {
            format!("https://{host}")
        };
        Url::parse(&url).with_context(|| format!("invalid APIC address '{}'", self.host))
    }

    /// The host portion of [`base_url`](Self::base_url), including any port
    pub(crate) fn authority(&self) -> anyhow::Result<String> {
        let url = self.base_url()?;
        let host = url
            .host_str()
            .with_context(|| format!("APIC address '{}' has no host", self.host))?;
        Ok(match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        })
    }

    pub(crate) fn credentials(&self) -> anyhow::Result<(String, String)> {
        let username = self
            .username
            .clone()
            .context("an APIC username is required, use --username or ACI_COLLECTOR_USERNAME")?;
        let password = self
            .password
            .as_ref()
            .map(|p| p.expose_secret().clone())
            .context("an APIC password is required, use --password or ACI_COLLECTOR_PASSWORD")?;
        Ok((username, password))
    }
}
