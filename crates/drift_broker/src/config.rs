//! Broker configuration: a TOML file with per-field defaults.
//!
//! TLS is mandatory unless explicitly disabled: exactly one of
//! `acme_hostnames` or `disable_tls` must be set. Certificate renewal is
//! the external ACME agent's job; this process just reads the PEM files
//! it maintains.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Comma-separated hostnames the TLS certificate covers.
    #[serde(default)]
    pub acme_hostnames: Option<String>,
    /// Optional contact email for certificate-expiry notifications.
    #[serde(default)]
    pub acme_email: Option<String>,
    /// Serve plain HTTP instead of TLS.
    #[serde(default)]
    pub disable_tls: bool,
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
    #[serde(default)]
    pub geoip_database: Option<PathBuf>,
    #[serde(default)]
    pub geoip6_database: Option<PathBuf>,
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
    #[serde(default = "default_metrics_log")]
    pub metrics_log: PathBuf,
}

fn default_listen() -> String {
    "0.0.0.0:443".into()
}
fn default_metrics_interval_secs() -> u64 {
    86_400
}
fn default_metrics_log() -> PathBuf {
    PathBuf::from("metrics.log")
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            acme_hostnames: None,
            acme_email: None,
            disable_tls: false,
            tls_cert: None,
            tls_key: None,
            geoip_database: None,
            geoip6_database: None,
            metrics_interval_secs: default_metrics_interval_secs(),
            metrics_log: default_metrics_log(),
        }
    }
}

impl BrokerConfig {
    /// Load from `path` if it exists, otherwise start from defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("read {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("parse {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        let has_acme = self
            .acme_hostnames
            .as_deref()
            .is_some_and(|h| !h.trim().is_empty());
        match (has_acme, self.disable_tls) {
            (false, false) => bail!("either acme_hostnames or disable_tls is required"),
            (true, true) => bail!("acme_hostnames and disable_tls are mutually exclusive"),
            _ => {}
        }
        if has_acme && (self.tls_cert.is_none() || self.tls_key.is_none()) {
            bail!("TLS mode needs tls_cert and tls_key (PEM files the ACME agent maintains)");
        }
        Ok(())
    }

    pub fn acme_hostname_list(&self) -> Vec<String> {
        self.acme_hostnames
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }
}
