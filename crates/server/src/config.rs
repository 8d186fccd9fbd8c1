#[cfg(test)]
#[path = "tests/config.rs"]
mod tests;

use core::time::Duration;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use eyre::WrapErr;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 11420;

/// How long a new connection may take to send its first bytes.
pub const DEFAULT_PREFIX_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
#[non_exhaustive]
pub struct ServerConfig {
    pub listen: SocketAddr,

    /// Certificate and key for native RPC. Only test builds may omit it.
    pub tls: Option<PemPaths>,

    pub web: WebConfig,

    /// SNI containing any of these is routed to native RPC.
    pub default_domains: Vec<String>,

    pub prefix_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            tls: None,
            web: WebConfig::default(),
            default_domains: Vec::new(),
            prefix_timeout: DEFAULT_PREFIX_TIMEOUT,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn new(listen: SocketAddr, tls: Option<PemPaths>) -> Self {
        Self {
            listen,
            tls,
            ..Self::default()
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read server config {}", path.display()))?;

        toml::from_str(&content)
            .wrap_err_with(|| format!("failed to parse server config {}", path.display()))
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
#[non_exhaustive]
pub struct WebConfig {
    pub enabled: bool,
    /// Certificate for the web path; the native one is used if absent.
    pub tls: Option<PemPaths>,
}

impl WebConfig {
    #[must_use]
    pub const fn new(enabled: bool, tls: Option<PemPaths>) -> Self {
        Self { enabled, tls }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PemPaths {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

impl PemPaths {
    pub fn new(certificate: impl Into<PathBuf>, private_key: impl Into<PathBuf>) -> Self {
        Self {
            certificate: certificate.into(),
            private_key: private_key.into(),
        }
    }

    pub fn load(&self) -> eyre::Result<PemPair> {
        let certificate = fs::read(&self.certificate)
            .wrap_err_with(|| format!("failed to read {}", self.certificate.display()))?;
        let private_key = fs::read(&self.private_key)
            .wrap_err_with(|| format!("failed to read {}", self.private_key.display()))?;

        Ok(PemPair {
            certificate,
            private_key,
        })
    }
}

/// PEM encoded certificate chain and private key.
#[derive(Clone)]
pub struct PemPair {
    pub certificate: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl core::fmt::Debug for PemPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PemPair")
            .field("certificate", &format_args!("{} bytes", self.certificate.len()))
            .finish_non_exhaustive()
    }
}
