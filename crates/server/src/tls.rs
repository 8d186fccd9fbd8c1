use std::sync::Arc;

use eyre::{bail, eyre, WrapErr};
use mixcomms_network::credentials::{dns_names, ALPN_H2, ALPN_HTTP1};
use parking_lot::RwLock;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tracing::info;
use x509_parser::pem::Pem;

use crate::config::PemPair;

/// A parsed certificate chain, key and the leaf's DNS names.
#[derive(Debug)]
pub struct Identity {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub dns_names: Vec<String>,
}

impl Identity {
    pub fn from_pem(pair: &PemPair) -> eyre::Result<Self> {
        let mut chain = Vec::new();
        for pem in Pem::iter_from_buffer(&pair.certificate) {
            let pem = pem.map_err(|err| eyre!("invalid certificate pem: {err}"))?;
            if pem.label == "CERTIFICATE" {
                chain.push(CertificateDer::from(pem.contents));
            }
        }

        let Some(leaf) = chain.first() else {
            bail!("no certificate found in pem");
        };
        let (_, leaf) = x509_parser::parse_x509_certificate(leaf.as_ref())
            .map_err(|err| eyre!("invalid leaf certificate: {err}"))?;
        let dns_names = dns_names(&leaf);

        let key = Pem::iter_from_buffer(&pair.private_key)
            .filter_map(Result::ok)
            .find_map(|pem| match pem.label.as_str() {
                "PRIVATE KEY" => Some(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pem.contents))),
                "RSA PRIVATE KEY" => Some(PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(pem.contents))),
                _ => None,
            })
            .ok_or_else(|| eyre!("no private key found in pem"))?;

        Ok(Self {
            chain,
            key,
            dns_names,
        })
    }

    fn server_config(self, alpn: &[u8]) -> eyre::Result<Arc<ServerConfig>> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(self.chain, self.key)
            .wrap_err("certificate does not match private key")?;
        config.alpn_protocols = vec![alpn.to_vec()];

        Ok(Arc::new(config))
    }
}

/// TLS config for native RPC, fixed for the life of the server.
pub fn native_config(pair: &PemPair) -> eyre::Result<(Arc<ServerConfig>, Vec<String>)> {
    let identity = Identity::from_pem(pair)?;
    let names = identity.dns_names.clone();

    Ok((identity.server_config(ALPN_H2)?, names))
}

/// TLS config for web RPC, replaceable while the listener keeps running.
#[derive(Debug)]
pub struct WebCertificate {
    current: RwLock<(Arc<ServerConfig>, Arc<[String]>)>,
}

impl WebCertificate {
    pub fn from_pem(pair: &PemPair) -> eyre::Result<Self> {
        Ok(Self {
            current: RwLock::new(Self::load(pair)?),
        })
    }

    fn load(pair: &PemPair) -> eyre::Result<(Arc<ServerConfig>, Arc<[String]>)> {
        let identity = Identity::from_pem(pair)?;
        let names = Arc::from(identity.dns_names.clone());

        Ok((identity.server_config(ALPN_HTTP1)?, names))
    }

    /// Swaps in a new certificate. Established connections keep the old one.
    pub fn replace(&self, pair: &PemPair) -> eyre::Result<()> {
        let next = Self::load(pair)?;
        info!(dns_names = ?next.1, "replaced web certificate");
        *self.current.write() = next;

        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.current.read().0)
    }

    #[must_use]
    pub fn dns_names(&self) -> Arc<[String]> {
        Arc::clone(&self.current.read().1)
    }
}
