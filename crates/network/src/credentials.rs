#[cfg(test)]
#[path = "tests/credentials.rs"]
mod tests;

use std::sync::Arc;

use mixcomms_crypto::PublicKey;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, SignatureScheme};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;

use crate::config::ConnectionType;
use crate::Error;

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Transport credentials derived from a peer's PEM certificate.
#[derive(Clone, Debug)]
pub struct Credentials {
    server_name: ServerName<'static>,
    dns_names: Vec<String>,
    public_key: PublicKey,
    native: Arc<ClientConfig>,
    web: Arc<ClientConfig>,
}

impl Credentials {
    /// Parses `certificate`, pins it for TLS and extracts its RSA key.
    ///
    /// The presented server name is `server_name` if given, otherwise the
    /// certificate's first DNS name.
    pub fn from_pem(certificate: &[u8], server_name: Option<&str>) -> Result<Self, Error> {
        let (_, pem) =
            parse_x509_pem(certificate).map_err(|err| Error::Configuration(err.to_string()))?;
        let parsed = pem
            .parse_x509()
            .map_err(|err| Error::Configuration(format!("invalid certificate: {err}")))?;

        let dns_names = dns_names(&parsed);
        let public_key = PublicKey::from_certificate(&parsed)?;

        let name = match (server_name, dns_names.first()) {
            (Some(name), _) => name.to_owned(),
            (None, Some(name)) if !name.starts_with("*.") => name.clone(),
            _ => {
                return Err(Error::Configuration(
                    "certificate has no usable DNS name and no server name was configured"
                        .to_owned(),
                ))
            }
        };
        let server_name = ServerName::try_from(name)
            .map_err(|err| Error::Configuration(format!("invalid server name: {err}")))?;

        let pinned = CertificateDer::from(pem.contents.clone());

        Ok(Self {
            server_name,
            dns_names,
            public_key,
            native: Arc::new(client_config(pinned.clone(), ALPN_H2)?),
            web: Arc::new(client_config(pinned, ALPN_HTTP1)?),
        })
    }

    #[must_use]
    pub const fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }

    #[must_use]
    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    #[must_use]
    pub const fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    #[must_use]
    pub fn client_config(&self, connection_type: ConnectionType) -> Arc<ClientConfig> {
        match connection_type {
            ConnectionType::Native => Arc::clone(&self.native),
            ConnectionType::Web => Arc::clone(&self.web),
        }
    }
}

/// Subject alternative DNS names, falling back to the common name.
#[must_use]
pub fn dns_names(certificate: &X509Certificate<'_>) -> Vec<String> {
    let mut names: Vec<String> = certificate
        .subject_alternative_name()
        .ok()
        .flatten()
        .map(|san| {
            san.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(name) => Some((*name).to_owned()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    if names.is_empty() {
        names.extend(
            certificate
                .subject()
                .iter_common_name()
                .filter_map(|cn| cn.as_str().ok())
                .map(str::to_owned),
        );
    }

    names
}

fn client_config(pinned: CertificateDer<'static>, alpn: &[u8]) -> Result<ClientConfig, Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = Arc::new(PinnedCertVerifier {
        pinned,
        provider: Arc::clone(&provider),
    });

    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    config.alpn_protocols = vec![alpn.to_vec()];

    Ok(config)
}

/// Accepts exactly the peer certificate this host was configured with.
/// Handshake signatures are still checked against it.
#[derive(Debug)]
struct PinnedCertVerifier {
    pinned: CertificateDer<'static>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.pinned.as_ref() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::UnknownIssuer,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
