#[cfg(test)]
#[path = "tests/lib.rs"]
mod tests;

use std::fmt;

use mixcomms_primitives::Id;
use ring::rand::SystemRandom;
use ring::signature::{self, RsaKeyPair, UnparsedPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, SubjectPublicKeyInfo, X509Certificate};
use x509_parser::public_key::PublicKey as ParsedPublicKey;

const PKCS8_LABEL: &str = "PRIVATE KEY";
const PKCS1_LABEL: &str = "RSA PRIVATE KEY";
const CERTIFICATE_LABEL: &str = "CERTIFICATE";
const SPKI_LABEL: &str = "PUBLIC KEY";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CryptoError {
    #[error("invalid PEM: {0}")]
    Pem(String),
    #[error("unexpected PEM block {found:?}, expected {expected}")]
    UnexpectedPemLabel {
        expected: &'static str,
        found: String,
    },
    #[error("rejected RSA private key: {0}")]
    KeyRejected(String),
    #[error("invalid certificate: {0}")]
    Certificate(String),
    #[error("public key is not an RSA key")]
    NotRsa,
    #[error("failed to sign message")]
    Signing,
    #[error("signature verification failed")]
    BadSignature,
}

/// RSA private key used to sign outgoing authenticated messages.
pub struct PrivateKey {
    inner: RsaKeyPair,
}

impl PrivateKey {
    /// Loads a PKCS#8 (`PRIVATE KEY`) or PKCS#1 (`RSA PRIVATE KEY`) PEM block.
    pub fn from_pem(pem: &[u8]) -> Result<Self, CryptoError> {
        let (_, pem) = parse_x509_pem(pem).map_err(|err| CryptoError::Pem(err.to_string()))?;

        match pem.label.as_str() {
            PKCS8_LABEL => Self::from_pkcs8_der(&pem.contents),
            PKCS1_LABEL => Self::from_pkcs1_der(&pem.contents),
            found => Err(CryptoError::UnexpectedPemLabel {
                expected: PKCS8_LABEL,
                found: found.to_owned(),
            }),
        }
    }

    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, CryptoError> {
        RsaKeyPair::from_pkcs8(der)
            .map(|inner| Self { inner })
            .map_err(|err| CryptoError::KeyRejected(err.to_string()))
    }

    pub fn from_pkcs1_der(der: &[u8]) -> Result<Self, CryptoError> {
        RsaKeyPair::from_der(der)
            .map(|inner| Self { inner })
            .map_err(|err| CryptoError::KeyRejected(err.to_string()))
    }

    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            der: self.inner.public().as_ref().to_vec(),
        }
    }

    /// RSA-PSS-SHA256 signature over `data`.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut signature = vec![0; self.inner.public().modulus_len()];

        self.inner
            .sign(
                &signature::RSA_PSS_SHA256,
                &SystemRandom::new(),
                data,
                &mut signature,
            )
            .map_err(|_| CryptoError::Signing)?;

        Ok(signature)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// RSA public key, held as a DER encoded PKCS#1 `RSAPublicKey`.
#[derive(Clone, Eq, PartialEq)]
pub struct PublicKey {
    der: Vec<u8>,
}

impl PublicKey {
    #[must_use]
    pub const fn from_pkcs1_der(der: Vec<u8>) -> Self {
        Self { der }
    }

    pub fn from_spki_der(der: &[u8]) -> Result<Self, CryptoError> {
        let (_, spki) = SubjectPublicKeyInfo::from_der(der)
            .map_err(|err| CryptoError::Certificate(err.to_string()))?;

        Self::from_spki(&spki)
    }

    /// Accepts either a `CERTIFICATE` or a `PUBLIC KEY` PEM block.
    pub fn from_pem(pem: &[u8]) -> Result<Self, CryptoError> {
        let (_, pem) = parse_x509_pem(pem).map_err(|err| CryptoError::Pem(err.to_string()))?;

        match pem.label.as_str() {
            CERTIFICATE_LABEL => {
                let certificate = pem
                    .parse_x509()
                    .map_err(|err| CryptoError::Certificate(err.to_string()))?;
                Self::from_certificate(&certificate)
            }
            SPKI_LABEL => Self::from_spki_der(&pem.contents),
            found => Err(CryptoError::UnexpectedPemLabel {
                expected: CERTIFICATE_LABEL,
                found: found.to_owned(),
            }),
        }
    }

    pub fn from_certificate(certificate: &X509Certificate<'_>) -> Result<Self, CryptoError> {
        Self::from_spki(certificate.public_key())
    }

    fn from_spki(spki: &SubjectPublicKeyInfo<'_>) -> Result<Self, CryptoError> {
        match spki.parsed() {
            Ok(ParsedPublicKey::RSA(_)) => Ok(Self {
                der: spki.subject_public_key.data.to_vec(),
            }),
            _ => Err(CryptoError::NotRsa),
        }
    }

    #[must_use]
    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        UnparsedPublicKey::new(&signature::RSA_PSS_2048_8192_SHA256, &self.der)
            .verify(data, signature)
            .map_err(|_| CryptoError::BadSignature)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey")
            .field(&format_args!("{} bytes", self.der.len()))
            .finish()
    }
}

/// Digest over the payload and the identity it is addressed to, so a
/// signature cannot be replayed against another peer.
#[must_use]
pub fn digest(payload: &[u8], recipient: &Id) -> [u8; 32] {
    let recipient = if recipient.is_bootstrap() {
        &Id::DUMMY_USER
    } else {
        recipient
    };

    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(recipient.as_bytes());
    hasher.finalize().into()
}

pub fn sign(key: &PrivateKey, payload: &[u8], recipient: &Id) -> Result<Vec<u8>, CryptoError> {
    key.sign(&digest(payload, recipient))
}

pub fn verify(
    key: &PublicKey,
    payload: &[u8],
    signature: &[u8],
    recipient: &Id,
) -> Result<(), CryptoError> {
    key.verify(&digest(payload, recipient), signature)
}
