#[cfg(test)]
#[path = "tests/id.rs"]
mod tests;

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const VALUE_LEN: usize = 32;
pub const ID_LEN: usize = VALUE_LEN + 1;

/// Number of leading id bytes rendered into a DNS label by [`Id::dns_prefix`].
const DNS_PREFIX_BYTES: usize = 16;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
#[repr(u8)]
#[non_exhaustive]
pub enum IdType {
    Generic = 0,
    Gateway = 1,
    Node = 2,
    User = 3,
    NotificationBot = 4,
}

impl IdType {
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Generic),
            1 => Some(Self::Gateway),
            2 => Some(Self::Node),
            3 => Some(Self::User),
            4 => Some(Self::NotificationBot),
            _ => None,
        }
    }
}

impl fmt::Display for IdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Generic => "generic",
            Self::Gateway => "gateway",
            Self::Node => "node",
            Self::User => "user",
            Self::NotificationBot => "notificationBot",
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum IdError {
    #[error("invalid id length: expected {ID_LEN} bytes, got {0}")]
    InvalidLength(usize),
    #[error("unknown id type byte {0:#04x}")]
    UnknownType(u8),
    #[error("invalid id encoding")]
    InvalidEncoding,
}

/// The network identity of a peer: a 32 byte value followed by its [`IdType`].
#[derive(Clone, Copy, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Id([u8; ID_LEN]);

impl Id {
    /// Placeholder identity used before a client knows who it is talking to.
    pub const DUMMY_USER: Self = Self::from_tag(*b"dummy", IdType::User);

    /// Identity a gateway uses before it learns its node's permanent id.
    pub const TEMP_GATEWAY: Self = Self::from_tag(*b"tmp", IdType::Gateway);

    const fn from_tag<const N: usize>(tag: [u8; N], ty: IdType) -> Self {
        let mut bytes = [0; ID_LEN];
        let mut i = 0;
        while i < N {
            bytes[i] = tag[i];
            i += 1;
        }
        bytes[VALUE_LEN] = ty as u8;
        Self(bytes)
    }

    #[must_use]
    pub const fn new(value: [u8; VALUE_LEN], ty: IdType) -> Self {
        let mut bytes = [0; ID_LEN];
        let mut i = 0;
        while i < VALUE_LEN {
            bytes[i] = value[i];
            i += 1;
        }
        bytes[VALUE_LEN] = ty as u8;
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdError> {
        let bytes: [u8; ID_LEN] = bytes
            .try_into()
            .map_err(|_| IdError::InvalidLength(bytes.len()))?;

        if IdType::from_byte(bytes[VALUE_LEN]).is_none() {
            return Err(IdError::UnknownType(bytes[VALUE_LEN]));
        }

        Ok(Self(bytes))
    }

    /// Derives the id a dynamic client must claim for the given public key and salt.
    #[must_use]
    pub fn derive(public_key: &[u8], salt: &[u8], ty: IdType) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(public_key);
        hasher.update(salt);

        Self::new(hasher.finalize().into(), ty)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    #[must_use]
    pub fn id_type(&self) -> IdType {
        IdType::from_byte(self.0[VALUE_LEN]).unwrap_or(IdType::Generic)
    }

    /// Bootstrap identities sign and verify against [`Id::DUMMY_USER`]
    /// rather than their own bytes.
    #[must_use]
    pub fn is_bootstrap(&self) -> bool {
        *self == Self::DUMMY_USER || *self == Self::TEMP_GATEWAY
    }

    /// Lowercase hex label derived from this id, used in TLS server names.
    #[must_use]
    pub fn dns_prefix(&self) -> String {
        hex::encode(&self.0[..DNS_PREFIX_BYTES])
    }
}

impl Deref for Id {
    type Target = [u8; ID_LEN];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&STANDARD.encode(self.0))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl FromStr for Id {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = STANDARD.decode(s).map_err(|_| IdError::InvalidEncoding)?;

        Self::from_bytes(&bytes)
    }
}

impl TryFrom<&[u8]> for Id {
    type Error = IdError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Self::from_bytes(bytes)
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;

        encoded.parse().map_err(serde::de::Error::custom)
    }
}
