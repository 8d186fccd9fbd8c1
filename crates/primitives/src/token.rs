#[cfg(test)]
#[path = "tests/token.rs"]
mod tests;

use std::fmt;
use std::ops::Deref;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::{CryptoRng, RngCore};
use thiserror::Error;

pub const TOKEN_LEN: usize = 32;

/// How long a freshly minted nonce stays redeemable.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[error("invalid token length: expected {TOKEN_LEN} bytes, got {0}")]
pub struct TokenError(pub usize);

/// Opaque proof of a reverse-authentication grant.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct Token([u8; TOKEN_LEN]);

impl Token {
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0; TOKEN_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[must_use]
    pub const fn from_array(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }
}

impl Deref for Token {
    type Target = [u8; TOKEN_LEN];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<&[u8]> for Token {
    type Error = TokenError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        bytes
            .try_into()
            .map(Self)
            .map_err(|_| TokenError(bytes.len()))
    }
}

// Tokens are credentials, keep them out of logs.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(..)")
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&STANDARD.encode(self.0))
    }
}

/// A token together with the window in which it may be redeemed.
#[derive(Clone, Copy, Debug)]
pub struct Nonce {
    token: Token,
    generated_at: Instant,
    ttl: Duration,
}

impl Nonce {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R, ttl: Duration) -> Self {
        Self {
            token: Token::random(rng),
            generated_at: Instant::now(),
            ttl,
        }
    }

    #[must_use]
    pub const fn token(&self) -> Token {
        self.token
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.generated_at.elapsed() < self.ttl
    }
}
