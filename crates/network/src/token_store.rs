#[cfg(test)]
#[path = "tests/token_store.rs"]
mod tests;

use std::collections::HashMap;
use std::time::Duration;

use mixcomms_primitives::token::DEFAULT_TOKEN_TTL;
use mixcomms_primitives::{Nonce, Token};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use tracing::debug;

/// Outstanding nonces are first swept for expired entries once this many
/// pile up.
const PURGE_THRESHOLD: usize = 1024;

/// Tokens handed out by this node and not yet redeemed.
#[derive(Debug)]
pub struct TokenStore {
    ttl: Duration,
    nonces: Mutex<Nonces>,
}

#[derive(Debug)]
struct Nonces {
    entries: HashMap<Token, Nonce>,
    /// Size at which `generate` sweeps next. Doubles past whatever survives
    /// a sweep, so sweeping stays amortized constant per token.
    sweep_at: usize,
}

impl Default for Nonces {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            sweep_at: PURGE_THRESHOLD,
        }
    }
}

impl Nonces {
    fn purge_expired(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, nonce| nonce.is_valid());
        self.sweep_at = self.entries.len().saturating_mul(2).max(PURGE_THRESHOLD);
        before.saturating_sub(self.entries.len())
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_TTL)
    }
}

impl TokenStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            nonces: Mutex::default(),
        }
    }

    /// Mints a token backed by a fresh nonce.
    pub fn generate(&self) -> Token {
        let nonce = Nonce::generate(&mut OsRng, self.ttl);
        let token = nonce.token();

        let mut nonces = self.nonces.lock();
        if nonces.entries.len() >= nonces.sweep_at {
            let purged = nonces.purge_expired();
            debug!(purged, outstanding = nonces.entries.len(), "purged expired nonces");
        }
        let _ = nonces.entries.insert(token, nonce);

        token
    }

    /// Redeems a token. The entry is removed whether or not its nonce is
    /// still valid, so a token can succeed at most once.
    pub fn validate(&self, token: &Token) -> bool {
        self.nonces
            .lock()
            .entries
            .remove(token)
            .is_some_and(|nonce| nonce.is_valid())
    }

    /// Drops nonces whose validity window has passed, returning how many.
    pub fn purge_expired(&self) -> usize {
        self.nonces.lock().purge_expired()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nonces.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nonces.lock().entries.is_empty()
    }
}
