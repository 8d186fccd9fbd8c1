#[cfg(test)]
#[path = "tests/host.rs"]
mod tests;

use core::fmt;
use core::time::Duration;

use mixcomms_crypto::PublicKey;
use mixcomms_primitives::{Id, Token};
use parking_lot::{Mutex, RwLock};
use tokio::sync::MutexGuard;
use tracing::{debug, info};

use crate::codec::AuthMetadata;
use crate::config::{dial_timeout, HostParams};
use crate::connection::{Connection, ConnectivityState, DialTarget, RpcChannel};
use crate::credentials::Credentials;
use crate::error::PROXY_ERROR_MARKER;
use crate::metric::{Metric, ProxyErrorTracker};
use crate::Error;

/// This process's record of one remote peer.
pub struct Host {
    id: Id,
    address: RwLock<String>,
    params: HostParams,
    credentials: Option<Credentials>,
    public_key: Option<PublicKey>,
    transition: tokio::sync::Mutex<()>,
    connection: Mutex<Option<Connection>>,
    transmission_token: Mutex<Option<Token>>,
    reception_token: Mutex<Option<Token>>,
    metric: Metric,
    proxy_errors: ProxyErrorTracker,
}

impl Host {
    /// Creates a host. The certificate, when given, is parsed once for the
    /// TLS server name, pinned client config and RSA public key.
    ///
    /// A host with an address must have a certificate unless
    /// `allow_insecure` is set.
    pub fn new(
        id: Id,
        address: impl Into<String>,
        certificate: Option<&[u8]>,
        params: HostParams,
        allow_insecure: bool,
    ) -> Result<Self, Error> {
        let address = address.into();

        let credentials = certificate
            .map(|pem| Credentials::from_pem(pem, params.server_name.as_deref()))
            .transpose()?;

        if credentials.is_none() && !address.is_empty() && !allow_insecure {
            return Err(Error::Configuration(format!(
                "no certificate for host {id}, transport security can only be disabled in test builds"
            )));
        }

        let public_key = credentials.as_ref().map(|c| c.public_key().clone());

        Ok(Self::build(id, address, params, credentials, public_key))
    }

    /// A host that can only be received from, such as a dynamic client.
    #[must_use]
    pub fn receive_only(id: Id, public_key: Option<PublicKey>, params: HostParams) -> Self {
        Self::build(id, String::new(), params, None, public_key)
    }

    fn build(
        id: Id,
        address: String,
        params: HostParams,
        credentials: Option<Credentials>,
        public_key: Option<PublicKey>,
    ) -> Self {
        Self {
            id,
            address: RwLock::new(address),
            proxy_errors: ProxyErrorTracker::new(params.proxy_error_metric.clone()),
            params,
            credentials,
            public_key,
            transition: tokio::sync::Mutex::default(),
            connection: Mutex::default(),
            transmission_token: Mutex::default(),
            reception_token: Mutex::default(),
            metric: Metric::default(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &Id {
        &self.id
    }

    #[must_use]
    pub fn address(&self) -> String {
        self.address.read().clone()
    }

    #[must_use]
    pub fn has_address(&self) -> bool {
        !self.address.read().is_empty()
    }

    #[must_use]
    pub const fn params(&self) -> &HostParams {
        &self.params
    }

    #[must_use]
    pub const fn public_key(&self) -> Option<&PublicKey> {
        self.public_key.as_ref()
    }

    #[must_use]
    pub const fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Dials unless already alive.
    pub async fn connect(&self) -> Result<(), Error> {
        let _guard = self.lock_transition().await;
        self.dial_locked().await
    }

    /// Serializes connect and handshake on this host only.
    pub(crate) async fn lock_transition(&self) -> MutexGuard<'_, ()> {
        self.transition.lock().await
    }

    /// Caller must hold the transition lock.
    pub(crate) async fn dial_locked(&self) -> Result<(), Error> {
        if self.is_alive() {
            return Ok(());
        }

        let address = self.address();
        if address.is_empty() {
            return Err(Error::NoAddress(self.id));
        }

        let attempts = self.params.max_retries.max(1);
        let mut last_err = Error::Disconnected;

        for attempt in 0..attempts {
            let target = DialTarget {
                address: &address,
                credentials: self.credentials.as_ref(),
                timeout: dial_timeout(attempt),
            };

            match Connection::dial(self.params.connection_type, target).await {
                Ok(connection) => {
                    info!(id = %self.id, %address, attempt, "connected to host");
                    if let Some(stale) = self.connection.lock().replace(connection) {
                        stale.close();
                    }
                    return Ok(());
                }
                Err(err) => {
                    debug!(id = %self.id, %address, attempt, %err, "dial attempt failed");
                    last_err = err;
                }
            }
        }

        Err(Error::Dial {
            id: self.id,
            address,
            attempts,
            source: Box::new(last_err),
        })
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(Connection::is_alive)
    }

    #[must_use]
    pub fn state(&self) -> ConnectivityState {
        self.connection
            .lock()
            .as_ref()
            .map_or(ConnectivityState::Shutdown, Connection::state)
    }

    /// Closes the connection and forgets the transmission token. Safe to
    /// call when already disconnected.
    pub fn disconnect(&self) {
        if let Some(connection) = self.connection.lock().take() {
            connection.close();
            debug!(id = %self.id, "disconnected from host");
        }
        *self.transmission_token.lock() = None;
    }

    /// Disconnects if the address changed so the next call dials anew.
    pub fn update_address(&self, address: impl Into<String>) {
        let address = address.into();
        {
            let mut current = self.address.write();
            if *current == address {
                return;
            }
            *current = address;
        }
        self.disconnect();
    }

    #[must_use]
    pub fn transmission_token(&self) -> Option<Token> {
        *self.transmission_token.lock()
    }

    pub fn set_transmission_token(&self, token: Token) {
        *self.transmission_token.lock() = Some(token);
    }

    #[must_use]
    pub fn reception_token(&self) -> Option<Token> {
        *self.reception_token.lock()
    }

    pub fn set_reception_token(&self, token: Token) {
        *self.reception_token.lock() = Some(token);
    }

    /// Whether a handshake must run before the next call.
    #[must_use]
    pub fn authentication_required(&self) -> bool {
        self.params.auth_enabled && self.transmission_token.lock().is_none()
    }

    /// A channel over the live connection, tagged with `sender` and the
    /// transmission token when authentication is enabled.
    pub(crate) fn channel(&self, sender: &Id, timeout: Option<Duration>) -> Result<RpcChannel, Error> {
        let channel = self
            .connection
            .lock()
            .as_ref()
            .map(Connection::channel)
            .ok_or(Error::Disconnected)?;

        let channel = match (self.params.auth_enabled, self.transmission_token()) {
            (true, Some(token)) => channel.with_auth(AuthMetadata::new(*sender, token)),
            _ => channel,
        };

        Ok(match timeout {
            Some(limit) => channel.with_timeout(limit),
            None => channel.without_timeout(),
        })
    }

    /// Counts `err` in the error metric unless it is excluded.
    pub(crate) fn record_error(&self, err: &Error) {
        if !self.params.enable_metrics {
            return;
        }

        let message = err.to_string();
        if !self
            .params
            .excluded_metric_errors
            .iter()
            .any(|excluded| message.contains(excluded.as_str()))
        {
            self.metric.increment();
        }
    }

    /// Feeds a call outcome into the error metric and proxy failure window.
    pub(crate) fn observe<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        let err = match result {
            Ok(value) => {
                let _ = self.proxy_errors.record(false);
                return Ok(value);
            }
            Err(err) => err,
        };

        self.record_error(&err);

        if self
            .proxy_errors
            .record(err.to_string().contains(PROXY_ERROR_MARKER))
        {
            return Err(Error::TooManyProxyErrors {
                id: self.id,
                source: Box::new(err),
            });
        }

        Err(err)
    }

    #[must_use]
    pub const fn metric(&self) -> &Metric {
        &self.metric
    }

    /// Errors counted since the previous snapshot.
    pub fn metrics_snapshot(&self) -> u64 {
        self.metric.snapshot_and_reset()
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.id)
            .field("address", &*self.address.read())
            .field("state", &self.state())
            .field("auth_enabled", &self.params.auth_enabled)
            .finish_non_exhaustive()
    }
}
