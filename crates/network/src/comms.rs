use core::future::Future;
use core::time::Duration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mixcomms_crypto::{PrivateKey, PublicKey};
use mixcomms_primitives::messages::{AuthenticatedMessage, ClientId};
use mixcomms_primitives::{Id, Token};
use prost::Message;
use tracing::warn;

use crate::codec::MessageStream;
use crate::config::{CommsConfig, HostParams};
use crate::connection::RpcChannel;
use crate::host::Host;
use crate::registry::HostRegistry;
use crate::token_store::TokenStore;
use crate::transmit::{transmit, Link};
use crate::Error;

/// The entry point of this crate: our identity and key, the peers we know
/// and the tokens we have handed out.
#[derive(Debug)]
pub struct ProtoComms {
    id: Id,
    private_key: PrivateKey,
    salt: Option<Vec<u8>>,
    tokens: TokenStore,
    registry: HostRegistry,
    config: CommsConfig,
    auth_signatures_disabled: AtomicBool,
}

impl ProtoComms {
    #[must_use]
    pub fn new(id: Id, private_key: PrivateKey, config: CommsConfig) -> Self {
        Self {
            id,
            private_key,
            salt: None,
            tokens: TokenStore::new(config.token_ttl),
            registry: HostRegistry::new(),
            config,
            auth_signatures_disabled: AtomicBool::new(false),
        }
    }

    /// Marks this process as a dynamic client whose id derives from its
    /// public key and `salt`. The pair travels with every handshake so
    /// receivers that have never heard of us can check the claim.
    #[must_use]
    pub fn with_salt(mut self, salt: Vec<u8>) -> Self {
        self.salt = Some(salt);
        self
    }

    /// Allows hosts without certificates.
    ///
    /// # Panics
    ///
    /// Unless built with the `testing` feature.
    pub fn disable_tls(&self) {
        assert!(
            cfg!(feature = "testing"),
            "transport security can only be disabled in test builds"
        );
        warn!("transport security disabled");
        self.registry.allow_insecure();
    }

    /// Skips signing and signature checks in the token handshake.
    ///
    /// # Panics
    ///
    /// Unless built with the `testing` feature.
    pub fn disable_auth_signatures(&self) {
        assert!(
            cfg!(feature = "testing"),
            "handshake signatures can only be disabled in test builds"
        );
        warn!("handshake signatures disabled");
        self.auth_signatures_disabled.store(true, Ordering::Release);
    }

    pub(crate) fn auth_signatures_disabled(&self) -> bool {
        self.auth_signatures_disabled.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn id(&self) -> &Id {
        &self.id
    }

    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.private_key.public_key()
    }

    #[must_use]
    pub const fn config(&self) -> &CommsConfig {
        &self.config
    }

    #[must_use]
    pub const fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn token_store(&self) -> &TokenStore {
        &self.tokens
    }

    /// Registers `id`, with the configured default parameters if `params`
    /// is `None`.
    pub fn add_host(
        &self,
        id: Id,
        address: &str,
        certificate: Option<&[u8]>,
        params: Option<HostParams>,
    ) -> Result<Arc<Host>, Error> {
        let params = params.unwrap_or_else(|| self.config.host_params.clone());

        self.registry.add_host(id, address, certificate, params)
    }

    #[must_use]
    pub fn get_host(&self, id: &Id) -> Option<Arc<Host>> {
        self.registry.get_host(id)
    }

    pub fn remove_host(&self, id: &Id) -> Option<Arc<Host>> {
        self.registry.remove_host(id)
    }

    #[must_use]
    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.registry.hosts()
    }

    /// Closes every outbound connection.
    pub fn shutdown(&self) {
        self.registry.disconnect_all();
    }

    /// Runs a unary call against `host` bounded by its send timeout,
    /// reconnecting and re-authenticating as needed.
    pub async fn send<T, F, Fut>(&self, host: &Host, operation: F) -> Result<T, Error>
    where
        F: FnMut(RpcChannel) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let timeout = host.params().send_timeout;
        transmit(&self.link(host, Some(timeout)), operation).await
    }

    /// Like [`send`](Self::send), bounded by the longer messaging timeout.
    pub async fn send_messaging<T, F, Fut>(&self, host: &Host, operation: F) -> Result<T, Error>
    where
        F: FnMut(RpcChannel) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let timeout = host.params().messaging_timeout;
        transmit(&self.link(host, Some(timeout)), operation).await
    }

    /// Opens a server stream. Channels carry no timeout; the caller ends
    /// the stream through its cancellation token.
    pub async fn stream<T, F, Fut>(&self, host: &Host, operation: F) -> Result<MessageStream<T>, Error>
    where
        F: FnMut(RpcChannel) -> Fut,
        Fut: Future<Output = Result<MessageStream<T>, Error>>,
    {
        transmit(&self.link(host, None), operation).await
    }

    const fn link<'a>(&'a self, host: &'a Host, timeout: Option<Duration>) -> HostLink<'a> {
        HostLink {
            comms: self,
            host,
            timeout,
        }
    }

    /// Signs `payload` for `recipient`.
    pub fn sign(&self, payload: &[u8], recipient: &Id) -> Result<Vec<u8>, Error> {
        Ok(mixcomms_crypto::sign(&self.private_key, payload, recipient)?)
    }

    /// Wraps `message` in a signed envelope addressed to `recipient`.
    pub fn pack_authenticated_message<M: Message>(
        &self,
        message: &M,
        recipient: &Id,
        token: Token,
    ) -> Result<AuthenticatedMessage, Error> {
        let message = message.encode_to_vec();

        let signature = if self.auth_signatures_disabled() {
            Vec::new()
        } else {
            self.sign(&message, recipient)?
        };

        let client = self.salt.as_ref().map(|salt| ClientId {
            salt: salt.clone(),
            public_key: self.public_key().as_der().to_vec(),
        });

        Ok(AuthenticatedMessage {
            id: self.id.to_vec(),
            signature,
            token: token.to_vec(),
            client,
            message,
        })
    }
}

struct HostLink<'a> {
    comms: &'a ProtoComms,
    host: &'a Host,
    timeout: Option<Duration>,
}

impl Link for HostLink<'_> {
    type Channel = RpcChannel;

    fn id(&self) -> &Id {
        self.host.id()
    }

    fn has_address(&self) -> bool {
        self.host.has_address()
    }

    async fn establish(&self) -> Result<RpcChannel, Error> {
        {
            let _guard = self.host.lock_transition().await;

            self.host.dial_locked().await?;

            if self.host.authentication_required() {
                self.comms
                    .client_handshake(self.host)
                    .await
                    .map_err(|err| Error::Handshake {
                        id: *self.host.id(),
                        source: Box::new(err),
                    })?;
            }
        }

        self.host.channel(self.comms.id(), self.timeout)
    }

    fn reset(&self) {
        self.host.disconnect();
    }

    fn record_failure(&self, err: &Error) {
        self.host.record_error(err);
    }

    fn observe<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        self.host.observe(result)
    }
}
