//! One TCP port serving native RPC and web RPC, with the generic token
//! service always mounted.

use core::time::Duration;
use std::net::SocketAddr;
use std::sync::Arc;

use eyre::{bail, WrapErr};
use mixcomms_network::ProtoComms;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::{PemPair, ServerConfig};
use crate::matcher::{NativeMatcher, WebMatcher};
use crate::mux::{Demux, Routing};
use crate::tls::{native_config, WebCertificate};

pub mod config;
pub mod matcher;
mod mux;
pub mod router;
pub mod tls;

pub use router::{ConnectionInfo, RpcRequest, RpcRouter};

/// Longest a shutdown waits for open connections before dropping them.
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug)]
pub struct Server;

impl Server {
    /// Binds the listener and starts serving in the background.
    pub async fn start(
        comms: Arc<ProtoComms>,
        config: ServerConfig,
        router: RpcRouter,
    ) -> eyre::Result<ServerHandle> {
        let (routing, web_certificate) = match &config.tls {
            Some(paths) => {
                let native_pem = paths.load()?;
                let (native, names) = native_config(&native_pem)
                    .wrap_err("failed to load native rpc certificate")?;

                let web = if config.web.enabled {
                    let web_pem = match &config.web.tls {
                        Some(paths) => paths.load()?,
                        None => native_pem,
                    };
                    let certificate = Arc::new(
                        WebCertificate::from_pem(&web_pem)
                            .wrap_err("failed to load web rpc certificate")?,
                    );
                    let matcher =
                        WebMatcher::new(Arc::clone(&certificate), comms.id().dns_prefix());
                    Some((certificate, matcher))
                } else {
                    None
                };
                let web_certificate = web.as_ref().map(|(certificate, _)| Arc::clone(certificate));

                let routing = Routing::Tls {
                    native,
                    native_matcher: NativeMatcher::new(names, config.default_domains.clone()),
                    web,
                };

                (routing, web_certificate)
            }
            None if cfg!(feature = "testing") && comms.registry().is_insecure() => {
                warn!("serving without transport security");
                let routing = Routing::Plaintext {
                    web_enabled: config.web.enabled,
                };

                (routing, None)
            }
            None => bail!("a native rpc certificate is required"),
        };

        let listener = TcpListener::bind(config.listen)
            .await
            .wrap_err_with(|| format!("failed to bind {}", config.listen))?;
        let local_addr = listener.local_addr()?;

        let web_enabled = match &routing {
            Routing::Tls { web, .. } => web.is_some(),
            Routing::Plaintext { web_enabled } => *web_enabled,
        };

        let demux = Arc::new(Demux {
            routing,
            router: router.into_router(),
            prefix_timeout: config.prefix_timeout,
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        drop(demux.tracker.spawn(Arc::clone(&demux).run(listener)));

        info!(
            id = %comms.id(),
            %local_addr,
            web = web_enabled,
            "server listening"
        );

        Ok(ServerHandle {
            local_addr,
            web_certificate,
            demux,
        })
    }
}

#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    web_certificate: Option<Arc<WebCertificate>>,
    demux: Arc<Demux>,
}

impl ServerHandle {
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Replaces the web RPC certificate. New connections use it at once.
    pub fn set_web_certificate(&self, pair: &PemPair) -> eyre::Result<()> {
        let Some(certificate) = &self.web_certificate else {
            bail!("web rpc is not enabled with tls");
        };

        certificate.replace(pair)
    }

    /// Stops accepting, lets open connections finish within
    /// [`GRACEFUL_STOP_TIMEOUT`] and drops the rest.
    pub async fn shutdown(self) {
        info!(local_addr = %self.local_addr, "server stopping");

        let demux = &self.demux;
        demux.shutdown.cancel();
        let _ = demux.tracker.close();

        if timeout(GRACEFUL_STOP_TIMEOUT, demux.tracker.wait()).await.is_err() {
            warn!(
                remaining = demux.tracker.len(),
                "connections did not close in time, dropping them"
            );
            demux.abort.cancel();
            demux.tracker.wait().await;
        }

        info!(local_addr = %self.local_addr, "server stopped");
    }
}
