use core::time::Duration;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use eyre::Result as EyreResult;
use futures_util::StreamExt;
use mixcomms_crypto::PrivateKey;
use mixcomms_network::config::ProxyErrorMetricParams;
use mixcomms_network::{CommsConfig, ConnectionType, Error, Host, HostParams, ProtoComms};
use mixcomms_primitives::messages::{AssignToken, Ping};
use mixcomms_primitives::{Id, IdType, Status, Token};
use mixcomms_server::config::{PemPaths, ServerConfig, WebConfig};
use mixcomms_server::{RpcRequest, RpcRouter, Server, ServerHandle, GRACEFUL_STOP_TIMEOUT};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const WHOAMI_PATH: &str = "/test.Identity/Whoami";
const SECRET_PATH: &str = "/test.Identity/Secret";
const COUNT_PATH: &str = "/test.Identity/Count";
const RELAY_PATH: &str = "/test.Identity/Relay";

#[derive(Clone, PartialEq, prost::Message)]
struct Whoami {
    #[prost(bool, tag = "1")]
    authenticated: bool,
    #[prost(bytes = "vec", tag = "2")]
    sender: Vec<u8>,
    #[prost(string, tag = "3")]
    reason: String,
    #[prost(bool, tag = "4")]
    web: bool,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn testdata(file: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../testdata")
        .join(file)
}

fn pem(name: &str) -> PemPaths {
    PemPaths::new(testdata(&format!("{name}.crt")), testdata(&format!("{name}.key")))
}

fn comms(id: Id, key: &str) -> EyreResult<Arc<ProtoComms>> {
    let key = PrivateKey::from_pem(&fs::read(testdata(key))?)?;

    Ok(Arc::new(ProtoComms::new(id, key, CommsConfig::default())))
}

fn whoami(comms: &ProtoComms, request: &RpcRequest<Ping>) -> Whoami {
    let auth = request.authenticate(comms);

    Whoami {
        authenticated: auth.is_authenticated,
        sender: auth.sender.map(|host| host.id().to_vec()).unwrap_or_default(),
        reason: auth.reason,
        web: request.web,
    }
}

fn params() -> HostParams {
    HostParams {
        max_retries: 1,
        auth_enabled: true,
        ..HostParams::default()
    }
}

struct Fixture {
    server: Arc<ProtoComms>,
    client: Arc<ProtoComms>,
    handle: ServerHandle,
}

impl Fixture {
    async fn start(web: Option<PemPaths>) -> EyreResult<Self> {
        init_tracing();

        let server = comms(Id::new([2; 32], IdType::Node), "node.key")?;
        let client = comms(Id::new([3; 32], IdType::Gateway), "client.key")?;

        let client_cert = fs::read(testdata("client.crt"))?;
        let _host = server.add_host(*client.id(), "", Some(&client_cert), None)?;

        let router = RpcRouter::new(Arc::clone(&server))
            .unary(WHOAMI_PATH, {
                let comms = Arc::clone(&server);
                move |request: RpcRequest<Ping>| {
                    let comms = Arc::clone(&comms);
                    async move { Ok::<_, Status>(whoami(&comms, &request)) }
                }
            })
            .unary(SECRET_PATH, {
                let comms = Arc::clone(&server);
                move |request: RpcRequest<Ping>| {
                    let comms = Arc::clone(&comms);
                    async move {
                        let auth = request.authenticate(&comms);
                        let _sender = auth.require()?;
                        Ok::<_, Status>(whoami(&comms, &request))
                    }
                }
            })
            .unary(RELAY_PATH, |_: RpcRequest<Ping>| async {
                Err::<Ping, _>(Status::unavailable("could not reach target host"))
            })
            .server_streaming(COUNT_PATH, |_: RpcRequest<Ping>| async {
                let tokens = (1..=3_u8).map(|n| Ok(AssignToken { token: vec![n] }));
                Ok(futures_util::stream::iter(tokens))
            });

        let mut config = ServerConfig::new(([127, 0, 0, 1], 0).into(), Some(pem("node")));
        config.web = WebConfig::new(web.is_some(), web);

        let handle = Server::start(Arc::clone(&server), config, router).await?;

        Ok(Self {
            server,
            client,
            handle,
        })
    }

    fn connect(
        &self,
        cert: &str,
        connection_type: ConnectionType,
        server_name: Option<&str>,
    ) -> EyreResult<Arc<Host>> {
        self.connect_with(
            cert,
            HostParams {
                connection_type,
                server_name: server_name.map(ToOwned::to_owned),
                ..params()
            },
        )
    }

    fn connect_with(&self, cert: &str, params: HostParams) -> EyreResult<Arc<Host>> {
        let _old = self.client.remove_host(self.server.id());
        let certificate = fs::read(testdata(cert))?;

        Ok(self.client.add_host(
            *self.server.id(),
            &self.handle.local_addr().to_string(),
            Some(&certificate),
            Some(params),
        )?)
    }

    async fn call(&self, host: &Host, path: &'static str) -> EyreResult<Whoami> {
        let reply = self
            .client
            .send(host, |channel| async move { channel.unary(path, &Ping {}).await })
            .await?;

        Ok(reply)
    }
}

#[tokio::test]
async fn test_authenticated_native_call() -> EyreResult<()> {
    let fixture = Fixture::start(None).await?;
    let host = fixture.connect("node.crt", ConnectionType::Native, None)?;

    let reply = fixture.call(&host, WHOAMI_PATH).await?;

    assert!(reply.authenticated, "{}", reply.reason);
    assert_eq!(reply.sender, fixture.client.id().to_vec());
    assert!(!reply.web, "served over native rpc");
    assert!(host.transmission_token().is_some(), "handshake stored a token");

    fixture.handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_tampered_token_is_reported_then_healed() -> EyreResult<()> {
    let fixture = Fixture::start(None).await?;
    let host = fixture.connect("node.crt", ConnectionType::Native, None)?;

    let _reply = fixture.call(&host, WHOAMI_PATH).await?;
    host.set_transmission_token(Token::from_array([9; 32]));

    let reply = fixture.call(&host, WHOAMI_PATH).await?;
    assert!(!reply.authenticated, "tampered token must not authenticate");
    assert!(!reply.reason.is_empty(), "rejection carries a reason");

    let reply = fixture.call(&host, SECRET_PATH).await?;
    assert!(reply.authenticated, "{}", reply.reason);
    assert_ne!(host.transmission_token(), Some(Token::from_array([9; 32])));

    fixture.handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_server_streaming_call() -> EyreResult<()> {
    let fixture = Fixture::start(None).await?;
    let host = fixture.connect("node.crt", ConnectionType::Native, None)?;
    let cancel = CancellationToken::new();

    let stream = fixture
        .client
        .stream(&host, |channel| {
            let cancel = cancel.clone();
            async move {
                channel
                    .server_streaming::<_, AssignToken>(COUNT_PATH, &Ping {}, cancel)
                    .await
            }
        })
        .await?;

    let tokens = stream
        .map(|message| message.map(|message| message.token))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    assert_eq!(tokens, [vec![1], vec![2], vec![3]]);

    fixture.handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_repeated_proxy_failures_trip_the_cutoff() -> EyreResult<()> {
    let fixture = Fixture::start(None).await?;
    let host = fixture.connect_with(
        "node.crt",
        HostParams {
            proxy_error_metric: ProxyErrorMetricParams {
                cutoff: 0.5,
                window: 4,
            },
            ..params()
        },
    )?;

    let mut tripped = 0;
    for call in 1..=8 {
        let result = fixture
            .client
            .send(&host, |channel| async move {
                channel.unary::<_, Ping>(RELAY_PATH, &Ping {}).await
            })
            .await;

        match result {
            Err(Error::TooManyProxyErrors { .. }) => tripped += 1,
            Err(Error::Status(status)) => {
                assert!(call < 4, "call {call} should trip once the window is full: {status}");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    assert_eq!(tripped, 5, "every call after the window fills is rewritten");
    assert_eq!(host.metric().errors(), 8);

    fixture.handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_web_rpc_on_the_same_port() -> EyreResult<()> {
    let fixture = Fixture::start(Some(pem("web"))).await?;

    let web = fixture.connect("web.crt", ConnectionType::Web, Some("abc.web.mixcomms.test"))?;
    let reply = fixture.call(&web, WHOAMI_PATH).await?;
    assert!(reply.authenticated, "{}", reply.reason);
    assert!(reply.web, "served over web rpc");

    let native = fixture.connect("node.crt", ConnectionType::Native, None)?;
    let reply = fixture.call(&native, WHOAMI_PATH).await?;
    assert!(reply.authenticated, "{}", reply.reason);
    assert!(!reply.web, "served over native rpc");

    fixture.handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_web_certificate_swap() -> EyreResult<()> {
    let fixture = Fixture::start(Some(pem("web"))).await?;

    fixture.handle.set_web_certificate(&pem("gateway").load()?)?;

    let swapped = fixture.connect("gateway.crt", ConnectionType::Web, None)?;
    let reply = fixture.call(&swapped, WHOAMI_PATH).await?;
    assert!(reply.web, "served over web rpc");

    let stale = fixture.connect("web.crt", ConnectionType::Web, Some("abc.web.mixcomms.test"))?;
    assert!(
        fixture.call(&stale, WHOAMI_PATH).await.is_err(),
        "old certificate is no longer served"
    );

    fixture.handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_web_certificate_swap_needs_web() -> EyreResult<()> {
    let fixture = Fixture::start(None).await?;

    assert!(
        fixture
            .handle
            .set_web_certificate(&pem("gateway").load()?)
            .is_err(),
        "no web listener to update"
    );

    fixture.handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_closes_connections() -> EyreResult<()> {
    let fixture = Fixture::start(None).await?;
    let host = fixture.connect("node.crt", ConnectionType::Native, None)?;
    let _reply = fixture.call(&host, WHOAMI_PATH).await?;

    let addr = fixture.handle.local_addr();
    timeout(
        GRACEFUL_STOP_TIMEOUT.saturating_add(Duration::from_secs(1)),
        fixture.handle.shutdown(),
    )
    .await?;

    assert!(
        tokio::net::TcpStream::connect(addr).await.is_err(),
        "listener is closed"
    );

    Ok(())
}
