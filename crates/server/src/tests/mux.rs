use eyre::Result as EyreResult;
use mixcomms_crypto::PrivateKey;
use mixcomms_network::connection::DialTarget;
use mixcomms_network::{CommsConfig, Connection, ConnectionType, ProtoComms};
use mixcomms_primitives::messages::{AssignToken, Ping, REQUEST_TOKEN_PATH};
use mixcomms_primitives::{Id, IdType};
use tokio::io::AsyncWriteExt;

use super::*;
use crate::router::RpcRouter;

const NODE_KEY: &[u8] = include_bytes!("../../../../testdata/node.key");

async fn plaintext(web_enabled: bool) -> EyreResult<(Arc<Demux>, SocketAddr)> {
    let comms = ProtoComms::new(
        Id::new([2; 32], IdType::Node),
        PrivateKey::from_pem(NODE_KEY)?,
        CommsConfig::default(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let demux = Arc::new(Demux {
        routing: Routing::Plaintext { web_enabled },
        router: RpcRouter::new(Arc::new(comms)).into_router(),
        prefix_timeout: Duration::from_secs(1),
        shutdown: CancellationToken::new(),
        abort: CancellationToken::new(),
        tracker: TaskTracker::new(),
    });
    drop(demux.tracker.spawn(Arc::clone(&demux).run(listener)));

    Ok((demux, addr))
}

async fn request_token(kind: ConnectionType, addr: SocketAddr) -> EyreResult<AssignToken> {
    let address = addr.to_string();
    let connection = Connection::dial(
        kind,
        DialTarget {
            address: &address,
            credentials: None,
            timeout: Duration::from_secs(1),
        },
    )
    .await?;

    Ok(connection
        .channel()
        .unary(REQUEST_TOKEN_PATH, &Ping {})
        .await?)
}

async fn stop(demux: &Demux) {
    demux.shutdown.cancel();
    let _ = demux.tracker.close();
    demux.abort.cancel();
    demux.tracker.wait().await;
}

#[tokio::test]
async fn test_replay_yields_prefix_then_stream() {
    let rest: &[u8] = b" world";
    let mut io = Replay::new(Bytes::from_static(b"hello"), rest);

    let mut out = String::new();
    let _ = io.read_to_string(&mut out).await.unwrap();

    assert_eq!(out, "hello world");
}

#[tokio::test]
async fn test_plaintext_routes_by_preface() -> EyreResult<()> {
    let (demux, addr) = plaintext(true).await?;

    let native = request_token(ConnectionType::Native, addr).await?;
    let web = request_token(ConnectionType::Web, addr).await?;

    assert_eq!(native.token.len(), 32);
    assert_eq!(web.token.len(), 32);

    stop(&demux).await;
    Ok(())
}

#[tokio::test]
async fn test_plaintext_drops_http1_without_web() -> EyreResult<()> {
    let (demux, addr) = plaintext(false).await?;

    assert!(
        request_token(ConnectionType::Native, addr).await.is_ok(),
        "native still served"
    );
    assert!(
        request_token(ConnectionType::Web, addr).await.is_err(),
        "web connection dropped"
    );

    stop(&demux).await;
    Ok(())
}

#[tokio::test]
async fn test_tls_drops_connections_without_client_hello() -> EyreResult<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (native, names) = crate::tls::native_config(&crate::config::PemPaths::new(
        concat!(env!("CARGO_MANIFEST_DIR"), "/../../testdata/node.crt"),
        concat!(env!("CARGO_MANIFEST_DIR"), "/../../testdata/node.key"),
    )
    .load()?)?;

    let demux = Arc::new(Demux {
        routing: Routing::Tls {
            native,
            native_matcher: NativeMatcher::new(names, Vec::new()),
            web: None,
        },
        router: Router::new(),
        prefix_timeout: Duration::from_secs(1),
        shutdown: CancellationToken::new(),
        abort: CancellationToken::new(),
        tracker: TaskTracker::new(),
    });
    drop(demux.tracker.spawn(Arc::clone(&demux).run(listener)));

    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(b"GET /").await?;

    let mut buf = Vec::new();
    let read = stream.read_to_end(&mut buf).await?;
    assert_eq!(read, 0, "closed without a reply");

    stop(&demux).await;
    Ok(())
}
