//! Splits one listening socket between native RPC (HTTP/2) and web RPC
//! (HTTP/1.1).

use core::future::Future;
use core::pin::{pin, Pin};
use core::task::{Context, Poll};
use core::time::Duration;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Request;
use axum::Router;
use bytes::{Bytes, BytesMut};
use hyper::body::Incoming;
use hyper::server::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceBuilder;
use tracing::{debug, warn};

use crate::matcher::{
    parse_client_hello, record_len, ClientHello, NativeMatcher, TlsMatcher, WebMatcher, RECORD_HEADER_LEN,
};
use crate::router::ConnectionInfo;
use crate::tls::WebCertificate;

const HTTP2_PREFACE_START: &[u8; 3] = b"PRI";
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How connections are told apart.
#[derive(Debug)]
pub(crate) enum Routing {
    Tls {
        native: Arc<ServerConfig>,
        native_matcher: NativeMatcher,
        web: Option<(Arc<WebCertificate>, WebMatcher)>,
    },
    /// No TLS at all: HTTP/2 is recognised by its connection preface.
    Plaintext { web_enabled: bool },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Route {
    Native,
    Web,
}

#[derive(Debug)]
pub(crate) struct Demux {
    pub routing: Routing,
    pub router: Router,
    pub prefix_timeout: Duration,
    /// Stops accepting and asks open connections to wind down.
    pub shutdown: CancellationToken,
    /// Drops connections that did not wind down in time.
    pub abort: CancellationToken,
    pub tracker: TaskTracker,
}

impl Demux {
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, remote) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(%err, "failed to accept connection");
                    sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let demux = Arc::clone(&self);
            drop(self.tracker.spawn(async move {
                if let Err(err) = demux.handle(stream, remote).await {
                    debug!(%remote, %err, "connection closed");
                }
            }));
        }

        debug!("listener stopped");
    }

    async fn handle(&self, mut stream: TcpStream, remote: SocketAddr) -> io::Result<()> {
        match &self.routing {
            Routing::Tls {
                native,
                native_matcher,
                web,
            } => {
                let Some((prefix, hello)) = read_client_hello(&mut stream, self.prefix_timeout).await?
                else {
                    debug!(%remote, "dropping connection without a TLS ClientHello");
                    return Ok(());
                };

                let (config, route) = if native_matcher.matches(&hello) {
                    (Arc::clone(native), Route::Native)
                } else if let Some((certificate, _)) =
                    web.as_ref().filter(|(_, matcher)| matcher.matches(&hello))
                {
                    (certificate.config(), Route::Web)
                } else {
                    debug!(%remote, server_name = ?hello.server_name, alpn = ?hello.alpn, "no route for connection");
                    return Ok(());
                };

                let io = Replay::new(prefix, stream);
                let tls = timeout(self.prefix_timeout, TlsAcceptor::from(config).accept(io))
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tls handshake timed out"))??;

                self.serve(tls, remote, route).await;
            }
            Routing::Plaintext { web_enabled } => {
                let mut prefix = [0; HTTP2_PREFACE_START.len()];
                let _ = timeout(self.prefix_timeout, stream.read_exact(&mut prefix))
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no request prefix"))??;

                let route = if &prefix == HTTP2_PREFACE_START {
                    Route::Native
                } else if *web_enabled {
                    Route::Web
                } else {
                    debug!(%remote, "dropping plaintext connection that is not HTTP/2");
                    return Ok(());
                };

                let io = Replay::new(Bytes::copy_from_slice(&prefix), stream);
                self.serve(io, remote, route).await;
            }
        }

        Ok(())
    }

    async fn serve<I>(&self, io: I, remote: SocketAddr, route: Route)
    where
        I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let info = ConnectionInfo {
            remote,
            web: route == Route::Web,
        };
        let service = ServiceBuilder::new()
            .map_request(move |mut request: Request<Incoming>| {
                let _ = request.extensions_mut().insert(info);
                request
            })
            .service(self.router.clone());
        let service = TowerToHyperService::new(service);
        let io = TokioIo::new(io);

        debug!(%remote, ?route, "serving connection");

        let result = match route {
            Route::Native => {
                let connection = http2::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service);
                self.drive(connection).await
            }
            Route::Web => {
                let connection = http1::Builder::new()
                    .keep_alive(true)
                    .serve_connection(io, service);
                self.drive(connection).await
            }
        };

        if let Err(err) = result {
            debug!(%remote, %err, "connection ended with error");
        }
    }

    async fn drive<C>(&self, connection: C) -> Result<(), hyper::Error>
    where
        C: GracefulConnection,
    {
        let mut connection = pin!(connection);

        tokio::select! {
            result = connection.as_mut() => return result,
            () = self.shutdown.cancelled() => connection.as_mut().graceful_shutdown(),
        }

        tokio::select! {
            result = connection => result,
            () = self.abort.cancelled() => Ok(()),
        }
    }
}

/// Reads one TLS record and parses it as a ClientHello. `Ok(None)` means
/// the peer spoke something else.
async fn read_client_hello(
    stream: &mut TcpStream,
    limit: Duration,
) -> io::Result<Option<(Bytes, ClientHello)>> {
    let read = async {
        let mut header = [0; RECORD_HEADER_LEN];
        let _ = stream.read_exact(&mut header).await?;

        let Some(len) = record_len(&header) else {
            return Ok::<_, io::Error>(None);
        };

        let mut prefix = BytesMut::zeroed(RECORD_HEADER_LEN.saturating_add(len));
        prefix[..RECORD_HEADER_LEN].copy_from_slice(&header);
        let _ = stream.read_exact(&mut prefix[RECORD_HEADER_LEN..]).await?;

        let prefix = prefix.freeze();
        Ok(parse_client_hello(&prefix[RECORD_HEADER_LEN..]).map(|hello| (prefix.clone(), hello)))
    };

    timeout(limit, read)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no ClientHello received"))?
}

/// A hyper connection that can be asked to finish in-flight requests and
/// stop.
trait GracefulConnection: Future<Output = Result<(), hyper::Error>> {
    fn graceful_shutdown(self: Pin<&mut Self>);
}

impl<I, S, E> GracefulConnection for http2::Connection<I, S, E>
where
    Self: Future<Output = Result<(), hyper::Error>>,
    I: hyper::rt::Read + hyper::rt::Write + Unpin,
    S: hyper::service::HttpService<Incoming>,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    S::ResBody: hyper::body::Body + 'static,
    <S::ResBody as hyper::body::Body>::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    E: hyper::rt::bounds::Http2ServerConnExec<S::Future, S::ResBody>,
{
    fn graceful_shutdown(self: Pin<&mut Self>) {
        Self::graceful_shutdown(self);
    }
}

impl<I, S> GracefulConnection for http1::Connection<I, S>
where
    Self: Future<Output = Result<(), hyper::Error>>,
    I: hyper::rt::Read + hyper::rt::Write + Unpin,
    S: hyper::service::HttpService<Incoming>,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    S::ResBody: hyper::body::Body + 'static,
    <S::ResBody as hyper::body::Body>::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn graceful_shutdown(self: Pin<&mut Self>) {
        Self::graceful_shutdown(self);
    }
}

/// Hands already consumed bytes back to the reader before continuing with
/// the socket.
#[derive(Debug)]
struct Replay<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Replay<S> {
    const fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Replay<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.prefix.is_empty() {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }

        let len = this.prefix.len().min(buf.remaining());
        buf.put_slice(&this.prefix.split_to(len));

        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Replay<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
#[path = "tests/mux.rs"]
mod tests;
