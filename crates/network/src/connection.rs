#[cfg(test)]
#[path = "tests/connection.rs"]
mod tests;

use core::future::Future;
use core::time::Duration;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, TE};
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo};
use mixcomms_primitives::{Code, Status};
use parking_lot::Mutex;
use prost::Message;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::{
    encode_frame, read_unary, status_from_headers, AuthMetadata, MessageStream,
    GRPC_CONTENT_TYPE, GRPC_WEB_CONTENT_TYPE,
};
use crate::config::ConnectionType;
use crate::credentials::Credentials;
use crate::error::connect_error;
use crate::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl ConnectivityState {
    #[must_use]
    pub const fn is_alive(self) -> bool {
        matches!(self, Self::Idle | Self::Connecting | Self::Ready)
    }
}

/// Where and how to dial.
#[derive(Clone, Copy, Debug)]
pub struct DialTarget<'a> {
    pub address: &'a str,
    /// Plain TCP when absent.
    pub credentials: Option<&'a Credentials>,
    pub timeout: Duration,
}

trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

type BoxedIo = Box<dyn Io>;

type RequestBody = Full<Bytes>;

/// A live transport to one peer. A host is configured for exactly one
/// variant for its whole lifetime.
#[derive(Debug)]
pub enum Connection {
    NativeRpc(NativeConnection),
    WebRpc(WebConnection),
}

impl Connection {
    /// Connects and completes the HTTP handshake within `target.timeout`.
    pub async fn dial(kind: ConnectionType, target: DialTarget<'_>) -> Result<Self, Error> {
        let dial = async {
            let io = connect_io(kind, &target).await?;
            let scheme = if target.credentials.is_some() {
                "https"
            } else {
                "http"
            };

            match kind {
                ConnectionType::Native => {
                    NativeConnection::handshake(io, target.address, scheme)
                        .await
                        .map(Self::NativeRpc)
                }
                ConnectionType::Web => WebConnection::handshake(io, target.address, scheme)
                    .await
                    .map(Self::WebRpc),
            }
        };

        timeout(target.timeout, dial)
            .await
            .map_err(|_| Error::DeadlineExceeded)?
    }

    #[must_use]
    pub const fn kind(&self) -> ConnectionType {
        match self {
            Self::NativeRpc(_) => ConnectionType::Native,
            Self::WebRpc(_) => ConnectionType::Web,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectivityState {
        self.driver().state()
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.state().is_alive()
    }

    pub fn close(&self) {
        self.driver().close();
    }

    #[must_use]
    pub fn channel(&self) -> RpcChannel {
        match self {
            Self::NativeRpc(conn) => conn.channel(),
            Self::WebRpc(conn) => conn.channel(),
        }
    }

    /// # Panics
    ///
    /// If this is a web connection.
    #[must_use]
    pub fn native(&self) -> &NativeConnection {
        match self {
            Self::NativeRpc(conn) => conn,
            Self::WebRpc(_) => panic!("web connection used as a native rpc connection"),
        }
    }

    /// # Panics
    ///
    /// If this is a native connection.
    #[must_use]
    pub fn web(&self) -> &WebConnection {
        match self {
            Self::WebRpc(conn) => conn,
            Self::NativeRpc(_) => panic!("native rpc connection used as a web connection"),
        }
    }

    const fn driver(&self) -> &Driver {
        match self {
            Self::NativeRpc(conn) => &conn.driver,
            Self::WebRpc(conn) => &conn.driver,
        }
    }
}

async fn connect_io(kind: ConnectionType, target: &DialTarget<'_>) -> Result<BoxedIo, Error> {
    let tcp = TcpStream::connect(target.address)
        .await
        .map_err(connect_error)?;
    tcp.set_nodelay(true)?;

    let Some(credentials) = target.credentials else {
        return Ok(Box::new(tcp));
    };

    let tls = TlsConnector::from(credentials.client_config(kind))
        .connect(credentials.server_name().clone(), tcp)
        .await
        .map_err(connect_error)?;

    Ok(Box::new(tls))
}

/// Background task driving the HTTP connection, and the state it reports.
#[derive(Debug)]
struct Driver {
    state: Arc<Mutex<ConnectivityState>>,
    task: JoinHandle<()>,
}

impl Driver {
    fn spawn<F, E>(address: &str, connection: F) -> Self
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: core::fmt::Display + Send + 'static,
    {
        let state = Arc::new(Mutex::new(ConnectivityState::Ready));
        let address = address.to_owned();

        let task = tokio::spawn({
            let state = Arc::clone(&state);
            async move {
                let next = match connection.await {
                    Ok(()) => ConnectivityState::Shutdown,
                    Err(err) => {
                        debug!(%address, %err, "connection terminated");
                        ConnectivityState::TransientFailure
                    }
                };
                *state.lock() = next;
            }
        });

        Self { state, task }
    }

    fn state(&self) -> ConnectivityState {
        *self.state.lock()
    }

    fn close(&self) {
        self.task.abort();
        *self.state.lock() = ConnectivityState::Shutdown;
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// HTTP/2 connection carrying native RPC calls.
#[derive(Debug)]
pub struct NativeConnection {
    sender: http2::SendRequest<RequestBody>,
    authority: String,
    scheme: &'static str,
    driver: Driver,
}

impl NativeConnection {
    async fn handshake(io: BoxedIo, address: &str, scheme: &'static str) -> Result<Self, Error> {
        let (sender, connection) =
            http2::handshake(TokioExecutor::new(), TokioIo::new(io)).await?;

        Ok(Self {
            sender,
            authority: address.to_owned(),
            scheme,
            driver: Driver::spawn(address, connection),
        })
    }

    #[must_use]
    pub fn channel(&self) -> RpcChannel {
        RpcChannel {
            transport: Transport::Native(self.sender.clone()),
            authority: self.authority.clone(),
            scheme: self.scheme,
            auth: None,
            timeout: None,
        }
    }
}

/// HTTP/1.1 connection carrying web RPC calls. Calls are serialized.
#[derive(Debug)]
pub struct WebConnection {
    sender: Arc<tokio::sync::Mutex<http1::SendRequest<RequestBody>>>,
    authority: String,
    scheme: &'static str,
    driver: Driver,
}

impl WebConnection {
    async fn handshake(io: BoxedIo, address: &str, scheme: &'static str) -> Result<Self, Error> {
        let (sender, connection) = http1::handshake(TokioIo::new(io)).await?;

        Ok(Self {
            sender: Arc::new(tokio::sync::Mutex::new(sender)),
            authority: address.to_owned(),
            scheme,
            driver: Driver::spawn(address, connection),
        })
    }

    #[must_use]
    pub fn channel(&self) -> RpcChannel {
        RpcChannel {
            transport: Transport::Web(Arc::clone(&self.sender)),
            authority: self.authority.clone(),
            scheme: self.scheme,
            auth: None,
            timeout: None,
        }
    }
}

#[derive(Clone, Debug)]
enum Transport {
    Native(http2::SendRequest<RequestBody>),
    Web(Arc<tokio::sync::Mutex<http1::SendRequest<RequestBody>>>),
}

/// Handle for issuing calls over a [`Connection`]. Cheap to clone.
#[derive(Clone, Debug)]
pub struct RpcChannel {
    transport: Transport,
    authority: String,
    scheme: &'static str,
    auth: Option<AuthMetadata>,
    timeout: Option<Duration>,
}

impl RpcChannel {
    /// Attaches sender id and transmission token to every call.
    #[must_use]
    pub const fn with_auth(mut self, auth: AuthMetadata) -> Self {
        self.auth = Some(auth);
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    #[must_use]
    pub const fn auth(&self) -> Option<&AuthMetadata> {
        self.auth.as_ref()
    }

    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub async fn unary<Req, Resp>(&self, path: &str, request: &Req) -> Result<Resp, Error>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let call = async {
            let response = self.call(path, request).await?;
            read_unary(response.into_body()).await
        };

        match self.timeout {
            Some(limit) => timeout(limit, call)
                .await
                .map_err(|_| Error::DeadlineExceeded)?,
            None => call.await,
        }
    }

    /// Starts a server-streaming call. The timeout, if any, bounds only the
    /// wait for response headers; `cancel` ends the stream.
    pub async fn server_streaming<Req, Resp>(
        &self,
        path: &str,
        request: &Req,
        cancel: CancellationToken,
    ) -> Result<MessageStream<Resp>, Error>
    where
        Req: Message,
        Resp: Message + Default + 'static,
    {
        let response = match self.timeout {
            Some(limit) => timeout(limit, self.call(path, request))
                .await
                .map_err(|_| Error::DeadlineExceeded)?,
            None => self.call(path, request).await,
        }?;

        Ok(MessageStream::from_body(response.into_body(), cancel))
    }

    async fn call<Req: Message>(&self, path: &str, request: &Req) -> Result<Response<Incoming>, Error> {
        let body = Full::new(encode_frame(request)?);

        let builder = match self.transport {
            Transport::Native(_) => Request::post(format!(
                "{}://{}{path}",
                self.scheme, self.authority
            ))
            .header(CONTENT_TYPE, GRPC_CONTENT_TYPE)
            .header(TE, "trailers"),
            Transport::Web(_) => Request::post(path)
                .header(HOST, self.authority.as_str())
                .header(CONTENT_TYPE, GRPC_WEB_CONTENT_TYPE)
                .header("x-grpc-web", "1"),
        };

        let mut request = builder.body(body)?;
        if let Some(auth) = &self.auth {
            auth.apply(request.headers_mut())?;
        }

        let response = match &self.transport {
            Transport::Native(sender) => {
                let mut sender = sender.clone();
                sender.ready().await?;
                sender.send_request(request).await?
            }
            Transport::Web(sender) => {
                let mut sender = sender.lock().await;
                sender.ready().await?;
                sender.send_request(request).await?
            }
        };

        check_response_head(&response)?;

        Ok(response)
    }
}

/// Rejects non-200 responses and trailers-only error responses.
fn check_response_head<B>(response: &Response<B>) -> Result<(), Status> {
    let status = response.status();
    if status != StatusCode::OK {
        let code = match status {
            StatusCode::BAD_REQUEST => Code::Internal,
            StatusCode::UNAUTHORIZED => Code::Unauthenticated,
            StatusCode::FORBIDDEN => Code::PermissionDenied,
            StatusCode::NOT_FOUND => Code::Unimplemented,
            StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => Code::Unavailable,
            _ => Code::Unknown,
        };
        return Err(Status::new(code, format!("unexpected http status {status}")));
    }

    match status_from_headers(response.headers()) {
        Some(result) => result,
        None => Ok(()),
    }
}
