//! Maps RPC paths to handlers and speaks both framings on the way in and
//! out.

#[cfg(test)]
#[path = "tests/router.rs"]
mod tests;

use core::convert::Infallible;
use core::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, StatusCode};
use http_body_util::StreamBody;
use hyper::body::Frame as BodyFrame;
use mixcomms_network::codec::{
    encode_frame, encode_trailer_frame, status_headers, Frame, FrameDecoder, GRPC_CONTENT_TYPE,
    GRPC_WEB_CONTENT_TYPE, MAX_FRAME_LEN,
};
use mixcomms_network::{Auth, ProtoComms};
use mixcomms_primitives::messages::{
    Ack, AuthenticatedMessage, Ping, AUTHENTICATE_TOKEN_PATH, REQUEST_TOKEN_PATH,
};
use mixcomms_primitives::Status;
use prost::Message;
use tracing::debug;

/// Attached to every request by the connection that carried it.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionInfo {
    pub remote: SocketAddr,
    pub web: bool,
}

/// A decoded inbound call.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct RpcRequest<T> {
    pub message: T,
    pub metadata: HeaderMap,
    pub source: Option<IpAddr>,
    /// Whether the call arrived over web RPC.
    pub web: bool,
}

impl<T> RpcRequest<T> {
    /// Checks the sender id and token in the call metadata.
    #[must_use]
    pub fn authenticate(&self, comms: &ProtoComms) -> Auth {
        comms.authenticated_receiver_from_metadata(&self.metadata, self.source)
    }
}

/// Routes for one server. The generic bootstrap service is always
/// mounted.
#[derive(Clone, Debug)]
pub struct RpcRouter {
    router: Router,
}

impl RpcRouter {
    #[must_use]
    pub fn new(comms: Arc<ProtoComms>) -> Self {
        let request_token = {
            let comms = Arc::clone(&comms);
            move |_: RpcRequest<Ping>| {
                let comms = Arc::clone(&comms);
                async move { Ok(comms.request_token()) }
            }
        };

        let authenticate_token = move |request: RpcRequest<AuthenticatedMessage>| {
            let comms = Arc::clone(&comms);
            async move {
                match comms.validate_token(&request.message) {
                    Ok(_) => Ok(Ack::default()),
                    Err(err) => {
                        debug!(source = ?request.source, %err, "token validation failed");
                        Err(Status::unauthenticated(err.to_string()))
                    }
                }
            }
        };

        Self {
            router: Router::new().fallback(unimplemented),
        }
        .unary(REQUEST_TOKEN_PATH, request_token)
        .unary(AUTHENTICATE_TOKEN_PATH, authenticate_token)
    }

    #[must_use]
    pub fn unary<Req, Resp, H, Fut>(mut self, path: &str, handler: H) -> Self
    where
        Req: Message + Default + 'static,
        Resp: Message + 'static,
        H: Fn(RpcRequest<Req>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        self.router = self.router.route(
            path,
            post(move |request: Request| {
                let handler = handler.clone();
                async move {
                    let (request, web) = match decode_request::<Req>(request).await {
                        Ok(decoded) => decoded,
                        Err(response) => return response,
                    };

                    match handler(request).await.and_then(|resp| data_frame(&resp)) {
                        Ok(frame) => unary_response(frame, web),
                        Err(status) => status_response(&status, web),
                    }
                }
            }),
        );
        self
    }

    #[must_use]
    pub fn server_streaming<Req, Resp, H, Fut, S>(mut self, path: &str, handler: H) -> Self
    where
        Req: Message + Default + 'static,
        Resp: Message + 'static,
        H: Fn(RpcRequest<Req>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
        S: Stream<Item = Result<Resp, Status>> + Send + 'static,
    {
        self.router = self.router.route(
            path,
            post(move |request: Request| {
                let handler = handler.clone();
                async move {
                    let (request, web) = match decode_request::<Req>(request).await {
                        Ok(decoded) => decoded,
                        Err(response) => return response,
                    };

                    match handler(request).await {
                        Ok(messages) => streaming_response(messages, web),
                        Err(status) => status_response(&status, web),
                    }
                }
            }),
        );
        self
    }

    #[must_use]
    pub fn into_router(self) -> Router {
        self.router
    }
}

async fn unimplemented(request: Request) -> Response {
    let web = is_web(request.headers());
    let status = Status::unimplemented(format!("unknown method {}", request.uri().path()));

    status_response(&status, web)
}

fn is_web(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/grpc-web"))
}

fn is_rpc(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/grpc"))
}

async fn decode_request<T: Message + Default>(
    request: Request,
) -> Result<(RpcRequest<T>, bool), Response> {
    let (parts, body) = request.into_parts();

    if !is_rpc(&parts.headers) {
        return Err(StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response());
    }

    let info = parts.extensions.get::<ConnectionInfo>().copied();
    let web = is_web(&parts.headers);

    let message = read_message::<T>(body).await;

    match message {
        Ok(message) => Ok((
            RpcRequest {
                message,
                metadata: parts.headers,
                source: info.map(|info| info.remote.ip()),
                web,
            },
            web,
        )),
        Err(status) => Err(status_response(&status, web)),
    }
}

async fn read_message<T: Message + Default>(body: Body) -> Result<T, Status> {
    let body = axum::body::to_bytes(body, MAX_FRAME_LEN.saturating_add(64))
        .await
        .map_err(|err| Status::invalid_argument(format!("failed to read request: {err}")))?;

    let mut decoder = FrameDecoder::default();
    decoder.extend(&body);

    let payload = match decoder.next_frame() {
        Ok(Some(Frame::Data(payload))) => payload,
        Ok(_) => return Err(Status::invalid_argument("request carried no message")),
        Err(err) => return Err(Status::invalid_argument(err.to_string())),
    };

    T::decode(payload).map_err(|err| Status::invalid_argument(err.to_string()))
}

fn data_frame<M: Message>(message: &M) -> Result<Bytes, Status> {
    encode_frame(message).map_err(|err| Status::internal(err.to_string()))
}

fn trailer_frame(status: Option<&Status>) -> Bytes {
    // Status trailers are a few short headers, always within frame limits.
    encode_trailer_frame(&status_headers(status)).unwrap_or_default()
}

fn content_type(web: bool) -> HeaderValue {
    HeaderValue::from_static(if web {
        GRPC_WEB_CONTENT_TYPE
    } else {
        GRPC_CONTENT_TYPE
    })
}

type BodyFrames = Vec<Result<BodyFrame<Bytes>, Infallible>>;

fn response_with(frames: BodyFrames, web: bool) -> Response {
    let body = Body::new(StreamBody::new(futures_util::stream::iter(frames)));

    ([(CONTENT_TYPE, content_type(web))], body).into_response()
}

fn unary_response(frame: Bytes, web: bool) -> Response {
    let frames = if web {
        vec![Ok(BodyFrame::data(frame)), Ok(BodyFrame::data(trailer_frame(None)))]
    } else {
        vec![Ok(BodyFrame::data(frame)), Ok(BodyFrame::trailers(status_headers(None)))]
    };

    response_with(frames, web)
}

/// A trailers-only response: the status travels in the headers.
fn status_response(status: &Status, web: bool) -> Response {
    let mut response = response_with(Vec::new(), web);
    response.headers_mut().extend(status_headers(Some(status)));
    response
}

fn streaming_response<S, M>(messages: S, web: bool) -> Response
where
    S: Stream<Item = Result<M, Status>> + Send + 'static,
    M: Message + 'static,
{
    let frames = async_stream::stream! {
        let mut messages = core::pin::pin!(messages);
        let mut outcome = None;

        while let Some(message) = messages.next().await {
            match message.and_then(|message| data_frame(&message)) {
                Ok(frame) => yield Ok::<_, Infallible>(BodyFrame::data(frame)),
                Err(status) => {
                    outcome = Some(status);
                    break;
                }
            }
        }

        if web {
            yield Ok(BodyFrame::data(trailer_frame(outcome.as_ref())));
        } else {
            yield Ok(BodyFrame::trailers(status_headers(outcome.as_ref())));
        }
    };

    let body = Body::new(StreamBody::new(frames));

    ([(CONTENT_TYPE, content_type(web))], body).into_response()
}
