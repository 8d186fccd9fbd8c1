//! Length-prefixed message framing shared by both transports.
//!
//! Every message travels as one flag byte, a 4-byte big-endian length and
//! the protobuf payload. Native calls carry their status in HTTP trailers;
//! web calls append it to the body as a frame flagged with
//! [`TRAILER_FLAG`].

#[cfg(test)]
#[path = "tests/codec.rs"]
mod tests;

use core::pin::Pin;
use core::task::{Context, Poll};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::Stream;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use http_body_util::BodyExt;
use hyper::body::Body;
use mixcomms_primitives::messages::{ID_METADATA, TOKEN_METADATA};
use mixcomms_primitives::status::{decode_message, encode_message};
use mixcomms_primitives::{Code, Id, Status, Token};
use prost::Message;
use tokio_util::sync::CancellationToken;

use crate::Error;

pub const GRPC_CONTENT_TYPE: &str = "application/grpc+proto";
pub const GRPC_WEB_CONTENT_TYPE: &str = "application/grpc-web+proto";

pub const GRPC_STATUS: &str = "grpc-status";
pub const GRPC_MESSAGE: &str = "grpc-message";

pub const FRAME_HEADER_LEN: usize = 5;
pub const DATA_FLAG: u8 = 0x00;
pub const TRAILER_FLAG: u8 = 0x80;

/// Frames announcing a larger payload are rejected before buffering it.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub fn encode_frame<M: Message>(message: &M) -> Result<Bytes, Error> {
    frame(DATA_FLAG, &message.encode_to_vec())
}

/// Serializes `trailers` as an HTTP/1 header block inside a trailer frame.
pub fn encode_trailer_frame(trailers: &HeaderMap) -> Result<Bytes, Error> {
    let mut block = Vec::new();

    for (name, value) in trailers {
        block.extend_from_slice(name.as_str().as_bytes());
        block.extend_from_slice(b": ");
        block.extend_from_slice(value.as_bytes());
        block.extend_from_slice(b"\r\n");
    }

    frame(TRAILER_FLAG, &block)
}

fn frame(flag: u8, payload: &[u8]) -> Result<Bytes, Error> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|_| payload.len() <= MAX_FRAME_LEN)
        .ok_or_else(|| Error::Frame(format!("payload of {} bytes is too large", payload.len())))?;

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN.saturating_add(payload.len()));
    buf.put_u8(flag);
    buf.put_u32(len);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

#[derive(Debug)]
pub enum Frame {
    Data(Bytes),
    Trailers(HeaderMap),
}

/// Incremental decoder over a byte stream of frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Returns the next complete frame, or `None` if more input is needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        let Some(&[flag, a, b, c, d]) = self.buf.get(..FRAME_HEADER_LEN) else {
            return Ok(None);
        };

        let len = usize::try_from(u32::from_be_bytes([a, b, c, d]))
            .map_err(|err| Error::Frame(err.to_string()))?;
        if len > MAX_FRAME_LEN {
            return Err(Error::Frame(format!("frame of {len} bytes exceeds limit")));
        }
        if self.buf.len() < FRAME_HEADER_LEN.saturating_add(len) {
            return Ok(None);
        }

        self.buf.advance(FRAME_HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();

        match flag {
            DATA_FLAG => Ok(Some(Frame::Data(payload))),
            flag if flag & TRAILER_FLAG != 0 => {
                parse_trailer_block(&payload).map(|trailers| Some(Frame::Trailers(trailers)))
            }
            flag => Err(Error::Frame(format!("unsupported frame flag {flag:#04x}"))),
        }
    }

    /// Fails if input ended in the middle of a frame.
    pub fn finish(&self) -> Result<(), Error> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(Error::Frame(format!(
                "input ended with {} undecoded bytes",
                self.buf.len()
            )))
        }
    }
}

/// Parses `name: value` lines separated by CRLF.
pub fn parse_trailer_block(block: &[u8]) -> Result<HeaderMap, Error> {
    let mut trailers = HeaderMap::new();

    for line in block.split(|byte| *byte == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }

        let Some(colon) = line.iter().position(|byte| *byte == b':') else {
            return Err(Error::Frame("malformed trailer line".to_owned()));
        };
        let (name, value) = line.split_at(colon);
        let value = value.get(1..).unwrap_or_default().trim_ascii();

        let name = HeaderName::from_bytes(name.trim_ascii())
            .map_err(|err| Error::Frame(format!("invalid trailer name: {err}")))?;
        let value = HeaderValue::from_bytes(value)
            .map_err(|err| Error::Frame(format!("invalid trailer value: {err}")))?;

        let _ = trailers.append(name, value);
    }

    Ok(trailers)
}

/// Reads `grpc-status` out of headers or trailers. `None` if absent.
#[must_use]
pub fn status_from_headers(headers: &HeaderMap) -> Option<Result<(), Status>> {
    let code = headers.get(GRPC_STATUS)?;

    let code = code
        .to_str()
        .ok()
        .and_then(|code| code.trim().parse::<i32>().ok())
        .map_or(Code::Unknown, Code::from_i32);

    if code == Code::Ok {
        return Some(Ok(()));
    }

    let message = headers
        .get(GRPC_MESSAGE)
        .and_then(|message| message.to_str().ok())
        .map(decode_message)
        .unwrap_or_default();

    Some(Err(Status::new(code, message)))
}

/// Headers or trailers announcing `status`; `None` announces success.
#[must_use]
pub fn status_headers(status: Option<&Status>) -> HeaderMap {
    let mut headers = HeaderMap::new();

    let Some(status) = status else {
        let _ = headers.insert(GRPC_STATUS, HeaderValue::from(Code::Ok.as_i32()));
        return headers;
    };

    let _ = headers.insert(GRPC_STATUS, HeaderValue::from(status.code().as_i32()));
    if let Ok(message) = HeaderValue::from_str(&encode_message(status.message())) {
        let _ = headers.insert(GRPC_MESSAGE, message);
    }

    headers
}

/// Sender identity and transmission token attached to authenticated calls.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AuthMetadata {
    pub id: Id,
    pub token: Token,
}

impl AuthMetadata {
    #[must_use]
    pub const fn new(id: Id, token: Token) -> Self {
        Self { id, token }
    }

    pub fn apply(&self, headers: &mut HeaderMap) -> Result<(), Error> {
        let id = HeaderValue::try_from(self.id.to_string()).map_err(http::Error::from)?;
        let token = HeaderValue::try_from(self.token.to_string()).map_err(http::Error::from)?;

        let _ = headers.insert(ID_METADATA, id);
        let _ = headers.insert(TOKEN_METADATA, token);

        Ok(())
    }

    pub fn from_headers(headers: &HeaderMap) -> Result<Self, Error> {
        let id = metadata_value(headers, ID_METADATA)?.parse::<Id>()?;

        let token = STANDARD
            .decode(metadata_value(headers, TOKEN_METADATA)?)
            .map_err(|err| Error::Metadata(format!("token is not base64: {err}")))?;
        let token = Token::try_from(token.as_slice())?;

        Ok(Self { id, token })
    }
}

fn metadata_value<'a>(headers: &'a HeaderMap, key: &'static str) -> Result<&'a str, Error> {
    headers
        .get(key)
        .ok_or_else(|| Error::Metadata(format!("missing `{key}`")))?
        .to_str()
        .map_err(|err| Error::Metadata(format!("`{key}` is not ascii: {err}")))
}

/// Buffers a whole response body and returns its single message.
pub(crate) async fn read_unary<T, B>(body: B) -> Result<T, Error>
where
    T: Message + Default,
    B: Body<Data = Bytes> + Send,
    B::Error: Into<Error>,
{
    let collected = body.collect().await.map_err(Into::<Error>::into)?;
    let trailers = collected.trailers().cloned();

    let mut decoder = FrameDecoder::default();
    decoder.extend(&collected.to_bytes());

    let mut message = None;
    while let Some(frame) = decoder.next_frame()? {
        match frame {
            Frame::Data(payload) if message.is_none() => message = Some(T::decode(payload)?),
            Frame::Data(_) => return Err(Error::Frame("unexpected second message".to_owned())),
            Frame::Trailers(trailers) => {
                if let Some(result) = status_from_headers(&trailers) {
                    result?;
                }
            }
        }
    }

    if let Some(result) = trailers.as_ref().and_then(status_from_headers) {
        result?;
    }
    decoder.finish()?;

    message.ok_or_else(|| Error::Frame("response carried no message".to_owned()))
}

/// Messages of a server-streaming call.
///
/// The stream ends cleanly when the call completes or when the
/// cancellation token fires; a non-OK status ends it with an error.
pub struct MessageStream<T> {
    inner: Pin<Box<dyn Stream<Item = Result<T, Error>> + Send>>,
}

impl<T> core::fmt::Debug for MessageStream<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MessageStream").finish_non_exhaustive()
    }
}

impl<T> MessageStream<T>
where
    T: Message + Default + 'static,
{
    pub(crate) fn from_body<B>(body: B, cancel: CancellationToken) -> Self
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<Error> + Send,
    {
        let inner = async_stream::try_stream! {
            let mut body = body;
            let mut decoder = FrameDecoder::default();
            let mut finished = false;

            loop {
                while let Some(frame) = decoder.next_frame()? {
                    match frame {
                        Frame::Data(payload) => yield T::decode(payload)?,
                        Frame::Trailers(trailers) => {
                            if let Some(result) = status_from_headers(&trailers) {
                                result?;
                            }
                            finished = true;
                        }
                    }
                }

                if finished {
                    break;
                }

                let next = tokio::select! {
                    () = cancel.cancelled() => None,
                    next = body.frame() => next,
                };

                let Some(next) = next else {
                    if !cancel.is_cancelled() {
                        decoder.finish()?;
                    }
                    break;
                };

                match next.map_err(Into::<Error>::into)?.into_data() {
                    Ok(data) => decoder.extend(&data),
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            if let Some(result) = status_from_headers(&trailers) {
                                result?;
                            }
                            finished = true;
                        }
                    }
                }
            }
        };

        Self {
            inner: Box::pin(inner),
        }
    }
}

impl<T> Stream for MessageStream<T> {
    type Item = Result<T, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
