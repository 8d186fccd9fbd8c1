//! Protobuf messages of the generic bootstrap service and the envelope
//! carried by authenticated calls.

use prost::Message;

pub const REQUEST_TOKEN_PATH: &str = "/messages.Generic/RequestToken";
pub const AUTHENTICATE_TOKEN_PATH: &str = "/messages.Generic/AuthenticateToken";

/// Request metadata key carrying the base64 sender id.
pub const ID_METADATA: &str = "id";
/// Request metadata key carrying the base64 transmission token.
pub const TOKEN_METADATA: &str = "token";

#[allow(
    clippy::empty_structs_with_brackets,
    reason = "prost derives expect a braced struct"
)]
#[derive(Clone, Copy, PartialEq, Eq, Message)]
pub struct Ping {}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct AssignToken {
    #[prost(bytes = "vec", tag = "1")]
    pub token: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct Ack {
    #[prost(string, tag = "1")]
    pub error: String,
}

/// Key material a dynamic client presents on first contact so the
/// receiver can derive and check its claimed id.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct ClientId {
    #[prost(bytes = "vec", tag = "1")]
    pub salt: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub public_key: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct AuthenticatedMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub token: Vec<u8>,
    #[prost(message, optional, tag = "4")]
    pub client: Option<ClientId>,
    #[prost(bytes = "vec", tag = "5")]
    pub message: Vec<u8>,
}

impl AuthenticatedMessage {
    /// Decodes the wrapped payload.
    pub fn decode_payload<M: Message + Default>(&self) -> Result<M, prost::DecodeError> {
        M::decode(self.message.as_slice())
    }
}
