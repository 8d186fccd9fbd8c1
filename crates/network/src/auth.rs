//! Reverse authentication: the token handshake and the inbound gate every
//! authenticated handler goes through.

#[cfg(test)]
#[path = "tests/auth.rs"]
mod tests;

use std::net::IpAddr;
use std::sync::Arc;

use http::HeaderMap;
use mixcomms_crypto::PublicKey;
use mixcomms_primitives::messages::{
    Ack, AssignToken, AuthenticatedMessage, ClientId, Ping, AUTHENTICATE_TOKEN_PATH,
    REQUEST_TOKEN_PATH,
};
use mixcomms_primitives::{Id, IdType, Status, Token};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::codec::AuthMetadata;
use crate::error::AUTH_ERROR_MARKER;
use crate::host::Host;
use crate::{Error, ProtoComms};

/// Outcome of checking an inbound call. Failure is a value here; the
/// handler decides what to do with it.
#[derive(Clone, Debug)]
pub struct Auth {
    pub is_authenticated: bool,
    /// The claimed sender, if it is a known host.
    pub sender: Option<Arc<Host>>,
    pub claimed_id: Option<Id>,
    /// Why authentication failed; empty on success.
    pub reason: String,
    pub source: Option<IpAddr>,
}

impl Auth {
    fn accepted(sender: Arc<Host>, source: Option<IpAddr>) -> Self {
        Self {
            is_authenticated: true,
            claimed_id: Some(*sender.id()),
            sender: Some(sender),
            reason: String::new(),
            source,
        }
    }

    fn rejected(
        claimed_id: Option<Id>,
        sender: Option<Arc<Host>>,
        reason: impl Into<String>,
        source: Option<IpAddr>,
    ) -> Self {
        let reason = reason.into();
        debug!(?claimed_id, ?source, %reason, "rejected inbound call");

        Self {
            is_authenticated: false,
            sender,
            claimed_id,
            reason,
            source,
        }
    }

    /// The authenticated sender, or the status to fail the call with.
    ///
    /// The status message starts with the marker that makes the caller
    /// re-run its handshake.
    pub fn require(&self) -> Result<&Arc<Host>, Status> {
        match &self.sender {
            Some(sender) if self.is_authenticated => Ok(sender),
            _ => {
                let id = self
                    .claimed_id
                    .map_or_else(|| "unknown".to_owned(), |id| id.to_string());

                Err(Status::unauthenticated(format!(
                    "{AUTH_ERROR_MARKER} {id}: {}",
                    self.reason
                )))
            }
        }
    }
}

#[allow(
    clippy::multiple_inherent_impl,
    reason = "handshake methods are kept with the rest of the auth flow"
)]
impl ProtoComms {
    /// Obtains a transmission token from `host`: request a token, prove our
    /// identity by signing it, and remember it once the host accepts.
    ///
    /// Caller must hold the host's transition lock.
    pub(crate) async fn client_handshake(&self, host: &Host) -> Result<(), Error> {
        let channel = host.channel(self.id(), Some(host.params().send_timeout))?;

        let assigned: AssignToken = channel.unary(REQUEST_TOKEN_PATH, &Ping {}).await?;
        let token = Token::try_from(assigned.token.as_slice())?;

        let message = self.pack_authenticated_message(&assigned, host.id(), token)?;
        let ack: Ack = channel.unary(AUTHENTICATE_TOKEN_PATH, &message).await?;
        if !ack.error.is_empty() {
            return Err(Status::unauthenticated(ack.error).into());
        }

        host.set_transmission_token(token);
        debug!(id = %host.id(), "handshake complete");

        Ok(())
    }

    /// Mints a token for a peer starting a handshake.
    #[must_use]
    pub fn request_token(&self) -> AssignToken {
        AssignToken {
            token: self.token_store().generate().to_vec(),
        }
    }

    /// Completes a peer's handshake: checks its signature over the token,
    /// redeems the token and records it as the peer's reception token.
    ///
    /// Unknown senders are accepted only if they present a [`ClientId`]
    /// whose key and salt derive the claimed id; they are registered as
    /// receive-only hosts.
    pub fn validate_token(&self, message: &AuthenticatedMessage) -> Result<Arc<Host>, Error> {
        let id = Id::from_bytes(&message.id)?;

        let known = self.get_host(&id);
        let dynamic_key = match (&known, message.client.as_ref()) {
            (Some(_), _) => None,
            (None, Some(client)) => Some(derive_client_key(&id, client)?),
            (None, None) => return Err(Error::UnknownHost(id)),
        };

        if !self.auth_signatures_disabled() {
            let key = known
                .as_ref()
                .and_then(|host| host.public_key())
                .or(dynamic_key.as_ref())
                .ok_or(Error::TokenRejected("sender has no known public key"))?;

            mixcomms_crypto::verify(key, &message.message, &message.signature, self.id())?;
        }

        let assigned: AssignToken = message.decode_payload()?;
        let token = Token::try_from(assigned.token.as_slice())?;

        if !message.token.is_empty() && message.token.as_slice() != token.as_slice() {
            return Err(Error::TokenRejected("envelope token does not match payload"));
        }
        if !self.token_store().validate(&token) {
            return Err(Error::TokenRejected("token is unknown, used or expired"));
        }

        let host = match known {
            Some(host) => host,
            None => self.registry().add_receive_only(
                id,
                dynamic_key,
                self.config().host_params.clone(),
            ),
        };
        host.set_reception_token(token);

        debug!(%id, "peer authenticated");

        Ok(host)
    }

    /// Checks the id and token carried by an inbound envelope.
    #[must_use]
    pub fn authenticated_receiver(
        &self,
        message: &AuthenticatedMessage,
        source: Option<IpAddr>,
    ) -> Auth {
        let id = match Id::from_bytes(&message.id) {
            Ok(id) => id,
            Err(err) => return Auth::rejected(None, None, format!("invalid sender id: {err}"), source),
        };

        match Token::try_from(message.token.as_slice()) {
            Ok(token) => self.authenticate(id, &token, source),
            Err(err) => Auth::rejected(Some(id), self.get_host(&id), err.to_string(), source),
        }
    }

    /// Checks the id and token carried as call metadata.
    #[must_use]
    pub fn authenticated_receiver_from_metadata(
        &self,
        headers: &HeaderMap,
        source: Option<IpAddr>,
    ) -> Auth {
        match AuthMetadata::from_headers(headers) {
            Ok(metadata) => self.authenticate(metadata.id, &metadata.token, source),
            Err(err) => Auth::rejected(None, None, err.to_string(), source),
        }
    }

    fn authenticate(&self, id: Id, presented: &Token, source: Option<IpAddr>) -> Auth {
        let Some(host) = self.get_host(&id) else {
            return Auth::rejected(Some(id), None, "unknown sender", source);
        };

        let Some(expected) = host.reception_token() else {
            return Auth::rejected(Some(id), Some(host), "no token was issued to sender", source);
        };

        if bool::from(expected.as_bytes().ct_eq(presented.as_bytes())) {
            Auth::accepted(host, source)
        } else {
            Auth::rejected(Some(id), Some(host), "token mismatch", source)
        }
    }
}

fn derive_client_key(id: &Id, client: &ClientId) -> Result<PublicKey, Error> {
    if Id::derive(&client.public_key, &client.salt, IdType::User) != *id {
        return Err(Error::TokenRejected("client id does not derive from its key"));
    }

    Ok(PublicKey::from_pkcs1_der(client.public_key.clone()))
}
