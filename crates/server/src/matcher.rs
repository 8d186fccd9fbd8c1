//! Routes a connection to native or web RPC by reading its unencrypted
//! TLS ClientHello.

#[cfg(test)]
#[path = "tests/matcher.rs"]
mod tests;

use std::net::IpAddr;
use std::sync::Arc;

use crate::tls::WebCertificate;

/// Length of a TLS record header.
pub const RECORD_HEADER_LEN: usize = 5;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const EXTENSION_ALPN: u16 = 0x0010;
const SERVER_NAME_HOST: u8 = 0x00;

const ALPN_H2: &str = "h2";

/// The routing-relevant parts of a ClientHello.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClientHello {
    pub server_name: Option<String>,
    pub alpn: Vec<String>,
}

impl ClientHello {
    fn alpn_is_only_h2(&self) -> bool {
        matches!(self.alpn.as_slice(), [proto] if proto == ALPN_H2)
    }

    fn alpn_offers_http1(&self) -> bool {
        self.alpn.iter().any(|proto| proto.starts_with("http/1"))
    }
}

/// Body length announced by a record header, if it starts a handshake.
#[must_use]
pub fn record_len(header: &[u8; RECORD_HEADER_LEN]) -> Option<usize> {
    let [content_type, _major, _minor, hi, lo] = *header;

    (content_type == CONTENT_TYPE_HANDSHAKE).then(|| usize::from(u16::from_be_bytes([hi, lo])))
}

/// Parses the handshake message following the record header.
#[must_use]
pub fn parse_client_hello(body: &[u8]) -> Option<ClientHello> {
    let mut reader = Reader(body);

    if reader.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let hello_len = reader.u24()?;
    let mut hello = Reader(reader.take(hello_len)?);

    let _version = hello.take(2)?;
    let _random = hello.take(32)?;
    let session_id_len = usize::from(hello.u8()?);
    let _session_id = hello.take(session_id_len)?;
    let cipher_suites_len = usize::from(hello.u16()?);
    let _cipher_suites = hello.take(cipher_suites_len)?;
    let compression_len = usize::from(hello.u8()?);
    let _compression = hello.take(compression_len)?;

    let mut parsed = ClientHello::default();
    if hello.is_empty() {
        return Some(parsed);
    }

    let extensions_len = usize::from(hello.u16()?);
    let mut extensions = Reader(hello.take(extensions_len)?);

    while !extensions.is_empty() {
        let kind = extensions.u16()?;
        let len = usize::from(extensions.u16()?);
        let mut data = Reader(extensions.take(len)?);

        match kind {
            EXTENSION_SERVER_NAME => parsed.server_name = parse_server_name(&mut data),
            EXTENSION_ALPN => parsed.alpn = parse_alpn(&mut data)?,
            _ => {}
        }
    }

    Some(parsed)
}

fn parse_server_name(data: &mut Reader<'_>) -> Option<String> {
    let list_len = usize::from(data.u16()?);
    let mut list = Reader(data.take(list_len)?);

    while !list.is_empty() {
        let kind = list.u8()?;
        let len = usize::from(list.u16()?);
        let name = list.take(len)?;

        if kind == SERVER_NAME_HOST {
            return core::str::from_utf8(name).ok().map(str::to_ascii_lowercase);
        }
    }

    None
}

fn parse_alpn(data: &mut Reader<'_>) -> Option<Vec<String>> {
    let list_len = usize::from(data.u16()?);
    let mut list = Reader(data.take(list_len)?);
    let mut protocols = Vec::new();

    while !list.is_empty() {
        let len = usize::from(list.u8()?);
        protocols.push(String::from_utf8_lossy(list.take(len)?).into_owned());
    }

    Some(protocols)
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if len > self.0.len() {
            return None;
        }
        let (head, tail) = self.0.split_at(len);
        self.0 = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1)?.first().copied()
    }

    fn u16(&mut self) -> Option<u16> {
        let &[hi, lo] = self.take(2)? else {
            return None;
        };
        Some(u16::from_be_bytes([hi, lo]))
    }

    fn u24(&mut self) -> Option<usize> {
        let &[hi, mid, lo] = self.take(3)? else {
            return None;
        };
        Some((usize::from(hi) << 16) | (usize::from(mid) << 8) | usize::from(lo))
    }
}

/// Whether `name` is covered by the certificate DNS name `pattern`. A
/// leading `*.` matches exactly one label.
#[must_use]
pub fn dns_name_matches(pattern: &str, name: &str) -> bool {
    let (pattern, name) = (pattern.to_ascii_lowercase(), name.to_ascii_lowercase());

    match pattern.strip_prefix("*.") {
        Some(suffix) => name
            .split_once('.')
            .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix),
        None => pattern == name,
    }
}

pub trait TlsMatcher {
    fn matches(&self, hello: &ClientHello) -> bool;
}

/// Claims connections meant for native RPC.
#[derive(Clone, Debug)]
pub struct NativeMatcher {
    certificate_names: Vec<String>,
    default_domains: Vec<String>,
}

impl NativeMatcher {
    #[must_use]
    pub const fn new(certificate_names: Vec<String>, default_domains: Vec<String>) -> Self {
        Self {
            certificate_names,
            default_domains,
        }
    }
}

impl TlsMatcher for NativeMatcher {
    fn matches(&self, hello: &ClientHello) -> bool {
        if let Some(name) = &hello.server_name {
            if self
                .certificate_names
                .iter()
                .any(|pattern| dns_name_matches(pattern, name))
            {
                return true;
            }
            if self
                .default_domains
                .iter()
                .any(|domain| name.contains(domain.as_str()))
            {
                return true;
            }
            if name.parse::<IpAddr>().is_ok() {
                return true;
            }
        }

        hello.alpn_is_only_h2()
    }
}

/// Claims connections meant for web RPC, and by default anything native
/// RPC did not claim.
#[derive(Clone, Debug)]
pub struct WebMatcher {
    certificate: Arc<WebCertificate>,
    identity_prefix: String,
}

impl WebMatcher {
    #[must_use]
    pub const fn new(certificate: Arc<WebCertificate>, identity_prefix: String) -> Self {
        Self {
            certificate,
            identity_prefix,
        }
    }
}

impl TlsMatcher for WebMatcher {
    fn matches(&self, hello: &ClientHello) -> bool {
        if let Some(name) = &hello.server_name {
            if self
                .certificate
                .dns_names()
                .iter()
                .any(|pattern| dns_name_matches(pattern, name))
            {
                return true;
            }
            if name.contains(self.identity_prefix.as_str()) {
                return true;
            }
        }

        if hello.alpn_offers_http1() {
            return true;
        }

        !hello.alpn_is_only_h2()
    }
}
