//! Protocol classification from early connection bytes.
//!
//! [`classify`] is a pure function of the first bytes of a connection. The
//! result is folded into a [`ProtocolStack`], which only ever fills empty
//! layers: the first protocol recorded for a layer wins.

use std::fmt;

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::char as byte_char,
    combinator::value,
};
use serde::{Deserialize, Serialize};
use sockscope_common::types::{ConnType, ConnectionTuple};

/// Number of leading bytes the classifier looks at.
pub const CLASSIFICATION_WINDOW: usize = 64;

const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
const TLS_HANDSHAKE: u8 = 0x16;
const TLS_CLIENT_HELLO: u8 = 0x01;
const TLS_SERVER_HELLO: u8 = 0x02;
const POSTGRES_PROTOCOL_V3: u32 = 0x0003_0000;
const POSTGRES_SSL_REQUEST: u32 = 80_877_103;
const AMQP_HEADER: &[u8] = b"AMQP\x00\x00\x09\x01";

/// Stack layer a protocol belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    /// Request/response APIs.
    Api,
    /// Datastores and brokers.
    Application,
    /// Transport encryption.
    Encryption,
}

/// A recognised protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// HTTP/1.x.
    Http,
    /// HTTP/2.
    Http2,
    /// PostgreSQL wire protocol.
    Postgres,
    /// Redis RESP.
    Redis,
    /// AMQP 0-9-1.
    Amqp,
    /// TLS.
    Tls,
}

impl Protocol {
    /// Layer the protocol occupies in a stack.
    #[must_use]
    pub const fn layer(self) -> Layer {
        match self {
            Self::Http | Self::Http2 => Layer::Api,
            Self::Postgres | Self::Redis | Self::Amqp => Layer::Application,
            Self::Tls => Layer::Encryption,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Http => "http",
            Self::Http2 => "http2",
            Self::Postgres => "postgres",
            Self::Redis => "redis",
            Self::Amqp => "amqp",
            Self::Tls => "tls",
        };
        f.write_str(name)
    }
}

/// Protocols detected on one connection, one slot per layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolStack {
    /// API layer protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api: Option<Protocol>,
    /// Application layer protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application: Option<Protocol>,
    /// Encryption layer protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<Protocol>,
}

impl ProtocolStack {
    /// Records `protocol` in its layer if that layer is still empty.
    ///
    /// Returns `true` when the stack changed.
    pub fn merge(&mut self, protocol: Protocol) -> bool {
        let slot = match protocol.layer() {
            Layer::Api => &mut self.api,
            Layer::Application => &mut self.application,
            Layer::Encryption => &mut self.encryption,
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(protocol);
        true
    }

    /// Whether `protocol` is part of the stack.
    #[must_use]
    pub fn contains(&self, protocol: Protocol) -> bool {
        [self.api, self.application, self.encryption].contains(&Some(protocol))
    }

    /// Whether nothing was detected yet.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.api.is_none() && self.application.is_none() && self.encryption.is_none()
    }

    /// Whether a cleartext protocol is known, which ends classification.
    ///
    /// An encryption-only stack stays open so decrypted payload seen later
    /// can still name the protocol inside the tunnel.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.api.is_some() || self.application.is_some()
    }
}

/// Classifies the first bytes of a connection.
///
/// Returns `None` for ambiguous, truncated or unrecognised input. Every
/// recognised protocol runs over TCP, so UDP tuples are never classified.
#[must_use]
pub fn classify(tuple: &ConnectionTuple, payload: &[u8]) -> Option<Protocol> {
    if tuple.conn_type != ConnType::Tcp || payload.is_empty() {
        return None;
    }
    let window = &payload[..payload.len().min(CLASSIFICATION_WINDOW)];

    if is_tls(window) {
        Some(Protocol::Tls)
    } else if window.starts_with(HTTP2_PREFACE) {
        Some(Protocol::Http2)
    } else if http_start_line(window).is_ok() {
        Some(Protocol::Http)
    } else if window.starts_with(AMQP_HEADER) {
        Some(Protocol::Amqp)
    } else if is_postgres_startup(window) {
        Some(Protocol::Postgres)
    } else if resp_array_header(window).is_ok() {
        Some(Protocol::Redis)
    } else {
        None
    }
}

fn is_tls(b: &[u8]) -> bool {
    b.len() >= 6
        && b[0] == TLS_HANDSHAKE
        && b[1] == 0x03
        && b[2] <= 0x04
        && matches!(b[5], TLS_CLIENT_HELLO | TLS_SERVER_HELLO)
}

fn is_postgres_startup(b: &[u8]) -> bool {
    let (Some(len), Some(code)) = (be_u32_at(b, 0), be_u32_at(b, 4)) else {
        return false;
    };
    (8..=10_000).contains(&len) && (code == POSTGRES_PROTOCOL_V3 || code == POSTGRES_SSL_REQUEST)
}

fn be_u32_at(b: &[u8], at: usize) -> Option<u32> {
    let bytes: [u8; 4] = b.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

fn http_method(input: &[u8]) -> IResult<&[u8], ()> {
    alt((
        value((), tag(&b"GET"[..])),
        value((), tag(&b"POST"[..])),
        value((), tag(&b"PUT"[..])),
        value((), tag(&b"DELETE"[..])),
        value((), tag(&b"HEAD"[..])),
        value((), tag(&b"OPTIONS"[..])),
        value((), tag(&b"PATCH"[..])),
        value((), tag(&b"CONNECT"[..])),
        value((), tag(&b"TRACE"[..])),
    ))
    .parse(input)
}

/// `METHOD SP /target` or `HTTP/1.x SP`.
fn http_start_line(input: &[u8]) -> IResult<&[u8], ()> {
    let request = value(
        (),
        (
            http_method,
            byte_char(' '),
            take_while1(|c: u8| c != b' ' && !c.is_ascii_control()),
        ),
    );
    let response = value(
        (),
        (tag(&b"HTTP/1."[..]), take_while1(|c: u8| c.is_ascii_digit()), byte_char(' ')),
    );
    alt((request, response)).parse(input)
}

/// `*<count>\r\n$` as sent by every RESP client command.
fn resp_array_header(input: &[u8]) -> IResult<&[u8], ()> {
    value(
        (),
        (
            byte_char('*'),
            take_while1(|c: u8| c.is_ascii_digit()),
            tag(&b"\r\n$"[..]),
        ),
    )
    .parse(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp() -> ConnectionTuple {
        ConnectionTuple::new(
            ConnType::Tcp,
            "10.0.0.1".parse().expect("ip"),
            40000,
            "10.0.0.2".parse().expect("ip"),
            443,
        )
    }

    #[test]
    fn detects_tls_client_hello() {
        let hello = [0x16, 0x03, 0x01, 0x02, 0x00, 0x01, 0x00, 0x01, 0xfc];
        assert_eq!(classify(&tcp(), &hello), Some(Protocol::Tls));
    }

    #[test]
    fn rejects_tls_with_unknown_version() {
        let hello = [0x16, 0x03, 0x09, 0x02, 0x00, 0x01];
        assert_eq!(classify(&tcp(), &hello), None);
    }

    #[test]
    fn detects_http_request_and_response() {
        assert_eq!(
            classify(&tcp(), b"GET /index.html HTTP/1.1\r\nHost: a\r\n"),
            Some(Protocol::Http)
        );
        assert_eq!(
            classify(&tcp(), b"HTTP/1.1 200 OK\r\n"),
            Some(Protocol::Http)
        );
    }

    #[test]
    fn method_without_target_is_ambiguous() {
        assert_eq!(classify(&tcp(), b"GET"), None);
        assert_eq!(classify(&tcp(), b"GETTER /x"), None);
    }

    #[test]
    fn detects_http2_preface() {
        assert_eq!(classify(&tcp(), HTTP2_PREFACE), Some(Protocol::Http2));
    }

    #[test]
    fn detects_datastores() {
        let mut startup = 41u32.to_be_bytes().to_vec();
        startup.extend_from_slice(&POSTGRES_PROTOCOL_V3.to_be_bytes());
        startup.extend_from_slice(b"user\0postgres\0");
        assert_eq!(classify(&tcp(), &startup), Some(Protocol::Postgres));

        assert_eq!(
            classify(&tcp(), b"*1\r\n$4\r\nPING\r\n"),
            Some(Protocol::Redis)
        );
        assert_eq!(classify(&tcp(), AMQP_HEADER), Some(Protocol::Amqp));
    }

    #[test]
    fn udp_is_never_classified() {
        let mut tuple = tcp();
        tuple.conn_type = ConnType::Udp;
        assert_eq!(classify(&tuple, b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn garbage_is_unknown() {
        assert_eq!(classify(&tcp(), &[0xde, 0xad, 0xbe, 0xef]), None);
        assert_eq!(classify(&tcp(), b""), None);
    }

    #[test]
    fn first_protocol_of_a_layer_wins() {
        let mut stack = ProtocolStack::default();
        assert!(stack.merge(Protocol::Http));
        assert!(!stack.merge(Protocol::Http2));
        assert_eq!(stack.api, Some(Protocol::Http));
        assert!(stack.contains(Protocol::Http));
        assert!(!stack.contains(Protocol::Http2));
    }

    #[test]
    fn encryption_only_stack_stays_open() {
        let mut stack = ProtocolStack::default();
        assert!(stack.is_empty());
        assert!(stack.merge(Protocol::Tls));
        assert!(!stack.is_complete());
        assert!(stack.merge(Protocol::Http));
        assert!(stack.is_complete());
        assert!(stack.contains(Protocol::Tls));
    }
}
