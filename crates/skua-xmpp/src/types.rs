//! Common types for the XMPP server.

use serde::{Deserialize, Serialize};

/// Connection state in the XMPP negotiation lifecycle.
///
/// A connection walks forward through these states; STARTTLS and SASL
/// success both loop back to `AwaitStreamOpen` because the protocol requires
/// a fresh stream after them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the client's `<stream:stream>` header.
    AwaitStreamOpen,
    /// STARTTLS offered, waiting for the upgrade request and handshake.
    TlsNegotiation,
    /// SASL mechanisms offered, waiting for authentication.
    Authenticating,
    /// Authenticated, waiting for the resource bind request.
    Binding,
    /// Bound, waiting for the (optional) session establishment IQ.
    AwaitSession,
    /// Fully established; stanzas flow through the routing fabric.
    Established,
    /// Teardown in progress.
    Closing,
    /// Connection closed.
    Closed,
}

/// Transport under a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transport {
    /// Plain TCP (pre-STARTTLS).
    Tcp,
    /// TCP upgraded to TLS.
    TcpTls,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::TcpTls => write!(f, "tcp+tls"),
        }
    }
}

/// Stanza kind, derived from the top-level element name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    /// Message stanza.
    Message,
    /// Presence stanza.
    Presence,
    /// IQ (info/query) stanza.
    Iq,
    /// Anything else at the top level of the stream.
    Other,
}

impl StanzaKind {
    /// Classify a top-level element name.
    pub fn from_name(name: &str) -> Self {
        match name {
            "message" => StanzaKind::Message,
            "presence" => StanzaKind::Presence,
            "iq" => StanzaKind::Iq,
            _ => StanzaKind::Other,
        }
    }
}

impl std::fmt::Display for StanzaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StanzaKind::Message => write!(f, "message"),
            StanzaKind::Presence => write!(f, "presence"),
            StanzaKind::Iq => write!(f, "iq"),
            StanzaKind::Other => write!(f, "other"),
        }
    }
}

/// IQ stanza type (RFC 6120 section 8.2.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    /// Request for information.
    Get,
    /// Request to set or replace information.
    Set,
    /// Successful response.
    Result,
    /// Error response.
    Error,
}

impl IqType {
    /// Parse the `type` attribute value.
    pub fn from_attr(value: &str) -> Option<Self> {
        match value {
            "get" => Some(IqType::Get),
            "set" => Some(IqType::Set),
            "result" => Some(IqType::Result),
            "error" => Some(IqType::Error),
            _ => None,
        }
    }

    /// Value of the `type` attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }
}

impl std::fmt::Display for IqType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stanza_kind_from_name() {
        assert_eq!(StanzaKind::from_name("message"), StanzaKind::Message);
        assert_eq!(StanzaKind::from_name("presence"), StanzaKind::Presence);
        assert_eq!(StanzaKind::from_name("iq"), StanzaKind::Iq);
        assert_eq!(StanzaKind::from_name("handshake"), StanzaKind::Other);
    }

    #[test]
    fn iq_type_roundtrip() {
        for ty in [IqType::Get, IqType::Set, IqType::Result, IqType::Error] {
            assert_eq!(IqType::from_attr(ty.as_str()), Some(ty));
        }
        assert_eq!(IqType::from_attr("subscribe"), None);
    }
}
