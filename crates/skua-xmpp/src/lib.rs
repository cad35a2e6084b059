//! # skua-xmpp
//!
//! An embeddable XMPP client-to-server core following RFC 6120/6121.
//!
//! Three pieces cooperate:
//!
//! - **Stream engine** — incremental XML parsing of each client's
//!   full-duplex stream, with stanza framing, per-connection parse state,
//!   and the stream restarts STARTTLS and SASL require.
//! - **Routing fabric** — an ordered stanza-route table keyed by JID
//!   patterns (wildcards allowed, first match wins) and an IQ-route table
//!   keyed by payload namespace, shared by clients and in-process
//!   components alike.
//! - **Connection lifecycle** — per-client negotiation (stream open, TLS
//!   upgrade, SASL PLAIN, resource bind, session) over a socket that swaps
//!   plaintext for TLS mid-stream.
//!
//! Components extend the server by registering routes through the same
//! public API the built-in handlers use; the bundled
//! [`MucComponent`](muc::MucComponent) is the worked example.

pub mod auth;
pub mod connection;
pub mod im;
pub mod muc;
pub mod parser;
pub mod pattern;
pub mod registry;
pub mod routing;
pub mod server;
pub mod socket;
pub mod stanza;
pub mod stream;

mod error;
mod types;

pub use auth::{Authenticator, StaticAuthenticator};
pub use error::{
    generate_iq_error, generate_stream_error, stream_errors, StanzaErrorCondition,
    StanzaErrorType, XmppError,
};
pub use parser::{ns, StreamEvent, StreamHeader, XmlParser};
pub use pattern::RoutePattern;
pub use registry::{
    ConnectionRegistry, DisconnectCallback, ListenerId, OutboundStanza, SendResult,
};
pub use routing::{RouteCallback, StanzaRouter};
pub use server::{TlsConfig, XmppServer, XmppServerConfig};
pub use stanza::Stanza;
pub use types::{ConnectionState, IqType, StanzaKind, Transport};
