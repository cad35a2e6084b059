//! Error types for the XMPP server.

use thiserror::Error;

use crate::parser::ns;

/// XMPP server errors.
///
/// Errors raised while processing a single connection close that connection
/// and go no further; errors raised during server construction propagate to
/// the caller. Registration APIs never surface errors for duplicate or
/// missing entries, they log and no-op.
#[derive(Debug, Error)]
pub enum XmppError {
    /// I/O error on a socket or a key/certificate file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS configuration or handshake error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// A JID or route pattern that does not follow `local@domain/resource`.
    #[error("malformed JID: {0}")]
    MalformedJid(String),

    /// Ill-formed XML on the stream. Fatal for the connection.
    #[error("XML parse error: {0}")]
    Parse(String),

    /// SASL authentication failed.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The requested resource is already bound for this bare JID.
    #[error("resource bind conflict: {0}")]
    BindConflict(String),

    /// No route matched a destination JID.
    ///
    /// Dispatch never raises this across the routing boundary; unroutable
    /// stanzas are logged and dropped. The variant exists for callers that
    /// want to surface the condition themselves.
    #[error("no route to {0}")]
    NoRoute(String),

    /// The peer sent something the current negotiation state does not allow.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Stream-level failure (closed mid-negotiation, bad version, ...).
    #[error("stream error: {0}")]
    Stream(String),

    /// Invalid server configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl XmppError {
    /// Create a new TLS error.
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a new malformed-JID error.
    pub fn malformed_jid(msg: impl Into<String>) -> Self {
        Self::MalformedJid(msg.into())
    }

    /// Create a new XML parse error.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a new authentication error.
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthFailed(msg.into())
    }

    /// Create a new protocol-violation error.
    pub fn protocol_violation(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    /// Create a new stream error.
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// XMPP stanza error conditions (RFC 6120 section 8.3.3, the subset this
/// server emits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// Bad request (malformed stanza).
    BadRequest,
    /// Conflict (e.g. resource already bound).
    Conflict,
    /// Feature not implemented.
    FeatureNotImplemented,
    /// Forbidden.
    Forbidden,
    /// Internal server error.
    InternalServerError,
    /// Item not found.
    ItemNotFound,
    /// JID malformed.
    JidMalformed,
    /// Not acceptable.
    NotAcceptable,
    /// Not authorized.
    NotAuthorized,
    /// Service unavailable.
    ServiceUnavailable,
}

impl StanzaErrorCondition {
    /// Element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAuthorized => "not-authorized",
            Self::ServiceUnavailable => "service-unavailable",
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error types (RFC 6120 section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials.
    Auth,
    /// Do not retry.
    Cancel,
    /// Retry after changing the data sent.
    Modify,
    /// Retry after waiting.
    Wait,
}

impl StanzaErrorType {
    /// Value of the `type` attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Generate an IQ error response as raw XML.
///
/// Used by negotiation code that answers on its own stream before the stanza
/// fabric is available (e.g. bind conflicts).
pub fn generate_iq_error(
    id: &str,
    to: Option<&str>,
    from: Option<&str>,
    condition: StanzaErrorCondition,
    error_type: StanzaErrorType,
    text: Option<&str>,
) -> String {
    let mut iq = format!("<iq type='error' id='{}'", id);

    if let Some(to) = to {
        iq.push_str(&format!(" to='{}'", to));
    }
    if let Some(from) = from {
        iq.push_str(&format!(" from='{}'", from));
    }

    iq.push_str(&format!(
        "><error type='{}'><{} xmlns='{}'/>{}</error></iq>",
        error_type.as_str(),
        condition.as_str(),
        ns::STANZAS,
        text.map(|t| format!(
            "<text xmlns='{}' xml:lang='en'>{}</text>",
            ns::STANZAS,
            t
        ))
        .unwrap_or_default()
    ));

    iq
}

/// Generate a stream error followed by the stream close tag.
///
/// Stream errors are fatal; the connection must be torn down after sending.
pub fn generate_stream_error(condition: &str, text: Option<&str>) -> String {
    let mut error = format!(
        "<stream:error><{} xmlns='{}'/>",
        condition,
        ns::STREAM_ERRORS
    );

    if let Some(t) = text {
        error.push_str(&format!(
            "<text xmlns='{}' xml:lang='en'>{}</text>",
            ns::STREAM_ERRORS,
            t
        ));
    }

    error.push_str("</stream:error></stream:stream>");
    error
}

/// Stream error conditions this server emits.
pub mod stream_errors {
    /// The stream namespace or version is unsupported.
    pub const UNSUPPORTED_VERSION: &str = "unsupported-version";
    /// Received XML that is not well-formed.
    pub const NOT_WELL_FORMED: &str = "not-well-formed";
    /// The peer violated the negotiation sequence.
    pub const POLICY_VIOLATION: &str = "policy-violation";
    /// Authentication is required before this action.
    pub const NOT_AUTHORIZED: &str = "not-authorized";
    /// The server is shutting down.
    pub const SYSTEM_SHUTDOWN: &str = "system-shutdown";
}
