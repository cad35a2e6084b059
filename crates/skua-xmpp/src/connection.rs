//! Per-client connection handling.
//!
//! Each accepted socket gets one task running [`ClientConnection`]: the
//! negotiation state machine (stream open, STARTTLS, SASL PLAIN, resource
//! bind) followed by the established-session loop that feeds inbound
//! stanzas to the routing fabric and drains routed stanzas back out.

use std::net::SocketAddr;
use std::sync::Arc;

use base64::prelude::*;
use jid::{BareJid, FullJid, Jid};
use rand::distr::Alphanumeric;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::auth::Authenticator;
use crate::error::{generate_iq_error, StanzaErrorCondition, StanzaErrorType};
use crate::parser::{ns, StreamEvent};
use crate::pattern::RoutePattern;
use crate::registry::{ConnectionRegistry, OutboundStanza};
use crate::routing::{RouteCallback, StanzaRouter};
use crate::socket::ClientSocket;
use crate::stanza::Stanza;
use crate::stream::XmppStream;
use crate::types::ConnectionState;
use crate::XmppError;

/// Depth of each connection's outbound stanza channel. This is the
/// connection's outbound buffer: writes into it are best-effort and
/// non-blocking, and a client that cannot drain this many stanzas is
/// disconnected rather than throttled.
const OUTBOUND_CHANNEL_SIZE: usize = 256;

/// Length of server-generated bind resources.
const GENERATED_RESOURCE_LEN: usize = 16;

/// One client connection.
pub struct ClientConnection<A: Authenticator> {
    peer_addr: SocketAddr,
    stream: XmppStream,
    state: ConnectionState,
    domain: String,
    tls_acceptor: Option<TlsAcceptor>,
    auth: Arc<A>,
    router: Arc<StanzaRouter>,
    registry: Arc<ConnectionRegistry>,
    /// Cancelled when this connection must close: on server shutdown (it is
    /// a child of the server token) or when the delivery callback finds the
    /// outbound buffer full.
    closing: CancellationToken,
    /// Set after SASL success.
    bare_jid: Option<BareJid>,
    /// Set after resource binding; owning this means a registry entry and a
    /// self-route exist and must be torn down.
    jid: Option<FullJid>,
    outbound_rx: Option<mpsc::Receiver<OutboundStanza>>,
}

impl<A: Authenticator> ClientConnection<A> {
    /// Drive a freshly-accepted connection to completion.
    #[allow(clippy::too_many_arguments)]
    #[instrument(
        name = "xmpp.connection",
        skip(tcp, tls_acceptor, domain, buffer_size, auth, router, registry, shutdown),
        fields(peer = %peer_addr, jid = tracing::field::Empty)
    )]
    pub async fn handle_connection(
        tcp: TcpStream,
        peer_addr: SocketAddr,
        tls_acceptor: Option<TlsAcceptor>,
        domain: String,
        buffer_size: usize,
        auth: Arc<A>,
        router: Arc<StanzaRouter>,
        registry: Arc<ConnectionRegistry>,
        shutdown: CancellationToken,
    ) -> Result<(), XmppError> {
        info!("new connection");

        let mut connection = Self {
            peer_addr,
            stream: XmppStream::new(ClientSocket::Plain(tcp), domain.clone(), buffer_size),
            state: ConnectionState::AwaitStreamOpen,
            domain,
            tls_acceptor,
            auth,
            router,
            registry,
            closing: shutdown.child_token(),
            bare_jid: None,
            jid: None,
            outbound_rx: None,
        };

        let result = connection.run().await;
        connection.teardown();

        match &result {
            Ok(()) => info!("connection closed"),
            Err(e) => info!(error = %e, "connection closed"),
        }
        result
    }

    async fn run(&mut self) -> Result<(), XmppError> {
        self.negotiate().await?;
        self.session_loop().await
    }

    /// The negotiation phase: repeated stream restarts until the client is
    /// encrypted (when offered), authenticated, and bound.
    async fn negotiate(&mut self) -> Result<(), XmppError> {
        loop {
            self.state = ConnectionState::AwaitStreamOpen;
            let _header = self.stream.expect_stream_open().await?;
            self.stream.send_stream_header().await?;

            if self.tls_acceptor.is_some() && !self.stream.is_tls() {
                self.state = ConnectionState::TlsNegotiation;
                self.stream.send_features_starttls().await?;
                self.await_starttls().await?;
                continue;
            }

            if self.bare_jid.is_none() {
                self.state = ConnectionState::Authenticating;
                self.stream.send_features_sasl().await?;
                self.await_sasl().await?;
                continue;
            }

            self.state = ConnectionState::Binding;
            self.stream.send_features_bind().await?;
            self.await_bind().await?;
            self.state = ConnectionState::AwaitSession;
            return Ok(());
        }
    }

    /// Wait for `<starttls/>` and switch the socket to TLS.
    async fn await_starttls(&mut self) -> Result<(), XmppError> {
        match self.stream.read_event().await? {
            Some(StreamEvent::Stanza(el)) if el.name() == "starttls" && el.ns() == ns::TLS => {
                let Some(acceptor) = self.tls_acceptor.clone() else {
                    return Err(XmppError::protocol_violation("STARTTLS not offered"));
                };
                self.stream.starttls(&acceptor).await?;
                debug!(transport = %self.stream.transport(), "socket upgraded");
                Ok(())
            }
            Some(StreamEvent::Stanza(el)) => Err(XmppError::protocol_violation(format!(
                "expected starttls, got <{}>",
                el.name()
            ))),
            Some(StreamEvent::StreamOpen(_)) => Err(XmppError::protocol_violation(
                "stream restart before STARTTLS",
            )),
            Some(StreamEvent::StreamClose) | None => {
                Err(XmppError::stream("connection closed during TLS negotiation"))
            }
        }
    }

    /// Wait for `<auth/>` and verify SASL PLAIN credentials.
    async fn await_sasl(&mut self) -> Result<(), XmppError> {
        match self.stream.read_event().await? {
            Some(StreamEvent::Stanza(el)) if el.name() == "auth" && el.ns() == ns::SASL => {
                let mechanism = el.attr("mechanism").unwrap_or_default().to_owned();
                if mechanism != "PLAIN" {
                    self.stream.send_sasl_failure("invalid-mechanism").await?;
                    return Err(XmppError::auth_failed(format!(
                        "unsupported mechanism: {}",
                        mechanism
                    )));
                }

                let (jid, password) = match parse_sasl_plain(&el.text(), &self.domain) {
                    Ok(credentials) => credentials,
                    Err(e) => {
                        self.stream.send_sasl_failure("incorrect-encoding").await?;
                        return Err(e);
                    }
                };

                match self.auth.authenticate(&jid, &password).await {
                    Ok(()) => {
                        // SASL success mandates a stream restart; the parser
                        // reset happens inside the send.
                        self.stream.send_sasl_success().await?;
                        info!(jid = %jid, "authenticated");
                        tracing::Span::current().record("jid", jid.to_string());
                        self.bare_jid = Some(jid);
                        Ok(())
                    }
                    Err(e) => {
                        warn!(jid = %jid, "authentication failed");
                        self.stream.send_sasl_failure("not-authorized").await?;
                        Err(e)
                    }
                }
            }
            Some(StreamEvent::Stanza(el)) => Err(XmppError::protocol_violation(format!(
                "expected auth, got <{}>",
                el.name()
            ))),
            Some(StreamEvent::StreamOpen(_)) => {
                Err(XmppError::protocol_violation("stream restart before auth"))
            }
            Some(StreamEvent::StreamClose) | None => {
                Err(XmppError::stream("connection closed during SASL"))
            }
        }
    }

    /// Wait for the bind IQ, resolve the resource, and claim the full JID.
    ///
    /// A conflicting client-proposed resource is answered with a
    /// `<conflict/>` IQ error and the client may try again on the same
    /// stream.
    async fn await_bind(&mut self) -> Result<(), XmppError> {
        loop {
            let element = match self.stream.read_event().await? {
                Some(StreamEvent::Stanza(el)) if el.name() == "iq" => el,
                Some(StreamEvent::Stanza(el)) => {
                    return Err(XmppError::protocol_violation(format!(
                        "expected bind iq, got <{}>",
                        el.name()
                    )))
                }
                Some(StreamEvent::StreamOpen(_)) => {
                    return Err(XmppError::protocol_violation("stream restart before bind"))
                }
                Some(StreamEvent::StreamClose) | None => {
                    return Err(XmppError::stream("connection closed during bind"))
                }
            };

            let stanza = Stanza::from_element(element)?;
            let id = stanza.id().unwrap_or("bind_1").to_owned();
            let Some(bind) = stanza.element().get_child("bind", ns::BIND) else {
                return Err(XmppError::protocol_violation("expected resource bind"));
            };
            if stanza.element().attr("type") != Some("set") {
                return Err(XmppError::protocol_violation("bind must be an iq set"));
            }

            let Some(bare) = self.bare_jid.clone() else {
                return Err(XmppError::protocol_violation("bind before authentication"));
            };

            let requested = bind
                .get_child("resource", ns::BIND)
                .map(|r| r.text().trim().to_owned())
                .filter(|r| !r.is_empty());

            let (tx, rx) = mpsc::channel(OUTBOUND_CHANNEL_SIZE);

            let full = match requested {
                Some(resource) => {
                    let full = match bare.with_resource_str(&resource) {
                        Ok(full) => full,
                        Err(e) => {
                            debug!(resource, error = %e, "rejecting malformed resource");
                            let error = generate_iq_error(
                                &id,
                                None,
                                Some(&self.domain),
                                StanzaErrorCondition::BadRequest,
                                StanzaErrorType::Modify,
                                Some("malformed resource"),
                            );
                            self.stream.send_raw(&error).await?;
                            continue;
                        }
                    };
                    match self.registry.register(full.clone(), tx.clone()) {
                        Ok(()) => full,
                        Err(XmppError::BindConflict(_)) => {
                            warn!(jid = %full, "resource bind conflict");
                            let error = generate_iq_error(
                                &id,
                                None,
                                Some(&self.domain),
                                StanzaErrorCondition::Conflict,
                                StanzaErrorType::Cancel,
                                Some("resource already bound"),
                            );
                            self.stream.send_raw(&error).await?;
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
                None => loop {
                    // Collisions on 16 random alphanumerics are not
                    // expected; the loop is the correctness backstop.
                    let full = bare
                        .with_resource_str(&generate_resource())
                        .map_err(|e| XmppError::malformed_jid(e.to_string()))?;
                    match self.registry.register(full.clone(), tx.clone()) {
                        Ok(()) => break full,
                        Err(XmppError::BindConflict(_)) => continue,
                        Err(e) => return Err(e),
                    }
                },
            };

            self.install_self_route(&full, tx);
            self.outbound_rx = Some(rx);
            self.jid = Some(full.clone());
            tracing::Span::current().record("jid", full.to_string());

            let result = format!(
                "<iq type='result' id='{}'><bind xmlns='{}'><jid>{}</jid></bind></iq>",
                id,
                ns::BIND,
                full
            );
            self.stream.send_raw(&result).await?;
            info!(jid = %full, transport = %self.stream.transport(), "resource bound");
            return Ok(());
        }
    }

    /// Register this connection's exact-JID route. Routed stanzas land in
    /// the outbound channel and the session loop writes them to the socket.
    fn install_self_route(&self, jid: &FullJid, tx: mpsc::Sender<OutboundStanza>) {
        let pattern = RoutePattern::from(jid);
        self.router
            .register_stanza_route(pattern, self_route_callback(tx, self.closing.clone()));
    }

    /// The established-session loop.
    async fn session_loop(&mut self) -> Result<(), XmppError> {
        let mut outbound_rx = self.outbound_rx.take();

        loop {
            tokio::select! {
                event = self.stream.read_event() => match event? {
                    Some(StreamEvent::Stanza(el)) => {
                        let mut stanza = match Stanza::from_element(el) {
                            Ok(stanza) => stanza,
                            Err(e) => {
                                warn!(error = %e, "dropping malformed stanza");
                                continue;
                            }
                        };

                        if let Some(jid) = &self.jid {
                            stanza.set_from(&Jid::from(jid.clone()));
                        }
                        if self.state == ConnectionState::AwaitSession && is_session_iq(&stanza) {
                            self.state = ConnectionState::Established;
                        }

                        if !self.router.dispatch(&stanza) {
                            debug!(kind = %stanza.kind(), "stanza was not delivered");
                        }
                    }
                    Some(StreamEvent::StreamClose) => {
                        debug!("client closed the stream");
                        let _ = self.stream.close().await;
                        return Ok(());
                    }
                    Some(StreamEvent::StreamOpen(_)) => {
                        return Err(XmppError::protocol_violation(
                            "stream restart inside an established session",
                        ));
                    }
                    None => {
                        debug!("connection closed by peer");
                        return Ok(());
                    }
                },

                routed = recv_or_pending(&mut outbound_rx) => match routed {
                    Some(outbound) => {
                        if let Err(e) = self.stream.write_stanza(&outbound.stanza).await {
                            warn!(error = %e, "write failed, closing connection");
                            return Err(e);
                        }
                    }
                    None => {
                        // Route and registry entry are gone; keep serving
                        // the inbound half until the peer goes away.
                        debug!("outbound channel closed");
                        outbound_rx = None;
                    }
                },

                _ = self.closing.cancelled() => {
                    debug!("connection close requested");
                    let _ = self.stream.close().await;
                    return Ok(());
                }
            }
        }
    }

    /// Release everything this connection holds.
    ///
    /// Runs on every exit path and is idempotent: the self-route and
    /// registry entry go away exactly once, in that order, and disconnect
    /// listeners fire from the registry release.
    fn teardown(&mut self) {
        self.state = ConnectionState::Closing;
        if let Some(jid) = self.jid.take() {
            self.router.deregister_stanza_route(&RoutePattern::from(&jid));
            self.registry.unregister(&jid);
            debug!(jid = %jid, peer = %self.peer_addr, "connection resources released");
        }
        self.state = ConnectionState::Closed;
    }
}

/// The delivery callback behind a connection's self-route.
///
/// Delivery is a non-blocking `try_send` into the connection's outbound
/// buffer. A full buffer means the client is not draining: the connection's
/// closing token is cancelled so the slow client is disconnected rather than
/// throttled. The `false` return still only reports the failed delivery to
/// the router, which takes no action on it.
fn self_route_callback(
    tx: mpsc::Sender<OutboundStanza>,
    closing: CancellationToken,
) -> RouteCallback {
    Arc::new(
        move |stanza| match tx.try_send(OutboundStanza::new(stanza.clone())) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("outbound buffer full, disconnecting slow client");
                closing.cancel();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("outbound channel closed");
                false
            }
        },
    )
}

/// Receive from the channel, or park forever once it is gone.
async fn recv_or_pending(
    rx: &mut Option<mpsc::Receiver<OutboundStanza>>,
) -> Option<OutboundStanza> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn is_session_iq(stanza: &Stanza) -> bool {
    stanza
        .iq_payload()
        .is_some_and(|payload| payload.ns() == ns::SESSION)
}

/// Decode a SASL PLAIN initial response: `authzid \0 authcid \0 password`.
///
/// The authcid may be a bare JID or a plain localpart; a localpart is
/// qualified with the server domain.
fn parse_sasl_plain(data: &str, domain: &str) -> Result<(BareJid, String), XmppError> {
    let decoded = BASE64_STANDARD
        .decode(data.trim())
        .map_err(|e| XmppError::auth_failed(format!("invalid base64: {}", e)))?;

    let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
    let (authcid, password) = match parts.len() {
        3 => (parts[1], parts[2]),
        2 => (parts[0], parts[1]),
        _ => return Err(XmppError::auth_failed("malformed PLAIN response")),
    };

    let authcid = std::str::from_utf8(authcid)
        .map_err(|_| XmppError::auth_failed("authcid is not UTF-8"))?;
    let password = std::str::from_utf8(password)
        .map_err(|_| XmppError::auth_failed("password is not UTF-8"))?
        .to_owned();
    if authcid.is_empty() {
        return Err(XmppError::auth_failed("empty authcid"));
    }

    let jid: BareJid = if authcid.contains('@') {
        authcid.parse()
    } else {
        format!("{}@{}", authcid, domain).parse()
    }
    .map_err(|e| XmppError::malformed_jid(format!("{}: {}", authcid, e)))?;

    Ok((jid, password))
}

/// A fresh random resource for clients that did not propose one.
fn generate_resource() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_RESOURCE_LEN)
        .map(char::from)
        .collect()
}
