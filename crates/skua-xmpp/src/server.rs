//! The server runtime.
//!
//! Owns the routing tables, the connection registry and the shared TLS
//! acceptor; accepts client connections and gives each one a task. The
//! registration methods re-exported here are the component extension
//! surface: anything holding a reference to the server (or its router and
//! registry) can attach to the stanza fabric.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::auth::Authenticator;
use crate::connection::ClientConnection;
use crate::im;
use crate::muc::MucComponent;
use crate::pattern::RoutePattern;
use crate::registry::{ConnectionRegistry, DisconnectCallback, ListenerId};
use crate::routing::{RouteCallback, StanzaRouter};
use crate::XmppError;

/// TLS certificate and key locations.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// PEM certificate chain.
    pub certificate: PathBuf,
    /// PEM PKCS#8 private key.
    pub private_key: PathBuf,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct XmppServerConfig {
    /// Address the C2S listener is bound to.
    pub listen_addr: SocketAddr,
    /// The domain this server claims as its JID.
    pub domain: String,
    /// STARTTLS material; `None` disables the TLS offer entirely.
    pub tls: Option<TlsConfig>,
    /// Per-connection read buffer size in bytes.
    pub buffer_size: usize,
}

impl Default for XmppServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5222)),
            domain: "localhost".to_owned(),
            tls: None,
            buffer_size: 4096,
        }
    }
}

/// An XMPP server instance.
pub struct XmppServer<A: Authenticator> {
    config: XmppServerConfig,
    auth: Arc<A>,
    tls_acceptor: Option<TlsAcceptor>,
    router: Arc<StanzaRouter>,
    registry: Arc<ConnectionRegistry>,
    muc: Arc<MucComponent>,
    listener: TcpListener,
    shutdown_token: CancellationToken,
}

impl<A: Authenticator> XmppServer<A> {
    /// Create a server around a pre-bound listener.
    ///
    /// The listener is taken rather than bound here so the caller decides
    /// the bind error policy (and tests can bind to an ephemeral port). The
    /// shutdown token stops the accept loop and asks live connections to
    /// close.
    pub fn new(
        config: XmppServerConfig,
        auth: Arc<A>,
        listener: TcpListener,
        shutdown_token: CancellationToken,
    ) -> Result<Self, XmppError> {
        let tls_acceptor = config.tls.as_ref().map(load_tls_acceptor).transpose()?;

        let router = Arc::new(StanzaRouter::new(&config.domain)?);
        let registry = Arc::new(ConnectionRegistry::new());

        im::register_core_routes(&router)?;
        let muc = MucComponent::attach(&router, &registry, &config.domain)?;

        Ok(Self {
            config,
            auth,
            tls_acceptor,
            router,
            registry,
            muc,
            listener,
            shutdown_token,
        })
    }

    /// Accept connections until the shutdown token fires.
    pub async fn run(self) -> Result<(), XmppError> {
        info!(
            addr = ?self.listener.local_addr().ok(),
            domain = %self.config.domain,
            tls = self.tls_acceptor.is_some(),
            "XMPP server listening"
        );

        loop {
            let (stream, peer_addr) = tokio::select! {
                result = self.listener.accept() => match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
                _ = self.shutdown_token.cancelled() => {
                    info!("accept loop stopped");
                    break;
                }
            };

            let tls_acceptor = self.tls_acceptor.clone();
            let domain = self.config.domain.clone();
            let buffer_size = self.config.buffer_size;
            let auth = Arc::clone(&self.auth);
            let router = Arc::clone(&self.router);
            let registry = Arc::clone(&self.registry);
            let shutdown = self.shutdown_token.clone();

            tokio::spawn(
                async move {
                    if let Err(e) = ClientConnection::handle_connection(
                        stream,
                        peer_addr,
                        tls_acceptor,
                        domain,
                        buffer_size,
                        auth,
                        router,
                        registry,
                        shutdown,
                    )
                    .await
                    {
                        warn!(error = %e, "connection error");
                    }
                }
                .instrument(info_span!(
                    "xmpp.connection.lifecycle",
                    client_ip = %peer_addr,
                )),
            );
        }

        // New registrations are refused from here on; connections notice the
        // token themselves and unwind.
        self.router.begin_shutdown();
        Ok(())
    }

    /// The server configuration.
    pub fn config(&self) -> &XmppServerConfig {
        &self.config
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The routing tables.
    pub fn router(&self) -> &Arc<StanzaRouter> {
        &self.router
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The MUC component.
    pub fn muc(&self) -> &Arc<MucComponent> {
        &self.muc
    }

    /// Register a stanza route. See [`StanzaRouter::register_stanza_route`].
    pub fn register_stanza_route(&self, pattern: RoutePattern, callback: RouteCallback) {
        self.router.register_stanza_route(pattern, callback);
    }

    /// Deregister a stanza route.
    pub fn deregister_stanza_route(&self, pattern: &RoutePattern) {
        self.router.deregister_stanza_route(pattern);
    }

    /// Register an IQ route.
    pub fn register_iq_route(&self, namespace: &str, callback: RouteCallback) {
        self.router.register_iq_route(namespace, callback);
    }

    /// Deregister an IQ route.
    pub fn deregister_iq_route(&self, namespace: &str) {
        self.router.deregister_iq_route(namespace);
    }

    /// Watch a client for disconnection.
    pub fn add_disconnect_listener(
        &self,
        jid: jid::FullJid,
        callback: DisconnectCallback,
    ) -> ListenerId {
        self.registry.add_disconnect_listener(jid, callback)
    }

    /// Cancel a disconnect watch.
    pub fn remove_disconnect_listener(&self, id: ListenerId) {
        self.registry.remove_disconnect_listener(id);
    }
}

/// Build the shared TLS acceptor from PEM files.
fn load_tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor, XmppError> {
    use rustls_pemfile::{certs, pkcs8_private_keys};
    use std::fs::File;
    use std::io::BufReader;
    use tokio_rustls::rustls::{pki_types::PrivateKeyDer, ServerConfig};

    let cert_file = File::open(&tls.certificate).map_err(|e| {
        XmppError::config(format!(
            "cannot open certificate {}: {}",
            tls.certificate.display(),
            e
        ))
    })?;
    let key_file = File::open(&tls.private_key).map_err(|e| {
        XmppError::config(format!(
            "cannot open private key {}: {}",
            tls.private_key.display(),
            e
        ))
    })?;

    let certs: Vec<_> = certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| XmppError::config(format!("invalid certificate file: {}", e)))?;

    let key = pkcs8_private_keys(&mut BufReader::new(key_file))
        .next()
        .ok_or_else(|| XmppError::config("no private key found"))?
        .map_err(|e| XmppError::config(format!("invalid private key: {}", e)))?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, PrivateKeyDer::Pkcs8(key))
        .map_err(|e| XmppError::tls(format!("TLS configuration rejected: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
