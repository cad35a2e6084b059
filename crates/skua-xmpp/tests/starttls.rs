//! STARTTLS negotiation tests over real TCP.
//!
//! Each test starts a TLS-enabled server (self-signed certificate written
//! to disk, so the acceptor is loaded through the same path production
//! uses) and drives it with scripted clients that upgrade mid-stream.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use skua_xmpp::{StaticAuthenticator, TlsConfig, XmppServer, XmppServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

/// Install the ring crypto provider once; rustls refuses to pick one when
/// several are compiled in.
fn install_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .expect("failed to install crypto provider");
    });
}

struct TlsFixture {
    cert_path: PathBuf,
    key_path: PathBuf,
    cert_der: CertificateDer<'static>,
}

impl TlsFixture {
    /// Generate a self-signed certificate and write the PEM files the
    /// server configuration points at.
    fn generate() -> Self {
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

        let dir = std::env::temp_dir();
        let tag = uuid::Uuid::new_v4();
        let cert_path = dir.join(format!("skua-test-{}.crt", tag));
        let key_path = dir.join(format!("skua-test-{}.key", tag));
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

        Self {
            cert_path,
            key_path,
            cert_der: CertificateDer::from(cert.der().to_vec()),
        }
    }

    /// A client-side connector that trusts this certificate.
    fn connector(&self) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        roots.add(self.cert_der.clone()).unwrap();
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }
}

async fn start_tls_server() -> (SocketAddr, TlsFixture) {
    install_crypto_provider();
    let fixture = TlsFixture::generate();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = XmppServerConfig {
        tls: Some(TlsConfig {
            certificate: fixture.cert_path.clone(),
            private_key: fixture.key_path.clone(),
        }),
        ..Default::default()
    };
    let server = XmppServer::new(
        config,
        Arc::new(StaticAuthenticator::open()),
        listener,
        CancellationToken::new(),
    )
    .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    (addr, fixture)
}

/// A scripted client that starts plaintext and upgrades to TLS mid-stream.
struct TlsTestClient {
    tcp: Option<TcpStream>,
    tls: Option<TlsStream<TcpStream>>,
    inbox: String,
}

impl TlsTestClient {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            tcp: Some(TcpStream::connect(addr).await.unwrap()),
            tls: None,
            inbox: String::new(),
        }
    }

    async fn send(&mut self, data: &str) {
        if let Some(tls) = &mut self.tls {
            tls.write_all(data.as_bytes()).await.unwrap();
            tls.flush().await.unwrap();
        } else if let Some(tcp) = &mut self.tcp {
            tcp.write_all(data.as_bytes()).await.unwrap();
            tcp.flush().await.unwrap();
        } else {
            panic!("client has no stream");
        }
    }

    async fn read_until(&mut self, needle: &str) -> String {
        loop {
            if let Some(pos) = self.inbox.find(needle) {
                let end = pos + needle.len();
                return self.inbox.drain(..end).collect();
            }

            let mut buf = [0u8; 4096];
            let read = async {
                if let Some(tls) = &mut self.tls {
                    tls.read(&mut buf).await
                } else if let Some(tcp) = &mut self.tcp {
                    tcp.read(&mut buf).await
                } else {
                    panic!("client has no stream");
                }
            };
            let n = timeout(Duration::from_secs(5), read)
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {:?}", needle))
                .unwrap();
            assert!(n > 0, "connection closed while waiting for {:?}", needle);
            self.inbox.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }

    async fn open_stream(&mut self) -> String {
        self.send(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' to='localhost' version='1.0'>",
        )
        .await;
        self.read_until("</stream:features>").await
    }

    /// Run the TLS handshake on the established TCP stream. Anything left
    /// in the plaintext inbox belongs to the dead stream.
    async fn upgrade(&mut self, connector: &TlsConnector) {
        let tcp = self.tcp.take().expect("already upgraded");
        let name = ServerName::try_from("localhost").unwrap();
        self.tls = Some(connector.connect(name, tcp).await.unwrap());
        self.inbox.clear();
    }

    /// STARTTLS request/proceed exchange plus the handshake itself.
    async fn starttls(&mut self, connector: &TlsConnector) {
        self.send("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
            .await;
        let proceed = self.read_until("/>").await;
        assert!(proceed.contains("<proceed"), "got {proceed:?}");
        self.upgrade(connector).await;
    }

    async fn authenticate(&mut self, user: &str) {
        let token = BASE64_STANDARD.encode(format!("\0{}\0password", user));
        self.send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            token
        ))
        .await;
        self.read_until("<success").await;
    }

    async fn bind(&mut self, resource: &str) -> String {
        self.send(&format!(
            "<iq type='set' id='bind_1'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <resource>{}</resource></bind></iq>",
            resource
        ))
        .await;
        let reply = self.read_until("</iq>").await;
        extract_jid(&reply).unwrap_or_else(|| panic!("bind failed: {reply:?}"))
    }

    async fn establish_session(&mut self) {
        self.send(
            "<iq type='set' id='sess_1'>\
             <session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></iq>",
        )
        .await;
        let ack = self.read_until("sess_1").await + &self.read_until(">").await;
        assert!(ack.contains("result"), "expected session ack, got {ack:?}");
    }

    /// The whole ladder: STARTTLS, SASL, bind, session.
    async fn login(
        addr: SocketAddr,
        connector: &TlsConnector,
        user: &str,
        resource: &str,
    ) -> (Self, String) {
        let mut client = Self::connect(addr).await;

        let features = client.open_stream().await;
        assert!(features.contains("<starttls"), "got {features:?}");
        assert!(features.contains("<required/>"), "got {features:?}");
        // Nothing but the TLS upgrade is on offer before encryption.
        assert!(!features.contains("<mechanisms"), "got {features:?}");

        client.starttls(connector).await;

        let features = client.open_stream().await;
        assert!(features.contains("PLAIN"), "got {features:?}");

        client.authenticate(user).await;

        let features = client.open_stream().await;
        assert!(
            features.contains("urn:ietf:params:xml:ns:xmpp-bind"),
            "got {features:?}"
        );

        let jid = client.bind(resource).await;
        client.establish_session().await;
        (client, jid)
    }
}

fn extract_jid(bind_reply: &str) -> Option<String> {
    let start = bind_reply.find("<jid>")? + "<jid>".len();
    let end = bind_reply.find("</jid>")?;
    Some(bind_reply[start..end].to_owned())
}

#[tokio::test]
async fn starttls_then_full_negotiation_and_delivery() {
    let (addr, fixture) = start_tls_server().await;
    let connector = fixture.connector();

    let (mut bob, bob_jid) = TlsTestClient::login(addr, &connector, "bob", "work").await;
    assert_eq!(bob_jid, "bob@localhost/work");

    let (mut alice, alice_jid) = TlsTestClient::login(addr, &connector, "alice", "home").await;
    assert_eq!(alice_jid, "alice@localhost/home");

    alice
        .send("<message to='bob@localhost/work' type='chat'><body>hi over tls</body></message>")
        .await;

    let delivered = bob.read_until("</message>").await;
    assert!(delivered.contains("hi over tls"), "got {delivered:?}");
    assert!(
        delivered.contains("alice@localhost/home"),
        "got {delivered:?}"
    );
}

/// No XML context survives the upgrade: a partial element sent in the same
/// write as the starttls request is discarded with the plaintext stream,
/// and the fresh stream over TLS negotiates cleanly.
#[tokio::test]
async fn plaintext_parser_state_does_not_survive_starttls() {
    let (addr, fixture) = start_tls_server().await;
    let connector = fixture.connector();

    let mut client = TlsTestClient::connect(addr).await;
    let features = client.open_stream().await;
    assert!(features.contains("<starttls"), "got {features:?}");

    // The upgrade request with the start of another stanza behind it; the
    // fragment reaches the server's parser before the handshake.
    client
        .send(
            "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>\
             <message to='bob@localhost'><bo",
        )
        .await;
    let proceed = client.read_until("/>").await;
    assert!(proceed.contains("<proceed"), "got {proceed:?}");
    client.upgrade(&connector).await;

    // Were the fragment still buffered, the restart would be rejected as
    // ill-formed XML. The full ladder must complete instead.
    let features = client.open_stream().await;
    assert!(features.contains("PLAIN"), "got {features:?}");
    client.authenticate("alice").await;
    client.open_stream().await;
    let jid = client.bind("home").await;
    assert_eq!(jid, "alice@localhost/home");
}

/// STARTTLS on an already-encrypted stream is a protocol violation and
/// closes the connection.
#[tokio::test]
async fn second_starttls_is_rejected() {
    let (addr, fixture) = start_tls_server().await;
    let connector = fixture.connector();

    let mut client = TlsTestClient::connect(addr).await;
    client.open_stream().await;
    client.starttls(&connector).await;
    client.open_stream().await;

    // The server offered SASL; a second upgrade request is out of order.
    client
        .send("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
        .await;

    let mut buf = [0u8; 1024];
    let tls = client.tls.as_mut().unwrap();
    loop {
        let n = timeout(Duration::from_secs(5), tls.read(&mut buf))
            .await
            .expect("timed out waiting for the connection to close")
            .unwrap_or(0);
        if n == 0 {
            break;
        }
    }
}
