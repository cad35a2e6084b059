//! End-to-end client-to-server tests over real TCP.
//!
//! Each test starts a plaintext server (TLS disabled, open authentication)
//! on an ephemeral port and drives it with scripted clients speaking wire
//! XMPP.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use skua_xmpp::{
    ConnectionRegistry, RoutePattern, StanzaRouter, StaticAuthenticator, XmppServer,
    XmppServerConfig,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

struct TestServer {
    addr: SocketAddr,
    router: Arc<StanzaRouter>,
    registry: Arc<ConnectionRegistry>,
    _shutdown: CancellationToken,
}

async fn start_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let shutdown = CancellationToken::new();

    let server = XmppServer::new(
        XmppServerConfig::default(),
        Arc::new(StaticAuthenticator::open()),
        listener,
        shutdown.clone(),
    )
    .unwrap();

    let addr = server.local_addr().unwrap();
    let router = Arc::clone(server.router());
    let registry = Arc::clone(server.registry());
    tokio::spawn(server.run());

    TestServer {
        addr,
        router,
        registry,
        _shutdown: shutdown,
    }
}

struct TestClient {
    stream: TcpStream,
    inbox: String,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            stream,
            inbox: String::new(),
        }
    }

    async fn send(&mut self, data: &str) {
        self.stream.write_all(data.as_bytes()).await.unwrap();
    }

    /// Read until `needle` appears, returning everything up to and
    /// including it. Later bytes stay buffered for the next call.
    async fn read_until(&mut self, needle: &str) -> String {
        loop {
            if let Some(pos) = self.inbox.find(needle) {
                let end = pos + needle.len();
                return self.inbox.drain(..end).collect();
            }

            let mut buf = [0u8; 4096];
            let n = timeout(Duration::from_secs(5), self.stream.read(&mut buf))
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

    async fn authenticate(&mut self, user: &str, password: &str) {
        let features = self.open_stream().await;
        assert!(
            features.contains("PLAIN"),
            "expected SASL features, got {features:?}"
        );

        let token = BASE64_STANDARD.encode(format!("\0{user}\0{password}"));
        self.send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{token}</auth>"
        ))
        .await;
        self.read_until("<success").await;
    }

    /// Send a bind request and return the server's raw reply.
    async fn request_bind(&mut self, resource: Option<&str>) -> String {
        let payload = match resource {
            Some(resource) => format!("<resource>{resource}</resource>"),
            None => String::new(),
        };
        self.send(&format!(
            "<iq type='set' id='bind_1'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>{payload}</bind></iq>"
        ))
        .await;
        self.read_until("</iq>").await
    }

    async fn establish_session(&mut self) {
        self.send(
            "<iq type='set' id='sess_1'>\
             <session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></iq>",
        )
        .await;
        // The ack is an empty result iq, serialized self-closing.
        let ack = self.read_until("sess_1").await + &self.read_until(">").await;
        assert!(ack.contains("result"), "expected session ack, got {ack:?}");
    }

    /// Full negotiation; returns the bound full JID.
    async fn login(addr: SocketAddr, user: &str, resource: Option<&str>) -> (Self, String) {
        let mut client = Self::connect(addr).await;
        client.authenticate(user, "password").await;

        let features = client.open_stream().await;
        assert!(
            features.contains("urn:ietf:params:xml:ns:xmpp-bind"),
            "expected bind features, got {features:?}"
        );

        let reply = client.request_bind(resource).await;
        let jid = extract_jid(&reply)
            .unwrap_or_else(|| panic!("bind failed for {user}: {reply:?}"));
        client.establish_session().await;
        (client, jid)
    }
}

fn extract_jid(bind_reply: &str) -> Option<String> {
    let start = bind_reply.find("<jid>")? + "<jid>".len();
    let end = bind_reply.find("</jid>")?;
    Some(bind_reply[start..end].to_owned())
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

#[tokio::test]
async fn happy_path_message_delivery() {
    let server = start_server().await;

    let (mut bob, bob_jid) = TestClient::login(server.addr, "bob", Some("work")).await;
    assert_eq!(bob_jid, "bob@localhost/work");

    let (mut alice, alice_jid) = TestClient::login(server.addr, "alice", Some("home")).await;
    assert_eq!(alice_jid, "alice@localhost/home");

    alice
        .send("<message to='bob@localhost/work' type='chat'><body>hi</body></message>")
        .await;

    let delivered = bob.read_until("</message>").await;
    assert!(delivered.contains("<body>hi</body>"), "got {delivered:?}");
    // The server stamps the real sender.
    assert!(
        delivered.contains("alice@localhost/home"),
        "got {delivered:?}"
    );
}

#[tokio::test]
async fn server_generates_resource_when_none_proposed() {
    let server = start_server().await;

    let (_client, jid) = TestClient::login(server.addr, "alice", None).await;

    let resource = jid
        .strip_prefix("alice@localhost/")
        .unwrap_or_else(|| panic!("unexpected jid {jid:?}"));
    assert!(resource.len() >= 16, "short generated resource {resource:?}");
    assert!(resource.chars().all(|c| c.is_ascii_alphanumeric()));
}

#[tokio::test]
async fn bind_conflict_leaves_first_binding_intact() {
    let server = start_server().await;

    let (mut first, _) = TestClient::login(server.addr, "alice", Some("home")).await;

    // The second client authenticates as the same user and wants the same
    // resource.
    let mut second = TestClient::connect(server.addr).await;
    second.authenticate("alice", "password").await;
    second.open_stream().await;

    let reply = second.request_bind(Some("home")).await;
    assert!(reply.contains("<conflict"), "expected conflict, got {reply:?}");
    assert!(reply.contains("error"), "expected error iq, got {reply:?}");

    // Same stream, second attempt with a different resource succeeds.
    let reply = second.request_bind(Some("tablet")).await;
    assert_eq!(extract_jid(&reply).as_deref(), Some("alice@localhost/tablet"));
    second.establish_session().await;

    // The first binding still receives traffic.
    second
        .send("<message to='alice@localhost/home' type='chat'><body>still there?</body></message>")
        .await;
    let delivered = first.read_until("</message>").await;
    assert!(delivered.contains("still there?"));
}

#[tokio::test]
async fn wildcard_route_catches_otherwise_unrouted_stanzas() {
    let server = start_server().await;

    let (mut alice, _) = TestClient::login(server.addr, "alice", Some("home")).await;

    let caught = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&caught);
    server.router.register_stanza_route(
        RoutePattern::any(),
        Arc::new(move |stanza| {
            if stanza.to().map(|j| j.to_string()).as_deref() == Some("nobody@elsewhere.example") {
                inner.fetch_add(1, Ordering::SeqCst);
            }
            true
        }),
    );

    alice
        .send("<message to='nobody@elsewhere.example'><body>into the void</body></message>")
        .await;

    wait_until(|| caught.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn iq_routes_win_over_wildcard_stanza_routes() {
    let server = start_server().await;

    let (mut alice, _) = TestClient::login(server.addr, "alice", Some("home")).await;

    let wildcard_hits = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&wildcard_hits);
    server.router.register_stanza_route(
        RoutePattern::any(),
        Arc::new(move |_| {
            inner.fetch_add(1, Ordering::SeqCst);
            true
        }),
    );

    alice
        .send("<iq type='get' id='roster_1'><query xmlns='jabber:iq:roster'/></iq>")
        .await;

    // The roster route answers; the wildcard stanza route never fires.
    let reply = alice.read_until("</iq>").await;
    assert!(reply.contains("roster_1"), "got {reply:?}");
    assert!(reply.contains("result"), "got {reply:?}");
    assert_eq!(wildcard_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn disco_describes_the_server() {
    let server = start_server().await;
    let (mut alice, _) = TestClient::login(server.addr, "alice", Some("home")).await;

    alice
        .send("<iq type='get' id='info_1' to='localhost'>\
               <query xmlns='http://jabber.org/protocol/disco#info'/></iq>")
        .await;
    let reply = alice.read_until("</iq>").await;
    assert!(reply.contains("info_1"), "got {reply:?}");
    assert!(reply.contains("category"), "got {reply:?}");
    assert!(reply.contains("server"), "got {reply:?}");

    alice
        .send("<iq type='get' id='items_1' to='localhost'>\
               <query xmlns='http://jabber.org/protocol/disco#items'/></iq>")
        .await;
    let reply = alice.read_until("</iq>").await;
    assert!(reply.contains("items_1"), "got {reply:?}");
    assert!(reply.contains("conference.localhost"), "got {reply:?}");
}

#[tokio::test]
async fn unknown_server_iq_is_answered_with_service_unavailable() {
    let server = start_server().await;
    let (mut alice, _) = TestClient::login(server.addr, "alice", Some("home")).await;

    alice
        .send("<iq type='get' id='v1' to='localhost'><query xmlns='jabber:iq:version'/></iq>")
        .await;
    let reply = alice.read_until("</iq>").await;
    assert!(reply.contains("v1"), "got {reply:?}");
    assert!(reply.contains("service-unavailable"), "got {reply:?}");
}

#[tokio::test]
async fn ungraceful_disconnect_cleans_up_routes_and_registry() {
    let server = start_server().await;

    let (alice, _) = TestClient::login(server.addr, "alice", Some("home")).await;
    let (mut bob, _) = TestClient::login(server.addr, "bob", Some("work")).await;
    assert_eq!(server.registry.connection_count(), 2);

    // Kill alice's TCP connection without a stream close.
    drop(alice);

    let registry = Arc::clone(&server.registry);
    wait_until(move || registry.connection_count() == 1).await;

    let alice_jid: jid::FullJid = "alice@localhost/home".parse().unwrap();
    assert!(!server.registry.is_bound(&alice_jid));

    // A stanza to the dead JID is dropped silently; the server keeps
    // serving bob.
    bob.send("<message to='alice@localhost/home' type='chat'><body>anyone?</body></message>")
        .await;
    bob.send("<iq type='get' id='after_1'><query xmlns='jabber:iq:roster'/></iq>")
        .await;
    let reply = bob.read_until("</iq>").await;
    assert!(reply.contains("after_1"), "got {reply:?}");
    assert!(reply.contains("result"), "got {reply:?}");
}

#[tokio::test]
async fn muc_join_and_groupchat_roundtrip() {
    let server = start_server().await;

    let (mut alice, _) = TestClient::login(server.addr, "alice", Some("home")).await;
    let (mut bob, _) = TestClient::login(server.addr, "bob", Some("work")).await;

    // Alice joins and sees her own presence with status 110.
    alice
        .send("<presence to='tavern@conference.localhost/Alice'/>")
        .await;
    let own = alice.read_until("110").await;
    assert!(own.contains("tavern@conference.localhost/Alice"), "got {own:?}");

    // Bob joins; both sides observe it.
    bob.send("<presence to='tavern@conference.localhost/Bob'/>")
        .await;
    bob.read_until("110").await;
    alice
        .read_until("tavern@conference.localhost/Bob")
        .await;

    // Alice posts; bob receives it from her room JID.
    alice
        .send("<message to='tavern@conference.localhost' type='groupchat'>\
               <body>evening all</body></message>")
        .await;
    let relayed = bob.read_until("evening all").await;
    assert!(
        relayed.contains("tavern@conference.localhost/Alice"),
        "got {relayed:?}"
    );

    // Dropping bob's connection evicts him; alice sees the unavailable
    // presence.
    drop(bob);
    let gone = alice.read_until("unavailable").await;
    assert!(gone.contains("tavern@conference.localhost/Bob"), "got {gone:?}");
}
