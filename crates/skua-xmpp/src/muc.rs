//! Multi-User Chat glue (XEP-0045, minimal).
//!
//! A small in-process component that demonstrates the extension surface:
//! it claims `*@conference.<domain>/*` through the public route API, keeps
//! occupant lists per room, relays groupchat messages, and uses disconnect
//! listeners to evict occupants whose connection went away. Room history,
//! affiliations and configuration are out of scope.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use jid::{FullJid, Jid};
use minidom::Element;
use tracing::{debug, info, warn};

use crate::parser::ns;
use crate::pattern::RoutePattern;
use crate::registry::{ConnectionRegistry, ListenerId};
use crate::routing::StanzaRouter;
use crate::stanza::Stanza;
use crate::types::StanzaKind;
use crate::XmppError;

struct Occupant {
    nick: String,
    real_jid: FullJid,
    listener: ListenerId,
}

#[derive(Default)]
struct Room {
    occupants: Vec<Occupant>,
}

impl Room {
    fn find_by_jid(&self, jid: &FullJid) -> Option<&Occupant> {
        self.occupants.iter().find(|o| o.real_jid == *jid)
    }

    fn find_by_nick(&self, nick: &str) -> Option<&Occupant> {
        self.occupants.iter().find(|o| o.nick == nick)
    }
}

/// The MUC component.
pub struct MucComponent {
    /// The component's domain, `conference.<server domain>`.
    domain: String,
    rooms: Mutex<HashMap<String, Room>>,
    router: Weak<StanzaRouter>,
    registry: Weak<ConnectionRegistry>,
}

impl MucComponent {
    /// Create the component and register its stanza route.
    pub fn attach(
        router: &Arc<StanzaRouter>,
        registry: &Arc<ConnectionRegistry>,
        server_domain: &str,
    ) -> Result<Arc<Self>, XmppError> {
        let domain = format!("conference.{}", server_domain);
        let pattern = RoutePattern::new(Some("*"), &domain, Some("*"))?;

        let component = Arc::new(Self {
            domain,
            rooms: Mutex::new(HashMap::new()),
            router: Arc::downgrade(router),
            registry: Arc::downgrade(registry),
        });

        let weak = Arc::downgrade(&component);
        router.register_stanza_route(
            pattern,
            Arc::new(move |stanza| match weak.upgrade() {
                Some(component) => component.handle_stanza(stanza),
                None => false,
            }),
        );

        info!(domain = %component.domain, "MUC component attached");
        Ok(component)
    }

    /// The component's domain.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Number of active rooms.
    pub fn room_count(&self) -> usize {
        self.rooms_lock().len()
    }

    /// Occupant count for a room, if it exists.
    pub fn occupant_count(&self, room: &str) -> Option<usize> {
        self.rooms_lock().get(room).map(|r| r.occupants.len())
    }

    fn rooms_lock(&self) -> MutexGuard<'_, HashMap<String, Room>> {
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The stanza-route callback.
    fn handle_stanza(self: &Arc<Self>, stanza: &Stanza) -> bool {
        match stanza.kind() {
            StanzaKind::Presence => self.handle_presence(stanza),
            StanzaKind::Message => self.handle_message(stanza),
            _ => {
                debug!(kind = %stanza.kind(), "MUC ignores this stanza kind");
                false
            }
        }
    }

    /// Presence to `room@conference.domain/nick` joins or leaves.
    fn handle_presence(self: &Arc<Self>, stanza: &Stanza) -> bool {
        let Some((room, nick)) = self.room_and_nick(stanza.to()) else {
            debug!("presence to MUC without room/nick addressing");
            return false;
        };
        let Some(sender) = full_sender(stanza) else {
            debug!("presence to MUC without a full sender JID");
            return false;
        };

        match stanza.element().attr("type") {
            None => self.join(&room, &nick, sender),
            Some("unavailable") => self.leave(&room, &sender),
            Some(other) => {
                debug!(presence_type = other, "MUC ignores this presence type");
                true
            }
        }
    }

    fn join(self: &Arc<Self>, room_name: &str, nick: &str, sender: FullJid) -> bool {
        let mut outgoing = Vec::new();
        {
            let mut rooms = self.rooms_lock();
            let room = rooms.entry(room_name.to_owned()).or_default();

            if let Some(existing) = room.find_by_nick(nick) {
                if existing.real_jid != sender {
                    warn!(room = room_name, nick, "nick already taken");
                    return false;
                }
                // Re-join with the same nick is idempotent.
                return true;
            }

            // Evict the occupant again when its connection dies.
            let listener = match self.registry.upgrade() {
                Some(registry) => {
                    let component = Arc::downgrade(self);
                    registry.add_disconnect_listener(
                        sender.clone(),
                        Arc::new(move |jid| {
                            if let Some(component) = component.upgrade() {
                                component.evict(jid);
                            }
                        }),
                    )
                }
                None => return false,
            };

            // The new occupant learns about everyone already present.
            for occupant in &room.occupants {
                outgoing.extend(self.presence_stanza(
                    room_name,
                    &occupant.nick,
                    &sender,
                    false,
                    false,
                ));
            }

            room.occupants.push(Occupant {
                nick: nick.to_owned(),
                real_jid: sender.clone(),
                listener,
            });

            // Everyone (including the joiner, with status 110) sees the join.
            for occupant in &room.occupants {
                let is_self = occupant.real_jid == sender;
                outgoing.extend(self.presence_stanza(
                    room_name,
                    nick,
                    &occupant.real_jid,
                    false,
                    is_self,
                ));
            }

            debug!(room = room_name, nick, occupants = room.occupants.len(), "occupant joined");
        }

        self.route_all(outgoing)
    }

    fn leave(self: &Arc<Self>, room_name: &str, sender: &FullJid) -> bool {
        let mut outgoing = Vec::new();
        {
            let mut rooms = self.rooms_lock();
            let Some(room) = rooms.get_mut(room_name) else {
                debug!(room = room_name, "leave for unknown room");
                return false;
            };
            let Some(index) = room.occupants.iter().position(|o| o.real_jid == *sender) else {
                debug!(room = room_name, "leave from a non-occupant");
                return false;
            };

            let occupant = room.occupants.remove(index);
            if let Some(registry) = self.registry.upgrade() {
                registry.remove_disconnect_listener(occupant.listener);
            }

            outgoing.extend(self.presence_stanza(room_name, &occupant.nick, sender, true, true));
            for remaining in &room.occupants {
                outgoing.extend(self.presence_stanza(
                    room_name,
                    &occupant.nick,
                    &remaining.real_jid,
                    true,
                    false,
                ));
            }

            let now_empty = room.occupants.is_empty();
            if now_empty {
                rooms.remove(room_name);
                debug!(room = room_name, "room emptied and removed");
            }
        }

        self.route_all(outgoing)
    }

    /// Groupchat message to `room@conference.domain`, relayed to every
    /// occupant from the sender's room JID.
    fn handle_message(self: &Arc<Self>, stanza: &Stanza) -> bool {
        let Some((room_name, _)) = self.room_and_nick_or_bare(stanza.to()) else {
            debug!("message to MUC without a room address");
            return false;
        };
        let Some(sender) = full_sender(stanza) else {
            debug!("message to MUC without a full sender JID");
            return false;
        };
        if stanza.element().attr("type") != Some("groupchat") {
            debug!("MUC relays groupchat messages only");
            return false;
        }

        let mut outgoing = Vec::new();
        {
            let rooms = self.rooms_lock();
            let Some(room) = rooms.get(&room_name) else {
                debug!(room = %room_name, "message to unknown room");
                return false;
            };
            let Some(occupant) = room.find_by_jid(&sender) else {
                debug!(room = %room_name, from = %sender, "message from a non-occupant");
                return false;
            };

            let from_room: Jid = match format!("{}@{}/{}", room_name, self.domain, occupant.nick)
                .parse()
            {
                Ok(jid) => jid,
                Err(e) => {
                    warn!(error = %e, "occupant room JID does not parse");
                    return false;
                }
            };

            for recipient in &room.occupants {
                let mut relayed = stanza.clone();
                relayed.set_from(&from_room);
                relayed.set_to(&Jid::from(recipient.real_jid.clone()));
                outgoing.push(relayed);
            }
        }

        self.route_all(outgoing)
    }

    /// Remove a disconnected client from every room it occupies.
    fn evict(self: &Arc<Self>, jid: &FullJid) {
        let mut outgoing = Vec::new();
        {
            let mut rooms = self.rooms_lock();
            let mut emptied = Vec::new();

            for (room_name, room) in rooms.iter_mut() {
                let Some(index) = room.occupants.iter().position(|o| o.real_jid == *jid) else {
                    continue;
                };
                let occupant = room.occupants.remove(index);
                debug!(room = %room_name, nick = %occupant.nick, "evicting disconnected occupant");

                for remaining in &room.occupants {
                    outgoing.extend(self.presence_stanza(
                        room_name,
                        &occupant.nick,
                        &remaining.real_jid,
                        true,
                        false,
                    ));
                }
                if room.occupants.is_empty() {
                    emptied.push(room_name.clone());
                }
            }
            for room_name in emptied {
                rooms.remove(&room_name);
            }
        }

        self.route_all(outgoing);
    }

    /// Build one occupant presence, addressed to a specific recipient.
    fn presence_stanza(
        &self,
        room: &str,
        nick: &str,
        recipient: &FullJid,
        unavailable: bool,
        is_self: bool,
    ) -> Option<Stanza> {
        let mut x = Element::builder("x", ns::MUC_USER).append(
            Element::builder("item", ns::MUC_USER)
                .attr("affiliation", "member")
                .attr("role", if unavailable { "none" } else { "participant" })
                .build(),
        );
        if is_self {
            x = x.append(Element::builder("status", ns::MUC_USER).attr("code", "110").build());
        }

        let mut builder = Element::builder("presence", ns::CLIENT)
            .attr("from", format!("{}@{}/{}", room, self.domain, nick))
            .attr("to", recipient.to_string())
            .append(x.build());
        if unavailable {
            builder = builder.attr("type", "unavailable");
        }

        match Stanza::from_element(builder.build()) {
            Ok(stanza) => Some(stanza),
            Err(e) => {
                warn!(error = %e, "failed to build MUC presence");
                None
            }
        }
    }

    /// Route a batch of stanzas; built under the room lock, sent outside it.
    fn route_all(&self, stanzas: Vec<Stanza>) -> bool {
        let Some(router) = self.router.upgrade() else {
            return false;
        };
        let mut all_delivered = true;
        for stanza in &stanzas {
            if !router.route_stanza(stanza) {
                all_delivered = false;
            }
        }
        all_delivered
    }

    /// Split `room@conference.domain/nick` addressing; the resource is
    /// required.
    fn room_and_nick(&self, to: Option<&Jid>) -> Option<(String, String)> {
        let to = to?;
        if to.domain().as_str() != self.domain {
            return None;
        }
        let room = to.node()?.as_str().to_owned();
        let nick = to.resource()?.as_str().to_owned();
        Some((room, nick))
    }

    /// Like [`room_and_nick`](Self::room_and_nick) but accepts a bare room
    /// JID (messages are addressed to the room itself).
    fn room_and_nick_or_bare(&self, to: Option<&Jid>) -> Option<(String, Option<String>)> {
        let to = to?;
        if to.domain().as_str() != self.domain {
            return None;
        }
        let room = to.node()?.as_str().to_owned();
        let nick = to.resource().map(|r| r.as_str().to_owned());
        Some((room, nick))
    }
}

fn full_sender(stanza: &Stanza) -> Option<FullJid> {
    stanza.from().cloned().and_then(|jid| jid.try_into_full().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    struct Fixture {
        router: Arc<StanzaRouter>,
        registry: Arc<ConnectionRegistry>,
        muc: Arc<MucComponent>,
    }

    fn fixture() -> Fixture {
        let router = Arc::new(StanzaRouter::new("localhost").unwrap());
        let registry = Arc::new(ConnectionRegistry::new());
        let muc = MucComponent::attach(&router, &registry, "localhost").unwrap();
        Fixture {
            router,
            registry,
            muc,
        }
    }

    /// Bind a fake client: registry entry plus a capture route.
    fn bind_client(fixture: &Fixture, jid: &str) -> (FullJid, Arc<StdMutex<Vec<Stanza>>>) {
        let full: FullJid = jid.parse().unwrap();
        let (tx, _rx) = mpsc::channel(16);
        fixture.registry.register(full.clone(), tx).unwrap();

        let captured = Arc::new(StdMutex::new(Vec::new()));
        let inner = Arc::clone(&captured);
        fixture.router.register_stanza_route(
            RoutePattern::from(&full),
            Arc::new(move |stanza: &Stanza| {
                inner.lock().unwrap().push(stanza.clone());
                true
            }),
        );
        (full, captured)
    }

    fn join_presence(from: &str, room: &str, nick: &str) -> Stanza {
        let xml = format!(
            "<presence xmlns='jabber:client' from='{}' to='{}@conference.localhost/{}'/>",
            from, room, nick
        );
        Stanza::from_element(xml.parse().unwrap()).unwrap()
    }

    fn groupchat(from: &str, room: &str, body: &str) -> Stanza {
        let xml = format!(
            "<message xmlns='jabber:client' type='groupchat' from='{}' \
             to='{}@conference.localhost'><body>{}</body></message>",
            from, room, body
        );
        Stanza::from_element(xml.parse().unwrap()).unwrap()
    }

    #[test]
    fn join_creates_room_and_echoes_self_presence() {
        let fixture = fixture();
        let (_alice, inbox) = bind_client(&fixture, "alice@localhost/home");

        assert!(fixture
            .router
            .dispatch(&join_presence("alice@localhost/home", "tavern", "Alice")));

        assert_eq!(fixture.muc.room_count(), 1);
        assert_eq!(fixture.muc.occupant_count("tavern"), Some(1));

        let inbox = inbox.lock().unwrap();
        assert_eq!(inbox.len(), 1);
        let presence = &inbox[0];
        assert_eq!(
            presence.from().unwrap().to_string(),
            "tavern@conference.localhost/Alice"
        );
        let x = presence.element().get_child("x", ns::MUC_USER).unwrap();
        assert!(x.children().any(|c| c.attr("code") == Some("110")));
    }

    #[test]
    fn second_join_sees_existing_occupants() {
        let fixture = fixture();
        let (_alice, alice_inbox) = bind_client(&fixture, "alice@localhost/home");
        let (_bob, bob_inbox) = bind_client(&fixture, "bob@localhost/work");

        fixture
            .router
            .dispatch(&join_presence("alice@localhost/home", "tavern", "Alice"));
        fixture
            .router
            .dispatch(&join_presence("bob@localhost/work", "tavern", "Bob"));

        assert_eq!(fixture.muc.occupant_count("tavern"), Some(2));

        // Bob got Alice's presence and his own self-presence.
        let bob_inbox = bob_inbox.lock().unwrap();
        let froms: Vec<String> = bob_inbox
            .iter()
            .map(|s| s.from().unwrap().to_string())
            .collect();
        assert!(froms.contains(&"tavern@conference.localhost/Alice".to_owned()));
        assert!(froms.contains(&"tavern@conference.localhost/Bob".to_owned()));

        // Alice saw Bob join.
        let alice_inbox = alice_inbox.lock().unwrap();
        assert!(alice_inbox
            .iter()
            .any(|s| s.from().unwrap().to_string() == "tavern@conference.localhost/Bob"));
    }

    #[test]
    fn groupchat_is_relayed_to_all_occupants() {
        let fixture = fixture();
        let (_alice, alice_inbox) = bind_client(&fixture, "alice@localhost/home");
        let (_bob, bob_inbox) = bind_client(&fixture, "bob@localhost/work");

        fixture
            .router
            .dispatch(&join_presence("alice@localhost/home", "tavern", "Alice"));
        fixture
            .router
            .dispatch(&join_presence("bob@localhost/work", "tavern", "Bob"));
        alice_inbox.lock().unwrap().clear();
        bob_inbox.lock().unwrap().clear();

        assert!(fixture
            .router
            .dispatch(&groupchat("alice@localhost/home", "tavern", "evening all")));

        for inbox in [&alice_inbox, &bob_inbox] {
            let inbox = inbox.lock().unwrap();
            assert_eq!(inbox.len(), 1);
            let msg = &inbox[0];
            assert_eq!(
                msg.from().unwrap().to_string(),
                "tavern@conference.localhost/Alice"
            );
            assert!(msg.to_xml().unwrap().contains("evening all"));
        }
    }

    #[test]
    fn non_occupant_cannot_post() {
        let fixture = fixture();
        let (_alice, _) = bind_client(&fixture, "alice@localhost/home");
        let (_mallory, _) = bind_client(&fixture, "mallory@localhost/x");

        fixture
            .router
            .dispatch(&join_presence("alice@localhost/home", "tavern", "Alice"));

        assert!(!fixture
            .router
            .dispatch(&groupchat("mallory@localhost/x", "tavern", "let me in")));
    }

    #[test]
    fn nick_conflict_is_rejected() {
        let fixture = fixture();
        let (_alice, _) = bind_client(&fixture, "alice@localhost/home");
        let (_bob, _) = bind_client(&fixture, "bob@localhost/work");

        assert!(fixture
            .router
            .dispatch(&join_presence("alice@localhost/home", "tavern", "Hero")));
        assert!(!fixture
            .router
            .dispatch(&join_presence("bob@localhost/work", "tavern", "Hero")));
        assert_eq!(fixture.muc.occupant_count("tavern"), Some(1));
    }

    #[test]
    fn leave_removes_occupant_and_empties_room() {
        let fixture = fixture();
        let (_alice, _) = bind_client(&fixture, "alice@localhost/home");

        fixture
            .router
            .dispatch(&join_presence("alice@localhost/home", "tavern", "Alice"));

        let xml = "<presence xmlns='jabber:client' type='unavailable' \
                   from='alice@localhost/home' to='tavern@conference.localhost/Alice'/>";
        let leave = Stanza::from_element(xml.parse().unwrap()).unwrap();
        assert!(fixture.router.dispatch(&leave));

        assert_eq!(fixture.muc.room_count(), 0);
    }

    #[test]
    fn disconnect_evicts_occupant_from_rooms() {
        let fixture = fixture();
        let (alice, _) = bind_client(&fixture, "alice@localhost/home");
        let (_bob, bob_inbox) = bind_client(&fixture, "bob@localhost/work");

        fixture
            .router
            .dispatch(&join_presence("alice@localhost/home", "tavern", "Alice"));
        fixture
            .router
            .dispatch(&join_presence("bob@localhost/work", "tavern", "Bob"));
        bob_inbox.lock().unwrap().clear();

        // Simulates the connection teardown path.
        fixture.registry.unregister(&alice);

        assert_eq!(fixture.muc.occupant_count("tavern"), Some(1));
        let bob_inbox = bob_inbox.lock().unwrap();
        assert!(bob_inbox.iter().any(|s| {
            s.from().unwrap().to_string() == "tavern@conference.localhost/Alice"
                && s.element().attr("type") == Some("unavailable")
        }));
    }
}
