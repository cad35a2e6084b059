//! The routing fabric: stanza routes and IQ routes.
//!
//! Two tables decide where a stanza goes. The stanza table is an ordered
//! list of JID patterns (first match wins, insertion order breaks ties); the
//! IQ table is a map keyed by the namespace of an IQ's single payload child.
//! Components register callbacks into both through the same API the server
//! itself uses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use jid::Jid;
use tracing::{debug, info, warn};

use crate::pattern::RoutePattern;
use crate::stanza::Stanza;
use crate::types::StanzaKind;
use crate::XmppError;

/// A route callback.
///
/// Returns `true` when the stanza was delivered and `false` when delivery
/// failed. The router never removes a route because its callback returned
/// `false`; components manage their own route lifetimes. Callbacks run
/// synchronously inside the dispatch and must not block.
pub type RouteCallback = Arc<dyn Fn(&Stanza) -> bool + Send + Sync>;

struct StanzaRoute {
    pattern: RoutePattern,
    callback: RouteCallback,
}

/// The two routing tables plus the server's own JID, which is the dispatch
/// target for stanzas without a `to` attribute.
///
/// Lookups complete before any callback runs, and removal only unlinks the
/// entry (the callback `Arc` stays alive until the dispatch frame ends), so
/// a callback may deregister any route, including its own, mid-dispatch.
pub struct StanzaRouter {
    server_jid: Jid,
    stanza_routes: RwLock<Vec<StanzaRoute>>,
    iq_routes: RwLock<HashMap<String, RouteCallback>>,
    shutting_down: AtomicBool,
}

impl StanzaRouter {
    /// Create a router for the given server domain.
    pub fn new(domain: &str) -> Result<Self, XmppError> {
        let server_jid = domain
            .parse()
            .map_err(|e| XmppError::malformed_jid(format!("server domain {}: {}", domain, e)))?;
        Ok(Self {
            server_jid,
            stanza_routes: RwLock::new(Vec::new()),
            iq_routes: RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// The server's own JID.
    pub fn server_jid(&self) -> &Jid {
        &self.server_jid
    }

    /// The server domain.
    pub fn domain(&self) -> &str {
        self.server_jid.domain().as_str()
    }

    /// Refuse all further registrations; called when shutdown begins.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    fn stanza_routes_read(&self) -> RwLockReadGuard<'_, Vec<StanzaRoute>> {
        self.stanza_routes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn stanza_routes_write(&self) -> RwLockWriteGuard<'_, Vec<StanzaRoute>> {
        self.stanza_routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn iq_routes_read(&self) -> RwLockReadGuard<'_, HashMap<String, RouteCallback>> {
        self.iq_routes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn iq_routes_write(&self) -> RwLockWriteGuard<'_, HashMap<String, RouteCallback>> {
        self.iq_routes.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a stanza route.
    ///
    /// A route whose pattern equals an existing one is rejected with a
    /// warning; the earlier registration stays installed.
    pub fn register_stanza_route(&self, pattern: RoutePattern, callback: RouteCallback) {
        if self.is_shutting_down() {
            warn!(pattern = %pattern, "stanza route registration rejected during shutdown");
            return;
        }

        let mut routes = self.stanza_routes_write();
        if routes.iter().any(|r| r.pattern == pattern) {
            warn!(pattern = %pattern, "attempted to insert duplicate stanza route");
            return;
        }
        debug!(pattern = %pattern, "stanza route registered");
        routes.push(StanzaRoute { pattern, callback });
    }

    /// Remove the stanza route with this exact pattern.
    pub fn deregister_stanza_route(&self, pattern: &RoutePattern) {
        let mut routes = self.stanza_routes_write();
        match routes.iter().position(|r| r.pattern == *pattern) {
            Some(index) => {
                routes.remove(index);
                debug!(pattern = %pattern, "stanza route deregistered");
            }
            None => warn!(pattern = %pattern, "attempted to remove non-existent stanza route"),
        }
    }

    /// Register an IQ route for a payload namespace.
    pub fn register_iq_route(&self, namespace: &str, callback: RouteCallback) {
        if self.is_shutting_down() {
            warn!(namespace, "IQ route registration rejected during shutdown");
            return;
        }

        let mut routes = self.iq_routes_write();
        if routes.contains_key(namespace) {
            warn!(namespace, "attempted to insert duplicate IQ route");
            return;
        }
        debug!(namespace, "IQ route registered");
        routes.insert(namespace.to_owned(), callback);
    }

    /// Remove the IQ route for a payload namespace.
    pub fn deregister_iq_route(&self, namespace: &str) {
        let mut routes = self.iq_routes_write();
        match routes.remove(namespace) {
            Some(_) => debug!(namespace, "IQ route deregistered"),
            None => warn!(namespace, "attempted to remove non-existent IQ route"),
        }
    }

    /// First stanza route matching the target, if any.
    fn lookup_stanza_route(&self, target: &Jid) -> Option<RouteCallback> {
        self.stanza_routes_read()
            .iter()
            .find(|r| r.pattern.matches(target))
            .map(|r| Arc::clone(&r.callback))
    }

    fn lookup_iq_route(&self, namespace: &str) -> Option<RouteCallback> {
        self.iq_routes_read().get(namespace).map(Arc::clone)
    }

    /// Route a stanza by its `to` JID (the server JID when absent).
    ///
    /// Unroutable stanzas are dropped here with an info log; the protocol
    /// permits that at the client-to-server boundary, and no error stanza is
    /// synthesized at this layer.
    pub fn route_stanza(&self, stanza: &Stanza) -> bool {
        let target = stanza.to().unwrap_or(&self.server_jid);
        match self.lookup_stanza_route(target) {
            Some(callback) => callback(stanza),
            None => {
                info!(to = %target, kind = %stanza.kind(), "no route for destination");
                false
            }
        }
    }

    /// Route an IQ by its payload namespace.
    pub fn route_iq(&self, namespace: &str, stanza: &Stanza) -> bool {
        match self.lookup_iq_route(namespace) {
            Some(callback) => callback(stanza),
            None => {
                info!(namespace, "no IQ route for namespace");
                false
            }
        }
    }

    /// Full dispatch for one inbound stanza.
    ///
    /// An IQ with exactly one payload child goes to the IQ table first; when
    /// no IQ route claims the namespace (and for everything else), the
    /// stanza table decides by destination JID.
    pub fn dispatch(&self, stanza: &Stanza) -> bool {
        if stanza.kind() == StanzaKind::Iq {
            if let Some(payload) = stanza.iq_payload() {
                let namespace = payload.ns();
                if let Some(callback) = self.lookup_iq_route(&namespace) {
                    return callback(stanza);
                }
            }
        }
        self.route_stanza(stanza)
    }

    /// Number of installed stanza routes.
    pub fn stanza_route_count(&self) -> usize {
        self.stanza_routes_read().len()
    }

    /// Number of installed IQ routes.
    pub fn iq_route_count(&self) -> usize {
        self.iq_routes_read().len()
    }
}

impl std::fmt::Debug for StanzaRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StanzaRouter")
            .field("server_jid", &self.server_jid.to_string())
            .field("stanza_routes", &self.stanza_route_count())
            .field("iq_routes", &self.iq_route_count())
            .finish()
    }
}
