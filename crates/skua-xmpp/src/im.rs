//! Built-in IM handlers.
//!
//! The routes every server instance installs at startup: session
//! establishment, roster queries, service discovery, and the core stanza
//! handler that owns the server's own JID.

use std::sync::{Arc, Weak};

use jid::Jid;
use minidom::Element;
use tracing::{debug, warn};

use crate::error::{StanzaErrorCondition, StanzaErrorType};
use crate::parser::ns;
use crate::pattern::RoutePattern;
use crate::routing::{RouteCallback, StanzaRouter};
use crate::stanza::Stanza;
use crate::types::{IqType, StanzaKind};
use crate::XmppError;

/// Install the built-in IQ routes and the server-JID stanza route.
pub(crate) fn register_core_routes(router: &Arc<StanzaRouter>) -> Result<(), XmppError> {
    let domain = router.domain().to_owned();

    router.register_iq_route(ns::SESSION, session_route(router, &domain));
    router.register_iq_route(ns::ROSTER, roster_route(router, &domain));
    router.register_iq_route(ns::DISCO_INFO, disco_info_route(router, &domain));
    router.register_iq_route(ns::DISCO_ITEMS, disco_items_route(router, &domain));

    let server_pattern = RoutePattern::new(None, &domain, None)?;
    router.register_stanza_route(server_pattern, core_stanza_route(router, &domain));

    Ok(())
}

/// Wrap a handler function into a route callback holding a weak router
/// reference (the router owns the callback, so a strong one would cycle).
fn weak_route<F>(router: &Arc<StanzaRouter>, handler: F) -> RouteCallback
where
    F: Fn(&StanzaRouter, &Stanza) -> bool + Send + Sync + 'static,
{
    let router: Weak<StanzaRouter> = Arc::downgrade(router);
    Arc::new(move |stanza| match router.upgrade() {
        Some(router) => handler(&router, stanza),
        None => false,
    })
}

fn session_route(router: &Arc<StanzaRouter>, domain: &str) -> RouteCallback {
    let domain = domain.to_owned();
    weak_route(router, move |router, stanza| {
        if stanza.iq_type() != Some(IqType::Set) {
            debug!("ignoring session IQ that is not a set");
            return true;
        }
        reply(router, stanza, &domain, None)
    })
}

fn roster_route(router: &Arc<StanzaRouter>, domain: &str) -> RouteCallback {
    let domain = domain.to_owned();
    weak_route(router, move |router, stanza| {
        match stanza.iq_type() {
            Some(IqType::Get) => {
                // Rosters are not persisted; every client starts empty.
                let query = Element::builder("query", ns::ROSTER).build();
                reply(router, stanza, &domain, Some(query))
            }
            Some(IqType::Set) => reply_error(
                router,
                stanza,
                &domain,
                StanzaErrorCondition::FeatureNotImplemented,
                StanzaErrorType::Cancel,
            ),
            _ => true,
        }
    })
}

fn disco_info_route(router: &Arc<StanzaRouter>, domain: &str) -> RouteCallback {
    let domain = domain.to_owned();
    weak_route(router, move |router, stanza| {
        if stanza.iq_type() != Some(IqType::Get) {
            return true;
        }

        let identity = Element::builder("identity", ns::DISCO_INFO)
            .attr("category", "server")
            .attr("type", "im")
            .attr("name", "skua")
            .build();
        let query = Element::builder("query", ns::DISCO_INFO)
            .append(identity)
            .append(feature(ns::DISCO_INFO))
            .append(feature(ns::DISCO_ITEMS))
            .append(feature(ns::MUC))
            .build();
        reply(router, stanza, &domain, Some(query))
    })
}

fn disco_items_route(router: &Arc<StanzaRouter>, domain: &str) -> RouteCallback {
    let domain = domain.to_owned();
    weak_route(router, move |router, stanza| {
        if stanza.iq_type() != Some(IqType::Get) {
            return true;
        }

        let conference = Element::builder("item", ns::DISCO_ITEMS)
            .attr("jid", format!("conference.{}", domain))
            .attr("name", "Chatrooms")
            .build();
        let query = Element::builder("query", ns::DISCO_ITEMS)
            .append(conference)
            .build();
        reply(router, stanza, &domain, Some(query))
    })
}

/// The handler behind the server's own JID.
///
/// IQs that reach it were claimed by no IQ route, so the server answers
/// `service-unavailable`. Messages and presence addressed to the server are
/// accepted and dropped.
fn core_stanza_route(router: &Arc<StanzaRouter>, domain: &str) -> RouteCallback {
    let domain = domain.to_owned();
    weak_route(router, move |router, stanza| match stanza.kind() {
        StanzaKind::Iq => match stanza.iq_type() {
            Some(IqType::Get) | Some(IqType::Set) => reply_error(
                router,
                stanza,
                &domain,
                StanzaErrorCondition::ServiceUnavailable,
                StanzaErrorType::Cancel,
            ),
            _ => true,
        },
        StanzaKind::Message | StanzaKind::Presence => {
            debug!(kind = %stanza.kind(), "dropping stanza addressed to the server");
            true
        }
        StanzaKind::Other => false,
    })
}

fn feature(var: &str) -> Element {
    Element::builder("feature", ns::DISCO_INFO)
        .attr("var", var)
        .build()
}

/// Build and route an IQ result back to the requester.
fn reply(router: &StanzaRouter, request: &Stanza, domain: &str, payload: Option<Element>) -> bool {
    let Some(from) = request.from() else {
        warn!("cannot answer an IQ with no sender");
        return false;
    };

    match iq_result(request.id().unwrap_or_default(), domain, from, payload) {
        Ok(result) => router.route_stanza(&result),
        Err(e) => {
            warn!(error = %e, "failed to build IQ result");
            false
        }
    }
}

/// Build and route an IQ error back to the requester.
fn reply_error(
    router: &StanzaRouter,
    request: &Stanza,
    domain: &str,
    condition: StanzaErrorCondition,
    error_type: StanzaErrorType,
) -> bool {
    let Some(from) = request.from() else {
        warn!("cannot answer an IQ with no sender");
        return false;
    };

    let error = Element::builder("error", ns::CLIENT)
        .attr("type", error_type.as_str())
        .append(Element::builder(condition.as_str(), ns::STANZAS).build())
        .build();
    let element = Element::builder("iq", ns::CLIENT)
        .attr("type", "error")
        .attr("id", request.id().unwrap_or_default())
        .attr("from", domain)
        .attr("to", from.to_string())
        .append(error)
        .build();

    match Stanza::from_element(element) {
        Ok(reply) => router.route_stanza(&reply),
        Err(e) => {
            warn!(error = %e, "failed to build IQ error");
            false
        }
    }
}

/// Build an IQ result stanza.
fn iq_result(
    id: &str,
    from: &str,
    to: &Jid,
    payload: Option<Element>,
) -> Result<Stanza, XmppError> {
    let mut builder = Element::builder("iq", ns::CLIENT)
        .attr("type", "result")
        .attr("id", id)
        .attr("from", from)
        .attr("to", to.to_string());
    if let Some(payload) = payload {
        builder = builder.append(payload);
    }
    Stanza::from_element(builder.build())
}
