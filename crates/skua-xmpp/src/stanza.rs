//! In-memory representation of one XMPP stanza.
//!
//! The routing fabric treats stanzas as opaque: the original element tree is
//! preserved for re-serialization, and only the handful of attributes
//! dispatch needs (kind, addressing, IQ type and payload) are parsed out.

use jid::Jid;
use minidom::Element;

use crate::types::{IqType, StanzaKind};
use crate::XmppError;

/// A parsed stanza.
///
/// Stanzas are short-lived values owned by the dispatch that produced them.
/// Route callbacks receive a shared reference and may clone, but must not
/// retain the reference beyond the dispatch frame.
#[derive(Debug, Clone)]
pub struct Stanza {
    kind: StanzaKind,
    from: Option<Jid>,
    to: Option<Jid>,
    element: Element,
}

impl Stanza {
    /// Wrap a top-level element, parsing its addressing attributes.
    ///
    /// Fails with `MalformedJid` when a `from` or `to` attribute does not
    /// parse as a JID.
    pub fn from_element(element: Element) -> Result<Self, XmppError> {
        let kind = StanzaKind::from_name(element.name());
        let from = parse_jid_attr(&element, "from")?;
        let to = parse_jid_attr(&element, "to")?;
        Ok(Self {
            kind,
            from,
            to,
            element,
        })
    }

    /// The stanza kind.
    pub fn kind(&self) -> StanzaKind {
        self.kind
    }

    /// The sender, if the stanza carries a `from` attribute.
    pub fn from(&self) -> Option<&Jid> {
        self.from.as_ref()
    }

    /// The destination, if the stanza carries a `to` attribute.
    ///
    /// An absent destination means "this server".
    pub fn to(&self) -> Option<&Jid> {
        self.to.as_ref()
    }

    /// The `id` attribute.
    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    /// The underlying element tree.
    pub fn element(&self) -> &Element {
        &self.element
    }

    /// The IQ type, when this is an IQ stanza with a valid `type` attribute.
    pub fn iq_type(&self) -> Option<IqType> {
        if self.kind != StanzaKind::Iq {
            return None;
        }
        self.element.attr("type").and_then(IqType::from_attr)
    }

    /// The IQ payload: the single child element whose namespace identifies
    /// the query semantics.
    ///
    /// Returns `None` for non-IQ stanzas and for IQs that do not have
    /// exactly one child.
    pub fn iq_payload(&self) -> Option<&Element> {
        if self.kind != StanzaKind::Iq {
            return None;
        }
        let mut children = self.element.children();
        let first = children.next()?;
        if children.next().is_some() {
            return None;
        }
        Some(first)
    }

    /// Overwrite the sender address.
    ///
    /// The server stamps every inbound stanza with the originating
    /// connection's full JID before dispatch, so recipients cannot be lied
    /// to about the sender.
    pub fn set_from(&mut self, jid: &Jid) {
        self.element.set_attr("from", jid.to_string());
        self.from = Some(jid.clone());
    }

    /// Overwrite the destination address.
    pub fn set_to(&mut self, jid: &Jid) {
        self.element.set_attr("to", jid.to_string());
        self.to = Some(jid.clone());
    }

    /// Serialize back to wire XML.
    pub fn to_xml(&self) -> Result<String, XmppError> {
        element_to_string(&self.element)
    }
}

/// Serialize an element to an XML string.
pub fn element_to_string(element: &Element) -> Result<String, XmppError> {
    let mut output = Vec::new();
    element
        .write_to(&mut output)
        .map_err(|e| XmppError::parse(format!("failed to serialize element: {}", e)))?;
    String::from_utf8(output).map_err(|e| XmppError::parse(format!("invalid UTF-8: {}", e)))
}

fn parse_jid_attr(element: &Element, name: &str) -> Result<Option<Jid>, XmppError> {
    element
        .attr(name)
        .map(|value| {
            value
                .parse()
                .map_err(|e| XmppError::malformed_jid(format!("{}: {}", value, e)))
        })
        .transpose()
}
