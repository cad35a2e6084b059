//! Route patterns: JID-shaped keys for the stanza route table.
//!
//! A pattern follows the JID grammar `[local "@"] domain ["/" resource]` but
//! additionally allows the literal `*` as a wildcard in any component.
//! Wildcards are valid only in route keys; on-wire JIDs use the `jid` crate's
//! validated types.

use std::fmt;
use std::str::FromStr;

use jid::{FullJid, Jid};

use crate::XmppError;

/// The wildcard marker accepted in any pattern component.
pub const WILDCARD: &str = "*";

/// A JID pattern used as a stanza route key.
///
/// Equality is componentwise and structural, which is also the route
/// uniqueness criterion: two routes with equal patterns cannot coexist.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutePattern {
    local: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl RoutePattern {
    /// Create a pattern from its components.
    ///
    /// The domain must be non-empty; empty local or resource parts are
    /// rejected as malformed.
    pub fn new(
        local: Option<&str>,
        domain: &str,
        resource: Option<&str>,
    ) -> Result<Self, XmppError> {
        if domain.is_empty() || domain.contains('@') || domain.contains('/') {
            return Err(XmppError::malformed_jid(format!(
                "invalid domain in pattern: {:?}",
                domain
            )));
        }
        if local == Some("") {
            return Err(XmppError::malformed_jid("empty local part in pattern"));
        }
        if resource == Some("") {
            return Err(XmppError::malformed_jid("empty resource in pattern"));
        }
        Ok(Self {
            local: local.map(str::to_owned),
            domain: domain.to_owned(),
            resource: resource.map(str::to_owned),
        })
    }

    /// The catch-all pattern: matches every target.
    pub fn any() -> Self {
        Self {
            local: Some(WILDCARD.to_owned()),
            domain: WILDCARD.to_owned(),
            resource: Some(WILDCARD.to_owned()),
        }
    }

    /// The local part, if the pattern has one.
    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    /// The domain part.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The resource part, if the pattern has one.
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// Whether this pattern matches a target JID.
    ///
    /// The domain must match the pattern's (or the pattern's is `*`). If the
    /// target carries a local part, the pattern must carry a matching one
    /// (or `*`); the same rule applies to the resource. A bare target thus
    /// matches any pattern with an agreeing domain and local part, whatever
    /// the pattern's resource says.
    pub fn matches(&self, target: &Jid) -> bool {
        if self.domain != WILDCARD && target.domain().as_str() != self.domain {
            return false;
        }

        if let Some(local) = target.node() {
            match &self.local {
                None => return false,
                Some(p) if p != WILDCARD && p != local.as_str() => return false,
                Some(_) => {}
            }
        }

        if let Some(resource) = target.resource() {
            match &self.resource {
                None => return false,
                Some(p) if p != WILDCARD && p != resource.as_str() => return false,
                Some(_) => {}
            }
        }

        true
    }
}

impl FromStr for RoutePattern {
    type Err = XmppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (head, resource) = match s.find('/') {
            Some(i) => (&s[..i], Some(&s[i + 1..])),
            None => (s, None),
        };

        let (local, domain) = match head.find('@') {
            Some(i) => (Some(&head[..i]), &head[i + 1..]),
            None => (None, head),
        };

        Self::new(local, domain, resource)
    }
}

// Display is the inverse of FromStr: `parse(format(p)) == p` for every valid
// pattern.
impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(local) = &self.local {
            write!(f, "{}@", local)?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

impl From<&FullJid> for RoutePattern {
    fn from(jid: &FullJid) -> Self {
        Self {
            local: jid.node().map(|n| n.as_str().to_owned()),
            domain: jid.domain().as_str().to_owned(),
            resource: Some(jid.resource().as_str().to_owned()),
        }
    }
}
