//! The authentication seam.
//!
//! The core does not own a credential store; it hands SASL PLAIN
//! credentials to an [`Authenticator`] supplied by the embedding process.

use std::collections::HashMap;

use jid::BareJid;

use crate::XmppError;

/// Verifies SASL PLAIN credentials.
///
/// Implementations are shared across all connections and must not block;
/// slow lookups should be async.
pub trait Authenticator: Send + Sync + 'static {
    /// Check the credentials for `jid`.
    ///
    /// Returns `Ok(())` on success and `AuthFailed` otherwise.
    fn authenticate(
        &self,
        jid: &BareJid,
        password: &str,
    ) -> impl std::future::Future<Output = Result<(), XmppError>> + Send;
}

/// A fixed in-memory credential table.
///
/// With no users configured it accepts any credentials, which is the
/// serverless-chat deployment mode (and what the integration tests use).
#[derive(Debug, Default)]
pub struct StaticAuthenticator {
    users: HashMap<String, String>,
}

impl StaticAuthenticator {
    /// Accept any credentials.
    pub fn open() -> Self {
        Self::default()
    }

    /// Build from `(user, password)` pairs.
    pub fn new(users: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            users: users.into_iter().collect(),
        }
    }

    /// Add a user.
    pub fn with_user(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(user.into(), password.into());
        self
    }

    /// Whether any credentials are configured.
    pub fn is_open(&self) -> bool {
        self.users.is_empty()
    }
}

impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, jid: &BareJid, password: &str) -> Result<(), XmppError> {
        if self.users.is_empty() {
            return Ok(());
        }

        let user = jid.node().map(|n| n.as_str()).unwrap_or_default();
        match self.users.get(user) {
            Some(expected) if expected == password => Ok(()),
            _ => Err(XmppError::auth_failed(format!(
                "invalid credentials for {}",
                jid
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare(s: &str) -> BareJid {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn open_authenticator_accepts_anyone() {
        let auth = StaticAuthenticator::open();
        assert!(auth.authenticate(&bare("alice@localhost"), "x").await.is_ok());
        assert!(auth.authenticate(&bare("bob@localhost"), "").await.is_ok());
    }

    #[tokio::test]
    async fn static_table_checks_password() {
        let auth = StaticAuthenticator::open().with_user("alice", "secret");

        assert!(auth
            .authenticate(&bare("alice@localhost"), "secret")
            .await
            .is_ok());
        assert!(matches!(
            auth.authenticate(&bare("alice@localhost"), "wrong").await,
            Err(XmppError::AuthFailed(_))
        ));
        assert!(matches!(
            auth.authenticate(&bare("bob@localhost"), "secret").await,
            Err(XmppError::AuthFailed(_))
        ));
    }
}
