//! Server configuration, read from `SKUA_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;

use skua_xmpp::{StaticAuthenticator, TlsConfig, XmppServerConfig};
use tracing::info;

/// Everything the binary needs to start the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address, `SKUA_LISTEN_ADDR` (default `0.0.0.0:5222`).
    pub listen_addr: SocketAddr,
    /// Server domain, `SKUA_SERVER_NAME` (default `localhost`).
    pub server_name: String,
    /// Whether STARTTLS is offered, `SKUA_SSL_ENABLED` (default off).
    pub ssl_enabled: bool,
    /// Certificate path, `SKUA_SSL_CERTIFICATE`.
    pub ssl_certificate: Option<PathBuf>,
    /// Private key path, `SKUA_SSL_PRIVATE_KEY`.
    pub ssl_private_key: Option<PathBuf>,
    /// Per-connection read buffer, `SKUA_BUFFER_SIZE` (default 4096).
    pub buffer_size: usize,
    /// `user:password` pairs, comma separated, `SKUA_USERS`. Empty accepts
    /// any credentials.
    pub users: Vec<(String, String)>,
}

impl ServerConfig {
    /// Load and validate the configuration from the environment.
    pub fn from_env() -> Result<Self, String> {
        let listen_addr = match std::env::var("SKUA_LISTEN_ADDR") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| format!("invalid SKUA_LISTEN_ADDR {:?}: {}", raw, e))?,
            Err(_) => SocketAddr::from(([0, 0, 0, 0], 5222)),
        };

        let server_name =
            std::env::var("SKUA_SERVER_NAME").unwrap_or_else(|_| "localhost".to_owned());
        if server_name.is_empty() {
            return Err("SKUA_SERVER_NAME must not be empty".to_owned());
        }

        let ssl_enabled = matches!(
            std::env::var("SKUA_SSL_ENABLED").as_deref(),
            Ok("1") | Ok("true") | Ok("yes")
        );
        let ssl_certificate = std::env::var_os("SKUA_SSL_CERTIFICATE").map(PathBuf::from);
        let ssl_private_key = std::env::var_os("SKUA_SSL_PRIVATE_KEY").map(PathBuf::from);

        if ssl_enabled && (ssl_certificate.is_none() || ssl_private_key.is_none()) {
            return Err(
                "SKUA_SSL_ENABLED requires SKUA_SSL_CERTIFICATE and SKUA_SSL_PRIVATE_KEY"
                    .to_owned(),
            );
        }

        let buffer_size = match std::env::var("SKUA_BUFFER_SIZE") {
            Ok(raw) => {
                let size: usize = raw
                    .parse()
                    .map_err(|e| format!("invalid SKUA_BUFFER_SIZE {:?}: {}", raw, e))?;
                if size == 0 {
                    return Err("SKUA_BUFFER_SIZE must be positive".to_owned());
                }
                size
            }
            Err(_) => 4096,
        };

        let users = match std::env::var("SKUA_USERS") {
            Ok(raw) => parse_users(&raw)?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            listen_addr,
            server_name,
            ssl_enabled,
            ssl_certificate,
            ssl_private_key,
            buffer_size,
            users,
        })
    }

    /// Log the effective configuration at startup.
    pub fn log_config(&self) {
        info!(
            listen = %self.listen_addr,
            domain = %self.server_name,
            ssl = self.ssl_enabled,
            buffer_size = self.buffer_size,
            users = self.users.len(),
            "configuration loaded"
        );
    }

    /// The core library's view of this configuration.
    pub fn to_xmpp_config(&self) -> XmppServerConfig {
        let tls = if self.ssl_enabled {
            match (&self.ssl_certificate, &self.ssl_private_key) {
                (Some(certificate), Some(private_key)) => Some(TlsConfig {
                    certificate: certificate.clone(),
                    private_key: private_key.clone(),
                }),
                _ => None,
            }
        } else {
            None
        };

        XmppServerConfig {
            listen_addr: self.listen_addr,
            domain: self.server_name.clone(),
            tls,
            buffer_size: self.buffer_size,
        }
    }

    /// Build the authenticator for the configured users.
    pub fn authenticator(&self) -> StaticAuthenticator {
        StaticAuthenticator::new(self.users.iter().cloned())
    }
}

fn parse_users(raw: &str) -> Result<Vec<(String, String)>, String> {
    raw.split(',')
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| {
            entry
                .split_once(':')
                .map(|(user, password)| (user.trim().to_owned(), password.to_owned()))
                .ok_or_else(|| format!("invalid SKUA_USERS entry {:?}, expected user:password", entry))
        })
        .collect()
}
