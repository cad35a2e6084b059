//! Client socket abstraction.
//!
//! One type covers both halves of a client's life: plain TCP before
//! STARTTLS and the TLS-wrapped stream after. The upgrade consumes the
//! plaintext variant, so no code path can keep writing cleartext to a
//! connection that negotiated encryption.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::types::Transport;
use crate::XmppError;

/// A client-facing socket, plaintext or TLS.
pub enum ClientSocket {
    /// Plain TCP.
    Plain(TcpStream),
    /// TCP upgraded to TLS.
    Tls(Box<TlsStream<TcpStream>>),
}

impl ClientSocket {
    /// The transport this socket currently speaks.
    pub fn transport(&self) -> Transport {
        match self {
            ClientSocket::Plain(_) => Transport::Tcp,
            ClientSocket::Tls(_) => Transport::TcpTls,
        }
    }

    /// Whether TLS is active.
    pub fn is_tls(&self) -> bool {
        matches!(self, ClientSocket::Tls(_))
    }

    /// Read bytes from the peer. Zero means orderly close.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, XmppError> {
        match self {
            ClientSocket::Plain(s) => Ok(s.read(buf).await?),
            ClientSocket::Tls(s) => Ok(s.read(buf).await?),
        }
    }

    /// Write the whole buffer to the peer.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), XmppError> {
        match self {
            ClientSocket::Plain(s) => Ok(s.write_all(data).await?),
            ClientSocket::Tls(s) => Ok(s.write_all(data).await?),
        }
    }

    /// Flush buffered writes.
    pub async fn flush(&mut self) -> Result<(), XmppError> {
        match self {
            ClientSocket::Plain(s) => Ok(s.flush().await?),
            ClientSocket::Tls(s) => Ok(s.flush().await?),
        }
    }

    /// Shut down the write half.
    pub async fn shutdown(&mut self) -> Result<(), XmppError> {
        match self {
            ClientSocket::Plain(s) => Ok(s.shutdown().await?),
            ClientSocket::Tls(s) => Ok(s.shutdown().await?),
        }
    }

    /// Upgrade a plaintext socket to TLS on the same TCP stream.
    ///
    /// Runs the server-side handshake before returning; a handshake failure
    /// drops the stream. Upgrading an already-encrypted socket is a protocol
    /// violation.
    pub async fn upgrade_tls(self, acceptor: &TlsAcceptor) -> Result<ClientSocket, XmppError> {
        match self {
            ClientSocket::Plain(tcp) => {
                let tls = acceptor
                    .accept(tcp)
                    .await
                    .map_err(|e| XmppError::tls(format!("handshake failed: {}", e)))?;
                Ok(ClientSocket::Tls(Box::new(tls)))
            }
            ClientSocket::Tls(_) => Err(XmppError::protocol_violation(
                "STARTTLS on an already-encrypted stream",
            )),
        }
    }
}

impl std::fmt::Debug for ClientSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ClientSocket")
            .field(&self.transport())
            .finish()
    }
}
