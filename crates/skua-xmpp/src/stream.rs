//! XML stream handling for client connections.
//!
//! `XmppStream` couples a [`ClientSocket`](crate::socket::ClientSocket) with
//! its per-connection [`XmlParser`](crate::parser::XmlParser) and provides
//! the protocol send helpers the negotiation state machine needs.

use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::parser::{ns, StreamEvent, XmlParser};
use crate::socket::ClientSocket;
use crate::stanza::Stanza;
use crate::types::Transport;
use crate::XmppError;

/// A client's XML stream.
pub struct XmppStream {
    /// The socket; `None` only transiently while a TLS upgrade is in flight.
    socket: Option<ClientSocket>,
    parser: XmlParser,
    domain: String,
    stream_id: String,
    read_buf: Vec<u8>,
}

impl XmppStream {
    /// Wrap a freshly-accepted socket.
    ///
    /// `buffer_size` is the per-connection read buffer, from configuration.
    pub fn new(socket: ClientSocket, domain: String, buffer_size: usize) -> Self {
        Self {
            socket: Some(socket),
            parser: XmlParser::new(),
            domain,
            stream_id: uuid::Uuid::new_v4().to_string(),
            read_buf: vec![0u8; buffer_size.max(1)],
        }
    }

    /// The server-assigned id of the current stream.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// The transport currently under the stream.
    pub fn transport(&self) -> Transport {
        self.socket
            .as_ref()
            .map(ClientSocket::transport)
            .unwrap_or(Transport::Tcp)
    }

    /// Whether the stream runs over TLS.
    pub fn is_tls(&self) -> bool {
        self.socket.as_ref().is_some_and(ClientSocket::is_tls)
    }

    fn socket_mut(&mut self) -> Result<&mut ClientSocket, XmppError> {
        self.socket
            .as_mut()
            .ok_or_else(|| XmppError::stream("socket lost during TLS upgrade"))
    }

    /// Read the next stream event, pulling bytes from the socket as needed.
    ///
    /// `Ok(None)` means the peer closed the TCP connection.
    pub async fn read_event(&mut self) -> Result<Option<StreamEvent>, XmppError> {
        loop {
            if let Some(event) = self.parser.next_event()? {
                return Ok(Some(event));
            }

            let socket = self
                .socket
                .as_mut()
                .ok_or_else(|| XmppError::stream("socket lost during TLS upgrade"))?;
            let n = socket.read(&mut self.read_buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.parser.feed(&self.read_buf[..n]);
        }
    }

    /// Wait for the client's stream header; anything else is a violation.
    pub async fn expect_stream_open(&mut self) -> Result<crate::parser::StreamHeader, XmppError> {
        match self.read_event().await? {
            Some(StreamEvent::StreamOpen(header)) => {
                header.validate()?;
                debug!(to = ?header.to, version = ?header.version, "received stream header");
                Ok(header)
            }
            Some(StreamEvent::Stanza(el)) => Err(XmppError::protocol_violation(format!(
                "expected stream header, got <{}>",
                el.name()
            ))),
            Some(StreamEvent::StreamClose) | None => {
                Err(XmppError::stream("connection closed before stream header"))
            }
        }
    }

    /// Send the server's stream header, opening a new stream.
    pub async fn send_stream_header(&mut self) -> Result<(), XmppError> {
        self.stream_id = uuid::Uuid::new_v4().to_string();
        let header = format!(
            "<?xml version='1.0'?>\
             <stream:stream xmlns='{}' xmlns:stream='{}' \
             id='{}' from='{}' version='1.0'>",
            ns::CLIENT,
            ns::STREAM,
            self.stream_id,
            self.domain
        );
        self.send_raw(&header).await?;
        debug!(stream_id = %self.stream_id, "sent stream header");
        Ok(())
    }

    /// Advertise STARTTLS as the only available (and required) feature.
    pub async fn send_features_starttls(&mut self) -> Result<(), XmppError> {
        let features = format!(
            "<stream:features><starttls xmlns='{}'><required/></starttls></stream:features>",
            ns::TLS
        );
        self.send_raw(&features).await
    }

    /// Advertise the SASL mechanisms this server accepts.
    pub async fn send_features_sasl(&mut self) -> Result<(), XmppError> {
        let features = format!(
            "<stream:features><mechanisms xmlns='{}'>\
             <mechanism>PLAIN</mechanism></mechanisms></stream:features>",
            ns::SASL
        );
        self.send_raw(&features).await
    }

    /// Advertise resource binding and optional session establishment.
    pub async fn send_features_bind(&mut self) -> Result<(), XmppError> {
        let features = format!(
            "<stream:features><bind xmlns='{}'/>\
             <session xmlns='{}'><optional/></session></stream:features>",
            ns::BIND,
            ns::SESSION
        );
        self.send_raw(&features).await
    }

    /// Acknowledge STARTTLS, run the TLS handshake on the same TCP stream,
    /// and reset the parser for the fresh encrypted stream.
    pub async fn starttls(&mut self, acceptor: &TlsAcceptor) -> Result<(), XmppError> {
        self.send_raw(&format!("<proceed xmlns='{}'/>", ns::TLS))
            .await?;

        let socket = self
            .socket
            .take()
            .ok_or_else(|| XmppError::stream("socket lost during TLS upgrade"))?;
        let socket = socket.upgrade_tls(acceptor).await?;
        self.socket = Some(socket);

        // RFC 6120: the stream restarts from scratch after the handshake.
        // Whatever the old parser had buffered belongs to the dead stream.
        self.parser.reset();
        debug!("TLS upgrade complete");
        Ok(())
    }

    /// Report SASL success and reset the parser for the fresh stream.
    pub async fn send_sasl_success(&mut self) -> Result<(), XmppError> {
        self.send_raw(&format!("<success xmlns='{}'/>", ns::SASL))
            .await?;
        self.parser.reset();
        Ok(())
    }

    /// Report a SASL failure with the given condition element.
    pub async fn send_sasl_failure(&mut self, condition: &str) -> Result<(), XmppError> {
        self.send_raw(&format!(
            "<failure xmlns='{}'><{}/></failure>",
            ns::SASL,
            condition
        ))
        .await
    }

    /// Serialize and send one stanza.
    pub async fn write_stanza(&mut self, stanza: &Stanza) -> Result<(), XmppError> {
        let xml = stanza.to_xml()?;
        self.send_raw(&xml).await
    }

    /// Send raw XML and flush.
    pub async fn send_raw(&mut self, xml: &str) -> Result<(), XmppError> {
        let socket = self.socket_mut()?;
        socket.write_all(xml.as_bytes()).await?;
        socket.flush().await
    }

    /// Close the stream gracefully: stream close tag, then TCP shutdown.
    pub async fn close(&mut self) -> Result<(), XmppError> {
        let socket = self.socket_mut()?;
        socket.write_all(b"</stream:stream>").await?;
        socket.flush().await?;
        socket.shutdown().await
    }
}
