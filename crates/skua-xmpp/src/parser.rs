//! Incremental XML parsing for XMPP streams.
//!
//! XMPP uses one long-lived XML document per stream, so stanzas must be
//! framed out of a byte stream that arrives in arbitrary chunks. The framing
//! pass tracks element depth with a streaming tokenizer; a top-level element
//! is complete when the depth returns to zero, and only then is the slice
//! handed to minidom for namespace-aware tree building.

use minidom::Element;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::XmppError;

/// Namespace URIs used in XMPP.
pub mod ns {
    /// XMPP client namespace.
    pub const CLIENT: &str = "jabber:client";
    /// XMPP streams namespace.
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// STARTTLS namespace.
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace.
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace.
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Session establishment namespace.
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Stanza error namespace.
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// Stream error namespace.
    pub const STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// Roster queries.
    pub const ROSTER: &str = "jabber:iq:roster";
    /// Service discovery: entity information (XEP-0030).
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    /// Service discovery: associated items (XEP-0030).
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
    /// Multi-User Chat (XEP-0045).
    pub const MUC: &str = "http://jabber.org/protocol/muc";
    /// Multi-User Chat occupant extensions (XEP-0045).
    pub const MUC_USER: &str = "http://jabber.org/protocol/muc#user";
}

/// Parsed `<stream:stream>` header attributes.
#[derive(Debug, Clone, Default)]
pub struct StreamHeader {
    /// The `to` attribute (target domain).
    pub to: Option<String>,
    /// The `from` attribute (source).
    pub from: Option<String>,
    /// The `id` attribute (server-assigned stream id).
    pub id: Option<String>,
    /// The `version` attribute; "1.0" for RFC 6120.
    pub version: Option<String>,
    /// The `xml:lang` attribute.
    pub lang: Option<String>,
}

impl StreamHeader {
    /// Parse the header attributes from the raw opening tag.
    ///
    /// The tag is intentionally unclosed XML (the matching close arrives at
    /// stream end), so it is read as a single start event.
    pub fn parse(tag: &str) -> Result<Self, XmppError> {
        let mut reader = Reader::from_str(tag);
        reader.config_mut().check_end_names = false;

        loop {
            match reader.read_event() {
                Ok(Event::Decl(_)) | Ok(Event::Text(_)) | Ok(Event::Comment(_))
                | Ok(Event::PI(_)) => continue,
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                    let mut header = StreamHeader::default();
                    for attr in e.attributes().flatten() {
                        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                        let value = String::from_utf8_lossy(&attr.value).into_owned();
                        match key.as_str() {
                            "to" => header.to = Some(value),
                            "from" => header.from = Some(value),
                            "id" => header.id = Some(value),
                            "version" => header.version = Some(value),
                            "xml:lang" => header.lang = Some(value),
                            _ => {}
                        }
                    }
                    return Ok(header);
                }
                _ => return Err(XmppError::parse("missing stream header element")),
            }
        }
    }

    /// Validate the header per RFC 6120.
    pub fn validate(&self) -> Result<(), XmppError> {
        if let Some(version) = &self.version {
            if version != "1.0" {
                return Err(XmppError::stream(format!(
                    "unsupported XMPP version: {}",
                    version
                )));
            }
        }
        Ok(())
    }
}

/// Events emitted by the stream parser.
#[derive(Debug)]
pub enum StreamEvent {
    /// The opening `<stream:stream>` tag was received.
    StreamOpen(StreamHeader),
    /// A complete top-level element.
    Stanza(Element),
    /// The closing `</stream:stream>` tag was received.
    StreamClose,
}

/// Incremental stream parser.
///
/// Bytes go in via [`feed`](Self::feed); complete events come out via
/// [`next_event`](Self::next_event). After STARTTLS or SASL success the
/// parser must be [`reset`](Self::reset): the protocol mandates a fresh
/// stream, and any partial buffer from before the transition is discarded.
pub struct XmlParser {
    buffer: Vec<u8>,
    stream_opened: bool,
}

/// A framed region of the buffer.
enum Frame {
    /// Stream opening tag, ending at the byte offset.
    Open(usize),
    /// Stream closing tag, ending at the byte offset.
    Close(usize),
    /// A complete top-level element spanning `start..end`.
    Stanza { start: usize, end: usize },
}

impl XmlParser {
    /// Create a fresh parser.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            stream_opened: false,
        }
    }

    /// Append raw bytes from the socket.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Whether the opening `<stream:stream>` has been seen since the last
    /// reset.
    pub fn stream_opened(&self) -> bool {
        self.stream_opened
    }

    /// Discard all state. Required on STARTTLS and SASL stream restarts.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.stream_opened = false;
    }

    /// Try to produce the next event from the buffered bytes.
    ///
    /// Returns `Ok(None)` when more data is needed, and `Err` on ill-formed
    /// XML, which is fatal for the connection.
    pub fn next_event(&mut self) -> Result<Option<StreamEvent>, XmppError> {
        match frame(&self.buffer)? {
            None => Ok(None),
            Some(Frame::Open(end)) => {
                let tag = std::str::from_utf8(&self.buffer[..end])
                    .map_err(|e| XmppError::parse(format!("invalid UTF-8 in header: {}", e)))?;
                let header = StreamHeader::parse(tag)?;
                self.buffer.drain(..end);
                self.stream_opened = true;
                Ok(Some(StreamEvent::StreamOpen(header)))
            }
            Some(Frame::Close(end)) => {
                self.buffer.drain(..end);
                Ok(Some(StreamEvent::StreamClose))
            }
            Some(Frame::Stanza { start, end }) => {
                let xml = std::str::from_utf8(&self.buffer[start..end])
                    .map_err(|e| XmppError::parse(format!("invalid UTF-8 in stanza: {}", e)))?
                    .to_owned();
                self.buffer.drain(..end);
                let element = parse_stanza_element(&xml)?;
                Ok(Some(StreamEvent::Stanza(element)))
            }
        }
    }
}

impl Default for XmlParser {
    fn default() -> Self {
        Self::new()
    }
}

fn is_stream_root(qname: &[u8]) -> bool {
    qname == b"stream:stream"
}

/// Locate the next complete frame in the buffer.
///
/// Depth starts at zero below the stream root; a top-level element is done
/// when its end tag brings the depth back to zero (or it is self-closing at
/// depth zero). `Ok(None)` means the buffer holds only a partial frame.
fn frame(buffer: &[u8]) -> Result<Option<Frame>, XmppError> {
    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;
    reader.config_mut().allow_unmatched_ends = true;

    let mut depth = 0usize;
    let mut stanza_start: Option<usize> = None;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_))
            | Ok(Event::DocType(_)) => continue,
            Ok(Event::Start(e)) => {
                if depth == 0 && is_stream_root(e.name().as_ref()) {
                    return Ok(Some(Frame::Open(reader.buffer_position() as usize)));
                }
                if depth == 0 {
                    stanza_start = Some(pos);
                }
                depth += 1;
            }
            Ok(Event::Empty(e)) => {
                if depth == 0 {
                    if is_stream_root(e.name().as_ref()) {
                        return Ok(Some(Frame::Open(reader.buffer_position() as usize)));
                    }
                    return Ok(Some(Frame::Stanza {
                        start: pos,
                        end: reader.buffer_position() as usize,
                    }));
                }
            }
            Ok(Event::End(e)) => {
                if depth == 0 {
                    if is_stream_root(e.name().as_ref()) {
                        return Ok(Some(Frame::Close(reader.buffer_position() as usize)));
                    }
                    return Err(XmppError::parse(format!(
                        "unmatched closing tag </{}>",
                        String::from_utf8_lossy(e.name().as_ref())
                    )));
                }
                depth -= 1;
                if depth == 0 {
                    // stanza_start is always set: depth only reaches zero
                    // again after the Start event that recorded it.
                    let start = stanza_start.unwrap_or(0);
                    return Ok(Some(Frame::Stanza {
                        start,
                        end: reader.buffer_position() as usize,
                    }));
                }
            }
            Ok(Event::Eof) => return Ok(None),
            // Text, CData and entity references carry no depth change.
            Ok(_) => {}
            // A syntax error from the tokenizer means the buffer ended in
            // the middle of a token (unclosed tag, CDATA, comment); the
            // next read completes it. Completed frames are still validated
            // strictly when the element tree is built.
            Err(quick_xml::Error::Syntax(_)) => return Ok(None),
            Err(e) => return Err(XmppError::parse(format!("invalid XML: {}", e))),
        }
    }
}

/// Build an element tree from a framed top-level slice.
///
/// Stanzas on the wire inherit the stream's default `jabber:client`
/// namespace; a framed slice parsed standalone needs that declaration made
/// explicit before minidom will accept it.
fn parse_stanza_element(xml: &str) -> Result<Element, XmppError> {
    let owned;
    let xml = match default_ns_insertion_point(xml) {
        Some(at) => {
            owned = format!("{} xmlns='{}'{}", &xml[..at], ns::CLIENT, &xml[at..]);
            owned.as_str()
        }
        None => xml,
    };
    xml.parse::<Element>()
        .map_err(|e| XmppError::parse(format!("invalid stanza: {}", e)))
}

/// Where to inject a default `xmlns`, or `None` when the root element
/// already resolves (declares a namespace or uses a prefix).
fn default_ns_insertion_point(xml: &str) -> Option<usize> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().check_end_names = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = e.name();
                if name.as_ref().contains(&b':') {
                    return None;
                }
                let declares_ns = e.attributes().flatten().any(|a| {
                    let key = a.key.as_ref();
                    key == b"xmlns" || key.starts_with(b"xmlns:")
                });
                if declares_ns {
                    return None;
                }
                // Insert right after `<name`.
                return Some(1 + name.as_ref().len());
            }
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}
