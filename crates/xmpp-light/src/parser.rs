//! Incremental framing of the XMPP XML stream.
//!
//! A client stream is one long-lived XML document. The parser buffers raw
//! bytes, finds the boundaries of each top-level element by tracking tag
//! depth, and only then hands the complete element to minidom. Nothing is
//! consumed until a whole unit (header, element or closing tag) is
//! available, so a partial read simply yields [`Decoded::NeedMoreData`] and
//! the next call starts over with the same bytes plus whatever arrived.

use minidom::Element;

use crate::error::stream_errors;
use crate::stanza::Stanza;
use crate::types::StanzaKind;
use crate::XmppError;

/// Namespace URIs used in XMPP
pub mod ns {
    pub const JABBER_CLIENT: &str = "jabber:client";
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    pub const ROSTER: &str = "jabber:iq:roster";
    pub const REGISTER: &str = "jabber:iq:register";
    pub const REGISTER_FEATURE: &str = "http://jabber.org/features/iq-register";
    pub const VERSION: &str = "jabber:iq:version";
    pub const PING: &str = "urn:xmpp:ping";
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
    pub const MUC: &str = "http://jabber.org/protocol/muc";
    pub const MUC_USER: &str = "http://jabber.org/protocol/muc#user";
    pub const PUBSUB: &str = "http://jabber.org/protocol/pubsub";
    pub const PUBSUB_EVENT: &str = "http://jabber.org/protocol/pubsub#event";
    pub const PUBSUB_OWNER: &str = "http://jabber.org/protocol/pubsub#owner";
    pub const DELAY: &str = "urn:xmpp:delay";
    pub const EXCLUSIVE: &str = "urn:xmpp:light:exclusive:0";
}

/// Parsed stream header information.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    /// The 'to' attribute (target domain)
    pub to: Option<String>,
    /// The 'from' attribute
    pub from: Option<String>,
    /// The 'id' attribute
    pub id: Option<String>,
    /// The 'version' attribute (should be "1.0")
    pub version: Option<String>,
    /// The 'xml:lang' attribute
    pub lang: Option<String>,
    /// Default namespace declared on the stream
    pub xmlns: Option<String>,
    /// Namespace bound to the stream prefix
    pub stream_ns: Option<String>,
}

impl StreamHeader {
    /// Parse the opening `<stream:stream ...>` tag.
    ///
    /// The tag is intentionally unclosed, so it is read attribute by
    /// attribute instead of being handed to an XML parser.
    pub fn parse(tag: &str) -> Result<Self, XmppError> {
        let mut header = StreamHeader::default();

        for (name, value) in parse_attributes(tag)? {
            match name.as_str() {
                "to" => header.to = Some(value),
                "from" => header.from = Some(value),
                "id" => header.id = Some(value),
                "version" => header.version = Some(value),
                "xml:lang" => header.lang = Some(value),
                "xmlns" => header.xmlns = Some(value),
                "xmlns:stream" => header.stream_ns = Some(value),
                _ => {}
            }
        }

        Ok(header)
    }

    /// Validate the stream header per RFC 6120.
    pub fn validate(&self) -> Result<(), XmppError> {
        if let Some(ref version) = self.version {
            if version != "1.0" {
                return Err(XmppError::stream(
                    stream_errors::UNSUPPORTED_VERSION,
                    format!("Unsupported XMPP version: {}", version),
                ));
            }
        }

        if let Some(ref xmlns) = self.xmlns {
            if xmlns != ns::JABBER_CLIENT {
                return Err(XmppError::stream(
                    stream_errors::INVALID_NAMESPACE,
                    format!("Unsupported stream namespace: {}", xmlns),
                ));
            }
        }

        if let Some(ref stream_ns) = self.stream_ns {
            if stream_ns != ns::STREAM {
                return Err(XmppError::stream(
                    stream_errors::INVALID_NAMESPACE,
                    format!("Unexpected stream prefix namespace: {}", stream_ns),
                ));
            }
        }

        Ok(())
    }
}

/// Negotiation events that are not stanzas.
#[derive(Debug)]
pub enum StreamEvent {
    /// Opening stream header (initial, or a restart after TLS/SASL)
    Open(StreamHeader),
    /// `<starttls/>`
    StartTls,
    /// `<auth mechanism='...'>` with its base64 payload ("" for none or "=")
    SaslAuth { mechanism: String, data: String },
    /// `<abort/>` during SASL
    SaslAbort,
    /// `</stream:stream>`
    Close,
    /// Any other top-level element
    Unsupported(Element),
}

/// Result of one [`XmlParser::parse_next`] call.
#[derive(Debug)]
pub enum Decoded {
    Stanza(Stanza),
    Event(StreamEvent),
    /// Well-formed stanza whose addressing could not be parsed
    Malformed { element: Element, error: XmppError },
    NeedMoreData,
}

/// Restartable framer for an inbound XMPP stream.
pub struct XmlParser {
    buffer: Vec<u8>,
    stream_open: bool,
    default_ns: String,
    max_stanza_size: usize,
}

/// Default upper bound for a single top-level element.
pub const DEFAULT_MAX_STANZA_SIZE: usize = 256 * 1024;

impl XmlParser {
    pub fn new() -> Self {
        Self::with_max_stanza_size(DEFAULT_MAX_STANZA_SIZE)
    }

    pub fn with_max_stanza_size(max_stanza_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(8192),
            stream_open: false,
            default_ns: ns::JABBER_CLIENT.to_string(),
            max_stanza_size,
        }
    }

    /// Append bytes read from the connection.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_stream_open(&self) -> bool {
        self.stream_open
    }

    /// Forget everything, including unread bytes.
    ///
    /// Used after STARTTLS: plaintext that arrived behind `<starttls/>` must
    /// not be interpreted once the channel is encrypted.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.stream_open = false;
    }

    /// Expect a fresh stream header but keep buffered bytes (SASL success).
    pub fn restart(&mut self) {
        self.stream_open = false;
    }

    /// Decode the next unit from the buffer.
    pub fn parse_next(&mut self) -> Result<Decoded, XmppError> {
        loop {
            let skip = self
                .buffer
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            if skip > 0 {
                self.buffer.drain(..skip);
            }

            let Some(&first) = self.buffer.first() else {
                return Ok(Decoded::NeedMoreData);
            };

            if first != b'<' {
                if !self.stream_open && self.buffer.starts_with(&[0xEF, 0xBB, 0xBF]) {
                    self.buffer.drain(..3);
                    continue;
                }
                return Err(XmppError::stream(
                    stream_errors::NOT_WELL_FORMED,
                    "character data between top-level elements",
                ));
            }

            match scan_top_level(&self.buffer)? {
                Scan::Incomplete => {
                    if self.buffer.len() > self.max_stanza_size {
                        return Err(XmppError::stream(
                            stream_errors::POLICY_VIOLATION,
                            "stanza exceeds maximum size",
                        ));
                    }
                    return Ok(Decoded::NeedMoreData);
                }
                Scan::Declaration(end) => {
                    if self.stream_open {
                        return Err(XmppError::stream(
                            stream_errors::RESTRICTED_XML,
                            "processing instruction inside stream",
                        ));
                    }
                    self.buffer.drain(..end);
                }
                Scan::StreamOpen(end) => {
                    let raw: Vec<u8> = self.buffer.drain(..end).collect();
                    let tag = std::str::from_utf8(&raw).map_err(|_| {
                        XmppError::stream(
                            stream_errors::UNSUPPORTED_ENCODING,
                            "stream header is not UTF-8",
                        )
                    })?;
                    let header = StreamHeader::parse(tag)?;
                    header.validate()?;
                    self.default_ns = header
                        .xmlns
                        .clone()
                        .unwrap_or_else(|| ns::JABBER_CLIENT.to_string());
                    self.stream_open = true;
                    return Ok(Decoded::Event(StreamEvent::Open(header)));
                }
                Scan::StreamClose(end) => {
                    self.buffer.drain(..end);
                    self.stream_open = false;
                    return Ok(Decoded::Event(StreamEvent::Close));
                }
                Scan::Element { end, tag_end } => {
                    if end > self.max_stanza_size {
                        return Err(XmppError::stream(
                            stream_errors::POLICY_VIOLATION,
                            "stanza exceeds maximum size",
                        ));
                    }
                    if !self.stream_open {
                        return Err(XmppError::stream(
                            stream_errors::BAD_FORMAT,
                            "element received before stream header",
                        ));
                    }
                    let raw: Vec<u8> = self.buffer.drain(..end).collect();
                    let text = String::from_utf8(raw).map_err(|_| {
                        XmppError::stream(stream_errors::UNSUPPORTED_ENCODING, "stanza is not UTF-8")
                    })?;
                    let text = with_namespace(&text, tag_end, &self.default_ns)?;
                    let element = parse_element(&text)?;
                    return Ok(classify(element));
                }
            }
        }
    }
}

impl Default for XmlParser {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(element: Element) -> Decoded {
    if element.is("starttls", ns::TLS) {
        return Decoded::Event(StreamEvent::StartTls);
    }
    if element.is("auth", ns::SASL) {
        let mechanism = element.attr("mechanism").unwrap_or_default().to_string();
        let text = element.text();
        let data = match text.trim() {
            "=" => String::new(),
            other => other.to_string(),
        };
        return Decoded::Event(StreamEvent::SaslAuth { mechanism, data });
    }
    if element.is("abort", ns::SASL) {
        return Decoded::Event(StreamEvent::SaslAbort);
    }

    if element.ns() == ns::JABBER_CLIENT && StanzaKind::from_name(element.name()).is_some() {
        return match Stanza::addresses(&element) {
            Ok((from, to)) => match Stanza::from_parts(element, from, to) {
                Ok(stanza) => Decoded::Stanza(stanza),
                Err(element) => Decoded::Event(StreamEvent::Unsupported(element)),
            },
            Err(error) => Decoded::Malformed { element, error },
        };
    }

    Decoded::Event(StreamEvent::Unsupported(element))
}

enum Scan {
    Incomplete,
    Declaration(usize),
    StreamOpen(usize),
    StreamClose(usize),
    /// `end` is one past the final `>`, `tag_end` one past the start tag
    Element { end: usize, tag_end: usize },
}

struct Tag {
    name: String,
    end: usize,
    self_closing: bool,
}

fn is_stream_name(name: &[u8]) -> bool {
    name == b"stream" || name.ends_with(b":stream")
}

fn find_byte(buf: &[u8], needle: u8, from: usize) -> Option<usize> {
    buf.get(from..)?
        .iter()
        .position(|b| *b == needle)
        .map(|i| i + from)
}

fn find_seq(buf: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

fn not_well_formed(msg: &str) -> XmppError {
    XmppError::stream(stream_errors::NOT_WELL_FORMED, msg)
}

fn restricted(msg: &str) -> XmppError {
    XmppError::stream(stream_errors::RESTRICTED_XML, msg)
}

/// Read a start tag beginning at `lt`. `Ok(None)` means the tag is cut off.
fn read_tag(buf: &[u8], lt: usize) -> Result<Option<Tag>, XmppError> {
    let name_start = lt + 1;
    let mut i = name_start;
    while i < buf.len() && !matches!(buf[i], b' ' | b'\t' | b'\r' | b'\n' | b'/' | b'>') {
        i += 1;
    }
    if i >= buf.len() {
        return Ok(None);
    }
    if i == name_start {
        return Err(not_well_formed("empty element name"));
    }
    let name = String::from_utf8_lossy(&buf[name_start..i]).into_owned();

    let mut quote: Option<u8> = None;
    while i < buf.len() {
        let b = buf[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'<' => return Err(not_well_formed("'<' inside a tag")),
                b'>' => {
                    return Ok(Some(Tag {
                        name,
                        end: i + 1,
                        self_closing: buf[i - 1] == b'/',
                    }));
                }
                _ => {}
            },
        }
        i += 1;
    }
    Ok(None)
}

/// Find the extent of the top-level unit at the start of `buf`.
fn scan_top_level(buf: &[u8]) -> Result<Scan, XmppError> {
    match buf.get(1) {
        None => Ok(Scan::Incomplete),
        Some(b'?') => Ok(find_seq(buf, b"?>", 2).map_or(Scan::Incomplete, |i| Scan::Declaration(i + 2))),
        Some(b'!') => Err(restricted("comments and DTDs are not allowed")),
        Some(b'/') => {
            let Some(gt) = find_byte(buf, b'>', 2) else {
                return Ok(Scan::Incomplete);
            };
            if is_stream_name(buf[2..gt].trim_ascii()) {
                Ok(Scan::StreamClose(gt + 1))
            } else {
                Err(not_well_formed("unexpected closing tag at stream level"))
            }
        }
        Some(_) => {
            let Some(tag) = read_tag(buf, 0)? else {
                return Ok(Scan::Incomplete);
            };
            if is_stream_name(tag.name.as_bytes()) {
                if tag.self_closing {
                    return Err(not_well_formed("empty stream element"));
                }
                return Ok(Scan::StreamOpen(tag.end));
            }
            if tag.self_closing {
                return Ok(Scan::Element {
                    end: tag.end,
                    tag_end: tag.end,
                });
            }

            let mut stack = vec![tag.name];
            let mut pos = tag.end;
            loop {
                let Some(lt) = find_byte(buf, b'<', pos) else {
                    return Ok(Scan::Incomplete);
                };
                match buf.get(lt + 1) {
                    None => return Ok(Scan::Incomplete),
                    Some(b'/') => {
                        let Some(gt) = find_byte(buf, b'>', lt + 2) else {
                            return Ok(Scan::Incomplete);
                        };
                        let name = buf[lt + 2..gt].trim_ascii();
                        match stack.pop() {
                            Some(open) if open.as_bytes() == name => {}
                            _ => return Err(not_well_formed("mismatched closing tag")),
                        }
                        pos = gt + 1;
                        if stack.is_empty() {
                            return Ok(Scan::Element {
                                end: pos,
                                tag_end: tag.end,
                            });
                        }
                    }
                    Some(b'!') => {
                        const CDATA: &[u8] = b"<![CDATA[";
                        let rest = &buf[lt..];
                        if rest.starts_with(CDATA) {
                            let Some(close) = find_seq(buf, b"]]>", lt + CDATA.len()) else {
                                return Ok(Scan::Incomplete);
                            };
                            pos = close + 3;
                        } else if rest.len() < CDATA.len() && CDATA.starts_with(rest) {
                            return Ok(Scan::Incomplete);
                        } else {
                            return Err(restricted("comments are not allowed"));
                        }
                    }
                    Some(b'?') => return Err(restricted("processing instructions are not allowed")),
                    Some(_) => {
                        let Some(inner) = read_tag(buf, lt)? else {
                            return Ok(Scan::Incomplete);
                        };
                        pos = inner.end;
                        if !inner.self_closing {
                            stack.push(inner.name);
                        }
                    }
                }
            }
        }
    }
}

/// Declare the stream's default namespace on a top-level element that
/// relies on inheriting it.
fn with_namespace(text: &str, tag_end: usize, default_ns: &str) -> Result<String, XmppError> {
    let start_tag = text
        .get(..tag_end)
        .ok_or_else(|| not_well_formed("truncated start tag"))?;
    let attributes = parse_attributes(start_tag)?;

    let name_len = start_tag[1..]
        .find(|c: char| c.is_ascii_whitespace() || c == '/' || c == '>')
        .unwrap_or(start_tag.len() - 1);
    let name = &start_tag[1..1 + name_len];

    let mut injected = String::new();
    if !attributes.iter().any(|(k, _)| k == "xmlns") {
        injected.push_str(&format!(" xmlns='{}'", escape(default_ns)));
    }
    if name.starts_with("stream:") && !attributes.iter().any(|(k, _)| k == "xmlns:stream") {
        injected.push_str(&format!(" xmlns:stream='{}'", ns::STREAM));
    }
    if injected.is_empty() {
        return Ok(text.to_string());
    }

    let split = 1 + name_len;
    let mut out = String::with_capacity(text.len() + injected.len());
    out.push_str(&text[..split]);
    out.push_str(&injected);
    out.push_str(&text[split..]);
    Ok(out)
}

/// Parse the attributes of a start tag (`<name a='1' b="2">`).
fn parse_attributes(tag: &str) -> Result<Vec<(String, String)>, XmppError> {
    let bytes = tag.as_bytes();
    let mut attributes = Vec::new();

    let mut i = 1;
    while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b'>' && bytes[i] != b'/' {
        i += 1;
    }

    loop {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() || bytes[i] == b'>' || bytes[i] == b'/' {
            break;
        }

        let name_start = i;
        while i < bytes.len() && bytes[i] != b'=' && !bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let name = &tag[name_start..i];

        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if bytes.get(i) != Some(&b'=') {
            return Err(not_well_formed("attribute without value"));
        }
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }

        let quote = match bytes.get(i) {
            Some(q @ (b'"' | b'\'')) => *q,
            _ => return Err(not_well_formed("unquoted attribute value")),
        };
        i += 1;
        let value_start = i;
        while i < bytes.len() && bytes[i] != quote {
            i += 1;
        }
        if i >= bytes.len() {
            return Err(not_well_formed("unterminated attribute value"));
        }
        attributes.push((name.to_string(), unescape(&tag[value_start..i])));
        i += 1;
    }

    Ok(attributes)
}

/// Escape text for use in XML character data or attribute values.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail.find(';') else {
            out.push_str(tail);
            return out;
        };
        let entity = &tail[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "apos" => Some('\''),
            "quot" => Some('"'),
            _ => entity
                .strip_prefix("#x")
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => out.push(c),
            None => out.push_str(&tail[..=semi]),
        }
        rest = &tail[semi + 1..];
    }
    out.push_str(rest);
    out
}

/// Parse a complete XML element.
pub fn parse_element(data: &str) -> Result<Element, XmppError> {
    data.parse::<Element>()
        .map_err(|e| XmppError::xml_parse(format!("Failed to parse element: {}", e)))
}

/// Serialize an element to its XML string form.
pub fn element_to_string(element: &Element) -> String {
    String::from(element)
}

/// Serialize a stanza for the wire.
pub fn serialize(stanza: &Stanza) -> Vec<u8> {
    element_to_string(stanza.element()).into_bytes()
}
