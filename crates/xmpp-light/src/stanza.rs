//! Immutable stanza values.
//!
//! A [`Stanza`] wraps the parsed element together with its kind and parsed
//! addresses. Routing never edits a stanza in place: re-addressing produces
//! a new value, and replies are built from scratch.

use jid::Jid;
use minidom::Element;

use crate::parser::{element_to_string, ns};
use crate::types::StanzaKind;
use crate::XmppError;

/// `type` attribute of a message stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Chat,
    Normal,
    Groupchat,
    Headline,
    Error,
}

impl MessageType {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("chat") => MessageType::Chat,
            Some("groupchat") => MessageType::Groupchat,
            Some("headline") => MessageType::Headline,
            Some("error") => MessageType::Error,
            _ => MessageType::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Chat => "chat",
            MessageType::Normal => "normal",
            MessageType::Groupchat => "groupchat",
            MessageType::Headline => "headline",
            MessageType::Error => "error",
        }
    }
}

/// `type` attribute of a presence stanza; absent means available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceType {
    Available,
    Unavailable,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Probe,
    Error,
}

impl PresenceType {
    fn parse(value: Option<&str>) -> Option<Self> {
        Some(match value {
            None => PresenceType::Available,
            Some("unavailable") => PresenceType::Unavailable,
            Some("subscribe") => PresenceType::Subscribe,
            Some("subscribed") => PresenceType::Subscribed,
            Some("unsubscribe") => PresenceType::Unsubscribe,
            Some("unsubscribed") => PresenceType::Unsubscribed,
            Some("probe") => PresenceType::Probe,
            Some("error") => PresenceType::Error,
            Some(_) => return None,
        })
    }

    /// Value of the `type` attribute; `None` for available.
    pub fn as_attr(&self) -> Option<&'static str> {
        match self {
            PresenceType::Available => None,
            PresenceType::Unavailable => Some("unavailable"),
            PresenceType::Subscribe => Some("subscribe"),
            PresenceType::Subscribed => Some("subscribed"),
            PresenceType::Unsubscribe => Some("unsubscribe"),
            PresenceType::Unsubscribed => Some("unsubscribed"),
            PresenceType::Probe => Some("probe"),
            PresenceType::Error => Some("error"),
        }
    }

    /// Whether this presence manages a subscription rather than availability.
    pub fn is_subscription(&self) -> bool {
        matches!(
            self,
            PresenceType::Subscribe
                | PresenceType::Subscribed
                | PresenceType::Unsubscribe
                | PresenceType::Unsubscribed
        )
    }
}

/// `type` attribute of an IQ stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    fn parse(value: Option<&str>) -> Option<Self> {
        match value {
            Some("get") => Some(IqType::Get),
            Some("set") => Some(IqType::Set),
            Some("result") => Some(IqType::Result),
            Some("error") => Some(IqType::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }

    /// get and set must always be answered.
    pub fn is_request(&self) -> bool {
        matches!(self, IqType::Get | IqType::Set)
    }
}

/// A message, presence or IQ stanza.
#[derive(Debug, Clone)]
pub struct Stanza {
    kind: StanzaKind,
    from: Option<Jid>,
    to: Option<Jid>,
    element: Element,
}

impl Stanza {
    /// Parse the `from` and `to` attributes of an element.
    pub fn addresses(element: &Element) -> Result<(Option<Jid>, Option<Jid>), XmppError> {
        let parse = |name: &str| -> Result<Option<Jid>, XmppError> {
            element
                .attr(name)
                .map(|value| {
                    Jid::new(value).map_err(|e| {
                        XmppError::jid_malformed(Some(format!("invalid '{}' address: {}", name, e)))
                    })
                })
                .transpose()
        };
        Ok((parse("from")?, parse("to")?))
    }

    /// Wrap an element whose addresses were already parsed.
    ///
    /// Gives the element back if it is not a stanza.
    pub fn from_parts(element: Element, from: Option<Jid>, to: Option<Jid>) -> Result<Self, Element> {
        match StanzaKind::from_name(element.name()) {
            Some(kind) if element.ns() == ns::JABBER_CLIENT => Ok(Self {
                kind,
                from,
                to,
                element,
            }),
            _ => Err(element),
        }
    }

    pub fn from_element(element: Element) -> Result<Self, XmppError> {
        let (from, to) = Self::addresses(&element)?;
        Self::from_parts(element, from, to).map_err(|e| {
            XmppError::bad_request(Some(format!("<{}/> is not a stanza", e.name())))
        })
    }

    pub fn kind(&self) -> StanzaKind {
        self.kind
    }

    pub fn from(&self) -> Option<&Jid> {
        self.from.as_ref()
    }

    pub fn to(&self) -> Option<&Jid> {
        self.to.as_ref()
    }

    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    /// Raw `type` attribute.
    pub fn type_attr(&self) -> Option<&str> {
        self.element.attr("type")
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn into_element(self) -> Element {
        self.element
    }

    pub fn message_type(&self) -> MessageType {
        MessageType::parse(self.type_attr())
    }

    /// `None` for an unknown presence type.
    pub fn presence_type(&self) -> Option<PresenceType> {
        PresenceType::parse(self.type_attr())
    }

    /// `None` for an IQ with a missing or unknown type.
    pub fn iq_type(&self) -> Option<IqType> {
        IqType::parse(self.type_attr())
    }

    pub fn body(&self) -> Option<String> {
        self.element
            .get_child("body", ns::JABBER_CLIENT)
            .map(|b| b.text())
    }

    pub fn subject(&self) -> Option<String> {
        self.element
            .get_child("subject", ns::JABBER_CLIENT)
            .map(|s| s.text())
    }

    /// First child element; the query of an IQ.
    pub fn payload(&self) -> Option<&Element> {
        self.element.children().next()
    }

    /// First child in the given namespace.
    pub fn child_in(&self, namespace: &str) -> Option<&Element> {
        self.element.children().find(|c| c.ns() == namespace)
    }

    /// Copy of this stanza carrying new addresses.
    pub fn readdressed(&self, from: &Jid, to: &Jid) -> Stanza {
        let mut element = self.element.clone();
        element.set_attr("from", from.to_string());
        element.set_attr("to", to.to_string());
        Stanza {
            kind: self.kind,
            from: Some(from.clone()),
            to: Some(to.clone()),
            element,
        }
    }

    /// Copy of this stanza with `from` set by the server, `to` untouched.
    pub fn with_from(&self, from: &Jid) -> Stanza {
        let mut element = self.element.clone();
        element.set_attr("from", from.to_string());
        Stanza {
            kind: self.kind,
            from: Some(from.clone()),
            to: self.to.clone(),
            element,
        }
    }

    /// Error reply mirroring this stanza's id, with addresses swapped.
    ///
    /// `server` is used as the reply's sender when the original had no `to`.
    pub fn error_reply(&self, error: &XmppError, server: &Jid) -> Stanza {
        let (condition, error_type, text) = error.to_stanza_error();

        let mut error_el = Element::builder("error", ns::JABBER_CLIENT)
            .attr("type", error_type.as_str())
            .append(Element::builder(condition.as_str(), ns::STANZAS).build());
        if let Some(text) = text {
            error_el = error_el.append(
                Element::builder("text", ns::STANZAS)
                    .attr("xml:lang", "en")
                    .append(text)
                    .build(),
            );
        }

        let from = self.to.clone().unwrap_or_else(|| server.clone());
        let mut builder = Element::builder(self.kind.as_str(), ns::JABBER_CLIENT)
            .attr("type", "error")
            .attr("from", from.to_string());
        if let Some(ref to) = self.from {
            builder = builder.attr("to", to.to_string());
        }
        if let Some(id) = self.id() {
            builder = builder.attr("id", id);
        }
        if self.kind != StanzaKind::Iq {
            builder = builder.append_all(
                self.element
                    .children()
                    .filter(|c| c.name() != "error")
                    .cloned(),
            );
        }
        let element = builder.append(error_el.build()).build();

        Stanza {
            kind: self.kind,
            from: Some(from),
            to: self.from.clone(),
            element,
        }
    }

    /// `type='result'` reply to an IQ request.
    pub fn iq_result(&self, server: &Jid, payload: Option<Element>) -> Stanza {
        let from = self.to.clone().unwrap_or_else(|| server.clone());
        let mut builder = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", "result")
            .attr("from", from.to_string())
            .attr("id", self.id().unwrap_or_default());
        if let Some(ref to) = self.from {
            builder = builder.attr("to", to.to_string());
        }
        if let Some(payload) = payload {
            builder = builder.append(payload);
        }
        Stanza {
            kind: StanzaKind::Iq,
            from: Some(from),
            to: self.from.clone(),
            element: builder.build(),
        }
    }

    /// Build a server-originated IQ.
    pub fn iq(type_: IqType, id: &str, from: &Jid, to: &Jid, payload: Element) -> Stanza {
        let element = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", type_.as_str())
            .attr("id", id)
            .attr("from", from.to_string())
            .attr("to", to.to_string())
            .append(payload)
            .build();
        Stanza {
            kind: StanzaKind::Iq,
            from: Some(from.clone()),
            to: Some(to.clone()),
            element,
        }
    }

    /// Build a server-generated presence.
    pub fn presence(
        type_: PresenceType,
        from: &Jid,
        to: &Jid,
        status: Option<&str>,
        extra: Option<Element>,
    ) -> Stanza {
        let mut builder = Element::builder("presence", ns::JABBER_CLIENT)
            .attr("from", from.to_string())
            .attr("to", to.to_string());
        if let Some(type_) = type_.as_attr() {
            builder = builder.attr("type", type_);
        }
        if let Some(status) = status {
            builder = builder.append(
                Element::builder("status", ns::JABBER_CLIENT)
                    .append(status)
                    .build(),
            );
        }
        if let Some(extra) = extra {
            builder = builder.append(extra);
        }
        Stanza {
            kind: StanzaKind::Presence,
            from: Some(from.clone()),
            to: Some(to.clone()),
            element: builder.build(),
        }
    }

    /// Build a server-generated message.
    pub fn message(type_: MessageType, from: &Jid, to: &Jid, children: Vec<Element>) -> Stanza {
        let element = Element::builder("message", ns::JABBER_CLIENT)
            .attr("type", type_.as_str())
            .attr("from", from.to_string())
            .attr("to", to.to_string())
            .append_all(children)
            .build();
        Stanza {
            kind: StanzaKind::Message,
            from: Some(from.clone()),
            to: Some(to.clone()),
            element,
        }
    }

    /// Copy of this stanza with extra children appended.
    pub fn with_children(&self, children: Vec<Element>) -> Stanza {
        let mut copy = self.clone();
        for child in children {
            copy.element.append_child(child);
        }
        copy
    }

    /// Serialize for the wire.
    pub fn to_xml(&self) -> String {
        element_to_string(&self.element)
    }
}

impl std::fmt::Display for Stanza {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_xml())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_element;

    fn stanza(xml: &str) -> Stanza {
        Stanza::from_element(parse_element(xml).unwrap()).unwrap()
    }

    #[test]
    fn parses_addresses_and_types() {
        let s = stanza(
            "<message xmlns='jabber:client' from='a@example.com/r' to='b@example.com' type='chat' id='1'><body>hey</body></message>",
        );
        assert_eq!(s.kind(), StanzaKind::Message);
        assert_eq!(s.from().unwrap().to_string(), "a@example.com/r");
        assert_eq!(s.message_type(), MessageType::Chat);
        assert_eq!(s.id(), Some("1"));
        assert_eq!(s.body().as_deref(), Some("hey"));
    }

    #[test]
    fn missing_message_type_is_normal() {
        let s = stanza("<message xmlns='jabber:client' to='b@example.com'/>");
        assert_eq!(s.message_type(), MessageType::Normal);
        let p = stanza("<presence xmlns='jabber:client'/>");
        assert_eq!(p.presence_type(), Some(PresenceType::Available));
    }

    #[test]
    fn non_stanza_elements_are_refused() {
        let element = parse_element("<enable xmlns='urn:xmpp:sm:3'/>").unwrap();
        assert!(Stanza::from_element(element).is_err());
    }

    #[test]
    fn error_reply_swaps_addresses_and_keeps_id() {
        let server: Jid = "example.com".parse().unwrap();
        let s = stanza(
            "<iq xmlns='jabber:client' from='a@example.com/r' to='b@example.com' type='get' id='q1'><query xmlns='jabber:iq:version'/></iq>",
        );
        let reply = s.error_reply(&XmppError::service_unavailable(None), &server);

        assert_eq!(reply.id(), Some("q1"));
        assert_eq!(reply.type_attr(), Some("error"));
        assert_eq!(reply.to().unwrap().to_string(), "a@example.com/r");
        assert_eq!(reply.from().unwrap().to_string(), "b@example.com");
        let error = reply.element().get_child("error", ns::JABBER_CLIENT).unwrap();
        assert_eq!(error.attr("type"), Some("cancel"));
        assert!(error.has_child("service-unavailable", ns::STANZAS));
        // IQ errors do not echo the query
        assert!(reply.element().get_child("query", "jabber:iq:version").is_none());
    }

    #[test]
    fn message_error_reply_echoes_body() {
        let server: Jid = "example.com".parse().unwrap();
        let s = stanza(
            "<message xmlns='jabber:client' from='a@example.com/r' to='nobody@example.com' id='m'><body>hi</body></message>",
        );
        let reply = s.error_reply(&XmppError::service_unavailable(None), &server);
        assert_eq!(reply.body().as_deref(), Some("hi"));
        assert_eq!(reply.kind(), StanzaKind::Message);
    }

    #[test]
    fn readdressed_leaves_original_untouched() {
        let s = stanza("<message xmlns='jabber:client' to='room@conference.example.com'><body>x</body></message>");
        let from: Jid = "room@conference.example.com/alice".parse().unwrap();
        let to: Jid = "bob@example.com/r1".parse().unwrap();
        let copy = s.readdressed(&from, &to);

        assert!(s.from().is_none());
        assert_eq!(copy.element().attr("from"), Some("room@conference.example.com/alice"));
        assert_eq!(copy.to(), Some(&to));
    }

    #[test]
    fn iq_result_from_server() {
        let server: Jid = "example.com".parse().unwrap();
        let s = stanza("<iq xmlns='jabber:client' from='a@example.com/r' type='get' id='p'><ping xmlns='urn:xmpp:ping'/></iq>");
        let result = s.iq_result(&server, None);
        assert_eq!(result.type_attr(), Some("result"));
        assert_eq!(result.from(), Some(&server));
        assert!(result.payload().is_none());
    }
}
