//! XEP-0060: Publish-Subscribe
//!
//! A minimal in-memory pubsub service hosted on the server domain. Nodes
//! are created explicitly or on first publish, keep a bounded number of
//! items and notify their subscribers with headline messages.
//!
//! ```xml
//! <iq type='set' id='pub1'>
//!   <pubsub xmlns='http://jabber.org/protocol/pubsub'>
//!     <publish node='news'>
//!       <item id='a1'><entry xmlns='http://www.w3.org/2005/Atom'/></item>
//!     </publish>
//!   </pubsub>
//! </iq>
//! ```

use std::collections::{BTreeSet, VecDeque};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jid::{BareJid, Jid};
use minidom::Element;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{ModuleContext, ServerModule};
use crate::error::{StanzaErrorCondition, StanzaErrorType};
use crate::parser::ns;
use crate::stanza::{IqType, MessageType, Stanza};
use crate::XmppError;

/// Items kept per node when no limit is configured.
pub const DEFAULT_MAX_ITEMS: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct PubSubItem {
    pub id: String,
    pub payload: Option<Element>,
}

impl PubSubItem {
    fn from_element(elem: &Element) -> Self {
        Self {
            id: elem
                .attr("id")
                .map(String::from)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            payload: elem.children().next().cloned(),
        }
    }

    fn to_element(&self, namespace: &str) -> Element {
        let mut builder = Element::builder("item", namespace).attr("id", self.id.as_str());
        if let Some(ref payload) = self.payload {
            builder = builder.append(payload.clone());
        }
        builder.build()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PubSubRequest {
    Publish { node: String, item: PubSubItem },
    Retract { node: String, item_id: String, notify: bool },
    Items { node: String, max_items: Option<usize>, item_ids: Vec<String> },
    CreateNode { node: String },
    DeleteNode { node: String },
    Subscribe { node: String, jid: Jid },
    Unsubscribe { node: String, jid: Jid },
}

fn node_attr(elem: &Element) -> Result<String, XmppError> {
    elem.attr("node")
        .filter(|n| !n.is_empty())
        .map(String::from)
        .ok_or_else(|| XmppError::bad_request(Some("Missing node attribute".into())))
}

fn jid_attr(elem: &Element) -> Result<Jid, XmppError> {
    let raw = elem
        .attr("jid")
        .ok_or_else(|| XmppError::bad_request(Some("Missing jid attribute".into())))?;
    Jid::new(raw).map_err(|e| XmppError::jid_malformed(Some(e.to_string())))
}

/// Parse the `<pubsub/>` payload of an IQ.
pub fn parse_pubsub(stanza: &Stanza) -> Result<PubSubRequest, XmppError> {
    let pubsub = stanza
        .payload()
        .filter(|p| p.name() == "pubsub")
        .ok_or_else(|| XmppError::bad_request(Some("Expected pubsub element".into())))?;

    if let Some(publish) = pubsub.get_child("publish", ns::PUBSUB) {
        let item = publish
            .get_child("item", ns::PUBSUB)
            .map(PubSubItem::from_element)
            .unwrap_or_else(|| PubSubItem {
                id: Uuid::new_v4().to_string(),
                payload: None,
            });
        return Ok(PubSubRequest::Publish {
            node: node_attr(publish)?,
            item,
        });
    }

    if let Some(retract) = pubsub.get_child("retract", ns::PUBSUB) {
        let item_id = retract
            .get_child("item", ns::PUBSUB)
            .and_then(|item| item.attr("id"))
            .ok_or_else(|| XmppError::bad_request(Some("Missing item id".into())))?
            .to_string();
        return Ok(PubSubRequest::Retract {
            node: node_attr(retract)?,
            item_id,
            notify: matches!(retract.attr("notify"), Some("true") | Some("1")),
        });
    }

    if let Some(items) = pubsub.get_child("items", ns::PUBSUB) {
        return Ok(PubSubRequest::Items {
            node: node_attr(items)?,
            max_items: items.attr("max_items").and_then(|s| s.parse().ok()),
            item_ids: items
                .children()
                .filter(|c| c.name() == "item")
                .filter_map(|c| c.attr("id").map(String::from))
                .collect(),
        });
    }

    if let Some(create) = pubsub.get_child("create", ns::PUBSUB) {
        return Ok(PubSubRequest::CreateNode {
            node: node_attr(create)?,
        });
    }

    if let Some(delete) = pubsub.get_child("delete", ns::PUBSUB_OWNER) {
        return Ok(PubSubRequest::DeleteNode {
            node: node_attr(delete)?,
        });
    }

    if let Some(subscribe) = pubsub.get_child("subscribe", ns::PUBSUB) {
        return Ok(PubSubRequest::Subscribe {
            node: node_attr(subscribe)?,
            jid: jid_attr(subscribe)?,
        });
    }

    if let Some(unsubscribe) = pubsub.get_child("unsubscribe", ns::PUBSUB) {
        return Ok(PubSubRequest::Unsubscribe {
            node: node_attr(unsubscribe)?,
            jid: jid_attr(unsubscribe)?,
        });
    }

    Err(XmppError::feature_not_implemented(Some(
        "Unsupported PubSub operation".into(),
    )))
}

#[derive(Debug)]
struct PubSubNode {
    owner: BareJid,
    items: VecDeque<PubSubItem>,
    subscribers: BTreeSet<String>,
}

impl PubSubNode {
    fn new(owner: BareJid) -> Self {
        Self {
            owner,
            items: VecDeque::new(),
            subscribers: BTreeSet::new(),
        }
    }

    fn subscriber_jids(&self) -> Vec<Jid> {
        self.subscribers
            .iter()
            .filter_map(|s| Jid::new(s).ok())
            .collect()
    }
}

/// In-memory pubsub service.
#[derive(Debug)]
pub struct PubSubModule {
    nodes: DashMap<String, PubSubNode>,
    max_items: usize,
}

impl Default for PubSubModule {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITEMS)
    }
}

fn event_message(server: &Jid, to: &Jid, event_child: Element) -> Stanza {
    Stanza::message(
        MessageType::Headline,
        server,
        to,
        vec![Element::builder("event", ns::PUBSUB_EVENT)
            .append(event_child)
            .build()],
    )
}

fn pubsub_result(child: Element) -> Element {
    Element::builder("pubsub", ns::PUBSUB).append(child).build()
}

impl PubSubModule {
    pub fn new(max_items: usize) -> Self {
        Self {
            nodes: DashMap::new(),
            max_items: max_items.max(1),
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn notify(server: &Jid, subscribers: &[Jid], event_child: &Element) -> Vec<Stanza> {
        subscribers
            .iter()
            .map(|to| event_message(server, to, event_child.clone()))
            .collect()
    }

    #[instrument(skip(self, stanza, ctx), name = "xmpp.pubsub.request")]
    async fn process(
        &self,
        request: PubSubRequest,
        stanza: &Stanza,
        ctx: &ModuleContext<'_>,
    ) -> Result<Vec<Stanza>, XmppError> {
        let sender = ctx.require_sender()?;
        let owner = sender.to_bare();

        match request {
            PubSubRequest::CreateNode { node } => {
                match self.nodes.entry(node.clone()) {
                    Entry::Occupied(_) => {
                        return Err(XmppError::conflict(Some(format!("node '{}' exists", node))))
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(PubSubNode::new(owner));
                    }
                }
                debug!(%node, "Node created");
                Ok(vec![stanza.iq_result(ctx.server, None)])
            }
            PubSubRequest::DeleteNode { node } => {
                let subscribers = {
                    let existing = self
                        .nodes
                        .get(&node)
                        .ok_or_else(|| XmppError::item_not_found(None))?;
                    if existing.owner != owner {
                        return Err(XmppError::forbidden(None));
                    }
                    existing.subscriber_jids()
                };
                self.nodes.remove(&node);
                let delete = Element::builder("delete", ns::PUBSUB_EVENT)
                    .attr("node", node.as_str())
                    .build();
                let mut out = vec![stanza.iq_result(ctx.server, None)];
                out.extend(Self::notify(ctx.server, &subscribers, &delete));
                Ok(out)
            }
            PubSubRequest::Publish { node, item } => {
                let subscribers = {
                    let mut entry = self
                        .nodes
                        .entry(node.clone())
                        .or_insert_with(|| PubSubNode::new(owner.clone()));
                    if entry.owner != owner {
                        return Err(XmppError::forbidden(None));
                    }
                    entry.items.retain(|existing| existing.id != item.id);
                    entry.items.push_back(item.clone());
                    while entry.items.len() > self.max_items {
                        entry.items.pop_front();
                    }
                    entry.subscriber_jids()
                };
                let published = Element::builder("publish", ns::PUBSUB)
                    .attr("node", node.as_str())
                    .append(Element::builder("item", ns::PUBSUB).attr("id", item.id.as_str()).build())
                    .build();
                let event = Element::builder("items", ns::PUBSUB_EVENT)
                    .attr("node", node.as_str())
                    .append(item.to_element(ns::PUBSUB_EVENT))
                    .build();
                let mut out = vec![stanza.iq_result(ctx.server, Some(pubsub_result(published)))];
                out.extend(Self::notify(ctx.server, &subscribers, &event));
                Ok(out)
            }
            PubSubRequest::Retract { node, item_id, notify } => {
                let subscribers = {
                    let mut entry = self
                        .nodes
                        .get_mut(&node)
                        .ok_or_else(|| XmppError::item_not_found(None))?;
                    if entry.owner != owner {
                        return Err(XmppError::forbidden(None));
                    }
                    let before = entry.items.len();
                    entry.items.retain(|existing| existing.id != item_id);
                    if entry.items.len() == before {
                        return Err(XmppError::item_not_found(Some(format!("no item '{}'", item_id))));
                    }
                    entry.subscriber_jids()
                };
                let mut out = vec![stanza.iq_result(ctx.server, None)];
                if notify {
                    let event = Element::builder("items", ns::PUBSUB_EVENT)
                        .attr("node", node.as_str())
                        .append(
                            Element::builder("retract", ns::PUBSUB_EVENT)
                                .attr("id", item_id.as_str())
                                .build(),
                        )
                        .build();
                    out.extend(Self::notify(ctx.server, &subscribers, &event));
                }
                Ok(out)
            }
            PubSubRequest::Items { node, max_items, item_ids } => {
                let entry = self
                    .nodes
                    .get(&node)
                    .ok_or_else(|| XmppError::item_not_found(None))?;
                let mut items: Vec<&PubSubItem> = entry
                    .items
                    .iter()
                    .filter(|item| item_ids.is_empty() || item_ids.contains(&item.id))
                    .collect();
                if let Some(max) = max_items {
                    let skip = items.len().saturating_sub(max);
                    items.drain(..skip);
                }
                let listing = Element::builder("items", ns::PUBSUB)
                    .attr("node", node.as_str())
                    .append_all(items.into_iter().map(|item| item.to_element(ns::PUBSUB)))
                    .build();
                Ok(vec![stanza.iq_result(ctx.server, Some(pubsub_result(listing)))])
            }
            PubSubRequest::Subscribe { node, jid } => {
                if jid.to_bare() != owner {
                    return Err(XmppError::bad_request(Some(
                        "subscription jid must match the requester".into(),
                    )));
                }
                self.nodes
                    .get_mut(&node)
                    .ok_or_else(|| XmppError::item_not_found(None))?
                    .subscribers
                    .insert(jid.to_string());
                let subscription = Element::builder("subscription", ns::PUBSUB)
                    .attr("node", node.as_str())
                    .attr("jid", jid.to_string())
                    .attr("subscription", "subscribed")
                    .build();
                Ok(vec![stanza.iq_result(ctx.server, Some(pubsub_result(subscription)))])
            }
            PubSubRequest::Unsubscribe { node, jid } => {
                if jid.to_bare() != owner {
                    return Err(XmppError::bad_request(Some(
                        "subscription jid must match the requester".into(),
                    )));
                }
                let removed = self
                    .nodes
                    .get_mut(&node)
                    .ok_or_else(|| XmppError::item_not_found(None))?
                    .subscribers
                    .remove(&jid.to_string());
                if !removed {
                    return Err(XmppError::stanza(
                        StanzaErrorCondition::UnexpectedRequest,
                        StanzaErrorType::Cancel,
                        Some("not subscribed".into()),
                    ));
                }
                Ok(vec![stanza.iq_result(ctx.server, None)])
            }
        }
    }
}

#[async_trait]
impl ServerModule for PubSubModule {
    fn name(&self) -> &'static str {
        "pubsub"
    }

    fn namespaces(&self) -> &[&'static str] {
        &[ns::PUBSUB, ns::PUBSUB_OWNER]
    }

    async fn handle(&self, stanza: &Stanza, ctx: &ModuleContext<'_>) -> Result<Vec<Stanza>, XmppError> {
        match stanza.iq_type() {
            Some(IqType::Get) | Some(IqType::Set) => {
                let request = parse_pubsub(stanza)?;
                self.process(request, stanza, ctx).await
            }
            _ => Ok(Vec::new()),
        }
    }
}
