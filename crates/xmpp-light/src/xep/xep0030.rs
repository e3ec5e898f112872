//! XEP-0030: Service Discovery for the server itself.
//!
//! `disco#info` reports the server identity and every namespace an
//! installed module serves. `disco#items` lists the MUC service. Queries
//! addressed to the MUC service or its rooms are answered by the room
//! registry instead.

use std::collections::BTreeSet;

use async_trait::async_trait;
use minidom::Element;

use super::{ModuleContext, ServerModule};
use crate::parser::ns;
use crate::stanza::{IqType, Stanza};
use crate::XmppError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub category: &'static str,
    pub type_: &'static str,
    pub name: Option<String>,
}

impl Identity {
    pub fn server() -> Self {
        Self {
            category: "server",
            type_: "im",
            name: Some("xmpp-light".to_string()),
        }
    }

    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder("identity", ns::DISCO_INFO)
            .attr("category", self.category)
            .attr("type", self.type_);
        if let Some(ref name) = self.name {
            builder = builder.attr("name", name.as_str());
        }
        builder.build()
    }
}

/// `<query xmlns='disco#info'/>` with one identity and the given features.
pub fn info_query<'a>(identity: &Identity, features: impl IntoIterator<Item = &'a str>) -> Element {
    let unique: BTreeSet<&str> = features.into_iter().collect();
    Element::builder("query", ns::DISCO_INFO)
        .append(identity.to_element())
        .append_all(
            unique
                .into_iter()
                .map(|var| Element::builder("feature", ns::DISCO_INFO).attr("var", var).build()),
        )
        .build()
}

#[derive(Debug, Default)]
pub struct DiscoModule;

#[async_trait]
impl ServerModule for DiscoModule {
    fn name(&self) -> &'static str {
        "service-discovery"
    }

    fn namespaces(&self) -> &[&'static str] {
        &[ns::DISCO_INFO, ns::DISCO_ITEMS]
    }

    async fn handle(&self, stanza: &Stanza, ctx: &ModuleContext<'_>) -> Result<Vec<Stanza>, XmppError> {
        if stanza.iq_type() != Some(IqType::Get) {
            return match stanza.iq_type() {
                Some(IqType::Set) => Err(XmppError::bad_request(None)),
                _ => Ok(Vec::new()),
            };
        }
        let Some(query) = stanza.payload() else {
            return Err(XmppError::bad_request(None));
        };
        if query.attr("node").is_some() {
            return Err(XmppError::item_not_found(None));
        }

        let payload = if query.ns() == ns::DISCO_INFO {
            info_query(
                &Identity::server(),
                ctx.features.iter().map(String::as_str),
            )
        } else {
            Element::builder("query", ns::DISCO_ITEMS)
                .append(
                    Element::builder("item", ns::DISCO_ITEMS)
                        .attr("jid", ctx.rooms.muc_domain())
                        .attr("name", "Chatrooms")
                        .build(),
                )
                .build()
        };
        Ok(vec![stanza.iq_result(ctx.server, Some(payload))])
    }
}
