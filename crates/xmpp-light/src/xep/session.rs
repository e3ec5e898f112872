//! Legacy session establishment and exclusive delivery.

use async_trait::async_trait;
use minidom::Element;

use super::{ModuleContext, ServerModule};
use crate::parser::ns;
use crate::stanza::{IqType, Stanza};
use crate::XmppError;

/// Acknowledges the RFC 3921 `<session/>` request older clients still send.
#[derive(Debug, Default)]
pub struct SessionModule;

#[async_trait]
impl ServerModule for SessionModule {
    fn name(&self) -> &'static str {
        "session"
    }

    fn namespaces(&self) -> &[&'static str] {
        &[ns::SESSION]
    }

    async fn handle(&self, stanza: &Stanza, ctx: &ModuleContext<'_>) -> Result<Vec<Stanza>, XmppError> {
        match stanza.iq_type() {
            Some(IqType::Set) => Ok(vec![stanza.iq_result(ctx.server, None)]),
            Some(IqType::Get) => Err(XmppError::bad_request(None)),
            _ => Ok(Vec::new()),
        }
    }
}

/// Lets a resource claim messages sent to the bare JID for itself alone.
///
/// ```xml
/// <iq type='set'><exclusive xmlns='urn:xmpp:light:exclusive:0' enabled='true'/></iq>
/// ```
#[derive(Debug, Default)]
pub struct ExclusiveModule;

fn exclusive_element(enabled: bool) -> Element {
    Element::builder("exclusive", ns::EXCLUSIVE)
        .attr("enabled", if enabled { "true" } else { "false" })
        .build()
}

#[async_trait]
impl ServerModule for ExclusiveModule {
    fn name(&self) -> &'static str {
        "exclusive-delivery"
    }

    fn namespaces(&self) -> &[&'static str] {
        &[ns::EXCLUSIVE]
    }

    async fn handle(&self, stanza: &Stanza, ctx: &ModuleContext<'_>) -> Result<Vec<Stanza>, XmppError> {
        let sender = ctx.require_sender()?;
        match stanza.iq_type() {
            Some(IqType::Get) => {
                let enabled = ctx.registry.is_exclusive(sender);
                Ok(vec![stanza.iq_result(ctx.server, Some(exclusive_element(enabled)))])
            }
            Some(IqType::Set) => {
                let enabled = match stanza.payload().and_then(|p| p.attr("enabled")) {
                    Some("true") | Some("1") => true,
                    Some("false") | Some("0") => false,
                    _ => {
                        return Err(XmppError::bad_request(Some(
                            "'enabled' must be true or false".into(),
                        )))
                    }
                };
                if !ctx.registry.set_exclusive(sender, enabled) {
                    return Err(XmppError::item_not_found(Some("resource is not connected".into())));
                }
                Ok(vec![stanza.iq_result(ctx.server, None)])
            }
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::super::testing::{stanza, Fixture};
    use super::*;

    #[tokio::test]
    async fn test_session_iq_is_acknowledged() {
        let fixture = Fixture::new();
        let iq = stanza(
            "<iq xmlns='jabber:client' type='set' id='s'><session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></iq>",
        );
        let out = SessionModule.handle(&iq, &fixture.ctx(true)).await.unwrap();
        assert_eq!(out[0].type_attr(), Some("result"));
    }

    #[tokio::test]
    async fn test_exclusive_toggle() {
        let fixture = Fixture::new();
        let (tx, _rx) = mpsc::channel(4);
        fixture
            .registry
            .register(fixture.sender.clone(), Uuid::new_v4(), tx)
            .unwrap();

        let set = stanza(
            "<iq xmlns='jabber:client' type='set' id='e'><exclusive xmlns='urn:xmpp:light:exclusive:0' enabled='true'/></iq>",
        );
        ExclusiveModule.handle(&set, &fixture.ctx(true)).await.unwrap();
        assert!(fixture.registry.is_exclusive(&fixture.sender));

        let get = stanza(
            "<iq xmlns='jabber:client' type='get' id='g'><exclusive xmlns='urn:xmpp:light:exclusive:0'/></iq>",
        );
        let out = ExclusiveModule.handle(&get, &fixture.ctx(true)).await.unwrap();
        assert_eq!(out[0].payload().unwrap().attr("enabled"), Some("true"));
    }

    #[tokio::test]
    async fn test_exclusive_requires_valid_flag() {
        let fixture = Fixture::new();
        let set = stanza(
            "<iq xmlns='jabber:client' type='set' id='e'><exclusive xmlns='urn:xmpp:light:exclusive:0' enabled='maybe'/></iq>",
        );
        let err = ExclusiveModule.handle(&set, &fixture.ctx(true)).await.unwrap_err();
        assert_eq!(err.to_stanza_error().0.as_str(), "bad-request");
    }
}
