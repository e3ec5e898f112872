//! `jabber:iq:roster` get and set handling.

use async_trait::async_trait;
use jid::BareJid;
use tracing::{debug, instrument};

use super::{roster_push, roster_query, RosterItem, Subscription};
use crate::parser::ns;
use crate::stanza::{IqType, Stanza};
use crate::xep::{ModuleContext, ServerModule};
use crate::XmppError;

/// Serves roster retrieval and edits for the requesting user.
#[derive(Debug, Default)]
pub struct RosterModule;

impl RosterModule {
    fn pushes(ctx: &ModuleContext<'_>, user: &BareJid, item: &RosterItem) -> Vec<Stanza> {
        ctx.registry
            .resources_for(user)
            .iter()
            .map(|resource| roster_push(user, resource, item))
            .collect()
    }

    #[instrument(skip(self, ctx, stanza), name = "xmpp.roster.set", fields(user = %user))]
    fn set(&self, user: &BareJid, stanza: &Stanza, ctx: &ModuleContext<'_>) -> Result<Vec<Stanza>, XmppError> {
        let query = stanza
            .payload()
            .ok_or_else(|| XmppError::bad_request(None))?;
        let mut items = query.children().filter(|c| c.name() == "item");
        let (Some(element), None) = (items.next(), items.next()) else {
            return Err(XmppError::bad_request(Some(
                "roster set must contain exactly one item".into(),
            )));
        };
        let item = RosterItem::from_element(element)?;
        if &item.jid == user {
            return Err(XmppError::not_acceptable(Some("cannot add yourself".into())));
        }

        let mut out = vec![stanza.iq_result(ctx.server, None)];
        if item.subscription == Subscription::Remove {
            if ctx.presence.roster().get(user, &item.jid).is_none() {
                return Err(XmppError::item_not_found(None));
            }
            out.extend(ctx.presence.unsubscribe(user, &item.jid));
            out.extend(ctx.presence.deny(user, &item.jid));
            ctx.presence.roster().remove(user, &item.jid);
            debug!(contact = %item.jid, "Roster item removed");
            let removed = RosterItem::new(item.jid.clone()).set_subscription(Subscription::Remove);
            out.extend(Self::pushes(ctx, user, &removed));
        } else {
            let stored = ctx.presence.roster().upsert(user, &item);
            out.extend(Self::pushes(ctx, user, &stored));
        }
        Ok(out)
    }
}

#[async_trait]
impl ServerModule for RosterModule {
    fn name(&self) -> &'static str {
        "roster"
    }

    fn namespaces(&self) -> &[&'static str] {
        &[ns::ROSTER]
    }

    async fn handle(&self, stanza: &Stanza, ctx: &ModuleContext<'_>) -> Result<Vec<Stanza>, XmppError> {
        let user = ctx.require_sender()?.to_bare();
        match stanza.iq_type() {
            Some(IqType::Get) => {
                let items = ctx.presence.roster().items(&user);
                Ok(vec![stanza.iq_result(ctx.server, Some(roster_query(&items)))])
            }
            Some(IqType::Set) => self.set(&user, stanza, ctx),
            _ => Ok(Vec::new()),
        }
    }
}
