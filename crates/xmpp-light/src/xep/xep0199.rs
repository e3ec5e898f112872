//! XEP-0199: XMPP Ping
//!
//! A ping addressed to the server is answered with an empty result.

use async_trait::async_trait;

use super::{ModuleContext, ServerModule};
use crate::parser::ns;
use crate::stanza::{IqType, Stanza};
use crate::XmppError;

#[derive(Debug, Default)]
pub struct PingModule;

#[async_trait]
impl ServerModule for PingModule {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn namespaces(&self) -> &[&'static str] {
        &[ns::PING]
    }

    async fn handle(&self, stanza: &Stanza, ctx: &ModuleContext<'_>) -> Result<Vec<Stanza>, XmppError> {
        match stanza.iq_type() {
            Some(IqType::Get) => Ok(vec![stanza.iq_result(ctx.server, None)]),
            Some(IqType::Set) => Err(XmppError::bad_request(Some("ping must be type 'get'".into()))),
            _ => Ok(Vec::new()),
        }
    }
}
