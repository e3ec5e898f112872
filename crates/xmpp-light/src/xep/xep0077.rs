//! XEP-0077: In-Band Registration
//!
//! Before authentication a client may fetch the registration form and
//! submit a username and password. Once authenticated it may change its
//! password or cancel the account.
//!
//! ```xml
//! <iq type='set' id='reg2'>
//!   <query xmlns='jabber:iq:register'>
//!     <username>alice</username>
//!     <password>secret</password>
//!   </query>
//! </iq>
//! ```

use async_trait::async_trait;
use jid::BareJid;
use minidom::Element;
use tracing::{debug, info, instrument};

use super::{ModuleContext, ServerModule};
use crate::parser::ns;
use crate::stanza::{IqType, Stanza};
use crate::XmppError;

/// A parsed registration submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationRequest {
    /// The client wants the form
    Form,
    Submit {
        username: String,
        password: String,
        email: Option<String>,
    },
    /// Cancel the authenticated account
    Remove,
}

/// Parse the `<query/>` of a registration IQ.
pub fn parse_registration(stanza: &Stanza) -> Result<RegistrationRequest, XmppError> {
    let query = stanza
        .element()
        .get_child("query", ns::REGISTER)
        .ok_or_else(|| XmppError::bad_request(Some("Missing query element".into())))?;

    match stanza.iq_type() {
        Some(IqType::Get) => Ok(RegistrationRequest::Form),
        Some(IqType::Set) => {
            if query.has_child("remove", ns::REGISTER) {
                return Ok(RegistrationRequest::Remove);
            }
            let field = |name: &str| {
                query
                    .get_child(name, ns::REGISTER)
                    .map(|e| e.text())
                    .filter(|s| !s.is_empty())
            };
            let username = field("username")
                .ok_or_else(|| XmppError::not_acceptable(Some("Username is required".into())))?;
            let password = field("password")
                .ok_or_else(|| XmppError::not_acceptable(Some("Password is required".into())))?;
            Ok(RegistrationRequest::Submit {
                username,
                password,
                email: field("email"),
            })
        }
        _ => Err(XmppError::bad_request(Some("Invalid IQ type for registration".into()))),
    }
}

/// The form returned for a `get`, flagged `<registered/>` when the
/// requester already has an account.
pub fn registration_form(registered_as: Option<&str>) -> Element {
    let mut builder = Element::builder("query", ns::REGISTER);
    match registered_as {
        Some(username) => {
            builder = builder
                .append(Element::builder("registered", ns::REGISTER).build())
                .append(Element::builder("username", ns::REGISTER).append(username).build())
                .append(Element::builder("password", ns::REGISTER).build());
        }
        None => {
            builder = builder
                .append(
                    Element::builder("instructions", ns::REGISTER)
                        .append("Choose a username and password.")
                        .build(),
                )
                .append(Element::builder("username", ns::REGISTER).build())
                .append(Element::builder("password", ns::REGISTER).build());
        }
    }
    builder.build()
}

#[derive(Debug, Default)]
pub struct RegistrationModule;

impl RegistrationModule {
    fn validate_username(username: &str, domain: &str) -> Result<String, XmppError> {
        let username = username.to_lowercase();
        let jid = BareJid::new(&format!("{}@{}", username, domain))
            .map_err(|e| XmppError::jid_malformed(Some(format!("invalid username: {}", e))))?;
        match jid.node() {
            Some(node) if node.as_str() == username => Ok(username),
            _ => Err(XmppError::jid_malformed(Some("invalid username".into()))),
        }
    }
}

#[async_trait]
impl ServerModule for RegistrationModule {
    fn name(&self) -> &'static str {
        "in-band-registration"
    }

    fn namespaces(&self) -> &[&'static str] {
        &[ns::REGISTER]
    }

    #[instrument(skip(self, stanza, ctx), name = "xmpp.register.handle", fields(authenticated = ctx.sender.is_some()))]
    async fn handle(&self, stanza: &Stanza, ctx: &ModuleContext<'_>) -> Result<Vec<Stanza>, XmppError> {
        let domain = ctx.server.domain().as_str();
        let own_username = ctx
            .sender
            .and_then(|jid| jid.node())
            .map(|node| node.as_str().to_string());

        match (parse_registration(stanza)?, own_username) {
            (RegistrationRequest::Form, None) => {
                Ok(vec![stanza.iq_result(ctx.server, Some(registration_form(None)))])
            }
            (RegistrationRequest::Form, Some(username)) => {
                let registered = ctx.accounts.exists(&username).await?;
                let form = registration_form(registered.then_some(username.as_str()));
                Ok(vec![stanza.iq_result(ctx.server, Some(form))])
            }
            (RegistrationRequest::Submit { username, password, email }, None) => {
                let username = Self::validate_username(&username, domain)?;
                ctx.accounts.create(&username, &password).await?;
                info!(%username, has_email = email.is_some(), "Account registered");
                Ok(vec![stanza.iq_result(ctx.server, None)])
            }
            (RegistrationRequest::Submit { username, password, .. }, Some(own)) => {
                if username.to_lowercase() != own {
                    return Err(XmppError::not_authorized(Some(
                        "cannot change another account".into(),
                    )));
                }
                ctx.accounts.change_password(&own, &password).await?;
                debug!(username = %own, "Password changed");
                Ok(vec![stanza.iq_result(ctx.server, None)])
            }
            (RegistrationRequest::Remove, Some(own)) => {
                if !ctx.accounts.remove(&own).await? {
                    return Err(XmppError::registration_required(None));
                }
                info!(username = %own, "Account removed");
                Ok(vec![stanza.iq_result(ctx.server, None)])
            }
            (RegistrationRequest::Remove, None) => Err(XmppError::not_authorized(None)),
        }
    }
}
