//! XEP-0092: Software Version

use async_trait::async_trait;
use minidom::Element;

use super::{ModuleContext, ServerModule};
use crate::parser::ns;
use crate::stanza::{IqType, Stanza};
use crate::XmppError;

/// Reports the server name and version.
#[derive(Debug, Clone)]
pub struct VersionModule {
    name: String,
    version: String,
    os: Option<String>,
}

impl VersionModule {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            os: None,
        }
    }

    pub fn with_os(mut self, os: impl Into<String>) -> Self {
        self.os = Some(os.into());
        self
    }

    fn query(&self) -> Element {
        let mut builder = Element::builder("query", ns::VERSION)
            .append(Element::builder("name", ns::VERSION).append(self.name.as_str()).build())
            .append(
                Element::builder("version", ns::VERSION)
                    .append(self.version.as_str())
                    .build(),
            );
        if let Some(ref os) = self.os {
            builder = builder.append(Element::builder("os", ns::VERSION).append(os.as_str()).build());
        }
        builder.build()
    }
}

impl Default for VersionModule {
    fn default() -> Self {
        Self::new("xmpp-light", env!("CARGO_PKG_VERSION"))
    }
}

#[async_trait]
impl ServerModule for VersionModule {
    fn name(&self) -> &'static str {
        "software-version"
    }

    fn namespaces(&self) -> &[&'static str] {
        &[ns::VERSION]
    }

    async fn handle(&self, stanza: &Stanza, ctx: &ModuleContext<'_>) -> Result<Vec<Stanza>, XmppError> {
        match stanza.iq_type() {
            Some(IqType::Get) => Ok(vec![stanza.iq_result(ctx.server, Some(self.query()))]),
            Some(IqType::Set) => Err(XmppError::not_acceptable(None)),
            _ => Ok(Vec::new()),
        }
    }
}
