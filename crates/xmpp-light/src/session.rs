//! Per-connection session state machine.
//!
//! The machine is pure: it owns no I/O and never awaits. The connection task
//! feeds it negotiation events and inbound stanzas and acts on what it says.
//!
//! ```text
//! Connected -> StreamOpened -> TlsPending -> TlsEstablished -> Authenticating
//!           -> Authenticated -> ResourceBound -> Active          (any -> Closed)
//! ```

use std::collections::VecDeque;

use jid::{BareJid, FullJid};
use tracing::debug;

use crate::error::stream_errors;
use crate::parser::{ns, StreamHeader};
use crate::stanza::{IqType, Stanza};
use crate::types::{SessionState, StanzaKind};
use crate::XmppError;

/// Bounds applied to a single session.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    /// Failed SASL attempts before the stream is closed
    pub max_auth_attempts: u32,
    /// Policy violations tolerated before the stream is closed
    pub violation_threshold: u32,
    /// Accept `jabber:iq:register` before authentication
    pub registration_enabled: bool,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_auth_attempts: 3,
            violation_threshold: 5,
            registration_enabled: true,
        }
    }
}

/// Stream features to advertise after a stream header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Features {
    StartTls,
    Sasl { registration: bool },
    Bind,
}

/// What to do with an inbound stanza.
#[derive(Debug)]
pub enum Admission {
    /// Hand to the router
    Route(Stanza),
    /// Resource binding request
    Bind(Stanza),
    /// Pre-authentication in-band registration
    Register(Stanza),
    /// Held until the session becomes active
    Queued,
    /// Answer with an error and keep the stream open
    Rejected { stanza: Stanza, error: XmppError },
    /// Violation threshold exceeded
    Fatal(XmppError),
}

/// State of one client session.
#[derive(Debug)]
pub struct SessionMachine {
    domain: String,
    limits: SessionLimits,
    state: SessionState,
    encrypted: bool,
    identity: Option<BareJid>,
    bound: Option<FullJid>,
    auth_failures: u32,
    violations: u32,
    pending: VecDeque<Stanza>,
}

impl SessionMachine {
    pub fn new(domain: impl Into<String>, limits: SessionLimits) -> Self {
        Self {
            domain: domain.into(),
            limits,
            state: SessionState::Connected,
            encrypted: false,
            identity: None,
            bound: None,
            auth_failures: 0,
            violations: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    /// Authenticated bare JID.
    pub fn identity(&self) -> Option<&BareJid> {
        self.identity.as_ref()
    }

    /// Bound full JID.
    pub fn jid(&self) -> Option<&FullJid> {
        self.bound.as_ref()
    }

    pub fn violations(&self) -> u32 {
        self.violations
    }

    fn transition(&mut self, to: SessionState) {
        debug!(from = %self.state, to = %to, "Session state transition");
        self.state = to;
    }

    /// A stream header arrived (initial open or restart).
    pub fn on_stream_open(&mut self, header: &StreamHeader) -> Result<Features, XmppError> {
        match header.to.as_deref() {
            Some(to) if to.eq_ignore_ascii_case(&self.domain) => {}
            Some(to) => {
                self.close();
                return Err(XmppError::stream(
                    stream_errors::HOST_UNKNOWN,
                    format!("this server does not serve '{}'", to),
                ));
            }
            None => {
                self.close();
                return Err(XmppError::stream(
                    stream_errors::IMPROPER_ADDRESSING,
                    "stream header has no 'to' attribute",
                ));
            }
        }

        match self.state {
            SessionState::Connected => {
                self.transition(SessionState::StreamOpened);
                Ok(Features::StartTls)
            }
            SessionState::TlsEstablished => Ok(Features::Sasl {
                registration: self.limits.registration_enabled,
            }),
            SessionState::Authenticated => Ok(Features::Bind),
            state => {
                self.close();
                Err(XmppError::stream(
                    stream_errors::POLICY_VIOLATION,
                    format!("unexpected stream restart in state {}", state),
                ))
            }
        }
    }

    /// `<starttls/>` received.
    pub fn on_starttls(&mut self) -> Result<(), XmppError> {
        if self.state != SessionState::StreamOpened {
            self.close();
            return Err(XmppError::stream(
                stream_errors::POLICY_VIOLATION,
                format!("STARTTLS not allowed in state {}", self.state),
            ));
        }
        self.transition(SessionState::TlsPending);
        Ok(())
    }

    pub fn on_tls_established(&mut self) -> Result<(), XmppError> {
        if self.state != SessionState::TlsPending {
            self.close();
            return Err(XmppError::internal("TLS completed without a STARTTLS request"));
        }
        self.encrypted = true;
        self.transition(SessionState::TlsEstablished);
        Ok(())
    }

    /// `<auth/>` received. Non-fatal errors are answered with a SASL failure.
    pub fn on_auth_start(&mut self) -> Result<(), XmppError> {
        match self.state {
            SessionState::TlsEstablished => {
                self.transition(SessionState::Authenticating);
                Ok(())
            }
            SessionState::Connected | SessionState::StreamOpened | SessionState::TlsPending => {
                Err(self.violation("authentication requires TLS"))
            }
            state => Err(self.violation(&format!("authentication not allowed in state {}", state))),
        }
    }

    pub fn on_auth_success(&mut self, identity: BareJid) -> Result<(), XmppError> {
        if self.state != SessionState::Authenticating {
            self.close();
            return Err(XmppError::internal("SASL success outside an exchange"));
        }
        self.identity = Some(identity);
        self.transition(SessionState::Authenticated);
        Ok(())
    }

    /// Record a failed attempt. Fatal once the attempt budget is spent.
    pub fn on_auth_failure(&mut self) -> Result<(), XmppError> {
        if self.state == SessionState::Authenticating {
            self.transition(SessionState::TlsEstablished);
        }
        self.auth_failures += 1;
        if self.auth_failures >= self.limits.max_auth_attempts {
            self.close();
            return Err(XmppError::auth_failed(format!(
                "{} failed authentication attempts",
                self.auth_failures
            )));
        }
        Ok(())
    }

    pub fn on_bound(&mut self, jid: FullJid) -> Result<(), XmppError> {
        if self.state != SessionState::Authenticated {
            self.close();
            return Err(XmppError::internal("resource bound outside Authenticated"));
        }
        self.bound = Some(jid);
        self.transition(SessionState::ResourceBound);
        Ok(())
    }

    /// Enter `Active` and release stanzas held while binding completed.
    pub fn activate(&mut self) -> Result<Vec<Stanza>, XmppError> {
        if self.state != SessionState::ResourceBound {
            self.close();
            return Err(XmppError::internal("activation without a bound resource"));
        }
        self.transition(SessionState::Active);
        Ok(self.pending.drain(..).collect())
    }

    /// Decide what happens to an inbound stanza in the current state.
    pub fn admit(&mut self, stanza: Stanza) -> Admission {
        match self.state {
            SessionState::Active => Admission::Route(stanza),
            SessionState::ResourceBound => {
                self.pending.push_back(stanza);
                Admission::Queued
            }
            SessionState::Authenticated if is_bind_request(&stanza) => Admission::Bind(stanza),
            SessionState::TlsEstablished
                if self.limits.registration_enabled && is_register_request(&stanza) =>
            {
                Admission::Register(stanza)
            }
            state => {
                let reason = if state < SessionState::TlsEstablished {
                    "stanzas are not accepted before TLS".to_string()
                } else if state < SessionState::Authenticated {
                    "stanzas are not accepted before authentication".to_string()
                } else {
                    format!("{} not accepted in state {}", stanza.kind(), state)
                };
                let error = self.violation(&reason);
                if error.is_fatal() {
                    Admission::Fatal(error)
                } else {
                    Admission::Rejected { stanza, error }
                }
            }
        }
    }

    /// Count a policy violation. Past the threshold it becomes a stream error.
    pub fn violation(&mut self, reason: &str) -> XmppError {
        self.violations += 1;
        if self.violations > self.limits.violation_threshold {
            self.close();
            return XmppError::stream(
                stream_errors::POLICY_VIOLATION,
                format!("too many policy violations ({})", reason),
            );
        }
        XmppError::policy_violation(reason)
    }

    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            self.transition(SessionState::Closed);
        }
        self.pending.clear();
    }
}

/// `<iq type='set'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></iq>`
pub fn is_bind_request(stanza: &Stanza) -> bool {
    stanza.kind() == StanzaKind::Iq
        && stanza.iq_type() == Some(IqType::Set)
        && stanza.child_in(ns::BIND).is_some()
}

pub fn is_register_request(stanza: &Stanza) -> bool {
    stanza.kind() == StanzaKind::Iq
        && stanza.iq_type().is_some_and(|t| t.is_request())
        && stanza.child_in(ns::REGISTER).is_some()
}

/// The resource requested in a bind IQ, if any.
pub fn requested_resource(stanza: &Stanza) -> Option<String> {
    stanza
        .child_in(ns::BIND)
        .and_then(|bind| bind.get_child("resource", ns::BIND))
        .map(|r| r.text().trim().to_string())
        .filter(|r| !r.is_empty())
}
