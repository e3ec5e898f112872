//! Connection actor for handling individual XMPP client connections.
//!
//! One task per socket. It reads frames, drives the [`SessionMachine`]
//! through negotiation and hands stanzas from an active session to the
//! router pool. Everything addressed to the session arrives on its bounded
//! output queue and is written here, so the socket has a single writer.

use std::net::SocketAddr;
use std::sync::Arc;

use jid::{FullJid, Jid};
use minidom::Element;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Span};
use uuid::Uuid;

use crate::auth::{self, mechanisms_feature, SaslFailure, SaslMechanism};
use crate::error::stream_errors;
use crate::metrics;
use crate::parser::{ns, Decoded, StreamEvent};
use crate::registry::{Eviction, Outbound};
use crate::server::ServerContext;
use crate::session::{requested_resource, Admission, Features, SessionMachine};
use crate::stanza::Stanza;
use crate::stream::XmppStream;
use crate::types::BindConflictPolicy;
use crate::XmppError;

/// Why the frame loop ended without an error.
enum Exit {
    /// Peer closed the stream or the socket
    PeerClosed,
    /// Server closed the stream with a stream error
    Terminated,
}

/// Actor managing a single XMPP client connection.
pub struct ConnectionActor {
    peer_addr: SocketAddr,
    stream: XmppStream,
    machine: SessionMachine,
    ctx: Arc<ServerContext>,
    /// Identifies this session in the connection registry
    session_id: Uuid,
    outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: mpsc::Receiver<Outbound>,
    shutdown: CancellationToken,
    /// Fires if the router evicts this session while its queue is full
    eviction: Eviction,
    /// Set once the resource is registered
    bound: Option<FullJid>,
    /// The `xmpp.connection.lifecycle` span
    span: Span,
}

impl ConnectionActor {
    /// Handle a new incoming connection until it closes, then tear it down.
    pub(crate) async fn handle_connection(
        tcp_stream: TcpStream,
        peer_addr: SocketAddr,
        ctx: Arc<ServerContext>,
        shutdown: CancellationToken,
    ) -> Result<(), XmppError> {
        info!(peer = %peer_addr, "New connection");

        let (outbound_tx, outbound_rx) = mpsc::channel(ctx.config.outbound_queue_capacity);
        let mut actor = Self {
            peer_addr,
            stream: XmppStream::new(
                tcp_stream,
                ctx.config.domain.clone(),
                ctx.config.max_stanza_size,
            ),
            machine: SessionMachine::new(ctx.config.domain.clone(), ctx.config.session_limits()),
            ctx,
            session_id: Uuid::new_v4(),
            outbound_tx,
            outbound_rx,
            shutdown,
            eviction: Eviction::new(),
            bound: None,
            span: Span::current(),
        };

        let result = actor.run().await;
        actor.cleanup().await;
        result
    }

    async fn run(&mut self) -> Result<(), XmppError> {
        match self.process().await {
            Ok(Exit::PeerClosed) => {
                debug!("Peer closed the stream");
                Ok(())
            }
            Ok(Exit::Terminated) => Ok(()),
            Err(e) => {
                if let Some(condition) = e.stream_condition() {
                    let text = match &e {
                        XmppError::Stream { text, .. } => text.clone(),
                        other => other.to_string(),
                    };
                    if self.stream.send_stream_error(condition, Some(&text)).await.is_ok() {
                        if let Err(e) = self.stream.shutdown().await {
                            debug!(error = %e, "Stream shutdown failed after stream error");
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Main loop: shutdown, then eviction, then queued output, then the next
    /// inbound frame.
    async fn process(&mut self) -> Result<Exit, XmppError> {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    return self
                        .terminate(stream_errors::SYSTEM_SHUTDOWN, "Server is shutting down")
                        .await;
                }

                (condition, text) = self.eviction.evicted() => {
                    info!(condition, "Session evicted by the server");
                    return self.terminate(condition, &text).await;
                }

                Some(outbound) = self.outbound_rx.recv() => match outbound {
                    Outbound::Stanza(stanza) => self.stream.write_stanza(&stanza).await?,
                    Outbound::Close { condition, text } => {
                        info!(condition, "Session terminated by the server");
                        return self.terminate(condition, &text).await;
                    }
                },

                frame = self.stream.read_frame() => match frame? {
                    None => return Ok(Exit::PeerClosed),
                    Some(Decoded::Event(StreamEvent::Close)) => {
                        self.machine.close();
                        if let Err(e) = self.stream.close().await {
                            debug!(error = %e, "Closing stream failed");
                        }
                        return Ok(Exit::PeerClosed);
                    }
                    Some(Decoded::Event(event)) => self.handle_event(event).await?,
                    Some(Decoded::Stanza(stanza)) => self.handle_stanza(stanza).await?,
                    Some(Decoded::Malformed { element, error }) => {
                        self.handle_malformed(element, error).await?
                    }
                    Some(Decoded::NeedMoreData) => {}
                },
            }
        }
    }

    async fn terminate(&mut self, condition: &str, text: &str) -> Result<Exit, XmppError> {
        self.machine.close();
        self.stream.send_stream_error(condition, Some(text)).await?;
        self.stream.shutdown().await?;
        Ok(Exit::Terminated)
    }

    async fn handle_event(&mut self, event: StreamEvent) -> Result<(), XmppError> {
        match event {
            StreamEvent::Open(header) => {
                self.stream.send_stream_header().await?;
                let features = self.machine.on_stream_open(&header)?;
                let xml = self.features_xml(features);
                self.stream.send_features(&xml).await
            }
            StreamEvent::StartTls => {
                self.machine.on_starttls()?;
                self.stream.starttls(&self.ctx.tls_acceptor).await?;
                self.machine.on_tls_established()?;
                self.span.record("transport", self.stream.transport().to_string());
                Ok(())
            }
            StreamEvent::SaslAuth { mechanism, data } => self.handle_sasl(&mechanism, &data).await,
            StreamEvent::SaslAbort => self.stream.write_raw(&SaslFailure::Aborted.to_xml()).await,
            StreamEvent::Close => Ok(()),
            StreamEvent::Unsupported(element) => Err(XmppError::stream(
                stream_errors::UNSUPPORTED_STANZA_TYPE,
                format!("<{} xmlns='{}'/> is not supported", element.name(), element.ns()),
            )),
        }
    }

    fn features_xml(&self, features: Features) -> String {
        match features {
            Features::StartTls => format!("<starttls xmlns='{}'><required/></starttls>", ns::TLS),
            Features::Sasl { registration } => {
                let mut xml = mechanisms_feature(&self.ctx.config.sasl_mechanisms);
                if registration {
                    xml.push_str(&format!("<register xmlns='{}'/>", ns::REGISTER_FEATURE));
                }
                xml
            }
            Features::Bind => format!(
                "<bind xmlns='{}'/><session xmlns='{}'><optional/></session>",
                ns::BIND,
                ns::SESSION
            ),
        }
    }

    async fn handle_sasl(&mut self, mechanism: &str, data: &str) -> Result<(), XmppError> {
        if let Err(e) = self.machine.on_auth_start() {
            if e.is_fatal() {
                return Err(e);
            }
            debug!(error = %e, "Refusing SASL exchange");
            let failure = if self.machine.is_encrypted() {
                SaslFailure::MalformedRequest
            } else {
                SaslFailure::EncryptionRequired
            };
            return self.stream.write_raw(&failure.to_xml()).await;
        }

        let label = SaslMechanism::from_name(mechanism)
            .map(|m| m.as_str())
            .unwrap_or("unknown");
        let outcome = auth::authenticate(
            mechanism,
            data,
            &self.ctx.config.domain,
            &self.ctx.config.sasl_mechanisms,
            self.ctx.accounts.as_ref(),
        )
        .await;

        match outcome {
            Ok(identity) => {
                metrics::record_auth_attempt(label, true);
                info!(identity = %identity, mechanism = label, "Authentication successful");
                self.machine.on_auth_success(identity)?;
                self.stream
                    .write_raw(&format!("<success xmlns='{}'/>", ns::SASL))
                    .await?;
                self.stream.restart();
                Ok(())
            }
            Err(failure) => {
                metrics::record_auth_attempt(label, false);
                debug!(mechanism = label, condition = failure.condition(), "Authentication failed");
                self.stream.write_raw(&failure.to_xml()).await?;
                self.machine.on_auth_failure()
            }
        }
    }

    async fn handle_stanza(&mut self, stanza: Stanza) -> Result<(), XmppError> {
        match self.machine.admit(stanza) {
            Admission::Route(stanza) => self.submit(stanza).await,
            Admission::Bind(request) => self.handle_bind(request).await,
            Admission::Register(request) => {
                let replies = match self.ctx.router.dispatch_to_modules(None, &request).await {
                    Ok(replies) => replies,
                    Err(e) => vec![request.error_reply(&e, self.ctx.router.server_jid())],
                };
                for reply in replies {
                    self.stream.write_stanza(&reply).await?;
                }
                Ok(())
            }
            Admission::Queued => Ok(()),
            Admission::Rejected { stanza, error } => {
                debug!(error = %error, kind = %stanza.kind(), "Rejected stanza");
                if stanza.type_attr() == Some("error") {
                    return Ok(());
                }
                let reply = stanza.error_reply(&error, self.ctx.router.server_jid());
                self.stream.write_stanza(&reply).await
            }
            Admission::Fatal(error) => Err(error),
        }
    }

    /// Answer a stanza whose addressing did not parse. The stream stays open.
    async fn handle_malformed(&mut self, element: Element, error: XmppError) -> Result<(), XmppError> {
        debug!(error = %error, element = element.name(), "Malformed stanza addressing");
        match Stanza::from_parts(element, None, None) {
            Ok(stanza) if stanza.type_attr() != Some("error") => {
                let reply = stanza.error_reply(&error, self.ctx.router.server_jid());
                self.stream.write_stanza(&reply).await
            }
            _ => Ok(()),
        }
    }

    /// Stamp the bound address as sender and queue for routing.
    async fn submit(&mut self, stanza: Stanza) -> Result<(), XmppError> {
        let Some(jid) = self.bound.clone() else {
            return Err(XmppError::internal("routing before resource binding"));
        };
        let stanza = stanza.with_from(&Jid::from(jid.clone()));
        self.ctx.pool.submit(jid, self.session_id, stanza).await
    }

    fn register(&mut self, jid: &FullJid) -> Result<(), XmppError> {
        self.eviction = self.ctx.router.registry().register(
            jid.clone(),
            self.session_id,
            self.outbound_tx.clone(),
        )?;
        Ok(())
    }

    async fn handle_bind(&mut self, request: Stanza) -> Result<(), XmppError> {
        let identity = self
            .machine
            .identity()
            .cloned()
            .ok_or_else(|| XmppError::internal("bind before authentication"))?;
        let server_jid = self.ctx.router.server_jid().clone();

        let resource = requested_resource(&request).unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let full_jid = match identity.with_resource_str(&resource) {
            Ok(jid) => jid,
            Err(e) => {
                let error = XmppError::bad_request(Some(format!("invalid resource: {}", e)));
                return self.stream.write_stanza(&request.error_reply(&error, &server_jid)).await;
            }
        };

        let mut registered = self.register(&full_jid);
        if registered.is_err() && self.ctx.config.bind_conflict == BindConflictPolicy::Replace {
            if let Some(previous) = self.ctx.router.registry().session_id(&full_jid) {
                info!(jid = %full_jid, "Resource already bound, replacing the old session");
                self.ctx
                    .pool
                    .teardown(full_jid.clone(), previous, Some(stream_errors::CONFLICT))
                    .await?;
            }
            registered = self.register(&full_jid);
        }
        if let Err(e) = registered {
            debug!(error = %e, "Refusing resource bind");
            let error = XmppError::conflict(Some(format!("resource '{}' is in use", resource)));
            return self.stream.write_stanza(&request.error_reply(&error, &server_jid)).await;
        }

        self.bound = Some(full_jid.clone());
        self.machine.on_bound(full_jid.clone())?;
        self.span.record("jid", full_jid.to_string());

        let bind = Element::builder("bind", ns::BIND)
            .append(
                Element::builder("jid", ns::BIND)
                    .append(full_jid.to_string())
                    .build(),
            )
            .build();
        self.stream
            .write_stanza(&request.iq_result(&server_jid, Some(bind)))
            .await?;

        info!(jid = %full_jid, peer = %self.peer_addr, "Session established");

        for held in self.machine.activate()? {
            self.submit(held).await?;
        }
        Ok(())
    }

    /// Teardown runs on the router after everything this session submitted.
    async fn cleanup(&mut self) {
        self.machine.close();
        if let Some(jid) = self.bound.take() {
            if let Err(e) = self.ctx.pool.teardown(jid, self.session_id, None).await {
                warn!(error = %e, "Session teardown failed");
            }
        }
        info!(peer = %self.peer_addr, "Connection closed");
    }
}
