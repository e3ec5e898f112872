//! Test utilities for end-to-end XMPP testing.
//!
//! Provides helpers for starting test servers, generating TLS certificates,
//! and driving raw XMPP client connections.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use xmpp_light::muc::MucRoomRegistry;
use xmpp_light::registry::ConnectionRegistry;
use xmpp_light::{
    tls_acceptor_from_pem, AccountStore, MessageStore, RoomConfig, SaslMechanism, XmppError,
    XmppServer, XmppServerConfig,
};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Domain served by every test server.
pub const DOMAIN: &str = "example.com";

/// Route server logs to the test writer. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn ring() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Generated TLS credentials for testing.
pub struct TestTlsCredentials {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub cert_der: CertificateDer<'static>,
}

impl TestTlsCredentials {
    /// Generate self-signed TLS credentials for testing.
    pub fn generate(domain: &str) -> Self {
        let subject_alt_names = vec![domain.to_string(), "localhost".to_string()];
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(subject_alt_names).expect("Failed to generate test certificate");

        Self {
            cert_pem: cert.pem().into_bytes(),
            key_pem: key_pair.serialize_pem().into_bytes(),
            cert_der: CertificateDer::from(cert.der().to_vec()),
        }
    }

    /// Create a TLS acceptor (server-side) from these credentials.
    pub fn tls_acceptor(&self) -> TlsAcceptor {
        tls_acceptor_from_pem(&self.cert_pem, &self.key_pem).expect("Failed to build TLS acceptor")
    }

    /// Create a TLS connector (client-side) that trusts this certificate.
    pub fn tls_connector(&self) -> TlsConnector {
        let mut root_store = RootCertStore::empty();
        root_store.add(self.cert_der.clone()).expect("Failed to add cert");

        let client_config = ClientConfig::builder_with_provider(ring())
            .with_safe_default_protocol_versions()
            .expect("Failed to select protocol versions")
            .with_root_certificates(root_store)
            .with_no_client_auth();

        TlsConnector::from(Arc::new(client_config))
    }
}

/// Test server handle.
pub struct TestServer {
    pub addr: SocketAddr,
    pub domain: String,
    pub tls_credentials: TestTlsCredentials,
    pub rooms: Arc<MucRoomRegistry>,
    pub registry: Arc<ConnectionRegistry>,
    pub accounts: Arc<dyn AccountStore>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<Result<(), XmppError>>>,
}

impl TestServer {
    /// Start a test XMPP server with default settings on an available port.
    pub async fn start() -> Self {
        Self::start_with(|_| {}, None).await
    }

    /// Start a test server after adjusting its configuration.
    ///
    /// ANONYMOUS and PLAIN are both enabled and `public@example.com` exists.
    pub async fn start_with(
        configure: impl FnOnce(&mut XmppServerConfig),
        message_store: Option<Arc<dyn MessageStore>>,
    ) -> Self {
        init_tracing();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test server");
        let addr = listener.local_addr().expect("Failed to get local addr");

        let tls_credentials = TestTlsCredentials::generate(DOMAIN);
        let mut config = XmppServerConfig {
            domain: DOMAIN.to_string(),
            c2s_addr: addr,
            sasl_mechanisms: vec![SaslMechanism::Anonymous, SaslMechanism::Plain],
            delivery_timeout: Duration::from_millis(200),
            ..XmppServerConfig::default()
        };
        configure(&mut config);

        let mut server =
            XmppServer::new(config, tls_credentials.tls_acceptor()).expect("Failed to create server");
        if let Some(store) = message_store {
            server = server.with_message_store(store);
        }
        server
            .rooms()
            .create_room(
                format!("public@{}", DOMAIN).parse().unwrap(),
                RoomConfig {
                    name: "Public Room".into(),
                    persistent: true,
                    ..RoomConfig::default()
                },
            )
            .expect("Failed to create default room");

        let rooms = Arc::clone(server.rooms());
        let registry = Arc::clone(server.registry());
        let accounts = Arc::clone(server.accounts());

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.serve(listener, shutdown.clone()));

        Self {
            addr,
            domain: DOMAIN.to_string(),
            tls_credentials,
            rooms,
            registry,
            accounts,
            shutdown,
            handle: Some(handle),
        }
    }

    /// Get a TLS connector that trusts this server.
    pub fn tls_connector(&self) -> TlsConnector {
        self.tls_credentials.tls_connector()
    }

    /// Register a PLAIN account.
    pub async fn create_account(&self, username: &str, password: &str) {
        self.accounts
            .create(username, password)
            .await
            .expect("Failed to create account");
    }

    /// Cancel the server and wait for the accept loop and every session to end.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            timeout(DEFAULT_TIMEOUT, handle)
                .await
                .expect("Server did not stop in time")
                .expect("Server task panicked")
                .expect("Server returned an error");
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A client that speaks raw XML over TCP, then TLS after STARTTLS.
pub struct RawXmppClient {
    tcp: Option<TcpStream>,
    tls: Option<tokio_rustls::client::TlsStream<TcpStream>>,
    buffer: String,
    domain: String,
}

impl RawXmppClient {
    /// Connect to a server.
    pub async fn connect(addr: SocketAddr, domain: &str) -> std::io::Result<Self> {
        let tcp = TcpStream::connect(addr).await?;
        Ok(Self {
            tcp: Some(tcp),
            tls: None,
            buffer: String::new(),
            domain: domain.to_string(),
        })
    }

    /// Send raw data.
    pub async fn send(&mut self, data: &str) -> std::io::Result<()> {
        if let Some(ref mut tls) = self.tls {
            tls.write_all(data.as_bytes()).await?;
            tls.flush().await?;
        } else if let Some(ref mut tcp) = self.tcp {
            tcp.write_all(data.as_bytes()).await?;
            tcp.flush().await?;
        }
        Ok(())
    }

    /// Read with timeout. Returns the bytes read as text; 0 bytes means EOF.
    pub async fn read(&mut self, timeout_dur: Duration) -> std::io::Result<usize> {
        let mut buf = [0u8; 8192];
        let n = timeout(timeout_dur, async {
            if let Some(ref mut tls) = self.tls {
                tls.read(&mut buf).await
            } else if let Some(ref mut tcp) = self.tcp {
                tcp.read(&mut buf).await
            } else {
                Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "Not connected"))
            }
        })
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "Timeout"))??;

        self.buffer.push_str(&String::from_utf8_lossy(&buf[..n]));
        Ok(n)
    }

    /// Read until pattern found.
    pub async fn read_until(&mut self, pattern: &str, timeout_dur: Duration) -> std::io::Result<String> {
        let start = std::time::Instant::now();
        while !self.buffer.contains(pattern) {
            if start.elapsed() > timeout_dur {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("Timeout waiting for: {} (have: {})", pattern, self.buffer),
                ));
            }
            let remaining = timeout_dur.saturating_sub(start.elapsed());
            if self.read(remaining).await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("Connection closed waiting for: {} (have: {})", pattern, self.buffer),
                ));
            }
        }
        Ok(self.buffer.clone())
    }

    /// Read until EOF or timeout, returning everything received.
    pub async fn read_to_close(&mut self, timeout_dur: Duration) -> String {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout_dur {
            let remaining = timeout_dur.saturating_sub(start.elapsed());
            match self.read(remaining).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        self.buffer.clone()
    }

    /// Clear buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Take the buffer.
    pub fn take_buffer(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }

    /// Upgrade to TLS.
    pub async fn upgrade_tls(&mut self, connector: TlsConnector) -> std::io::Result<()> {
        let tcp = self.tcp.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "No TCP connection or already TLS")
        })?;

        let server_name: ServerName<'static> = self
            .domain
            .clone()
            .try_into()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "Invalid server name"))?;

        let tls = connector.connect(server_name, tcp).await?;
        self.tls = Some(tls);
        self.buffer.clear();
        Ok(())
    }

    /// Check if using TLS.
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Send the client stream header.
    pub async fn send_stream_header(&mut self) -> std::io::Result<()> {
        let header = format!(
            "<?xml version='1.0'?>\
            <stream:stream \
            xmlns='jabber:client' \
            xmlns:stream='http://etherx.jabber.org/streams' \
            to='{}' \
            version='1.0'>",
            self.domain
        );
        self.send(&header).await
    }

    /// Open the stream and return the features the server offered.
    pub async fn open_stream(&mut self) -> std::io::Result<String> {
        self.clear();
        self.send_stream_header().await?;
        let features = self.read_until("</stream:features>", DEFAULT_TIMEOUT).await?;
        self.clear();
        Ok(features)
    }

    /// Stream header, STARTTLS and the post-TLS stream restart.
    pub async fn negotiate_tls(&mut self, connector: TlsConnector) -> std::io::Result<String> {
        let features = self.open_stream().await?;
        assert!(features.contains("starttls"), "STARTTLS not offered: {}", features);

        self.send("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>").await?;
        self.read_until("<proceed", DEFAULT_TIMEOUT).await?;
        self.upgrade_tls(connector).await?;

        self.open_stream().await
    }

    /// Run one SASL exchange. Returns the server's answer.
    pub async fn authenticate(&mut self, mechanism: &str, payload: Option<&str>) -> std::io::Result<String> {
        self.clear();
        let auth = match payload {
            Some(data) => format!(
                "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='{}'>{}</auth>",
                mechanism, data
            ),
            None => format!("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='{}'/>", mechanism),
        };
        self.send(&auth).await?;

        let start = std::time::Instant::now();
        loop {
            if self.buffer.contains("<success") || self.buffer.contains("</failure>") {
                return Ok(self.take_buffer());
            }
            let remaining = DEFAULT_TIMEOUT.saturating_sub(start.elapsed());
            if remaining.is_zero() || self.read(remaining).await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("No SASL outcome (have: {})", self.buffer),
                ));
            }
        }
    }

    /// Bind a resource after authentication. Returns the bound full JID.
    pub async fn bind(&mut self, resource: Option<&str>) -> std::io::Result<String> {
        let features = self.open_stream().await?;
        assert!(features.contains("urn:ietf:params:xml:ns:xmpp-bind"), "bind not offered: {}", features);

        let body = resource
            .map(|r| format!("<resource>{}</resource>", r))
            .unwrap_or_default();
        self.send(&format!(
            "<iq type='set' id='bind_1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>{}</bind></iq>",
            body
        ))
        .await?;
        let reply = self.read_until("</iq>", DEFAULT_TIMEOUT).await?;
        self.clear();

        extract_between(&reply, "<jid>", "</jid>").ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("bind failed: {}", reply))
        })
    }

    /// Connect, negotiate TLS, authenticate anonymously and bind.
    pub async fn anonymous(server: &TestServer, resource: &str) -> (Self, String) {
        let mut client = Self::connect(server.addr, &server.domain).await.expect("connect");
        client.negotiate_tls(server.tls_connector()).await.expect("tls");
        let outcome = client.authenticate("ANONYMOUS", None).await.expect("auth");
        assert!(outcome.contains("<success"), "ANONYMOUS failed: {}", outcome);
        let jid = client.bind(Some(resource)).await.expect("bind");
        (client, jid)
    }

    /// Connect, negotiate TLS, authenticate with PLAIN and bind.
    pub async fn plain(server: &TestServer, username: &str, password: &str, resource: &str) -> (Self, String) {
        let mut client = Self::connect(server.addr, &server.domain).await.expect("connect");
        client.negotiate_tls(server.tls_connector()).await.expect("tls");
        let payload = encode_sasl_plain(username, password);
        let outcome = client.authenticate("PLAIN", Some(&payload)).await.expect("auth");
        assert!(outcome.contains("<success"), "PLAIN failed: {}", outcome);
        let jid = client.bind(Some(resource)).await.expect("bind");
        (client, jid)
    }

    /// Send initial presence with a priority, then wait until the server
    /// has processed it. A ping is answered only after everything this
    /// session sent before it has been routed.
    pub async fn announce(&mut self, priority: i8) -> std::io::Result<()> {
        self.send(&format!("<presence><priority>{}</priority></presence>", priority))
            .await?;
        self.sync("announce").await
    }

    /// Round-trip a ping with the given id.
    pub async fn sync(&mut self, id: &str) -> std::io::Result<()> {
        self.send(&format!(
            "<iq type='get' id='{}' to='{}'><ping xmlns='urn:xmpp:ping'/></iq>",
            id, self.domain
        ))
        .await?;
        let start = std::time::Instant::now();
        while !has_attr(&self.buffer, "id", id) {
            let remaining = DEFAULT_TIMEOUT.saturating_sub(start.elapsed());
            if remaining.is_zero() || self.read(remaining).await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("no ping reply for {} (have: {})", id, self.buffer),
                ));
            }
        }
        Ok(())
    }
}

/// Helper to encode SASL PLAIN credentials.
pub fn encode_sasl_plain(username: &str, password: &str) -> String {
    let data = format!("\0{}\0{}", username, password);
    BASE64_STANDARD.encode(data.as_bytes())
}

/// Whether `xml` carries `name=value` with either quote style.
pub fn has_attr(xml: &str, name: &str, value: &str) -> bool {
    xml.contains(&format!("{}='{}'", name, value)) || xml.contains(&format!("{}=\"{}\"", name, value))
}

pub fn extract_between(haystack: &str, start: &str, end: &str) -> Option<String> {
    let from = haystack.find(start)? + start.len();
    let len = haystack[from..].find(end)?;
    Some(haystack[from..from + len].to_string())
}
