//! XMPP stream over TCP with in-band STARTTLS upgrade.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::generate_stream_error;
use crate::parser::{ns, Decoded, XmlParser};
use crate::stanza::Stanza;
use crate::types::Transport;
use crate::XmppError;

#[derive(Default)]
enum StreamInner {
    #[default]
    None,
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// One client connection: the socket, its framer and the stream identity.
pub struct XmppStream {
    inner: StreamInner,
    parser: XmlParser,
    domain: String,
    stream_id: String,
    header_sent: bool,
}

impl XmppStream {
    pub fn new(stream: TcpStream, domain: String, max_stanza_size: usize) -> Self {
        Self {
            inner: StreamInner::Tcp(stream),
            parser: XmlParser::with_max_stanza_size(max_stanza_size),
            domain,
            stream_id: Uuid::new_v4().to_string(),
            header_sent: false,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn transport(&self) -> Transport {
        match self.inner {
            StreamInner::Tls(_) => Transport::TcpTls,
            _ => Transport::Tcp,
        }
    }

    /// Read until the parser yields something. `Ok(None)` on EOF.
    ///
    /// Cancel safe: the only await is a socket read, and bytes are only
    /// handed to the parser after that read completes.
    pub async fn read_frame(&mut self) -> Result<Option<Decoded>, XmppError> {
        let mut buf = [0u8; 8192];
        loop {
            match self.parser.parse_next()? {
                Decoded::NeedMoreData => {}
                frame => return Ok(Some(frame)),
            }

            let n = match &mut self.inner {
                StreamInner::None => return Err(XmppError::internal("Stream not initialized")),
                StreamInner::Tcp(s) => s.read(&mut buf).await?,
                StreamInner::Tls(s) => s.read(&mut buf).await?,
            };
            if n == 0 {
                return Ok(None);
            }
            self.parser.feed(&buf[..n]);
        }
    }

    /// Answer a client stream header with ours. A restart gets a new id.
    pub async fn send_stream_header(&mut self) -> Result<(), XmppError> {
        self.stream_id = Uuid::new_v4().to_string();
        let header = format!(
            "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}' id='{}' from='{}' version='1.0' xml:lang='en'>",
            ns::JABBER_CLIENT,
            ns::STREAM,
            self.stream_id,
            self.domain
        );
        self.write_raw(&header).await?;
        self.header_sent = true;
        Ok(())
    }

    /// Send `<stream:features>` wrapping the given feature elements.
    pub async fn send_features(&mut self, features: &str) -> Result<(), XmppError> {
        self.write_raw(&format!("<stream:features>{}</stream:features>", features))
            .await
    }

    /// Send `<proceed/>` and run the server side of the TLS handshake.
    #[instrument(skip(self, tls_acceptor), name = "xmpp.stream.starttls")]
    pub async fn starttls(&mut self, tls_acceptor: &TlsAcceptor) -> Result<(), XmppError> {
        self.write_raw(&format!("<proceed xmlns='{}'/>", ns::TLS)).await?;

        let tcp_stream = match std::mem::take(&mut self.inner) {
            StreamInner::Tcp(s) => s,
            StreamInner::Tls(s) => {
                self.inner = StreamInner::Tls(s);
                return Err(XmppError::internal("Already using TLS"));
            }
            StreamInner::None => return Err(XmppError::internal("Stream already taken")),
        };

        let tls_stream = tls_acceptor.accept(tcp_stream).await?;
        self.inner = StreamInner::Tls(Box::new(tls_stream));
        self.parser.reset();

        debug!("TLS handshake complete");
        Ok(())
    }

    /// Expect a new stream header after SASL success.
    pub fn restart(&mut self) {
        self.parser.restart();
    }

    pub async fn write_stanza(&mut self, stanza: &Stanza) -> Result<(), XmppError> {
        self.write_raw(&stanza.to_xml()).await
    }

    /// Send a stream error and the closing tag.
    ///
    /// RFC 6120 requires our stream header to precede the error, so it is
    /// sent first if the client never got one.
    pub async fn send_stream_error(
        &mut self,
        condition: &str,
        text: Option<&str>,
    ) -> Result<(), XmppError> {
        if !self.header_sent {
            self.send_stream_header().await?;
        }
        self.write_raw(&generate_stream_error(condition, text)).await
    }

    pub async fn write_raw(&mut self, xml: &str) -> Result<(), XmppError> {
        match &mut self.inner {
            StreamInner::None => return Err(XmppError::internal("Stream not initialized")),
            StreamInner::Tcp(s) => {
                s.write_all(xml.as_bytes()).await?;
                s.flush().await?;
            }
            StreamInner::Tls(s) => {
                s.write_all(xml.as_bytes()).await?;
                s.flush().await?;
            }
        }
        Ok(())
    }

    /// Close the stream gracefully.
    pub async fn close(&mut self) -> Result<(), XmppError> {
        self.write_raw("</stream:stream>").await?;
        self.shutdown().await
    }

    /// Shut the socket down without writing anything further.
    pub async fn shutdown(&mut self) -> Result<(), XmppError> {
        match &mut self.inner {
            StreamInner::Tcp(s) => s.shutdown().await?,
            StreamInner::Tls(s) => s.shutdown().await?,
            StreamInner::None => {}
        }
        Ok(())
    }
}
