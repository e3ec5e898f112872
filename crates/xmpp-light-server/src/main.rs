//! xmpp-light server binary.
//!
//! Loads settings, TLS material and the optional message store, creates the
//! default public room and serves clients until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use jid::BareJid;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use xmpp_light::{load_tls_acceptor, RoomConfig, RoomType, XmppServer};

mod settings;
mod store;
mod telemetry;

use settings::Settings;
use store::LibSqlMessageStore;

/// Lightweight XMPP server
#[derive(Parser)]
#[command(name = "xmpp-light")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override xmpp.domain
    #[arg(short, long)]
    domain: Option<String>,

    /// Override xmpp.clients.port
    #[arg(short, long)]
    port: Option<u16>,

    /// Print the effective settings as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    if let Some(domain) = cli.domain {
        settings.xmpp.domain = domain;
    }
    if let Some(port) = cli.port {
        settings.xmpp.clients.port = port;
    }
    settings.validate()?;

    if cli.print_config {
        println!("{}", toml::to_string_pretty(&settings)?);
        return Ok(());
    }

    telemetry::init()?;
    info!("xmpp-light starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Other rustls users in the process get the same provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let tls_acceptor = load_tls_acceptor(&settings.xmpp.keystore.cert_path, &settings.xmpp.keystore.key_path)
        .context("Failed to load TLS material")?;

    let mut server = XmppServer::new(settings.server_config(), tls_acceptor)?;
    if settings.xmpp.message.save {
        let store = LibSqlMessageStore::open(&settings.xmpp.message.db_path)
            .await
            .context("Failed to open message store")?;
        server = server.with_message_store(Arc::new(store));
    }

    create_default_room(&server, &settings.xmpp.domain)?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                signal.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });

    server.run(shutdown).await?;
    Ok(())
}

/// `public@<domain>`, a permanent public room on the MUC service.
fn create_default_room(server: &XmppServer, domain: &str) -> Result<()> {
    let room_jid: BareJid = format!("public@{}", domain)
        .parse()
        .with_context(|| format!("Invalid default room address for domain {}", domain))?;
    server.rooms().create_room(
        room_jid.clone(),
        RoomConfig {
            name: "Public Room".into(),
            room_type: RoomType::Public,
            persistent: true,
            ..RoomConfig::default()
        },
    )?;
    info!(room = %room_jid, muc_domain = %server.rooms().muc_domain(), "Default room created");
    Ok(())
}
