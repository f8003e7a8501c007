//! # murmur-node
//!
//! Runs one messenger over the libp2p GossipSub transport: loads or creates
//! the identity, opens the database, joins the configured public chats and
//! keeps pulling received envelopes through the pipeline until Ctrl+C.

mod config;

use std::sync::{Arc, Mutex};

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use murmur_core::{Messenger, MessengerConfig, SharedDatabase};
use murmur_net::{keypair_from_identity, spawn_swarm, GossipTransport, SwarmConfig};
use murmur_shared::Identity;
use murmur_store::Database;

use crate::config::NodeConfig;

const INSTALLATION_ID_KEY: &str = "installation-id";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Tracing (RUST_LOG overrides the default filter)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,murmur_core=debug,murmur_net=debug")),
        )
        .init();

    info!("Starting murmur node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 2. Identity and storage
    // -----------------------------------------------------------------------
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    let identity = Arc::new(
        Identity::load_or_generate(&config.identity_path()).context("loading identity")?,
    );
    info!(user = %identity.user_id(), "Identity loaded");

    let database = Database::open_at(&config.database_path()).context("opening database")?;
    let installation_id = installation_id(&database)?;
    let db: SharedDatabase = Arc::new(Mutex::new(database));

    // -----------------------------------------------------------------------
    // 3. Transport
    // -----------------------------------------------------------------------
    let keypair = keypair_from_identity(&identity)?;
    let (commands, notifications, peer_id) = spawn_swarm(
        keypair,
        SwarmConfig {
            listen_port: config.listen_port,
            bootstrap_peers: config.bootstrap_peers.clone(),
        },
    )
    .await?;
    info!(peer_id = %peer_id, "Swarm running");
    let transport = Arc::new(GossipTransport::new(
        Arc::clone(&identity),
        commands,
        notifications,
    ));

    // -----------------------------------------------------------------------
    // 4. Messenger
    // -----------------------------------------------------------------------
    let messenger = Messenger::new(
        Arc::clone(&identity),
        transport.clone(),
        db,
        config.messenger_config(installation_id),
    )?;
    messenger.init().await?;
    messenger.start().await?;
    for chat in &config.public_chats {
        messenger.join_public_chat(chat).await?;
        info!(chat_id = %chat, "Joined public chat");
    }

    // -----------------------------------------------------------------------
    // 5. Retrieval loop until Ctrl+C
    // -----------------------------------------------------------------------
    let mut interval = tokio::time::interval(config.poll_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match messenger.retrieve_all().await {
                    Ok(response) if !response.is_empty() => {
                        for message in &response.messages {
                            info!(
                                chat_id = %message.chat_id,
                                from = %message.from.short(),
                                text = %message.text,
                                "Message"
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Retrieval failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    messenger.shutdown().await;
    transport.shutdown().await;
    Ok(())
}

/// Stable per-database installation ID, created on first start.
fn installation_id(db: &Database) -> anyhow::Result<String> {
    if let Some(bytes) = db.get_secret(INSTALLATION_ID_KEY)? {
        return String::from_utf8(bytes).context("stored installation id is not UTF-8");
    }
    let id = MessengerConfig::default().installation_id;
    db.set_secret(INSTALLATION_ID_KEY, id.as_bytes())?;
    Ok(id)
}
