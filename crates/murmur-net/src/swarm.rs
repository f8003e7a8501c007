//! libp2p swarm task driven through command / notification channels.
//!
//! The swarm event loop runs in a dedicated tokio task. The rest of the node
//! talks to it only through [`SwarmCommand`] and [`SwarmNotification`].

use std::ops::ControlFlow;
use std::time::Duration;

use futures::StreamExt;
use libp2p::{
    gossipsub::{self, MessageAuthenticity, MessageId, ValidationMode},
    identify,
    identity::Keypair,
    kad::{self, store::MemoryStore},
    swarm::SwarmEvent,
    Multiaddr, PeerId, Swarm, SwarmBuilder,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use murmur_shared::constants::{
    DEFAULT_QUIC_PORT, GOSSIPSUB_HEARTBEAT_SECS, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
use murmur_shared::Identity;

use crate::behaviour::{MurmurBehaviour, MurmurEvent};
use crate::discovery::peer_id_of;
use crate::error::{Result, TransportError};

/// Requests handled by the swarm task.
#[derive(Debug)]
pub enum SwarmCommand {
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<std::result::Result<(), String>>,
    },
    Subscribe(String),
    Unsubscribe(String),
    Shutdown,
}

/// What the swarm task reports back.
#[derive(Debug, Clone)]
pub enum SwarmNotification {
    PeerConnected { peer_id: PeerId, address: Multiaddr },
    PeerDisconnected { peer_id: PeerId },
    MessageReceived {
        source: Option<PeerId>,
        topic: String,
        data: Vec<u8>,
    },
}

pub struct SwarmConfig {
    pub listen_port: u16,
    pub bootstrap_peers: Vec<Multiaddr>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_QUIC_PORT,
            bootstrap_peers: Vec::new(),
        }
    }
}

/// libp2p keypair sharing the node identity's Ed25519 secret.
pub fn keypair_from_identity(identity: &Identity) -> Result<Keypair> {
    Keypair::ed25519_from_bytes(identity.secret_bytes().to_vec())
        .map_err(|e| TransportError::Swarm(e.to_string()))
}

pub fn build_swarm(keypair: Keypair) -> Result<Swarm<MurmurBehaviour>> {
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_quic()
        .with_behaviour(|key| -> std::result::Result<MurmurBehaviour, Box<dyn std::error::Error + Send + Sync>> {
            let local_peer_id = key.public().to_peer_id();

            // Envelopes are content-addressed; identical bytes are one message.
            let message_id_fn = |message: &gossipsub::Message| {
                MessageId::from(blake3::hash(&message.data).to_hex().to_string())
            };

            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .heartbeat_interval(Duration::from_secs(GOSSIPSUB_HEARTBEAT_SECS))
                .validation_mode(ValidationMode::Strict)
                .max_transmit_size(MAX_MESSAGE_SIZE + 1024)
                .message_id_fn(message_id_fn)
                .build()
                .map_err(|e| format!("GossipSub config: {e}"))?;

            let gossipsub = gossipsub::Behaviour::new(
                MessageAuthenticity::Signed(key.clone()),
                gossipsub_config,
            )
            .map_err(|e| format!("GossipSub init: {e}"))?;

            let mut kademlia =
                kad::Behaviour::new(local_peer_id, MemoryStore::new(local_peer_id));
            kademlia.set_mode(Some(kad::Mode::Server));

            let identify = identify::Behaviour::new(
                identify::Config::new(PROTOCOL_VERSION.to_string(), key.public())
                    .with_push_listen_addr_updates(true)
                    .with_interval(Duration::from_secs(60)),
            );

            Ok(MurmurBehaviour {
                gossipsub,
                kademlia,
                identify,
            })
        })
        .map_err(|e| TransportError::Swarm(e.to_string()))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    info!(peer_id = %swarm.local_peer_id(), "Built murmur swarm with QUIC transport");
    Ok(swarm)
}

/// Start listening, dial the bootstrap peers and move the swarm onto its
/// own task.
pub async fn spawn_swarm(
    keypair: Keypair,
    config: SwarmConfig,
) -> Result<(
    mpsc::Sender<SwarmCommand>,
    mpsc::Receiver<SwarmNotification>,
    PeerId,
)> {
    let mut swarm = build_swarm(keypair)?;
    let local_peer_id = *swarm.local_peer_id();
    listen(&mut swarm, config.listen_port)?;
    bootstrap(&mut swarm, &config.bootstrap_peers);

    let (cmd_tx, commands) = mpsc::channel(256);
    let (notifications, notif_rx) = mpsc::channel(256);
    let task = SwarmTask {
        swarm,
        commands,
        notifications,
    };
    tokio::spawn(task.run());

    Ok((cmd_tx, notif_rx, local_peer_id))
}

fn listen(swarm: &mut Swarm<MurmurBehaviour>, port: u16) -> Result<()> {
    for addr in [
        format!("/ip4/0.0.0.0/udp/{port}/quic-v1"),
        format!("/ip6/::/udp/{port}/quic-v1"),
    ] {
        let addr: Multiaddr = addr
            .parse()
            .map_err(|e: libp2p::multiaddr::Error| TransportError::Swarm(e.to_string()))?;
        swarm
            .listen_on(addr)
            .map_err(|e| TransportError::Swarm(e.to_string()))?;
    }
    info!(port, "QUIC listeners registered");
    Ok(())
}

/// Bootstrap peers also seed the Kademlia routing table when their address
/// names a peer ID.
fn bootstrap(swarm: &mut Swarm<MurmurBehaviour>, peers: &[Multiaddr]) {
    if peers.is_empty() {
        return;
    }
    for addr in peers {
        match swarm.dial(addr.clone()) {
            Ok(()) => debug!(addr = %addr, "Dialing bootstrap peer"),
            Err(e) => {
                warn!(addr = %addr, error = %e, "Bootstrap dial rejected");
                continue;
            }
        }
        if let Some(peer) = peer_id_of(addr) {
            swarm.behaviour_mut().kademlia.add_address(&peer, addr.clone());
        }
    }
    if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
        warn!(error = %e, "No known peers for the Kademlia bootstrap");
    }
}

struct SwarmTask {
    swarm: Swarm<MurmurBehaviour>,
    commands: mpsc::Receiver<SwarmCommand>,
    notifications: mpsc::Sender<SwarmNotification>,
}

impl SwarmTask {
    async fn run(mut self) {
        loop {
            let flow = tokio::select! {
                command = self.commands.recv() => self.on_command(command),
                event = self.swarm.select_next_some() => {
                    self.on_event(event).await;
                    ControlFlow::Continue(())
                }
            };
            if flow.is_break() {
                break;
            }
        }
        info!("Swarm task stopped");
    }

    /// A closed command channel means every transport handle is gone.
    fn on_command(&mut self, command: Option<SwarmCommand>) -> ControlFlow<()> {
        let gossipsub = &mut self.swarm.behaviour_mut().gossipsub;
        match command {
            Some(SwarmCommand::Publish { topic, data, reply }) => {
                let outcome = gossipsub
                    .publish(gossipsub::IdentTopic::new(&topic), data)
                    .map(drop)
                    .map_err(|e| e.to_string());
                if let Err(e) = &outcome {
                    debug!(topic = %topic, error = %e, "Publish rejected");
                }
                let _ = reply.send(outcome);
            }
            Some(SwarmCommand::Subscribe(topic)) => {
                if let Err(e) = gossipsub.subscribe(&gossipsub::IdentTopic::new(&topic)) {
                    warn!(topic = %topic, error = %e, "Could not subscribe");
                }
            }
            Some(SwarmCommand::Unsubscribe(topic)) => {
                if let Err(e) = gossipsub.unsubscribe(&gossipsub::IdentTopic::new(&topic)) {
                    warn!(topic = %topic, error = %e, "Could not unsubscribe");
                }
            }
            Some(SwarmCommand::Shutdown) | None => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    async fn on_event(&mut self, event: SwarmEvent<MurmurEvent>) {
        let notification = match event {
            SwarmEvent::Behaviour(MurmurEvent::Gossipsub(gossipsub::Event::Message {
                message, ..
            })) => {
                debug!(
                    topic = %message.topic,
                    len = message.data.len(),
                    "Envelope received"
                );
                SwarmNotification::MessageReceived {
                    source: message.source,
                    topic: message.topic.into_string(),
                    data: message.data,
                }
            }
            SwarmEvent::Behaviour(MurmurEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                let kademlia = &mut self.swarm.behaviour_mut().kademlia;
                for addr in info.listen_addrs {
                    kademlia.add_address(&peer_id, addr);
                }
                return;
            }
            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                let address = endpoint.get_remote_address().clone();
                debug!(peer = %peer_id, addr = %address, "Connected");
                SwarmNotification::PeerConnected { peer_id, address }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established: 0,
                ..
            } => {
                debug!(peer = %peer_id, "Last connection closed");
                SwarmNotification::PeerDisconnected { peer_id }
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(addr = %address, "Listening");
                return;
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                warn!(peer = ?peer_id, error = %error, "Dial failed");
                return;
            }
            _ => return,
        };
        // The receiver only goes away during shutdown.
        let _ = self.notifications.send(notification).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Result<SwarmTask> {
        let identity = Identity::generate();
        let swarm = build_swarm(keypair_from_identity(&identity)?)?;
        let (_, commands) = mpsc::channel(1);
        let (notifications, _) = mpsc::channel(1);
        Ok(SwarmTask {
            swarm,
            commands,
            notifications,
        })
    }

    fn subscribed(task: &SwarmTask) -> Vec<String> {
        task.swarm
            .behaviour()
            .gossipsub
            .topics()
            .map(|t| t.to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_topic_commands_and_shutdown() {
        let mut task = task().unwrap();
        let topic = gossipsub::IdentTopic::new("murmur-test").hash().to_string();

        let flow = task.on_command(Some(SwarmCommand::Subscribe("murmur-test".into())));
        assert!(flow.is_continue());
        assert_eq!(subscribed(&task), vec![topic]);

        assert!(task
            .on_command(Some(SwarmCommand::Unsubscribe("murmur-test".into())))
            .is_continue());
        assert!(subscribed(&task).is_empty());
        assert!(task
            .on_command(Some(SwarmCommand::Unsubscribe("never-joined".into())))
            .is_continue());

        assert!(task.on_command(Some(SwarmCommand::Shutdown)).is_break());
        assert!(task.on_command(None).is_break());
    }
}
