//! [`Transport`] implementation over the libp2p GossipSub swarm.
//!
//! A pump task drains swarm notifications, keeps envelopes that arrive on
//! subscribed topics and hands them out on [`Transport::retrieve_all`].
//! Publishing is confirmed by the swarm: accepted by GossipSub maps to `Sent`,
//! rejected (for example with no connected peers) maps to `Expired`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use murmur_shared::{Identity, Topic, UserId};

use crate::envelope::{Envelope, EnvelopeEvent, EnvelopeHash, OutgoingEnvelope};
use crate::error::{Result, TransportError};
use crate::swarm::{SwarmCommand, SwarmNotification};
use crate::transport::{Transport, EVENT_CHANNEL_CAPACITY};

#[derive(Default)]
struct Inbox {
    topics: HashSet<Topic>,
    envelopes: HashMap<Topic, Vec<Envelope>>,
}

pub struct GossipTransport {
    identity: Arc<Identity>,
    commands: mpsc::Sender<SwarmCommand>,
    inbox: Arc<Mutex<Inbox>>,
    events: broadcast::Sender<EnvelopeEvent>,
    pump: JoinHandle<()>,
}

impl GossipTransport {
    pub fn new(
        identity: Arc<Identity>,
        commands: mpsc::Sender<SwarmCommand>,
        mut notifications: mpsc::Receiver<SwarmNotification>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inbox = Arc::new(Mutex::new(Inbox::default()));

        let pump_inbox = Arc::clone(&inbox);
        let pump = tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                match notification {
                    SwarmNotification::MessageReceived { topic, data, source } => {
                        let envelope = match Envelope::from_bytes(&data) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                debug!(topic = %topic, source = ?source, error = %e, "Dropping undecodable envelope");
                                continue;
                            }
                        };
                        if envelope.topic.as_str() != topic {
                            warn!(topic = %topic, claimed = %envelope.topic, "Envelope topic mismatch");
                            continue;
                        }
                        let mut inbox = pump_inbox.lock().await;
                        if inbox.topics.contains(&envelope.topic) {
                            inbox
                                .envelopes
                                .entry(envelope.topic.clone())
                                .or_default()
                                .push(envelope);
                        }
                    }
                    SwarmNotification::PeerConnected { peer_id, .. } => {
                        debug!(peer = %peer_id, "Transport peer connected");
                    }
                    SwarmNotification::PeerDisconnected { peer_id } => {
                        debug!(peer = %peer_id, "Transport peer disconnected");
                    }
                }
            }
            debug!("Swarm notification stream closed");
        });

        Self {
            identity,
            commands,
            inbox,
            events,
            pump,
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(SwarmCommand::Shutdown).await;
        self.pump.abort();
    }
}

#[async_trait]
impl Transport for GossipTransport {
    fn local_user(&self) -> UserId {
        self.identity.user_id()
    }

    async fn subscribe(&self, topic: &Topic) -> Result<()> {
        if !self.inbox.lock().await.topics.insert(topic.clone()) {
            return Ok(());
        }
        debug!(topic = %topic, "Subscribing to topic");
        self.commands
            .send(SwarmCommand::Subscribe(topic.to_string()))
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<()> {
        {
            let mut inbox = self.inbox.lock().await;
            inbox.topics.remove(topic);
            inbox.envelopes.remove(topic);
        }
        self.commands
            .send(SwarmCommand::Unsubscribe(topic.to_string()))
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn post(&self, outgoing: OutgoingEnvelope) -> Result<EnvelopeHash> {
        let envelope = Envelope::seal(&self.identity, outgoing)?;
        let hash = envelope.hash();
        let data = envelope.to_bytes()?;

        let (reply, published) = oneshot::channel();
        self.commands
            .send(SwarmCommand::Publish {
                topic: envelope.topic.to_string(),
                data,
                reply,
            })
            .await
            .map_err(|_| TransportError::ChannelClosed)?;

        match published.await.map_err(|_| TransportError::ChannelClosed)? {
            Ok(()) => {
                debug!(hash = %hash, topic = %envelope.topic, "Envelope published");
                let _ = self.events.send(EnvelopeEvent::sent(hash));
            }
            Err(e) => {
                debug!(hash = %hash, topic = %envelope.topic, error = %e, "Envelope not published");
                let _ = self.events.send(EnvelopeEvent::expired(hash));
            }
        }
        Ok(hash)
    }

    async fn retrieve_all(&self) -> Result<Vec<(Topic, Vec<Envelope>)>> {
        let mut inbox = self.inbox.lock().await;
        Ok(std::mem::take(&mut inbox.envelopes).into_iter().collect())
    }

    fn subscribe_envelope_events(&self) -> broadcast::Receiver<EnvelopeEvent> {
        self.events.subscribe()
    }
}
