//! In-process transport hub.
//!
//! Every [`MemoryTransport`] connected to the same [`MemoryHub`] sees the
//! envelopes the others post on topics it subscribed to. Used by tests and by
//! single-process setups that run several messengers side by side.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use murmur_shared::{Identity, Topic, UserId};

use crate::envelope::{Envelope, EnvelopeEvent, EnvelopeHash, OutgoingEnvelope};
use crate::error::Result;
use crate::transport::{Transport, EVENT_CHANNEL_CAPACITY};

struct Node {
    user: UserId,
    topics: HashSet<Topic>,
    inbox: HashMap<Topic, Vec<Envelope>>,
    posted: Vec<Envelope>,
    auto_confirm: bool,
    offline: bool,
}

#[derive(Default)]
struct HubState {
    nodes: Vec<Node>,
}

#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new node signing with `identity`.
    pub async fn connect(&self, identity: Arc<Identity>) -> MemoryTransport {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut state = self.state.lock().await;
        state.nodes.push(Node {
            user: identity.user_id(),
            topics: HashSet::new(),
            inbox: HashMap::new(),
            posted: Vec::new(),
            auto_confirm: true,
            offline: false,
        });
        MemoryTransport {
            hub: self.clone(),
            node: state.nodes.len() - 1,
            identity,
            events,
        }
    }
}

pub struct MemoryTransport {
    hub: MemoryHub,
    node: usize,
    identity: Arc<Identity>,
    events: broadcast::Sender<EnvelopeEvent>,
}

impl MemoryTransport {
    /// When enabled (the default) every post is immediately confirmed `Sent`.
    pub async fn set_auto_confirm(&self, enabled: bool) {
        if let Some(node) = self.hub.state.lock().await.nodes.get_mut(self.node) {
            node.auto_confirm = enabled;
        }
    }

    /// An offline node delivers nothing and reports every post as expired.
    pub async fn set_offline(&self, offline: bool) {
        if let Some(node) = self.hub.state.lock().await.nodes.get_mut(self.node) {
            node.offline = offline;
        }
    }

    /// Everything this node has posted, in order.
    pub async fn posted(&self) -> Vec<Envelope> {
        self.hub
            .state
            .lock()
            .await
            .nodes
            .get(self.node)
            .map(|node| node.posted.clone())
            .unwrap_or_default()
    }

    /// Push an arbitrary delivery event to this node's subscribers.
    pub fn emit(&self, event: EnvelopeEvent) {
        let _ = self.events.send(event);
    }

    /// Place an envelope directly into this node's inbox.
    pub async fn inject(&self, envelope: Envelope) {
        if let Some(node) = self.hub.state.lock().await.nodes.get_mut(self.node) {
            node.inbox
                .entry(envelope.topic.clone())
                .or_default()
                .push(envelope);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_user(&self) -> UserId {
        self.identity.user_id()
    }

    async fn subscribe(&self, topic: &Topic) -> Result<()> {
        if let Some(node) = self.hub.state.lock().await.nodes.get_mut(self.node) {
            node.topics.insert(topic.clone());
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<()> {
        if let Some(node) = self.hub.state.lock().await.nodes.get_mut(self.node) {
            node.topics.remove(topic);
            node.inbox.remove(topic);
        }
        Ok(())
    }

    async fn post(&self, outgoing: OutgoingEnvelope) -> Result<EnvelopeHash> {
        let envelope = Envelope::seal(&self.identity, outgoing)?;
        let hash = envelope.hash();

        let mut state = self.hub.state.lock().await;
        let (auto_confirm, offline) = match state.nodes.get_mut(self.node) {
            Some(me) => {
                me.posted.push(envelope.clone());
                (me.auto_confirm, me.offline)
            }
            None => (false, true),
        };

        if offline {
            debug!(hash = %hash, topic = %envelope.topic, "Node offline, envelope expires");
            let _ = self.events.send(EnvelopeEvent::expired(hash));
            return Ok(hash);
        }

        for (idx, node) in state.nodes.iter_mut().enumerate() {
            if idx == self.node || node.offline || !node.topics.contains(&envelope.topic) {
                continue;
            }
            node.inbox
                .entry(envelope.topic.clone())
                .or_default()
                .push(envelope.clone());
            let _ = self.events.send(EnvelopeEvent::received(hash, node.user));
        }

        debug!(hash = %hash, topic = %envelope.topic, "Envelope posted to hub");
        if auto_confirm {
            let _ = self.events.send(EnvelopeEvent::sent(hash));
        }
        Ok(hash)
    }

    async fn retrieve_all(&self) -> Result<Vec<(Topic, Vec<Envelope>)>> {
        let mut state = self.hub.state.lock().await;
        Ok(state
            .nodes
            .get_mut(self.node)
            .map(|node| std::mem::take(&mut node.inbox).into_iter().collect())
            .unwrap_or_default())
    }

    fn subscribe_envelope_events(&self) -> broadcast::Receiver<EnvelopeEvent> {
        self.events.subscribe()
    }
}
