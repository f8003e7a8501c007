//! The transport adapter contract consumed by the messaging core.

use async_trait::async_trait;
use tokio::sync::broadcast;

use murmur_shared::{Topic, UserId};

use crate::envelope::{DeliveryMode, Envelope, EnvelopeEvent, EnvelopeHash, OutgoingEnvelope};
use crate::error::Result;

/// Capacity of the per-transport envelope event broadcast.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// An envelope accepted by the transport together with what was posted, so
/// the delivery tracker can re-post it later.
#[derive(Debug, Clone)]
pub struct PostedEnvelope {
    pub hash: EnvelopeHash,
    pub envelope: OutgoingEnvelope,
}

/// A store-and-forward pub/sub network carrying opaque signed envelopes.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Identity every outgoing envelope is signed with.
    fn local_user(&self) -> UserId;

    async fn subscribe(&self, topic: &Topic) -> Result<()>;

    async fn unsubscribe(&self, topic: &Topic) -> Result<()>;

    /// Sign and publish one envelope, returning its transport hash.
    async fn post(&self, envelope: OutgoingEnvelope) -> Result<EnvelopeHash>;

    /// Drain every envelope received on subscribed topics since the last call.
    async fn retrieve_all(&self) -> Result<Vec<(Topic, Vec<Envelope>)>>;

    /// Stream of sent / received / expired / batch-acknowledged notifications.
    fn subscribe_envelope_events(&self) -> broadcast::Receiver<EnvelopeEvent>;

    async fn send_public(&self, topic: &Topic, payload: Vec<u8>) -> Result<PostedEnvelope> {
        let envelope = OutgoingEnvelope::new(topic.clone(), payload);
        let hash = self.post(envelope.clone()).await?;
        Ok(PostedEnvelope { hash, envelope })
    }

    async fn send_private(
        &self,
        recipient: &UserId,
        payload: Vec<u8>,
        mode: &DeliveryMode,
    ) -> Result<PostedEnvelope> {
        self.send_public(&mode.topic(recipient), payload).await
    }
}
