//! Outbound encoding and dispatch, inbound pipeline orchestration.
//!
//! Direct payloads pick exactly one delivery mode per send: the topic of a
//! negotiated shared secret, else the recipient's partitioned topic when the
//! compatibility flag is set, else the discovery topic. Every accepted post is
//! handed to the [`EnvelopesMonitor`] under the logical message IDs it carries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use murmur_net::{DeliveryMode, DeliveryUpdate, EnvelopesMonitor, TrackedPost, Transport};
use murmur_shared::protocol::{ApplicationMessage, ApplicationMetadata, MessageType};
use murmur_shared::types::now_ms;
use murmur_shared::{message_id, Identity, MessageId, Topic, UserId};
use murmur_store::Installation;

use crate::config::MessengerConfig;
use crate::datasync::{DataSync, DispatchJob, GroupId};
use crate::encryption::{EncryptionProtocol, SharedSecret};
use crate::error::{MessengerError, Result};
use crate::pipeline::{InboundMessage, Pipeline};

/// Bound on the fire-and-forget bundle advertisement post.
const ADVERTISE_TIMEOUT: Duration = Duration::from_secs(1);

/// A signed payload ready to be sent, with its canonical ID.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub id: MessageId,
    pub kind: MessageType,
    /// Metadata-wrapped application payload.
    pub wrapped: Vec<u8>,
}

/// Result of one retrieval round.
#[derive(Debug, Default)]
pub struct ProcessedBatch {
    pub messages: Vec<InboundMessage>,
    /// Own installations announced by their bundles.
    pub installations: Vec<Installation>,
}

pub struct MessageProcessor {
    identity: Arc<Identity>,
    transport: Arc<dyn Transport>,
    monitor: Arc<EnvelopesMonitor>,
    encryption: Arc<EncryptionProtocol>,
    datasync: Arc<DataSync>,
    config: MessengerConfig,
    dispatch_tx: mpsc::Sender<DispatchJob>,
    dispatch_rx: Mutex<Option<mpsc::Receiver<DispatchJob>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageProcessor {
    pub fn new(
        identity: Arc<Identity>,
        transport: Arc<dyn Transport>,
        encryption: Arc<EncryptionProtocol>,
        config: MessengerConfig,
    ) -> Self {
        let monitor = Arc::new(EnvelopesMonitor::new(
            Arc::clone(&transport),
            config.monitor_config(),
        ));
        let datasync = Arc::new(DataSync::new(identity.user_id(), config.datasync_enabled));
        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.dispatch_queue_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            identity,
            transport,
            monitor,
            encryption,
            datasync,
            config,
            dispatch_tx,
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn monitor(&self) -> &Arc<EnvelopesMonitor> {
        &self.monitor
    }

    pub fn subscribe_delivery_updates(&self) -> broadcast::Receiver<DeliveryUpdate> {
        self.monitor.subscribe()
    }

    /// Encode and sign `message`. The returned ID never changes across re-sends.
    pub fn wrap(&self, message: &ApplicationMessage) -> Result<SentMessage> {
        let kind = message.kind().ok_or_else(|| {
            MessengerError::NotPermitted("unknown messages cannot be sent".into())
        })?;
        let wrapped = ApplicationMetadata::wrap(&self.identity, kind, message.to_bytes()?)?;
        Ok(SentMessage {
            id: message_id(&self.identity.user_id(), &wrapped),
            kind,
            wrapped,
        })
    }

    /// Send a wrapped payload to one peer.
    ///
    /// Goes through the sync layer when it is enabled and the recipient is not
    /// ourselves; the sync loop then dispatches and tracks it.
    pub async fn send_private(&self, recipient: &UserId, message: &SentMessage) -> Result<()> {
        let me = self.identity.user_id();
        if self.config.datasync_enabled && *recipient != me {
            let group = GroupId::one_to_one(&me, recipient);
            self.datasync.add_peer(group, *recipient)?;
            self.datasync.append_message(group, message.wrapped.clone())?;
            debug!(id = %message.id, peer = %recipient, "Queued message for sync");
            return Ok(());
        }

        let post = self.dispatch_private(recipient, &message.wrapped).await?;
        self.monitor.add(vec![message.id], vec![post]).await;
        Ok(())
    }

    /// Send one wrapped payload to every recipient, tracked as a single message.
    ///
    /// A failing recipient does not stop the others. Whatever was posted is
    /// tracked before the first failure is returned.
    pub async fn send_group(&self, recipients: &[UserId], message: &SentMessage) -> Result<()> {
        let mut posts = Vec::with_capacity(recipients.len());
        let mut failure = None;
        for recipient in recipients {
            match self.dispatch_private(recipient, &message.wrapped).await {
                Ok(post) => posts.push(post),
                Err(e) => {
                    warn!(id = %message.id, peer = %recipient, error = %e, "Group send failed for recipient");
                    failure.get_or_insert(e);
                }
            }
        }
        debug!(id = %message.id, posted = posts.len(), recipients = recipients.len(), "Sent group message");
        if !posts.is_empty() {
            self.monitor.add(vec![message.id], posts).await;
        }
        failure.map_or(Ok(()), Err)
    }

    pub async fn send_public(&self, chat_id: &str, message: &SentMessage) -> Result<()> {
        let spec = self.encryption.encrypt_public(&message.wrapped);
        let topic = Topic::public(chat_id);
        let posted = self.transport.send_public(&topic, spec.to_bytes()?).await?;
        debug!(id = %message.id, hash = %posted.hash, topic = %topic, "Sent public message");
        self.monitor
            .add(
                vec![message.id],
                vec![TrackedPost {
                    hash: posted.hash,
                    envelope: posted.envelope,
                    recipient: None,
                }],
            )
            .await;
        Ok(())
    }

    /// Encrypt for `recipient`, pick the delivery mode and post.
    async fn dispatch_private(&self, recipient: &UserId, payload: &[u8]) -> Result<TrackedPost> {
        let spec = self.encryption.encrypt_direct(recipient, payload)?;
        let mode = self.delivery_mode(spec.shared_secret.as_ref());

        // Replies arrive on the secret topic once the peer learned our bundle.
        if *recipient != self.identity.user_id() {
            let secret = self.encryption.shared_secret(recipient)?;
            self.transport.subscribe(&Topic::shared_secret(&secret.key)).await?;
        }

        let posted = self
            .transport
            .send_private(recipient, spec.to_bytes()?, &mode)
            .await?;
        debug!(hash = %posted.hash, peer = %recipient, mode = mode.name(), "Sent private message");
        Ok(TrackedPost {
            hash: posted.hash,
            envelope: posted.envelope,
            recipient: Some(*recipient),
        })
    }

    fn delivery_mode(&self, secret: Option<&SharedSecret>) -> DeliveryMode {
        match secret {
            Some(secret) => DeliveryMode::SharedSecret(secret.key),
            None if self.config.send_v1_partitioned => DeliveryMode::Partitioned,
            None => DeliveryMode::Discovery,
        }
    }

    /// Topics every node listens on: discovery, our partition and every
    /// negotiated secret.
    pub async fn subscribe_defaults(&self) -> Result<()> {
        self.transport.subscribe(&Topic::discovery()).await?;
        self.transport
            .subscribe(&Topic::partitioned(&self.identity.user_id()))
            .await?;
        for secret in self.encryption.negotiated_secrets()? {
            self.transport.subscribe(&Topic::shared_secret(&secret.key)).await?;
        }
        Ok(())
    }

    pub async fn join_public(&self, chat_id: &str) -> Result<()> {
        Ok(self.transport.subscribe(&Topic::public(chat_id)).await?)
    }

    pub async fn leave_public(&self, chat_id: &str) -> Result<()> {
        Ok(self.transport.unsubscribe(&Topic::public(chat_id)).await?)
    }

    /// Drain the transport and run every envelope through the pipeline.
    ///
    /// Envelopes that fail the pipeline are logged and skipped, and so are
    /// failed follow-ups; the rest of the batch is still returned.
    pub async fn retrieve_all(&self) -> Result<ProcessedBatch> {
        let mut batch = ProcessedBatch::default();
        let mut secrets = Vec::new();
        let mut advertise = Vec::new();

        let pipeline = Pipeline::new(&self.encryption, &self.datasync);
        for (topic, envelopes) in self.transport.retrieve_all().await? {
            debug!(topic = %topic, count = envelopes.len(), "Processing envelopes");
            for envelope in envelopes {
                match pipeline.run(&envelope) {
                    Ok(output) => {
                        batch.messages.extend(output.messages);
                        batch.installations.extend(output.installations);
                        secrets.extend(output.shared_secrets);
                        advertise.extend(output.advertise_to);
                    }
                    Err(e) => {
                        warn!(topic = %topic, hash = %envelope.hash(), error = %e, "Dropping envelope");
                    }
                }
            }
        }

        // The envelopes are already drained; follow-up failures must not lose them.
        for secret in secrets {
            if let Err(e) = self.transport.subscribe(&Topic::shared_secret(&secret.key)).await {
                warn!(error = %e, "Could not subscribe to negotiated topic");
            }
        }
        for peer in advertise {
            if let Err(e) = self.advertise_bundle(peer) {
                warn!(peer = %peer, error = %e, "Could not advertise bundle");
            }
        }
        Ok(batch)
    }

    /// Push our bundle to `peer` in the background, at most once per interval.
    fn advertise_bundle(&self, peer: UserId) -> Result<()> {
        let now = now_ms();
        if !self.encryption.should_advertise_bundle(&peer, now)? {
            return Ok(());
        }
        self.encryption.confirm_bundle_advertisement(&peer, now)?;

        let payload = self.encryption.build_bundle_advertisement().to_bytes()?;
        let mode = self.delivery_mode(self.encryption.negotiated_secret(&peer)?.as_ref());
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            match tokio::time::timeout(ADVERTISE_TIMEOUT, transport.send_private(&peer, payload, &mode)).await {
                Ok(Ok(posted)) => debug!(peer = %peer, hash = %posted.hash, "Advertised bundle"),
                Ok(Err(e)) => warn!(peer = %peer, error = %e, "Failed to advertise bundle"),
                Err(_) => warn!(peer = %peer, "Bundle advertisement timed out"),
            }
        });
        Ok(())
    }

    /// Start the tracker, the sync loop and the dispatcher draining it.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let Some(mut queue) = self.dispatch_rx.lock().await.take() else {
            warn!("Message processor already started");
            return Ok(());
        };
        self.monitor.start().await;

        let sync_loop = self.datasync.start(
            self.config.datasync_interval,
            self.dispatch_tx.clone(),
            self.shutdown.subscribe(),
        );

        let processor = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let dispatcher = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    job = queue.recv() => match job {
                        Some(job) => processor.dispatch_job(job).await,
                        None => break,
                    }
                }
            }
            debug!("Sync dispatcher stopped");
        });

        self.tasks.lock().await.extend([sync_loop, dispatcher]);
        info!(datasync = self.config.datasync_enabled, "Message processor started");
        Ok(())
    }

    async fn dispatch_job(&self, job: DispatchJob) {
        match self.dispatch_private(&job.peer, &job.payload).await {
            Ok(post) => {
                if !job.message_ids.is_empty() {
                    self.monitor.add(job.message_ids, vec![post]).await;
                }
            }
            Err(e) => warn!(peer = %job.peer, error = %e, "Failed to dispatch sync payload"),
        }
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
        self.monitor.stop().await;
        info!("Message processor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use murmur_net::{
        Envelope, EnvelopeEvent, EnvelopeHash, EnvelopeState, MemoryHub, MemoryTransport,
        OutgoingEnvelope,
    };
    use murmur_shared::protocol::{ChatMessage, ChatType, ContentType};
    use murmur_store::Database;

    struct Node {
        identity: Arc<Identity>,
        transport: Arc<MemoryTransport>,
        processor: Arc<MessageProcessor>,
    }

    async fn node(hub: &MemoryHub, config: MessengerConfig) -> Node {
        let identity = Arc::new(Identity::generate());
        let transport = Arc::new(hub.connect(Arc::clone(&identity)).await);
        let db = Arc::new(StdMutex::new(Database::open_in_memory().unwrap()));
        let encryption = Arc::new(
            EncryptionProtocol::new(
                Arc::clone(&identity),
                &config.installation_id,
                config.bundle_advertise_interval,
                db,
            )
            .unwrap(),
        );
        let processor = Arc::new(MessageProcessor::new(
            Arc::clone(&identity),
            transport.clone(),
            encryption,
            config,
        ));
        processor.subscribe_defaults().await.unwrap();
        Node {
            identity,
            transport,
            processor,
        }
    }

    fn chat(to: &UserId, text: &str) -> ApplicationMessage {
        ApplicationMessage::Chat(ChatMessage {
            clock: 1,
            timestamp: 1,
            text: text.into(),
            chat_id: to.to_hex(),
            response_to: None,
            chat_type: ChatType::OneToOne,
            content_type: ContentType::Text,
        })
    }

    #[tokio::test]
    async fn test_first_contact_uses_discovery_then_shared_secret() {
        let hub = MemoryHub::new();
        let alice = node(&hub, MessengerConfig::default()).await;
        let bob = node(&hub, MessengerConfig::default()).await;
        let bob_id = bob.identity.user_id();

        let first = alice.processor.wrap(&chat(&bob_id, "hello")).unwrap();
        alice.processor.send_private(&bob_id, &first).await.unwrap();
        assert_eq!(alice.transport.posted().await[0].topic, Topic::discovery());

        let received = bob.processor.retrieve_all().await.unwrap();
        assert_eq!(received.messages.len(), 1);
        assert_eq!(received.messages[0].id, first.id);
        assert_eq!(received.messages[0].signer, alice.identity.user_id());

        // Bob now knows Alice's bundle and answers on the secret topic.
        let reply = bob.processor.wrap(&chat(&alice.identity.user_id(), "hi")).unwrap();
        bob.processor.send_private(&alice.identity.user_id(), &reply).await.unwrap();
        let secret = bob.processor.encryption.shared_secret(&alice.identity.user_id()).unwrap();
        assert_eq!(bob.transport.posted().await[0].topic, Topic::shared_secret(&secret.key));

        let received = alice.processor.retrieve_all().await.unwrap();
        assert_eq!(received.messages.len(), 1);
        assert_eq!(received.messages[0].id, reply.id);
    }

    #[tokio::test]
    async fn test_partitioned_mode_when_flag_set() {
        let hub = MemoryHub::new();
        let config = MessengerConfig {
            send_v1_partitioned: true,
            ..MessengerConfig::default()
        };
        let alice = node(&hub, config).await;
        let bob = node(&hub, MessengerConfig::default()).await;
        let bob_id = bob.identity.user_id();

        let message = alice.processor.wrap(&chat(&bob_id, "hello")).unwrap();
        alice.processor.send_private(&bob_id, &message).await.unwrap();
        assert_eq!(alice.transport.posted().await[0].topic, Topic::partitioned(&bob_id));
        assert_eq!(bob.processor.retrieve_all().await.unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn test_send_is_tracked_until_sent_event() {
        let hub = MemoryHub::new();
        let alice = node(&hub, MessengerConfig::default()).await;
        let bob_id = Identity::generate().user_id();
        alice.transport.set_auto_confirm(false).await;
        let mut updates = alice.processor.subscribe_delivery_updates();

        let message = alice.processor.wrap(&chat(&bob_id, "hello")).unwrap();
        alice.processor.send_private(&bob_id, &message).await.unwrap();
        let hash = alice.transport.posted().await[0].hash();
        assert_eq!(alice.processor.monitor().state(&hash).await, EnvelopeState::Posted);

        alice.processor.monitor().handle_event(EnvelopeEvent::sent(hash)).await;
        assert_eq!(alice.processor.monitor().state(&hash).await, EnvelopeState::Sent);
        assert_eq!(updates.recv().await.unwrap(), DeliveryUpdate::Sent(vec![message.id]));
    }

    #[tokio::test]
    async fn test_group_send_is_one_message() {
        let hub = MemoryHub::new();
        let alice = node(&hub, MessengerConfig::default()).await;
        let bob = node(&hub, MessengerConfig::default()).await;
        let carol = node(&hub, MessengerConfig::default()).await;
        alice.transport.set_auto_confirm(false).await;
        let mut updates = alice.processor.subscribe_delivery_updates();

        let message = alice.processor.wrap(&chat(&bob.identity.user_id(), "all")).unwrap();
        let recipients = [bob.identity.user_id(), carol.identity.user_id()];
        alice.processor.send_group(&recipients, &message).await.unwrap();

        let posted = alice.transport.posted().await;
        assert_eq!(posted.len(), 2);
        alice.processor.monitor().handle_event(EnvelopeEvent::sent(posted[0].hash())).await;
        assert!(updates.try_recv().is_err());
        alice.processor.monitor().handle_event(EnvelopeEvent::sent(posted[1].hash())).await;
        assert_eq!(updates.recv().await.unwrap(), DeliveryUpdate::Sent(vec![message.id]));

        // Each peer only reads the copy addressed to it.
        let for_bob = bob.processor.retrieve_all().await.unwrap().messages;
        let for_carol = carol.processor.retrieve_all().await.unwrap().messages;
        assert_eq!(for_bob.len(), 1);
        assert_eq!(for_bob[0].id, message.id);
        assert_eq!(for_carol.len(), 1);
        assert_eq!(for_carol[0].id, message.id);
    }

    #[tokio::test]
    async fn test_group_send_tracks_posts_despite_failing_recipient() {
        let hub = MemoryHub::new();
        let alice = node(&hub, MessengerConfig::default()).await;
        let bob = node(&hub, MessengerConfig::default()).await;
        alice.transport.set_auto_confirm(false).await;

        // y = 2 has no point on the curve, so no key can be agreed with it.
        let mut bogus = [0u8; 32];
        bogus[0] = 2;
        let recipients = [UserId(bogus), bob.identity.user_id()];
        let message = alice.processor.wrap(&chat(&bob.identity.user_id(), "mixed")).unwrap();
        assert!(alice.processor.send_group(&recipients, &message).await.is_err());

        let posted = alice.transport.posted().await;
        assert_eq!(posted.len(), 1);
        assert_eq!(
            alice.processor.monitor().envelope_hashes(&message.id).await,
            vec![posted[0].hash()]
        );
        assert_eq!(bob.processor.retrieve_all().await.unwrap().messages.len(), 1);
    }

    /// Delegates to a memory transport but refuses new subscriptions.
    struct NoSubscribe(Arc<MemoryTransport>);

    #[async_trait::async_trait]
    impl Transport for NoSubscribe {
        fn local_user(&self) -> UserId {
            self.0.local_user()
        }

        async fn subscribe(&self, _topic: &Topic) -> murmur_net::error::Result<()> {
            Err(murmur_net::TransportError::ChannelClosed)
        }

        async fn unsubscribe(&self, topic: &Topic) -> murmur_net::error::Result<()> {
            self.0.unsubscribe(topic).await
        }

        async fn post(&self, envelope: OutgoingEnvelope) -> murmur_net::error::Result<EnvelopeHash> {
            self.0.post(envelope).await
        }

        async fn retrieve_all(&self) -> murmur_net::error::Result<Vec<(Topic, Vec<Envelope>)>> {
            self.0.retrieve_all().await
        }

        fn subscribe_envelope_events(&self) -> broadcast::Receiver<EnvelopeEvent> {
            self.0.subscribe_envelope_events()
        }
    }

    #[tokio::test]
    async fn test_drained_batch_survives_follow_up_failures() {
        let hub = MemoryHub::new();
        let alice = node(&hub, MessengerConfig::default()).await;
        let bob = node(&hub, MessengerConfig::default()).await;
        let bob_id = bob.identity.user_id();

        let encryption = Arc::clone(&bob.processor.encryption);
        let stubborn = MessageProcessor::new(
            Arc::clone(&bob.identity),
            Arc::new(NoSubscribe(Arc::clone(&bob.transport))),
            encryption,
            MessengerConfig::default(),
        );

        let first = alice.processor.wrap(&chat(&bob_id, "still here")).unwrap();
        alice.processor.send_private(&bob_id, &first).await.unwrap();

        let received = stubborn.retrieve_all().await.unwrap();
        assert_eq!(received.messages.len(), 1);
        assert_eq!(received.messages[0].id, first.id);
    }

    #[tokio::test]
    async fn test_datasync_delivers_through_dispatcher() {
        let hub = MemoryHub::new();
        let config = MessengerConfig {
            datasync_enabled: true,
            datasync_interval: Duration::from_millis(20),
            ..MessengerConfig::default()
        };
        let alice = node(&hub, config.clone()).await;
        let bob = node(&hub, config).await;
        let bob_id = bob.identity.user_id();
        alice.processor.start().await.unwrap();

        let message = alice.processor.wrap(&chat(&bob_id, "synced")).unwrap();
        alice.processor.send_private(&bob_id, &message).await.unwrap();

        let mut received = Vec::new();
        for _ in 0..100 {
            received.extend(bob.processor.retrieve_all().await.unwrap().messages);
            if !received.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        alice.processor.stop().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, message.id);
    }
}
