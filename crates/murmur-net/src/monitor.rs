//! Envelope delivery tracker.
//!
//! Tracks every envelope handed to the transport until it is confirmed sent
//! or has exhausted its retry budget. Confirmation and expiry are reported per
//! logical message ID, never per envelope: a message is sent only once every
//! envelope backing it is sent.
//!
//! All state lives behind one mutex. The lock is never held across a call into
//! the transport; retries collect due envelopes, unlock, post, then relock to
//! record the new hash.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use murmur_shared::{MessageId, UserId};

use crate::envelope::{
    EnvelopeErrorCode, EnvelopeEvent, EnvelopeEventKind, EnvelopeHash, OutgoingEnvelope,
};
use crate::transport::Transport;

/// Unmatched events remembered for envelopes not registered yet.
const MAX_ORPHAN_EVENTS: usize = 1024;

/// Confirmed envelopes kept around for state queries.
const MAX_SENT_HISTORY: usize = 4096;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub max_attempts: u32,
    pub retry_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_interval: Duration::from_millis(500),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl MonitorConfig {
    /// Delay required since the last attempt: `min(base * 2^attempts, max)`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 1u32 << attempts.min(16);
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeState {
    NotRegistered,
    Posted,
    Sent,
}

/// Terminal outcome for a set of logical messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryUpdate {
    Sent(Vec<MessageId>),
    Expired {
        ids: Vec<MessageId>,
        reason: String,
    },
}

/// One envelope to register with the tracker.
#[derive(Debug, Clone)]
pub struct TrackedPost {
    pub hash: EnvelopeHash,
    pub envelope: OutgoingEnvelope,
    /// Peer whose receipt counts as confirmation, if any.
    pub recipient: Option<UserId>,
}

#[derive(Debug)]
struct MonitoredEnvelope {
    hash: EnvelopeHash,
    state: EnvelopeState,
    attempts: u32,
    message: OutgoingEnvelope,
    message_ids: Vec<MessageId>,
    recipient: Option<UserId>,
    last_attempt: Instant,
}

#[derive(Default)]
struct MonitorState {
    envelopes: HashMap<EnvelopeHash, MonitoredEnvelope>,
    retry_queue: Vec<MonitoredEnvelope>,
    /// batch hash -> envelopes sent in it, awaiting acknowledgement
    batches: HashMap<EnvelopeHash, HashSet<EnvelopeHash>>,
    message_envelopes: HashMap<MessageId, Vec<EnvelopeHash>>,
    orphans: HashMap<EnvelopeHash, EnvelopeEvent>,
    orphan_order: VecDeque<EnvelopeHash>,
    sent_order: VecDeque<EnvelopeHash>,
}

impl MonitorState {
    fn on_event(&mut self, event: EnvelopeEvent, max_attempts: u32) -> Vec<DeliveryUpdate> {
        match event.kind {
            EnvelopeEventKind::Sent => self.on_sent(event),
            EnvelopeEventKind::Received => self.on_received(event),
            EnvelopeEventKind::Expired => {
                if !self.envelopes.contains_key(&event.hash) {
                    self.remember_orphan(event);
                    return Vec::new();
                }
                self.on_failure(
                    event.hash,
                    "envelope expired due to connectivity issues".into(),
                    max_attempts,
                )
                .into_iter()
                .collect()
            }
            EnvelopeEventKind::BatchAcknowledged => self.on_batch_acknowledged(event, max_attempts),
        }
    }

    fn on_sent(&mut self, event: EnvelopeEvent) -> Vec<DeliveryUpdate> {
        let Some(envelope) = self.envelopes.get(&event.hash) else {
            if event.batch.is_none() {
                self.remember_orphan(event);
            }
            return Vec::new();
        };
        if envelope.state == EnvelopeState::Sent {
            return Vec::new();
        }

        match event.batch {
            Some(batch) => {
                debug!(hash = %event.hash, batch = %batch, "Envelope sent, waiting for batch confirmation");
                self.batches.entry(batch).or_default().insert(event.hash);
                Vec::new()
            }
            None => {
                debug!(hash = %event.hash, "Envelope sent");
                self.mark_sent(event.hash).into_iter().collect()
            }
        }
    }

    fn on_received(&mut self, event: EnvelopeEvent) -> Vec<DeliveryUpdate> {
        let Some(envelope) = self.envelopes.get(&event.hash) else {
            self.remember_orphan(event);
            return Vec::new();
        };
        if envelope.state != EnvelopeState::Posted {
            return Vec::new();
        }
        if let Some(expected) = envelope.recipient {
            if event.peer != Some(expected) {
                return Vec::new();
            }
        }
        debug!(hash = %event.hash, peer = ?event.peer, "Expected envelope received");
        self.mark_sent(event.hash).into_iter().collect()
    }

    fn on_batch_acknowledged(&mut self, event: EnvelopeEvent, max_attempts: u32) -> Vec<DeliveryUpdate> {
        let Some(batch) = event.batch else {
            warn!(hash = %event.hash, "Batch acknowledgement without a batch hash");
            return Vec::new();
        };
        let envelopes = self.batches.remove(&batch).unwrap_or_else(|| {
            debug!(batch = %batch, "Batch is not found");
            HashSet::new()
        });

        let mut updates = Vec::new();
        let mut failed = HashSet::new();
        for error in &event.errors {
            if self.envelopes.contains_key(&error.hash) {
                warn!(
                    hash = %error.hash,
                    peer = ?event.peer,
                    error = %error.description,
                    "Envelope posted by us was discarded"
                );
                let reason = match error.code {
                    EnvelopeErrorCode::TimeNotSynced => {
                        "envelope wasn't delivered due to time sync issues".to_string()
                    }
                    EnvelopeErrorCode::Rejected => error.description.clone(),
                };
                updates.extend(self.on_failure(error.hash, reason, max_attempts));
            }
            failed.insert(error.hash);
        }

        for hash in envelopes {
            if failed.contains(&hash) {
                continue;
            }
            updates.extend(self.mark_sent(hash));
        }
        updates
    }

    /// Retry if attempts remain, otherwise report expiry and purge.
    fn on_failure(
        &mut self,
        hash: EnvelopeHash,
        reason: String,
        max_attempts: u32,
    ) -> Option<DeliveryUpdate> {
        let envelope = self.envelopes.remove(&hash)?;
        if envelope.state == EnvelopeState::Sent {
            self.envelopes.insert(hash, envelope);
            return None;
        }

        if envelope.attempts < max_attempts {
            debug!(hash = %hash, attempts = envelope.attempts, "Envelope queued for retry");
            self.retry_queue.push(envelope);
            None
        } else {
            info!(hash = %hash, attempts = envelope.attempts, reason = %reason, "Envelope expired");
            let ids = self.expire(&envelope.message_ids);
            (!ids.is_empty()).then_some(DeliveryUpdate::Expired { ids, reason })
        }
    }

    fn mark_sent(&mut self, hash: EnvelopeHash) -> Option<DeliveryUpdate> {
        let envelope = self.envelopes.get_mut(&hash)?;
        if envelope.state == EnvelopeState::Sent {
            return None;
        }
        envelope.state = EnvelopeState::Sent;
        let ids = envelope.message_ids.clone();

        self.sent_order.push_back(hash);
        let update = self.process_message_ids(&ids);
        self.trim_sent_history();
        update
    }

    /// Drop the oldest confirmed envelopes that no pending message still
    /// waits on.
    fn trim_sent_history(&mut self) {
        while self.sent_order.len() > MAX_SENT_HISTORY {
            let message_envelopes = &self.message_envelopes;
            let envelopes = &self.envelopes;
            let resolved = self.sent_order.iter().position(|hash| {
                envelopes.get(hash).map_or(true, |e| {
                    e.message_ids.iter().all(|id| {
                        !message_envelopes
                            .get(id)
                            .is_some_and(|hashes| hashes.contains(hash))
                    })
                })
            });
            let Some(pos) = resolved else {
                break;
            };
            if let Some(old) = self.sent_order.remove(pos) {
                self.envelopes.remove(&old);
            }
        }
    }

    /// Report the IDs whose backing envelopes are all sent.
    fn process_message_ids(&mut self, ids: &[MessageId]) -> Option<DeliveryUpdate> {
        let sent: Vec<MessageId> = ids
            .iter()
            .filter(|id| {
                self.message_envelopes.get(id).is_some_and(|hashes| {
                    hashes.iter().all(|h| {
                        self.envelopes
                            .get(h)
                            .is_some_and(|e| e.state == EnvelopeState::Sent)
                    })
                })
            })
            .copied()
            .collect();

        if sent.is_empty() {
            return None;
        }
        for id in &sent {
            self.message_envelopes.remove(id);
        }
        Some(DeliveryUpdate::Sent(sent))
    }

    /// Expiry is terminal for every message the envelope carried. Returns the
    /// IDs that were still pending. Sibling envelopes stop reporting them and
    /// are dropped once they carry nothing else.
    fn expire(&mut self, ids: &[MessageId]) -> Vec<MessageId> {
        let mut expired = Vec::new();
        let mut siblings = HashSet::new();
        for id in ids {
            if let Some(hashes) = self.message_envelopes.remove(id) {
                expired.push(*id);
                siblings.extend(hashes);
            }
        }

        for hash in siblings {
            let Some(envelope) = self.envelopes.get_mut(&hash) else {
                continue;
            };
            envelope.message_ids.retain(|id| !expired.contains(id));
            if envelope.message_ids.is_empty() && envelope.state == EnvelopeState::Posted {
                self.envelopes.remove(&hash);
            }
        }
        self.retry_queue.retain_mut(|envelope| {
            envelope.message_ids.retain(|id| !expired.contains(id));
            !envelope.message_ids.is_empty()
        });
        expired
    }

    /// Keep only the IDs that are still waiting on delivery.
    fn retain_pending(&self, ids: &mut Vec<MessageId>) {
        ids.retain(|id| self.message_envelopes.contains_key(id));
    }

    fn replace_hash(&mut self, ids: &[MessageId], old: EnvelopeHash, new: EnvelopeHash) {
        for id in ids {
            if let Some(hashes) = self.message_envelopes.get_mut(id) {
                hashes.retain(|h| *h != old);
                hashes.push(new);
            }
        }
    }

    fn remember_orphan(&mut self, event: EnvelopeEvent) {
        let hash = event.hash;
        if self.orphans.insert(hash, event).is_none() {
            self.orphan_order.push_back(hash);
        }
        while self.orphan_order.len() > MAX_ORPHAN_EVENTS {
            if let Some(old) = self.orphan_order.pop_front() {
                self.orphans.remove(&old);
            }
        }
    }

    /// Replay an event that arrived before `hash` was registered.
    fn apply_orphan(&mut self, hash: EnvelopeHash, max_attempts: u32) -> Vec<DeliveryUpdate> {
        match self.orphans.remove(&hash) {
            Some(event) => {
                self.orphan_order.retain(|h| *h != hash);
                self.on_event(event, max_attempts)
            }
            None => Vec::new(),
        }
    }
}

pub struct EnvelopesMonitor {
    transport: Arc<dyn Transport>,
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    updates: broadcast::Sender<DeliveryUpdate>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EnvelopesMonitor {
    pub fn new(transport: Arc<dyn Transport>, config: MonitorConfig) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Self {
            transport,
            config,
            state: Mutex::new(MonitorState::default()),
            updates,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryUpdate> {
        self.updates.subscribe()
    }

    /// Register envelopes carrying `message_ids`; every envelope starts at attempt 1.
    pub async fn add(&self, message_ids: Vec<MessageId>, posts: Vec<TrackedPost>) {
        let max_attempts = self.config.max_attempts;
        let mut updates = Vec::new();
        {
            let mut state = self.state.lock().await;
            let hashes: Vec<EnvelopeHash> = posts.iter().map(|p| p.hash).collect();
            for id in &message_ids {
                let entry = state.message_envelopes.entry(*id).or_default();
                for hash in &hashes {
                    if !entry.contains(hash) {
                        entry.push(*hash);
                    }
                }
            }

            for post in posts {
                debug!(hash = %post.hash, ids = message_ids.len(), "Tracking envelope");
                state
                    .envelopes
                    .entry(post.hash)
                    .or_insert_with(|| MonitoredEnvelope {
                        hash: post.hash,
                        state: EnvelopeState::Posted,
                        attempts: 1,
                        message: post.envelope,
                        message_ids: message_ids.clone(),
                        recipient: post.recipient,
                        last_attempt: Instant::now(),
                    });
            }

            for hash in &hashes {
                updates.extend(state.apply_orphan(*hash, max_attempts));
            }
            updates.extend(state.process_message_ids(&message_ids));
        }
        self.publish(updates);
    }

    pub async fn state(&self, hash: &EnvelopeHash) -> EnvelopeState {
        let state = self.state.lock().await;
        if let Some(envelope) = state.envelopes.get(hash) {
            return envelope.state;
        }
        if state.retry_queue.iter().any(|e| e.hash == *hash) {
            return EnvelopeState::Posted;
        }
        EnvelopeState::NotRegistered
    }

    /// Envelopes currently backing an unconfirmed message.
    pub async fn envelope_hashes(&self, id: &MessageId) -> Vec<EnvelopeHash> {
        self.state
            .lock()
            .await
            .message_envelopes
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn handle_event(&self, event: EnvelopeEvent) {
        let updates = self
            .state
            .lock()
            .await
            .on_event(event, self.config.max_attempts);
        self.publish(updates);
    }

    /// Re-post every queued envelope whose backoff has elapsed.
    pub async fn retry_once(&self) {
        let now = Instant::now();
        let due: Vec<MonitoredEnvelope> = {
            let mut state = self.state.lock().await;
            let queue = std::mem::take(&mut state.retry_queue);
            let (due, waiting): (Vec<_>, Vec<_>) = queue.into_iter().partition(|e| {
                now.saturating_duration_since(e.last_attempt) >= self.config.backoff(e.attempts)
            });
            state.retry_queue = waiting;
            due
        };

        for mut envelope in due {
            let old_hash = envelope.hash;
            debug!(hash = %old_hash, attempt = envelope.attempts + 1, "Retrying to send a message");
            let result = self.transport.post(envelope.message.clone()).await;

            envelope.attempts += 1;
            envelope.last_attempt = Instant::now();
            let mut updates = Vec::new();
            {
                let mut state = self.state.lock().await;
                // A sibling may have expired while this post was in flight.
                state.retain_pending(&mut envelope.message_ids);
                if envelope.message_ids.is_empty() {
                    continue;
                }
                match result {
                    Ok(new_hash) => {
                        state.replace_hash(&envelope.message_ids, old_hash, new_hash);
                        envelope.hash = new_hash;
                        envelope.state = EnvelopeState::Posted;
                        state.envelopes.insert(new_hash, envelope);
                        updates.extend(state.apply_orphan(new_hash, self.config.max_attempts));
                    }
                    Err(e) => {
                        warn!(hash = %old_hash, attempt = envelope.attempts, error = %e, "Failed to retry sending message");
                        if envelope.attempts < self.config.max_attempts {
                            state.retry_queue.push(envelope);
                        } else {
                            let ids = state.expire(&envelope.message_ids);
                            updates.push(DeliveryUpdate::Expired {
                                ids,
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }
            self.publish(updates);
        }
    }

    fn publish(&self, updates: Vec<DeliveryUpdate>) {
        for update in updates {
            let _ = self.updates.send(update);
        }
    }

    /// Spawn the event loop and the retry loop.
    pub async fn start(self: &Arc<Self>) {
        let mut events = self.transport.subscribe_envelope_events();
        let mut shutdown = self.shutdown.subscribe();
        let monitor = Arc::clone(self);
        let event_loop = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => match event {
                        Ok(event) => monitor.handle_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Envelope event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!("Envelope event loop stopped");
        });

        let mut shutdown = self.shutdown.subscribe();
        let monitor = Arc::clone(self);
        let retry_loop = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.retry_interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => monitor.retry_once().await,
                }
            }
            debug!("Envelope retry loop stopped");
        });

        self.tasks.lock().await.extend([event_loop, retry_loop]);
    }

    /// Signal both loops and wait for them; an in-flight retry completes first.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
    }
}
