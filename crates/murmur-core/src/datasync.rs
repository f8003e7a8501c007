//! Reliable delivery of messages to every peer of a group.
//!
//! Appended messages are offered to each peer of their group until that peer
//! acknowledges them, with exponential backoff measured in ticks ("epochs").
//! Outgoing work is produced as [`DispatchJob`]s and pushed into a bounded
//! queue; the sync lock is never held while a job is being sent.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use murmur_shared::constants::SYNC_MAGIC;
use murmur_shared::error::CodecError;
use murmur_shared::protocol::{decode_framed, encode_framed};
use murmur_shared::types::now_ms;
use murmur_shared::{message_id, MessageId, UserId};

/// Sends per message and peer before giving up.
const MAX_SEND_COUNT: u32 = 8;
/// Received message IDs remembered for deduplication.
const MAX_SEEN: usize = 10_000;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("sync state lock poisoned: {0}")]
    LockPoisoned(String),
}

type Result<T, E = SyncError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub [u8; 32]);

impl GroupId {
    /// Order-independent group of two peers.
    pub fn one_to_one(a: &UserId, b: &UserId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let mut hasher = blake3::Hasher::new();
        hasher.update(low.as_bytes());
        hasher.update(high.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }
}

pub type SyncMessageId = [u8; 32];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncMessage {
    pub group_id: GroupId,
    pub timestamp: u64,
    pub body: Vec<u8>,
}

impl SyncMessage {
    pub fn id(&self) -> SyncMessageId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.group_id.0);
        hasher.update(&self.timestamp.to_be_bytes());
        hasher.update(&self.body);
        *hasher.finalize().as_bytes()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncPayload {
    pub acks: Vec<SyncMessageId>,
    pub messages: Vec<SyncMessage>,
}

impl SyncPayload {
    pub fn is_empty(&self) -> bool {
        self.acks.is_empty() && self.messages.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        encode_framed(SYNC_MAGIC, self)
    }

    /// `Ok(None)` when `data` is not a sync payload.
    pub fn from_bytes(data: &[u8]) -> Result<Option<Self>, CodecError> {
        decode_framed(SYNC_MAGIC, data)
    }
}

/// One encoded payload due for a peer.
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub peer: UserId,
    pub payload: Vec<u8>,
    /// Logical messages carried, for delivery tracking.
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Copy)]
struct PeerSendState {
    send_count: u32,
    send_epoch: u64,
}

#[derive(Debug)]
struct OutgoingMessage {
    message: SyncMessage,
    peers: HashMap<UserId, PeerSendState>,
}

#[derive(Default)]
struct SyncState {
    epoch: u64,
    groups: HashMap<GroupId, HashSet<UserId>>,
    outgoing: HashMap<SyncMessageId, OutgoingMessage>,
    acks: HashMap<UserId, Vec<SyncMessageId>>,
    seen: HashSet<SyncMessageId>,
    seen_order: VecDeque<SyncMessageId>,
}

impl SyncState {
    fn mark_seen(&mut self, id: SyncMessageId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.seen_order.push_back(id);
        if self.seen_order.len() > MAX_SEEN {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

pub struct DataSync {
    local: UserId,
    sending_enabled: bool,
    state: Mutex<SyncState>,
}

impl DataSync {
    pub fn new(local: UserId, sending_enabled: bool) -> Self {
        Self {
            local,
            sending_enabled,
            state: Mutex::new(SyncState::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SyncState>> {
        self.state
            .lock()
            .map_err(|e| SyncError::LockPoisoned(e.to_string()))
    }

    pub fn add_peer(&self, group: GroupId, peer: UserId) -> Result<()> {
        self.lock()?.groups.entry(group).or_default().insert(peer);
        Ok(())
    }

    pub fn is_peer_in_group(&self, group: &GroupId, peer: &UserId) -> Result<bool> {
        Ok(self
            .lock()?
            .groups
            .get(group)
            .is_some_and(|peers| peers.contains(peer)))
    }

    /// Queue `body` for every peer currently in `group`; it is due on the next tick.
    pub fn append_message(&self, group: GroupId, body: Vec<u8>) -> Result<SyncMessageId> {
        let message = SyncMessage {
            group_id: group,
            timestamp: now_ms(),
            body,
        };
        let id = message.id();

        let mut state = self.lock()?;
        let epoch = state.epoch;
        let peers = state
            .groups
            .get(&group)
            .map(|peers| {
                peers
                    .iter()
                    .map(|peer| {
                        (
                            *peer,
                            PeerSendState {
                                send_count: 0,
                                send_epoch: epoch,
                            },
                        )
                    })
                    .collect::<HashMap<_, _>>()
            })
            .unwrap_or_default();
        if peers.is_empty() {
            warn!(group = %hex::encode(group.0), "Appending message to a group without peers");
        }
        state.outgoing.insert(id, OutgoingMessage { message, peers });
        debug!(id = %hex::encode(id), "Appended sync message");
        Ok(id)
    }

    /// Unpack a received payload.
    ///
    /// Payloads that are not sync envelopes come back unchanged as the only
    /// element. Otherwise acknowledgements are applied and the bodies of
    /// messages not seen before are returned.
    pub fn handle(&self, sender: &UserId, payload: &[u8]) -> Result<Vec<Vec<u8>>> {
        let sync = match SyncPayload::from_bytes(payload) {
            Ok(Some(sync)) => sync,
            Ok(None) => return Ok(vec![payload.to_vec()]),
            Err(e) => {
                debug!(sender = %sender, error = %e, "Undecodable sync payload, passing through");
                return Ok(vec![payload.to_vec()]);
            }
        };

        let mut state = self.lock()?;
        for ack in &sync.acks {
            let done = match state.outgoing.get_mut(ack) {
                Some(outgoing) => {
                    outgoing.peers.remove(sender);
                    outgoing.peers.is_empty()
                }
                None => false,
            };
            if done {
                debug!(id = %hex::encode(ack), "Sync message acknowledged by every peer");
                state.outgoing.remove(ack);
            }
        }

        let mut bodies = Vec::new();
        for message in sync.messages {
            let id = message.id();
            if self.sending_enabled {
                // Acknowledge duplicates too: the earlier ack may have been lost.
                state.acks.entry(*sender).or_default().push(id);
            }
            if state.mark_seen(id) {
                bodies.push(message.body);
            }
        }
        Ok(bodies)
    }

    /// Advance one epoch and collect everything due.
    pub fn tick(&self) -> Result<Vec<DispatchJob>> {
        let mut state = self.lock()?;
        state.epoch += 1;
        let epoch = state.epoch;

        let mut per_peer: HashMap<UserId, SyncPayload> = HashMap::new();
        for (peer, acks) in state.acks.drain() {
            per_peer.entry(peer).or_default().acks = acks;
        }

        let mut exhausted = Vec::new();
        for (id, outgoing) in state.outgoing.iter_mut() {
            outgoing.peers.retain(|peer, send| {
                if send.send_epoch > epoch {
                    return true;
                }
                if send.send_count >= MAX_SEND_COUNT {
                    warn!(id = %hex::encode(id), peer = %peer, "Giving up on sync message");
                    return false;
                }
                send.send_count += 1;
                send.send_epoch = epoch + (1u64 << send.send_count.min(16));
                per_peer
                    .entry(*peer)
                    .or_default()
                    .messages
                    .push(outgoing.message.clone());
                true
            });
            if outgoing.peers.is_empty() {
                exhausted.push(*id);
            }
        }
        for id in exhausted {
            state.outgoing.remove(&id);
        }
        drop(state);

        let mut jobs = Vec::new();
        for (peer, payload) in per_peer {
            if payload.is_empty() {
                continue;
            }
            let message_ids = payload
                .messages
                .iter()
                .map(|m| message_id(&self.local, &m.body))
                .collect();
            match payload.to_bytes() {
                Ok(bytes) => jobs.push(DispatchJob {
                    peer,
                    payload: bytes,
                    message_ids,
                }),
                Err(e) => warn!(peer = %peer, error = %e, "Failed to encode sync payload"),
            }
        }
        Ok(jobs)
    }

    /// Spawn the tick loop feeding `queue` until `shutdown` flips.
    pub fn start(
        self: &std::sync::Arc<Self>,
        interval: Duration,
        queue: mpsc::Sender<DispatchJob>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let sync = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let jobs = match sync.tick() {
                            Ok(jobs) => jobs,
                            Err(e) => {
                                warn!(error = %e, "Sync tick failed");
                                continue;
                            }
                        };
                        for job in jobs {
                            if queue.send(job).await.is_err() {
                                debug!("Dispatch queue closed");
                                return;
                            }
                        }
                    }
                }
            }
            debug!("Sync loop stopped");
        })
    }
}
