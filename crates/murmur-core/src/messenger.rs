//! The messenger: owner of the chat, contact and installation tables.
//!
//! All public calls serialize on one state lock, held from clock computation
//! through sending and persistence so two sends to the same chat never reuse a
//! clock value. Network I/O happens under that lock; striping it per chat is
//! the obvious next step if contention shows up.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use murmur_net::{DeliveryUpdate, Transport};
use murmur_shared::protocol::{
    ApplicationMessage, ChatMessage, ChatType, ContactUpdate, ContentType, MembershipEventKind,
    MembershipUpdateEvent, MembershipUpdateMessage, PairInstallation,
};
use murmur_shared::types::now_ms;
use murmur_shared::{Identity, MessageId, UserId};
use murmur_store::{
    Chat, Contact, Database, Installation, Message, OutgoingStatus, RawMessage, SaveBatch,
    StoreError, TAG_CONTACT_ADDED,
};

use crate::chat::{group_chat_id, next_clock, one_to_one_chat_id, resolve_chat, Resolved};
use crate::config::MessengerConfig;
use crate::contact::{alias_for, apply_contact_update, new_contact};
use crate::encryption::EncryptionProtocol;
use crate::error::{MessengerError, Result};
use crate::group::{merge_events, validate_update, Group};
use crate::pipeline::InboundMessage;
use crate::processor::{MessageProcessor, SentMessage};
use crate::response::MessengerResponse;
use crate::SharedDatabase;

/// Upper bound on membership events held for groups we have not seen created.
const MAX_PENDING_GROUPS: usize = 256;

/// What the user typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBody {
    pub text: String,
    pub content_type: ContentType,
    pub response_to: Option<MessageId>,
}

impl MessageBody {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            content_type: ContentType::Text,
            response_to: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MessengerState {
    chats: HashMap<String, Chat>,
    contacts: HashMap<UserId, Contact>,
    /// Installations of our own identity, keyed by installation ID.
    installations: HashMap<String, Installation>,
    pending_events: HashMap<String, Vec<MembershipUpdateEvent>>,
    contact_update_clock: u64,
}

pub struct Messenger {
    identity: Arc<Identity>,
    config: MessengerConfig,
    db: SharedDatabase,
    processor: Arc<MessageProcessor>,
    state: Mutex<MessengerState>,
    delivery_task: Mutex<Option<JoinHandle<()>>>,
}

impl Messenger {
    /// Wire the encryption layer and the processor. Fails if stored keys
    /// cannot be loaded.
    pub fn new(
        identity: Arc<Identity>,
        transport: Arc<dyn Transport>,
        db: SharedDatabase,
        config: MessengerConfig,
    ) -> Result<Self> {
        let encryption = Arc::new(EncryptionProtocol::new(
            Arc::clone(&identity),
            &config.installation_id,
            config.bundle_advertise_interval,
            Arc::clone(&db),
        )?);
        let processor = Arc::new(MessageProcessor::new(
            Arc::clone(&identity),
            transport,
            encryption,
            config.clone(),
        ));
        Ok(Self {
            identity,
            config,
            db,
            processor,
            state: Mutex::new(MessengerState::default()),
            delivery_task: Mutex::new(None),
        })
    }

    fn me(&self) -> UserId {
        self.identity.user_id()
    }

    fn db(&self) -> Result<std::sync::MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|e| MessengerError::LockPoisoned(e.to_string()))
    }

    /// Load persisted state, register this installation and subscribe to
    /// every topic we listen on.
    pub async fn init(&self) -> Result<()> {
        let me = self.me();
        let mut state = self.state.lock().await;
        {
            let db = self.db()?;
            db.save_installation(&Installation {
                id: self.config.installation_id.clone(),
                identity: me,
                enabled: true,
                name: self.config.device_name.clone(),
                device_type: std::env::consts::OS.to_string(),
                timestamp: now_ms(),
            })?;
            state.chats = db
                .all_chats()?
                .into_iter()
                .map(|chat| (chat.id.clone(), chat))
                .collect();
            state.contacts = db
                .all_contacts()?
                .into_iter()
                .map(|contact| (contact.id, contact))
                .collect();
            state.installations = db
                .installations_for(&me)?
                .into_iter()
                .map(|installation| (installation.id.clone(), installation))
                .collect();
        }

        self.processor.subscribe_defaults().await?;
        for chat in state.chats.values() {
            if chat.active && chat.chat_type == ChatType::Public {
                self.processor.join_public(&chat.id).await?;
            }
        }
        info!(
            user = %me.short(),
            chats = state.chats.len(),
            contacts = state.contacts.len(),
            installations = state.installations.len(),
            "Messenger initialised"
        );
        Ok(())
    }

    /// Start background delivery tracking and sync.
    pub async fn start(&self) -> Result<()> {
        self.processor.start().await?;

        let mut updates = self.processor.subscribe_delivery_updates();
        let db = Arc::clone(&self.db);
        let task = tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(DeliveryUpdate::Sent(ids)) => {
                        let result = db
                            .lock()
                            .map_err(|e| MessengerError::LockPoisoned(e.to_string()))
                            .and_then(|db| {
                                let updated = db.update_outgoing_status(&ids, OutgoingStatus::Sent)?;
                                db.mark_raw_messages_sent(&ids)?;
                                Ok(updated)
                            });
                        match result {
                            Ok(updated) => debug!(ids = ids.len(), updated, "Messages sent"),
                            Err(e) => warn!(error = %e, "Failed to record sent messages"),
                        }
                    }
                    Ok(DeliveryUpdate::Expired { ids, reason }) => {
                        warn!(ids = ids.len(), reason = %reason, "Messages expired");
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Delivery updates lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.delivery_task.lock().await = Some(task);
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.processor.stop().await;
        if let Some(task) = self.delivery_task.lock().await.take() {
            task.abort();
        }
        info!("Messenger shut down");
    }

    pub fn subscribe_delivery_updates(&self) -> broadcast::Receiver<DeliveryUpdate> {
        self.processor.subscribe_delivery_updates()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn chats(&self) -> Vec<Chat> {
        self.state.lock().await.chats.values().cloned().collect()
    }

    pub async fn chat(&self, chat_id: &str) -> Option<Chat> {
        self.state.lock().await.chats.get(chat_id).cloned()
    }

    pub async fn contacts(&self) -> Vec<Contact> {
        self.state.lock().await.contacts.values().cloned().collect()
    }

    pub async fn installations(&self) -> Vec<Installation> {
        self.state.lock().await.installations.values().cloned().collect()
    }

    pub fn message_by_id(&self, id: &MessageId) -> Result<Message> {
        self.db()?.get_message_by_id(id).map_err(|e| match e {
            StoreError::NotFound => MessengerError::MessageNotFound(id.to_hex()),
            other => other.into(),
        })
    }

    /// Newest first.
    pub fn chat_messages(&self, chat_id: &str, limit: u32, offset: u32) -> Result<Vec<Message>> {
        Ok(self.db()?.get_messages_for_chat(chat_id, limit, offset)?)
    }

    // -----------------------------------------------------------------------
    // Chats
    // -----------------------------------------------------------------------

    pub async fn join_public_chat(&self, name: &str) -> Result<MessengerResponse> {
        let mut state = self.state.lock().await;
        let mut chat = match state.chats.get(name) {
            Some(chat) if chat.chat_type != ChatType::Public => {
                return Err(MessengerError::InvalidChatType(chat.chat_type));
            }
            Some(chat) => chat.clone(),
            None => Chat::new(name, ChatType::Public, name, now_ms()),
        };
        chat.active = true;
        self.processor.join_public(name).await?;

        let mut response = MessengerResponse::default();
        response.add_chat(chat.clone());
        self.persist(&response)?;
        state.chats.insert(chat.id.clone(), chat);
        debug!(chat_id = %name, "Joined public chat");
        Ok(response)
    }

    pub async fn create_one_to_one_chat(&self, peer: &UserId) -> Result<MessengerResponse> {
        let mut state = self.state.lock().await;
        let chat_id = one_to_one_chat_id(peer);
        let mut chat = match state.chats.get(&chat_id) {
            Some(chat) => chat.clone(),
            None => Chat::new(&chat_id, ChatType::OneToOne, alias_for(peer), now_ms()),
        };
        chat.active = true;

        let mut response = MessengerResponse::default();
        response.add_chat(chat.clone());
        if !state.contacts.contains_key(peer) {
            let contact = new_contact(peer);
            response.add_contact(contact.clone());
            state.contacts.insert(*peer, contact);
        }
        self.persist(&response)?;
        state.chats.insert(chat_id, chat);
        Ok(response)
    }

    /// Soft-delete: the chat keeps its history and stops receiving public traffic.
    pub async fn deactivate_chat(&self, chat_id: &str) -> Result<MessengerResponse> {
        let mut state = self.state.lock().await;
        let mut chat = state
            .chats
            .get(chat_id)
            .cloned()
            .ok_or_else(|| MessengerError::ChatNotFound(chat_id.to_string()))?;
        chat.active = false;
        chat.deleted_at_clock_value = chat.last_clock_value;
        if chat.chat_type == ChatType::Public {
            self.processor.leave_public(chat_id).await?;
        }

        let mut response = MessengerResponse::default();
        response.add_chat(chat.clone());
        self.persist(&response)?;
        state.chats.insert(chat.id.clone(), chat);
        Ok(response)
    }

    pub async fn mark_messages_seen(
        &self,
        chat_id: &str,
        ids: &[MessageId],
    ) -> Result<MessengerResponse> {
        let mut state = self.state.lock().await;
        let mut chat = state
            .chats
            .get(chat_id)
            .cloned()
            .ok_or_else(|| MessengerError::ChatNotFound(chat_id.to_string()))?;
        {
            let mut db = self.db()?;
            let marked = db.mark_messages_seen(chat_id, ids)?;
            chat.unviewed_count = db.count_unseen(chat_id)?;
            db.save_chat(&chat)?;
            debug!(chat_id, marked, unviewed = chat.unviewed_count, "Marked messages seen");
        }

        let mut response = MessengerResponse::default();
        response.add_chat(chat.clone());
        state.chats.insert(chat.id.clone(), chat);
        Ok(response)
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    pub async fn send_chat_message(
        &self,
        chat_id: &str,
        body: MessageBody,
    ) -> Result<MessengerResponse> {
        let me = self.me();
        let mut state = self.state.lock().await;
        let mut chat = state
            .chats
            .get(chat_id)
            .cloned()
            .ok_or_else(|| MessengerError::ChatNotFound(chat_id.to_string()))?;
        if chat.chat_type == ChatType::PrivateGroup
            && !Group::derive(&chat.id, &chat.membership_updates).is_joined(&me)
        {
            return Err(MessengerError::NotPermitted(format!(
                "not a joined member of {chat_id}"
            )));
        }

        let now = now_ms();
        let clock = next_clock(&chat, now);
        let message = ChatMessage {
            clock,
            timestamp: now,
            text: body.text,
            chat_id: chat.id.clone(),
            response_to: body.response_to,
            chat_type: chat.chat_type,
            content_type: body.content_type,
        };
        let sent = self.processor.wrap(&ApplicationMessage::Chat(message.clone()))?;
        let recipients = self.recipients(&state, &chat)?;

        let stored = Message {
            id: sent.id,
            chat_id: chat.id.clone(),
            from: me,
            clock,
            whisper_timestamp: now,
            timestamp: now,
            text: message.text,
            content_type: message.content_type,
            outgoing_status: Some(OutgoingStatus::Sending),
            seen: true,
            response_to: message.response_to,
        };
        chat.last_clock_value = clock;
        chat.last_message_id = Some(sent.id);
        chat.active = true;

        let mut response = MessengerResponse::default();
        response.add_chat(chat.clone());
        response.add_message(stored);
        self.persist(&response)?;
        self.record_raw(&chat, &sent, &recipients, now)?;
        state.chats.insert(chat.id.clone(), chat.clone());

        self.dispatch(&state, &chat, &sent, &recipients).await?;
        debug!(chat_id = %chat.id, id = %sent.id, clock, "Sent chat message");
        Ok(response)
    }

    /// Re-send a stored outbound payload. Its ID never changes.
    pub async fn re_send_chat_message(&self, id: &MessageId) -> Result<()> {
        let state = self.state.lock().await;
        let raw = self.db()?.get_raw_message(id).map_err(|e| match e {
            StoreError::NotFound => MessengerError::MessageNotFound(id.to_hex()),
            other => other.into(),
        })?;
        let chat = state
            .chats
            .get(&raw.local_chat_id)
            .cloned()
            .ok_or_else(|| MessengerError::ChatNotFound(raw.local_chat_id.clone()))?;

        let sent = SentMessage {
            id: raw.id,
            kind: raw.message_type,
            wrapped: raw.payload,
        };
        self.dispatch(&state, &chat, &sent, &raw.recipients).await?;
        self.db()?.record_raw_send(id, now_ms())?;
        info!(id = %id, chat_id = %chat.id, attempt = raw.send_count + 1, "Re-sent message");
        Ok(())
    }

    /// Peers a message in `chat` is addressed to.
    fn recipients(&self, state: &MessengerState, chat: &Chat) -> Result<Vec<UserId>> {
        let me = self.me();
        let mut recipients = match chat.chat_type {
            ChatType::Public => Vec::new(),
            ChatType::OneToOne => vec![UserId::from_hex(&chat.id)?],
            ChatType::PrivateGroup => Group::derive(&chat.id, &chat.membership_updates)
                .joined_member_ids()
                .into_iter()
                .filter(|member| *member != me)
                .collect(),
        };
        if chat.chat_type != ChatType::Public && self.has_paired_devices(state) {
            recipients.push(me);
        }
        Ok(recipients)
    }

    fn has_paired_devices(&self, state: &MessengerState) -> bool {
        state
            .installations
            .values()
            .any(|i| i.enabled && i.id != self.config.installation_id)
    }

    async fn dispatch(
        &self,
        state: &MessengerState,
        chat: &Chat,
        sent: &SentMessage,
        recipients: &[UserId],
    ) -> Result<()> {
        match chat.chat_type {
            ChatType::Public => self.processor.send_public(&chat.id, sent).await,
            ChatType::OneToOne => {
                for recipient in recipients {
                    self.processor.send_private(recipient, sent).await?;
                }
                Ok(())
            }
            ChatType::PrivateGroup => {
                if recipients.is_empty() {
                    debug!(chat_id = %chat.id, paired = self.has_paired_devices(state), "No group members to send to");
                    return Ok(());
                }
                self.processor.send_group(recipients, sent).await
            }
        }
    }

    fn record_raw(&self, chat: &Chat, sent: &SentMessage, recipients: &[UserId], now: u64) -> Result<()> {
        self.db()?.save_raw_message(&RawMessage {
            id: sent.id,
            local_chat_id: chat.id.clone(),
            payload: sent.wrapped.clone(),
            message_type: sent.kind,
            recipients: recipients.to_vec(),
            send_count: 1,
            sent: false,
            last_sent: now,
        })?;
        Ok(())
    }

    /// Write chats, contacts and messages in one transaction, then installations.
    fn persist(&self, response: &MessengerResponse) -> Result<()> {
        let batch = SaveBatch {
            chats: response.chats.clone(),
            contacts: response.contacts.clone(),
            messages: response.messages.clone(),
        };
        let mut db = self.db()?;
        db.save_batch(&batch)?;
        for installation in &response.installations {
            db.save_installation(installation)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Groups
    // -----------------------------------------------------------------------

    pub async fn create_group_chat_with_members(
        &self,
        name: &str,
        members: &[UserId],
    ) -> Result<MessengerResponse> {
        let me = self.me();
        let mut state = self.state.lock().await;
        let chat_id = group_chat_id(&me);
        let now = now_ms();

        let mut events = vec![MembershipUpdateEvent::chat_created(&self.identity, &chat_id, name, now)?];
        let others: Vec<UserId> = members.iter().copied().filter(|m| *m != me).collect();
        if !others.is_empty() {
            events.push(MembershipUpdateEvent::members_added(
                &self.identity,
                &chat_id,
                others,
                now + 1,
            )?);
        }

        let mut chat = Chat::new(&chat_id, ChatType::PrivateGroup, name, now);
        let response = self.commit_local_events(&mut state, &mut chat, events, &Group::default()).await?;
        info!(chat_id = %chat_id, members = members.len(), "Created group chat");
        Ok(response)
    }

    pub async fn add_members_to_group_chat(
        &self,
        chat_id: &str,
        members: &[UserId],
    ) -> Result<MessengerResponse> {
        let members = members.to_vec();
        self.group_event(chat_id, |group, me| {
            if !group.is_admin_member(me) {
                return Err(MessengerError::NotPermitted("only admins can add members".into()));
            }
            Ok(())
        }, move |identity, chat_id, clock| {
            MembershipUpdateEvent::members_added(identity, chat_id, members, clock)
        })
        .await
    }

    pub async fn remove_member_from_group_chat(
        &self,
        chat_id: &str,
        member: &UserId,
    ) -> Result<MessengerResponse> {
        let member = *member;
        self.group_event(chat_id, |group, me| {
            if !group.is_admin_member(me) {
                return Err(MessengerError::NotPermitted("only admins can remove members".into()));
            }
            if group.creator == Some(member) {
                return Err(MessengerError::NotPermitted("the creator cannot be removed".into()));
            }
            if !group.is_member(&member) {
                return Err(MessengerError::NotPermitted(format!("{} is not a member", member.short())));
            }
            Ok(())
        }, move |identity, chat_id, clock| {
            MembershipUpdateEvent::member_removed(identity, chat_id, member, clock)
        })
        .await
    }

    pub async fn add_admins_to_group_chat(
        &self,
        chat_id: &str,
        admins: &[UserId],
    ) -> Result<MessengerResponse> {
        let admins = admins.to_vec();
        let targets = admins.clone();
        self.group_event(chat_id, move |group, me| {
            if group.creator != Some(*me) {
                return Err(MessengerError::NotPermitted("only the creator can add admins".into()));
            }
            if let Some(outsider) = targets.iter().find(|a| !group.is_member(a)) {
                return Err(MessengerError::NotPermitted(format!("{} is not a member", outsider.short())));
            }
            Ok(())
        }, move |identity, chat_id, clock| {
            MembershipUpdateEvent::admins_added(identity, chat_id, admins, clock)
        })
        .await
    }

    pub async fn change_group_chat_name(&self, chat_id: &str, name: &str) -> Result<MessengerResponse> {
        let name = name.to_string();
        self.group_event(chat_id, |group, me| {
            if !group.is_admin_member(me) {
                return Err(MessengerError::NotPermitted("only admins can rename the group".into()));
            }
            Ok(())
        }, move |identity, chat_id, clock| {
            MembershipUpdateEvent::name_changed(identity, chat_id, &name, clock)
        })
        .await
    }

    pub async fn confirm_joining_group(&self, chat_id: &str) -> Result<MessengerResponse> {
        self.group_event(chat_id, |group, me| {
            if !group.is_member(me) {
                return Err(MessengerError::NotPermitted("not invited to this group".into()));
            }
            Ok(())
        }, |identity, chat_id, clock| MembershipUpdateEvent::member_joined(identity, chat_id, clock))
        .await
    }

    pub async fn leave_group_chat(&self, chat_id: &str) -> Result<MessengerResponse> {
        let me = self.me();
        self.group_event(chat_id, |group, me| {
            if !group.is_member(me) {
                return Err(MessengerError::NotPermitted("not a member of this group".into()));
            }
            Ok(())
        }, move |identity, chat_id, clock| {
            MembershipUpdateEvent::member_removed(identity, chat_id, me, clock)
        })
        .await
    }

    /// Check, sign and broadcast one membership event for an existing group.
    async fn group_event<C, B>(&self, chat_id: &str, check: C, build: B) -> Result<MessengerResponse>
    where
        C: FnOnce(&Group, &UserId) -> Result<()>,
        B: FnOnce(&Identity, &str, u64) -> std::result::Result<MembershipUpdateEvent, murmur_shared::error::CodecError>,
    {
        let me = self.me();
        let mut state = self.state.lock().await;
        let mut chat = state
            .chats
            .get(chat_id)
            .cloned()
            .ok_or_else(|| MessengerError::ChatNotFound(chat_id.to_string()))?;
        if chat.chat_type != ChatType::PrivateGroup {
            return Err(MessengerError::InvalidChatType(chat.chat_type));
        }
        let before = Group::derive(&chat.id, &chat.membership_updates);
        check(&before, &me)?;

        let event = build(self.identity.as_ref(), chat.id.as_str(), next_clock(&chat, now_ms()))?;
        self.commit_local_events(&mut state, &mut chat, vec![event], &before).await
    }

    /// Merge locally created events, persist and send the full log to every
    /// member before and after the change.
    async fn commit_local_events(
        &self,
        state: &mut MessengerState,
        chat: &mut Chat,
        events: Vec<MembershipUpdateEvent>,
        before: &Group,
    ) -> Result<MessengerResponse> {
        let me = self.me();
        let now = now_ms();
        let merged = merge_events(&chat.membership_updates, &events);
        let after = Group::derive(&chat.id, &merged);

        chat.membership_updates = merged;
        chat.name = after.name.clone();
        chat.active = after.is_member(&me);
        if let Some(clock) = events.iter().map(|e| e.clock).max() {
            chat.last_clock_value = chat.last_clock_value.max(clock);
        }

        let mut response = MessengerResponse::default();
        for event in &events {
            let message = system_message(event, &chat.id, now, true);
            chat.last_message_id = Some(message.id);
            response.add_message(message);
        }
        response.add_chat(chat.clone());

        let mut recipients = before.member_ids();
        for member in after.member_ids() {
            if !recipients.contains(&member) {
                recipients.push(member);
            }
        }
        recipients.retain(|member| *member != me);
        if self.has_paired_devices(state) {
            recipients.push(me);
        }

        let update = MembershipUpdateMessage {
            chat_id: chat.id.clone(),
            events: chat.membership_updates.clone(),
            message: None,
        };
        let sent = self.processor.wrap(&ApplicationMessage::MembershipUpdate(update))?;

        self.persist(&response)?;
        self.record_raw(chat, &sent, &recipients, now)?;
        state.chats.insert(chat.id.clone(), chat.clone());

        if !recipients.is_empty() {
            self.processor.send_group(&recipients, &sent).await?;
        }
        debug!(chat_id = %chat.id, events = events.len(), recipients = recipients.len(), "Sent membership update");
        Ok(response)
    }

    // -----------------------------------------------------------------------
    // Contacts and devices
    // -----------------------------------------------------------------------

    pub async fn add_contact(&self, user: &UserId) -> Result<MessengerResponse> {
        let mut state = self.state.lock().await;
        let mut contact = state
            .contacts
            .get(user)
            .cloned()
            .unwrap_or_else(|| new_contact(user));
        contact.add_tag(TAG_CONTACT_ADDED);

        let mut response = MessengerResponse::default();
        response.add_contact(contact.clone());
        self.persist(&response)?;
        state.contacts.insert(*user, contact);
        Ok(response)
    }

    /// Push our display name to `peer`, adding them as a contact.
    pub async fn send_contact_update(&self, peer: &UserId, name: &str) -> Result<MessengerResponse> {
        let mut state = self.state.lock().await;
        let clock = (state.contact_update_clock + 1).max(now_ms());
        let sent = self.processor.wrap(&ApplicationMessage::ContactUpdate(ContactUpdate {
            clock,
            name: name.to_string(),
        }))?;

        let mut contact = state
            .contacts
            .get(peer)
            .cloned()
            .unwrap_or_else(|| new_contact(peer));
        contact.add_tag(TAG_CONTACT_ADDED);
        let mut response = MessengerResponse::default();
        response.add_contact(contact.clone());
        self.persist(&response)?;
        state.contacts.insert(*peer, contact);
        state.contact_update_clock = clock;

        self.processor.send_private(peer, &sent).await?;
        debug!(peer = %peer, clock, "Sent contact update");
        Ok(response)
    }

    /// Announce this installation to our other devices.
    pub async fn send_pair_installation(&self) -> Result<()> {
        let _state = self.state.lock().await;
        let sent = self.processor.wrap(&ApplicationMessage::PairInstallation(PairInstallation {
            clock: now_ms(),
            installation_id: self.config.installation_id.clone(),
            device_type: std::env::consts::OS.to_string(),
            name: self.config.device_name.clone(),
        }))?;
        self.processor.send_private(&self.me(), &sent).await
    }

    pub async fn enable_installation(&self, id: &str) -> Result<MessengerResponse> {
        self.set_installation_enabled(id, true).await
    }

    pub async fn disable_installation(&self, id: &str) -> Result<MessengerResponse> {
        self.set_installation_enabled(id, false).await
    }

    async fn set_installation_enabled(&self, id: &str, enabled: bool) -> Result<MessengerResponse> {
        let mut state = self.state.lock().await;
        let installation = state
            .installations
            .get_mut(id)
            .ok_or_else(|| MessengerError::NotPermitted(format!("unknown installation {id}")))?;
        installation.enabled = enabled;
        self.db()?.set_installation_enabled(&installation.identity, id, enabled)?;

        let mut response = MessengerResponse::default();
        response.add_installation(installation.clone());
        Ok(response)
    }

    // -----------------------------------------------------------------------
    // Receiving
    // -----------------------------------------------------------------------

    /// Fetch, decode and apply everything the transport received.
    ///
    /// Messages that cannot be applied are logged and left out; everything
    /// else in the batch is applied and persisted together.
    pub async fn retrieve_all(&self) -> Result<MessengerResponse> {
        let batch = self.processor.retrieve_all().await?;
        let mut state = self.state.lock().await;
        let mut working = state.clone();
        let mut response = MessengerResponse::default();

        for installation in batch.installations {
            if !working.installations.contains_key(&installation.id) {
                info!(installation_id = %installation.id, "Discovered own installation");
                working
                    .installations
                    .insert(installation.id.clone(), installation.clone());
                response.add_installation(installation);
            }
        }

        for message in &batch.messages {
            match &message.message {
                ApplicationMessage::Chat(chat_message) => {
                    if let Err(e) =
                        self.handle_chat_message(&mut working, &mut response, message, chat_message)
                    {
                        warn!(id = %message.id, error = %e, "Could not apply chat message");
                    }
                }
                ApplicationMessage::MembershipUpdate(update) => {
                    if let Err(e) =
                        self.handle_membership_update(&mut working, &mut response, message, update)
                    {
                        warn!(id = %message.id, chat_id = %update.chat_id, error = %e, "Could not apply membership update");
                    }
                }
                ApplicationMessage::PairInstallation(pair) => {
                    self.handle_pair_installation(&mut working, &mut response, message, pair);
                }
                ApplicationMessage::ContactUpdate(update) => {
                    self.handle_contact_update(&mut working, &mut response, message, update);
                }
                ApplicationMessage::Unknown => {
                    debug!(id = %message.id, signer = %message.signer, "Ignoring unknown message");
                }
            }
        }

        self.persist(&response)?;
        *state = working;
        if !response.is_empty() {
            debug!(
                chats = response.chats.len(),
                messages = response.messages.len(),
                contacts = response.contacts.len(),
                "Applied received messages"
            );
        }
        Ok(response)
    }

    fn already_stored(&self, response: &MessengerResponse, id: &MessageId) -> Result<bool> {
        if response.messages.iter().any(|m| m.id == *id) {
            return Ok(true);
        }
        Ok(self.db()?.message_exists(id)?)
    }

    fn handle_chat_message(
        &self,
        state: &mut MessengerState,
        response: &mut MessengerResponse,
        inbound: &InboundMessage,
        message: &ChatMessage,
    ) -> Result<()> {
        let me = self.me();
        let resolved = match resolve_chat(&state.chats, &me, &inbound.signer, message, now_ms()) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(id = %inbound.id, signer = %inbound.signer, error = %e, "Could not resolve chat");
                return Ok(());
            }
        };
        let mut chat = match resolved {
            Resolved::Existing(id) => match state.chats.get(&id) {
                Some(chat) => chat.clone(),
                None => return Ok(()),
            },
            Resolved::Created(chat) => chat,
        };

        if message.clock <= chat.deleted_at_clock_value {
            debug!(id = %inbound.id, chat_id = %chat.id, clock = message.clock, "Ignoring message older than deletion");
            return Ok(());
        }
        if self.already_stored(response, &inbound.id)? {
            debug!(id = %inbound.id, "Duplicate message");
            return Ok(());
        }

        let own = inbound.signer == me;
        let stored = Message {
            id: inbound.id,
            chat_id: chat.id.clone(),
            from: inbound.signer,
            clock: message.clock,
            whisper_timestamp: inbound.whisper_timestamp,
            timestamp: message.timestamp,
            text: message.text.clone(),
            content_type: message.content_type,
            outgoing_status: own.then_some(OutgoingStatus::Sent),
            seen: own,
            response_to: message.response_to,
        };

        if message.clock >= chat.last_clock_value {
            chat.last_clock_value = message.clock;
            chat.last_message_id = Some(inbound.id);
        }
        if !own {
            chat.unviewed_count += 1;
        }
        if chat.chat_type == ChatType::OneToOne {
            chat.active = true;
        }

        if !own && !state.contacts.contains_key(&inbound.signer) {
            let contact = new_contact(&inbound.signer);
            response.add_contact(contact.clone());
            state.contacts.insert(inbound.signer, contact);
        }

        debug!(id = %inbound.id, chat_id = %chat.id, clock = message.clock, "Received chat message");
        response.add_message(stored);
        response.add_chat(chat.clone());
        state.chats.insert(chat.id.clone(), chat);
        Ok(())
    }

    fn handle_membership_update(
        &self,
        state: &mut MessengerState,
        response: &mut MessengerResponse,
        inbound: &InboundMessage,
        update: &MembershipUpdateMessage,
    ) -> Result<()> {
        if let Err(e) = validate_update(update) {
            warn!(id = %inbound.id, chat_id = %update.chat_id, error = %e, "Rejecting membership update");
            return Ok(());
        }
        let me = self.me();
        let chat_id = &update.chat_id;

        let (mut chat, local) = match state.chats.get(chat_id) {
            Some(chat) if chat.chat_type != ChatType::PrivateGroup => {
                warn!(chat_id = %chat_id, "Membership update for a non-group chat");
                return Ok(());
            }
            Some(chat) => (Some(chat.clone()), chat.membership_updates.clone()),
            None => (None, state.pending_events.get(chat_id).cloned().unwrap_or_default()),
        };
        let merged = merge_events(&local, &update.events);
        let group = Group::derive(chat_id, &merged);

        if chat.is_none() {
            if group.creator.is_none() {
                debug!(chat_id = %chat_id, events = merged.len(), "Holding events for unknown group");
                let full = state.pending_events.len() >= MAX_PENDING_GROUPS;
                if full && !state.pending_events.contains_key(chat_id) {
                    warn!(chat_id = %chat_id, "Too many pending groups, dropping events");
                } else {
                    state.pending_events.insert(chat_id.clone(), merged);
                }
                return Ok(());
            }
            if !group.is_member(&me) {
                state.pending_events.remove(chat_id);
                debug!(chat_id = %chat_id, "Ignoring group we are not a member of");
                return Ok(());
            }
            chat = Some(Chat::new(chat_id, ChatType::PrivateGroup, &group.name, now_ms()));
        }
        let Some(mut chat) = chat else {
            return Ok(());
        };

        // Only events the replay accepts are shown or move the clock.
        let before = Group::derive(chat_id, &chat.membership_updates);
        let fresh: Vec<&MembershipUpdateEvent> = merged
            .iter()
            .filter(|e| group.was_applied(e) && !before.was_applied(e))
            .collect();

        for event in &fresh {
            let message = system_message(event, chat_id, inbound.whisper_timestamp, event.from == me);
            if self.already_stored(response, &message.id)? {
                continue;
            }
            chat.last_message_id = Some(message.id);
            response.add_message(message);
        }
        if let Some(clock) = fresh.iter().map(|e| e.clock).max() {
            chat.last_clock_value = chat.last_clock_value.max(clock);
        }
        let fresh_count = fresh.len();
        chat.membership_updates = merged;
        chat.name = group.name.clone();
        chat.active = group.is_member(&me);

        debug!(chat_id = %chat_id, fresh = fresh_count, members = group.members.len(), "Merged membership update");
        response.add_chat(chat.clone());
        state.chats.insert(chat_id.clone(), chat);
        state.pending_events.remove(chat_id);

        if let Some(message) = &update.message {
            self.handle_chat_message(state, response, inbound, message)?;
        }
        Ok(())
    }

    fn handle_pair_installation(
        &self,
        state: &mut MessengerState,
        response: &mut MessengerResponse,
        inbound: &InboundMessage,
        pair: &PairInstallation,
    ) {
        let me = self.me();
        if inbound.signer != me {
            warn!(signer = %inbound.signer, "Ignoring pair installation from another identity");
            return;
        }
        if pair.installation_id == self.config.installation_id {
            return;
        }
        let installation = state
            .installations
            .entry(pair.installation_id.clone())
            .or_insert_with(|| Installation {
                id: pair.installation_id.clone(),
                identity: me,
                enabled: false,
                name: String::new(),
                device_type: String::new(),
                timestamp: 0,
            });
        if pair.clock < installation.timestamp {
            return;
        }
        installation.name = pair.name.clone();
        installation.device_type = pair.device_type.clone();
        installation.timestamp = pair.clock;
        info!(installation_id = %pair.installation_id, name = %pair.name, "Paired installation metadata updated");
        response.add_installation(installation.clone());
    }

    fn handle_contact_update(
        &self,
        state: &mut MessengerState,
        response: &mut MessengerResponse,
        inbound: &InboundMessage,
        update: &ContactUpdate,
    ) {
        if inbound.signer == self.me() {
            return;
        }
        let contact = state
            .contacts
            .entry(inbound.signer)
            .or_insert_with(|| new_contact(&inbound.signer));
        if apply_contact_update(contact, update) {
            debug!(contact = %inbound.signer, clock = update.clock, "Contact updated");
            response.add_contact(contact.clone());
        }
    }
}

/// User-visible record of a membership event. Its ID is derived from the
/// event signature so re-delivery maps to the same message.
fn system_message(event: &MembershipUpdateEvent, chat_id: &str, received_at: u64, own: bool) -> Message {
    let actor = event.from.short();
    let text = match event.kind {
        MembershipEventKind::ChatCreated => {
            format!("{actor} created the group {}", event.name.as_deref().unwrap_or_default())
        }
        MembershipEventKind::NameChanged => {
            format!("{actor} changed the group name to {}", event.name.as_deref().unwrap_or_default())
        }
        MembershipEventKind::MembersAdded => format!("{actor} added {}", short_list(&event.members)),
        MembershipEventKind::MemberJoined => format!("{actor} joined the group"),
        MembershipEventKind::MemberRemoved => match event.member {
            Some(member) if member == event.from => format!("{actor} left the group"),
            Some(member) => format!("{actor} removed {}", member.short()),
            None => format!("{actor} removed a member"),
        },
        MembershipEventKind::AdminsAdded => {
            format!("{actor} made {} admin", short_list(&event.members))
        }
    };
    Message {
        id: event.system_message_id(),
        chat_id: chat_id.to_string(),
        from: event.from,
        clock: event.clock,
        whisper_timestamp: received_at,
        timestamp: received_at,
        text,
        content_type: ContentType::SystemMembership,
        outgoing_status: None,
        seen: own,
        response_to: None,
    }
}

fn short_list(users: &[UserId]) -> String {
    users
        .iter()
        .map(UserId::short)
        .collect::<Vec<_>>()
        .join(", ")
}
