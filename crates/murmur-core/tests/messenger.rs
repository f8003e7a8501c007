use std::sync::{Arc, Mutex};
use std::time::Duration;

use murmur_core::encryption::EncryptionProtocol;
use murmur_core::processor::MessageProcessor;
use murmur_core::{MessageBody, Messenger, MessengerConfig, MessengerError, SharedDatabase};
use murmur_net::{DeliveryUpdate, MemoryHub, MemoryTransport};
use murmur_shared::protocol::{
    ApplicationMessage, ChatMessage, ChatType, ContentType, MembershipUpdateEvent,
    MembershipUpdateMessage, PairInstallation,
};
use murmur_shared::{Identity, MessageId, UserId};
use murmur_store::{Database, OutgoingStatus};

struct Peer {
    identity: Arc<Identity>,
    transport: Arc<MemoryTransport>,
    db: SharedDatabase,
    messenger: Messenger,
}

impl Peer {
    fn id(&self) -> UserId {
        self.identity.user_id()
    }
}

async fn peer_with(hub: &MemoryHub, identity: Arc<Identity>, config: MessengerConfig) -> Peer {
    let transport = Arc::new(hub.connect(Arc::clone(&identity)).await);
    let db: SharedDatabase = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
    let messenger = Messenger::new(
        Arc::clone(&identity),
        transport.clone(),
        Arc::clone(&db),
        config,
    )
    .unwrap();
    messenger.init().await.unwrap();
    Peer {
        identity,
        transport,
        db,
        messenger,
    }
}

async fn peer(hub: &MemoryHub) -> Peer {
    peer_with(hub, Arc::new(Identity::generate()), MessengerConfig::default()).await
}

async fn wait_for_status(peer: &Peer, id: &MessageId, status: OutgoingStatus) {
    for _ in 0..100 {
        if peer.messenger.message_by_id(id).unwrap().outgoing_status == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("message {id} never reached {status:?}");
}

/// A bare processor for an identity, used to send what a messenger would not.
async fn raw_processor(hub: &MemoryHub, identity: &Arc<Identity>) -> MessageProcessor {
    let config = MessengerConfig::default();
    let transport = Arc::new(hub.connect(Arc::clone(identity)).await);
    let db: SharedDatabase = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
    let encryption = Arc::new(
        EncryptionProtocol::new(
            Arc::clone(identity),
            &config.installation_id,
            config.bundle_advertise_interval,
            db,
        )
        .unwrap(),
    );
    MessageProcessor::new(Arc::clone(identity), transport, encryption, config)
}

fn chat_texts(response: &murmur_core::MessengerResponse) -> Vec<String> {
    response
        .messages
        .iter()
        .filter(|m| m.content_type != ContentType::SystemMembership)
        .map(|m| m.text.clone())
        .collect()
}

#[tokio::test]
async fn test_one_to_one_round_trip() {
    let hub = MemoryHub::new();
    let alice = peer(&hub).await;
    let bob = peer(&hub).await;
    alice.messenger.start().await.unwrap();

    alice.messenger.create_one_to_one_chat(&bob.id()).await.unwrap();
    let sent = alice
        .messenger
        .send_chat_message(&bob.id().to_hex(), MessageBody::text("hello bob"))
        .await
        .unwrap();
    let id = sent.messages[0].id;
    assert_eq!(sent.messages[0].outgoing_status, Some(OutgoingStatus::Sending));
    wait_for_status(&alice, &id, OutgoingStatus::Sent).await;

    let received = bob.messenger.retrieve_all().await.unwrap();
    assert_eq!(chat_texts(&received), vec!["hello bob".to_string()]);
    assert_eq!(received.messages[0].id, id);
    assert_eq!(received.messages[0].from, alice.id());
    let chat = bob.messenger.chat(&alice.id().to_hex()).await.unwrap();
    assert_eq!(chat.chat_type, ChatType::OneToOne);
    assert_eq!(chat.unviewed_count, 1);
    assert_eq!(chat.last_message_id, Some(id));
    assert_eq!(received.contacts.len(), 1);
    assert_eq!(received.contacts[0].id, alice.id());

    // The reply travels on the negotiated topic and lands in Bob's chat at Alice.
    bob.messenger
        .send_chat_message(&alice.id().to_hex(), MessageBody::text("hi alice"))
        .await
        .unwrap();
    let reply = alice.messenger.retrieve_all().await.unwrap();
    assert_eq!(chat_texts(&reply), vec!["hi alice".to_string()]);
    assert_eq!(reply.messages[0].chat_id, bob.id().to_hex());

    alice.messenger.shutdown().await;
}

#[tokio::test]
async fn test_clock_increases_per_chat() {
    let hub = MemoryHub::new();
    let alice = peer(&hub).await;
    let bob = peer(&hub).await;
    alice.messenger.create_one_to_one_chat(&bob.id()).await.unwrap();

    let chat_id = bob.id().to_hex();
    let first = alice
        .messenger
        .send_chat_message(&chat_id, MessageBody::text("one"))
        .await
        .unwrap();
    let second = alice
        .messenger
        .send_chat_message(&chat_id, MessageBody::text("two"))
        .await
        .unwrap();
    assert!(second.messages[0].clock > first.messages[0].clock);
    assert_ne!(first.messages[0].id, second.messages[0].id);
}

#[tokio::test]
async fn test_send_to_unknown_chat_fails() {
    let hub = MemoryHub::new();
    let alice = peer(&hub).await;
    let result = alice
        .messenger
        .send_chat_message("nowhere", MessageBody::text("lost"))
        .await;
    assert!(matches!(result, Err(MessengerError::ChatNotFound(_))));
}

#[tokio::test]
async fn test_public_chat_reaches_joined_peers_only() {
    let hub = MemoryHub::new();
    let alice = peer(&hub).await;
    let bob = peer(&hub).await;
    let carol = peer(&hub).await;

    alice.messenger.join_public_chat("status").await.unwrap();
    bob.messenger.join_public_chat("status").await.unwrap();
    alice
        .messenger
        .send_chat_message("status", MessageBody::text("gm"))
        .await
        .unwrap();

    let received = bob.messenger.retrieve_all().await.unwrap();
    assert_eq!(chat_texts(&received), vec!["gm".to_string()]);
    assert_eq!(received.messages[0].chat_id, "status");
    assert!(carol.messenger.retrieve_all().await.unwrap().is_empty());

    // Leaving stops delivery.
    bob.messenger.deactivate_chat("status").await.unwrap();
    alice
        .messenger
        .send_chat_message("status", MessageBody::text("anyone?"))
        .await
        .unwrap();
    assert!(bob.messenger.retrieve_all().await.unwrap().messages.is_empty());
}

#[tokio::test]
async fn test_group_lifecycle() {
    let hub = MemoryHub::new();
    let alice = peer(&hub).await;
    let bob = peer(&hub).await;
    let carol = peer(&hub).await;

    let created = alice
        .messenger
        .create_group_chat_with_members("hikers", &[bob.id(), carol.id()])
        .await
        .unwrap();
    let chat_id = created.chats[0].id.clone();
    assert!(chat_id.ends_with(&alice.id().to_hex()));
    assert_eq!(created.messages.len(), 2);

    for member in [&bob, &carol] {
        let received = member.messenger.retrieve_all().await.unwrap();
        assert_eq!(received.chats.len(), 1);
        assert_eq!(received.chats[0].name, "hikers");
        assert_eq!(received.chats[0].chat_type, ChatType::PrivateGroup);
        assert_eq!(received.messages.len(), 2);
        assert!(received
            .messages
            .iter()
            .all(|m| m.content_type == ContentType::SystemMembership));
    }

    // Invited but not joined yet.
    let early = carol
        .messenger
        .send_chat_message(&chat_id, MessageBody::text("me too"))
        .await;
    assert!(matches!(early, Err(MessengerError::NotPermitted(_))));

    bob.messenger.confirm_joining_group(&chat_id).await.unwrap();
    let joined = alice.messenger.retrieve_all().await.unwrap();
    assert_eq!(joined.messages.len(), 1);
    carol.messenger.retrieve_all().await.unwrap();

    alice
        .messenger
        .send_chat_message(&chat_id, MessageBody::text("trail at 9"))
        .await
        .unwrap();
    let at_bob = bob.messenger.retrieve_all().await.unwrap();
    assert_eq!(chat_texts(&at_bob), vec!["trail at 9".to_string()]);
    assert!(carol.messenger.retrieve_all().await.unwrap().messages.is_empty());

    // Only admins rename.
    let denied = bob.messenger.change_group_chat_name(&chat_id, "bob's").await;
    assert!(matches!(denied, Err(MessengerError::NotPermitted(_))));
    alice
        .messenger
        .change_group_chat_name(&chat_id, "summit")
        .await
        .unwrap();
    bob.messenger.retrieve_all().await.unwrap();
    assert_eq!(bob.messenger.chat(&chat_id).await.unwrap().name, "summit");
}

#[tokio::test]
async fn test_admins_and_removal() {
    let hub = MemoryHub::new();
    let alice = peer(&hub).await;
    let bob = peer(&hub).await;
    let carol = peer(&hub).await;

    let created = alice
        .messenger
        .create_group_chat_with_members("ops", &[bob.id(), carol.id()])
        .await
        .unwrap();
    let chat_id = created.chats[0].id.clone();
    bob.messenger.retrieve_all().await.unwrap();
    carol.messenger.retrieve_all().await.unwrap();

    alice
        .messenger
        .add_admins_to_group_chat(&chat_id, &[bob.id()])
        .await
        .unwrap();
    bob.messenger.retrieve_all().await.unwrap();
    carol.messenger.retrieve_all().await.unwrap();

    // Bob is now an admin and may remove Carol, but never the creator.
    let creator = bob
        .messenger
        .remove_member_from_group_chat(&chat_id, &alice.id())
        .await;
    assert!(matches!(creator, Err(MessengerError::NotPermitted(_))));
    bob.messenger
        .remove_member_from_group_chat(&chat_id, &carol.id())
        .await
        .unwrap();

    carol.messenger.retrieve_all().await.unwrap();
    let at_carol = carol.messenger.chat(&chat_id).await.unwrap();
    assert!(!at_carol.active);

    alice.messenger.retrieve_all().await.unwrap();
    let at_alice = alice.messenger.chat(&chat_id).await.unwrap();
    let group = murmur_core::Group::derive(&chat_id, &at_alice.membership_updates);
    assert!(!group.is_member(&carol.id()));
    assert!(group.is_admin_member(&bob.id()));
}

#[tokio::test]
async fn test_leave_group() {
    let hub = MemoryHub::new();
    let alice = peer(&hub).await;
    let bob = peer(&hub).await;

    let created = alice
        .messenger
        .create_group_chat_with_members("pair", &[bob.id()])
        .await
        .unwrap();
    let chat_id = created.chats[0].id.clone();
    bob.messenger.retrieve_all().await.unwrap();

    let left = bob.messenger.leave_group_chat(&chat_id).await.unwrap();
    assert!(!left.chats[0].active);

    alice.messenger.retrieve_all().await.unwrap();
    let chat = alice.messenger.chat(&chat_id).await.unwrap();
    let group = murmur_core::Group::derive(&chat_id, &chat.membership_updates);
    assert!(!group.is_member(&bob.id()));
    assert!(chat.active);
}

#[tokio::test]
async fn test_membership_events_held_until_group_is_known() {
    let hub = MemoryHub::new();
    let bob = peer(&hub).await;

    // Drive the creator at the processor level to deliver its log out of order.
    let alice = Arc::new(Identity::generate());
    let processor = raw_processor(&hub, &alice).await;

    let chat_id = format!("late-{}", alice.user_id().to_hex());
    let created = MembershipUpdateEvent::chat_created(&alice, &chat_id, "late", 1).unwrap();
    let added = MembershipUpdateEvent::members_added(&alice, &chat_id, vec![bob.id()], 2).unwrap();

    let update = |events: Vec<MembershipUpdateEvent>| {
        ApplicationMessage::MembershipUpdate(MembershipUpdateMessage {
            chat_id: chat_id.clone(),
            events,
            message: None,
        })
    };

    let partial = processor.wrap(&update(vec![added])).unwrap();
    processor.send_group(&[bob.id()], &partial).await.unwrap();
    assert!(bob.messenger.retrieve_all().await.unwrap().is_empty());
    assert!(bob.messenger.chat(&chat_id).await.is_none());

    let rest = processor.wrap(&update(vec![created])).unwrap();
    processor.send_group(&[bob.id()], &rest).await.unwrap();
    let received = bob.messenger.retrieve_all().await.unwrap();
    assert_eq!(received.messages.len(), 2);

    let chat = bob.messenger.chat(&chat_id).await.unwrap();
    assert_eq!(chat.membership_updates.len(), 2);
    assert!(murmur_core::Group::derive(&chat_id, &chat.membership_updates).is_member(&bob.id()));
}

#[tokio::test]
async fn test_resend_keeps_message_id() {
    let hub = MemoryHub::new();
    let alice = peer(&hub).await;
    let bob = peer(&hub).await;
    alice.messenger.create_one_to_one_chat(&bob.id()).await.unwrap();

    let sent = alice
        .messenger
        .send_chat_message(&bob.id().to_hex(), MessageBody::text("again"))
        .await
        .unwrap();
    let id = sent.messages[0].id;
    assert_eq!(bob.messenger.retrieve_all().await.unwrap().messages.len(), 1);

    alice.messenger.re_send_chat_message(&id).await.unwrap();
    // Same ID, so the second copy is a duplicate.
    assert!(bob.messenger.retrieve_all().await.unwrap().messages.is_empty());
    let raw = alice.db.lock().unwrap().get_raw_message(&id).unwrap();
    assert_eq!(raw.send_count, 2);

    let missing = alice.messenger.re_send_chat_message(&MessageId([7; 32])).await;
    assert!(matches!(missing, Err(MessengerError::MessageNotFound(_))));
}

#[tokio::test]
async fn test_deleted_chat_ignores_older_messages() {
    let hub = MemoryHub::new();
    let alice = peer(&hub).await;
    let bob = peer(&hub).await;
    alice.messenger.create_one_to_one_chat(&bob.id()).await.unwrap();
    let chat_at_alice = bob.id().to_hex();
    let chat_at_bob = alice.id().to_hex();

    alice
        .messenger
        .send_chat_message(&chat_at_alice, MessageBody::text("first"))
        .await
        .unwrap();
    bob.messenger.retrieve_all().await.unwrap();
    let deleted = bob.messenger.deactivate_chat(&chat_at_bob).await.unwrap();
    assert!(!deleted.chats[0].active);
    assert_eq!(
        deleted.chats[0].deleted_at_clock_value,
        deleted.chats[0].last_clock_value
    );

    alice
        .messenger
        .send_chat_message(&chat_at_alice, MessageBody::text("second"))
        .await
        .unwrap();
    let received = bob.messenger.retrieve_all().await.unwrap();
    assert_eq!(chat_texts(&received), vec!["second".to_string()]);
    assert!(bob.messenger.chat(&chat_at_bob).await.unwrap().active);
}

#[tokio::test]
async fn test_mark_messages_seen_updates_unviewed_count() {
    let hub = MemoryHub::new();
    let alice = peer(&hub).await;
    let bob = peer(&hub).await;
    alice.messenger.create_one_to_one_chat(&bob.id()).await.unwrap();
    for text in ["a", "b"] {
        alice
            .messenger
            .send_chat_message(&bob.id().to_hex(), MessageBody::text(text))
            .await
            .unwrap();
    }
    let received = bob.messenger.retrieve_all().await.unwrap();
    let chat_id = alice.id().to_hex();
    assert_eq!(bob.messenger.chat(&chat_id).await.unwrap().unviewed_count, 2);

    let first = received.messages[0].id;
    let seen = bob.messenger.mark_messages_seen(&chat_id, &[first]).await.unwrap();
    assert_eq!(seen.chats[0].unviewed_count, 1);
    assert!(bob.messenger.message_by_id(&first).unwrap().seen);
}

#[tokio::test]
async fn test_contact_update_newest_name_wins() {
    let hub = MemoryHub::new();
    let alice = peer(&hub).await;
    let bob = peer(&hub).await;

    alice.messenger.send_contact_update(&bob.id(), "Alice").await.unwrap();
    let received = bob.messenger.retrieve_all().await.unwrap();
    assert_eq!(received.contacts.len(), 1);
    assert_eq!(received.contacts[0].name, "Alice");
    assert!(received.contacts[0].has_tag(murmur_store::TAG_REQUEST_RECEIVED));

    alice.messenger.send_contact_update(&bob.id(), "Ally").await.unwrap();
    bob.messenger.retrieve_all().await.unwrap();
    let contacts = bob.messenger.contacts().await;
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].name, "Ally");

    let at_alice = alice.messenger.contacts().await;
    assert!(at_alice[0].has_tag(murmur_store::TAG_CONTACT_ADDED));
}

#[tokio::test]
async fn test_paired_device_receives_own_messages() {
    let hub = MemoryHub::new();
    let identity = Arc::new(Identity::generate());
    let laptop = peer_with(&hub, Arc::clone(&identity), MessengerConfig::default()).await;
    let phone_config = MessengerConfig {
        device_name: "phone".into(),
        ..MessengerConfig::default()
    };
    let phone_installation = phone_config.installation_id.clone();
    let phone = peer_with(&hub, Arc::clone(&identity), phone_config).await;
    let bob = peer(&hub).await;

    phone.messenger.send_pair_installation().await.unwrap();
    let paired = laptop.messenger.retrieve_all().await.unwrap();
    let installation = paired
        .installations
        .iter()
        .find(|i| i.id == phone_installation)
        .unwrap();
    assert_eq!(installation.name, "phone");
    assert!(!installation.enabled);

    laptop
        .messenger
        .enable_installation(&phone_installation)
        .await
        .unwrap();
    laptop.messenger.create_one_to_one_chat(&bob.id()).await.unwrap();
    laptop
        .messenger
        .send_chat_message(&bob.id().to_hex(), MessageBody::text("from laptop"))
        .await
        .unwrap();

    let synced = phone.messenger.retrieve_all().await.unwrap();
    assert_eq!(chat_texts(&synced), vec!["from laptop".to_string()]);
    let message = synced
        .messages
        .iter()
        .find(|m| m.text == "from laptop")
        .unwrap();
    assert_eq!(message.chat_id, bob.id().to_hex());
    assert_eq!(message.outgoing_status, Some(OutgoingStatus::Sent));

    let at_bob = bob.messenger.retrieve_all().await.unwrap();
    assert_eq!(chat_texts(&at_bob), vec!["from laptop".to_string()]);
}

#[tokio::test]
async fn test_offline_send_expires() {
    let hub = MemoryHub::new();
    let config = MessengerConfig {
        max_attempts: 1,
        ..MessengerConfig::default()
    };
    let alice = peer_with(&hub, Arc::new(Identity::generate()), config).await;
    let bob = peer(&hub).await;
    alice.messenger.start().await.unwrap();
    alice.transport.set_offline(true).await;
    let mut updates = alice.messenger.subscribe_delivery_updates();

    alice.messenger.create_one_to_one_chat(&bob.id()).await.unwrap();
    let sent = alice
        .messenger
        .send_chat_message(&bob.id().to_hex(), MessageBody::text("void"))
        .await
        .unwrap();
    let id = sent.messages[0].id;

    let update = tokio::time::timeout(Duration::from_secs(5), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(update, DeliveryUpdate::Expired { ref ids, .. } if ids == &vec![id]));
    assert_eq!(
        alice.messenger.message_by_id(&id).unwrap().outgoing_status,
        Some(OutgoingStatus::Sending)
    );
    alice.messenger.shutdown().await;
}

#[tokio::test]
async fn test_datasync_delivery() {
    let hub = MemoryHub::new();
    let config = MessengerConfig {
        datasync_enabled: true,
        datasync_interval: Duration::from_millis(20),
        ..MessengerConfig::default()
    };
    let alice = peer_with(&hub, Arc::new(Identity::generate()), config.clone()).await;
    let bob = peer_with(&hub, Arc::new(Identity::generate()), config).await;
    alice.messenger.start().await.unwrap();
    bob.messenger.start().await.unwrap();

    alice.messenger.create_one_to_one_chat(&bob.id()).await.unwrap();
    alice
        .messenger
        .send_chat_message(&bob.id().to_hex(), MessageBody::text("reliable"))
        .await
        .unwrap();

    let mut texts = Vec::new();
    for _ in 0..100 {
        texts.extend(chat_texts(&bob.messenger.retrieve_all().await.unwrap()));
        if !texts.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(texts, vec!["reliable".to_string()]);

    alice.messenger.shutdown().await;
    bob.messenger.shutdown().await;
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("murmur.db");
    let hub = MemoryHub::new();
    let identity = Arc::new(Identity::generate());
    let bob = peer(&hub).await;
    let config = MessengerConfig::default();

    let open = || -> SharedDatabase { Arc::new(Mutex::new(Database::open_at(&path).unwrap())) };
    let transport = Arc::new(hub.connect(Arc::clone(&identity)).await);
    let first = Messenger::new(Arc::clone(&identity), transport, open(), config.clone()).unwrap();
    first.init().await.unwrap();
    first.create_one_to_one_chat(&bob.id()).await.unwrap();
    let sent = first
        .send_chat_message(&bob.id().to_hex(), MessageBody::text("persisted"))
        .await
        .unwrap();
    first.join_public_chat("status").await.unwrap();
    drop(first);

    let transport = Arc::new(hub.connect(Arc::clone(&identity)).await);
    let second = Messenger::new(Arc::clone(&identity), transport, open(), config).unwrap();
    second.init().await.unwrap();
    let chat = second.chat(&bob.id().to_hex()).await.unwrap();
    assert_eq!(chat.last_message_id, Some(sent.messages[0].id));
    assert!(second.chat("status").await.is_some());
    assert_eq!(
        second.message_by_id(&sent.messages[0].id).unwrap().text,
        "persisted"
    );
    assert_eq!(second.installations().await.len(), 1);
}

#[tokio::test]
async fn test_chat_history_pages_newest_first() {
    let hub = MemoryHub::new();
    let alice = peer(&hub).await;
    let bob = peer(&hub).await;
    let chat_id = bob.id().to_hex();
    alice.messenger.create_one_to_one_chat(&bob.id()).await.unwrap();
    for text in ["one", "two", "three"] {
        alice
            .messenger
            .send_chat_message(&chat_id, MessageBody::text(text))
            .await
            .unwrap();
    }

    let texts = |page: Vec<murmur_store::Message>| page.into_iter().map(|m| m.text).collect::<Vec<_>>();
    assert_eq!(texts(alice.messenger.chat_messages(&chat_id, 2, 0).unwrap()), ["three", "two"]);
    assert_eq!(texts(alice.messenger.chat_messages(&chat_id, 2, 2).unwrap()), ["one"]);
}

#[tokio::test]
async fn test_events_from_non_members_are_not_shown() {
    let hub = MemoryHub::new();
    let alice = peer(&hub).await;
    let bob = peer(&hub).await;
    let mallory = Arc::new(Identity::generate());
    let eve = Identity::generate().user_id();
    let forger = raw_processor(&hub, &mallory).await;

    let created = alice
        .messenger
        .create_group_chat_with_members("book club", &[bob.id()])
        .await
        .unwrap();
    let chat_id = created.chats[0].id.clone();
    bob.messenger.retrieve_all().await.unwrap();
    bob.messenger.confirm_joining_group(&chat_id).await.unwrap();
    let clock_before = bob.messenger.chat(&chat_id).await.unwrap().last_clock_value;

    let forged = MembershipUpdateEvent::members_added(&mallory, &chat_id, vec![eve], u64::MAX - 1).unwrap();
    let update = forger
        .wrap(&ApplicationMessage::MembershipUpdate(MembershipUpdateMessage {
            chat_id: chat_id.clone(),
            events: vec![forged],
            message: None,
        }))
        .unwrap();
    forger.send_group(&[bob.id()], &update).await.unwrap();

    let received = bob.messenger.retrieve_all().await.unwrap();
    assert!(received.messages.is_empty());
    let chat = bob.messenger.chat(&chat_id).await.unwrap();
    assert_eq!(chat.last_clock_value, clock_before);
    assert!(!murmur_core::Group::derive(&chat_id, &chat.membership_updates).is_member(&eve));

    bob.messenger
        .send_chat_message(&chat_id, MessageBody::text("still fine"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_huge_public_clock_does_not_break_sending() {
    let hub = MemoryHub::new();
    let bob = peer(&hub).await;
    let mallory = Arc::new(Identity::generate());
    let forger = raw_processor(&hub, &mallory).await;
    bob.messenger.join_public_chat("status").await.unwrap();

    let shout = forger
        .wrap(&ApplicationMessage::Chat(ChatMessage {
            clock: u64::MAX,
            timestamp: 1,
            text: "last word".into(),
            chat_id: "status".into(),
            response_to: None,
            chat_type: ChatType::Public,
            content_type: ContentType::Text,
        }))
        .unwrap();
    forger.send_public("status", &shout).await.unwrap();
    assert_eq!(chat_texts(&bob.messenger.retrieve_all().await.unwrap()), ["last word"]);

    let sent = bob
        .messenger
        .send_chat_message("status", MessageBody::text("reply"))
        .await
        .unwrap();
    assert_eq!(sent.messages[0].clock, u64::MAX);
}

#[tokio::test]
async fn test_pairing_from_another_identity_is_ignored() {
    let hub = MemoryHub::new();
    let bob = peer(&hub).await;
    let mallory = Arc::new(Identity::generate());
    let forger = raw_processor(&hub, &mallory).await;
    let paired_before = bob.messenger.installations().await.len();

    let pair = forger
        .wrap(&ApplicationMessage::PairInstallation(PairInstallation {
            clock: 1,
            installation_id: "mallory-phone".into(),
            device_type: "phone".into(),
            name: "totally bob".into(),
        }))
        .unwrap();
    forger.send_private(&bob.id(), &pair).await.unwrap();

    assert!(bob.messenger.retrieve_all().await.unwrap().is_empty());
    let installations = bob.messenger.installations().await;
    assert_eq!(installations.len(), paired_before);
    assert!(installations.iter().all(|i| i.id != "mallory-phone"));
}
