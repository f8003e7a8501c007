//! Chat identity, clocks and inbound chat resolution.

use std::collections::HashMap;

use tracing::debug;

use murmur_shared::protocol::{ChatMessage, ChatType};
use murmur_shared::UserId;
use murmur_store::Chat;

use crate::error::ChatResolutionError;
use crate::group::Group;

/// Canonical one-to-one chat ID: the peer's `0x`-prefixed key hex.
pub fn one_to_one_chat_id(peer: &UserId) -> String {
    peer.to_hex()
}

/// A fresh group chat ID owned by `creator`.
pub fn group_chat_id(creator: &UserId) -> String {
    format!("{}-{}", uuid::Uuid::new_v4(), creator.to_hex())
}

/// Lamport clock for the next local event in `chat`, kept close to wall time.
pub fn next_clock(chat: &Chat, now: u64) -> u64 {
    chat.last_clock_value.saturating_add(1).max(now)
}

/// Outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Existing(String),
    /// Not known locally yet; the caller stores it.
    Created(Chat),
}

impl Resolved {
    pub fn chat_id(&self) -> &str {
        match self {
            Resolved::Existing(id) => id,
            Resolved::Created(chat) => &chat.id,
        }
    }
}

/// Find the chat an inbound chat message belongs to.
///
/// `signer` is the authoritative author of the message and `me` the local
/// identity.
pub fn resolve_chat(
    chats: &HashMap<String, Chat>,
    me: &UserId,
    signer: &UserId,
    message: &ChatMessage,
    now: u64,
) -> Result<Resolved, ChatResolutionError> {
    match message.chat_type {
        ChatType::Public => match chats.get(&message.chat_id) {
            Some(chat) if chat.chat_type == ChatType::Public => Ok(Resolved::Existing(chat.id.clone())),
            Some(chat) => Err(ChatResolutionError::ChatTypeMismatch {
                chat_id: chat.id.clone(),
                existing: chat.chat_type,
            }),
            None => Err(ChatResolutionError::PublicChatNotFound(message.chat_id.clone())),
        },
        ChatType::OneToOne => {
            // Our own message synced from another device names the recipient.
            let peer = if signer == me {
                UserId::from_hex(&message.chat_id)
                    .map_err(|_| ChatResolutionError::InvalidChatId(message.chat_id.clone()))?
            } else {
                *signer
            };
            let chat_id = one_to_one_chat_id(&peer);
            match chats.get(&chat_id) {
                Some(chat) if chat.chat_type == ChatType::OneToOne => Ok(Resolved::Existing(chat_id)),
                Some(chat) => Err(ChatResolutionError::ChatTypeMismatch {
                    chat_id,
                    existing: chat.chat_type,
                }),
                None => {
                    debug!(chat_id = %chat_id, "Creating one-to-one chat for inbound message");
                    let name = crate::contact::alias_for(&peer);
                    Ok(Resolved::Created(Chat::new(chat_id, ChatType::OneToOne, name, now)))
                }
            }
        }
        ChatType::PrivateGroup => {
            let no_match = |reason: &str| ChatResolutionError::NoMatchingGroupChat {
                chat_id: message.chat_id.clone(),
                reason: reason.to_string(),
            };
            let chat = chats
                .get(&message.chat_id)
                .filter(|chat| chat.chat_type == ChatType::PrivateGroup)
                .ok_or_else(|| no_match("unknown group"))?;
            let group = Group::derive(&chat.id, &chat.membership_updates);
            if !group.is_joined(signer) {
                return Err(no_match("sender has not joined"));
            }
            if !group.is_joined(me) {
                return Err(no_match("we have not joined"));
            }
            Ok(Resolved::Existing(chat.id.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_shared::protocol::{ContentType, MembershipUpdateEvent};
    use murmur_shared::Identity;

    fn message(chat_id: &str, chat_type: ChatType) -> ChatMessage {
        ChatMessage {
            clock: 1,
            timestamp: 1,
            text: "hi".into(),
            chat_id: chat_id.into(),
            response_to: None,
            chat_type,
            content_type: ContentType::Text,
        }
    }

    #[test]
    fn test_next_clock() {
        let mut chat = Chat::new("status", ChatType::Public, "status", 0);
        assert_eq!(next_clock(&chat, 100), 100);
        chat.last_clock_value = 500;
        assert_eq!(next_clock(&chat, 100), 501);
        chat.last_clock_value = u64::MAX;
        assert_eq!(next_clock(&chat, 100), u64::MAX);
    }

    #[test]
    fn test_group_chat_id_ends_with_creator() {
        let creator = Identity::generate().user_id();
        assert!(crate::group::chat_id_matches_creator(&group_chat_id(&creator), &creator));
        assert_ne!(group_chat_id(&creator), group_chat_id(&creator));
    }

    #[test]
    fn test_public_chat_must_exist() {
        let me = Identity::generate().user_id();
        let peer = Identity::generate().user_id();
        let mut chats = HashMap::new();
        let msg = message("status", ChatType::Public);

        assert_eq!(
            resolve_chat(&chats, &me, &peer, &msg, 0),
            Err(ChatResolutionError::PublicChatNotFound("status".into()))
        );
        chats.insert("status".into(), Chat::new("status", ChatType::Public, "status", 0));
        assert_eq!(
            resolve_chat(&chats, &me, &peer, &msg, 0),
            Ok(Resolved::Existing("status".into()))
        );
    }

    #[test]
    fn test_one_to_one_from_peer_creates_chat_by_signer() {
        let me = Identity::generate().user_id();
        let peer = Identity::generate().user_id();
        // The chat ID field is the sender's view (our key); it is ignored.
        let msg = message(&me.to_hex(), ChatType::OneToOne);

        let resolved = resolve_chat(&HashMap::new(), &me, &peer, &msg, 7).unwrap();
        match resolved {
            Resolved::Created(chat) => {
                assert_eq!(chat.id, peer.to_hex());
                assert_eq!(chat.chat_type, ChatType::OneToOne);
            }
            other => panic!("unexpected resolution {other:?}"),
        }
    }

    #[test]
    fn test_one_to_one_from_self_uses_chat_id() {
        let me = Identity::generate().user_id();
        let peer = Identity::generate().user_id();
        let msg = message(&peer.to_hex(), ChatType::OneToOne);
        let resolved = resolve_chat(&HashMap::new(), &me, &me, &msg, 0).unwrap();
        assert_eq!(resolved.chat_id(), peer.to_hex());

        let bad = message("not-a-key", ChatType::OneToOne);
        assert_eq!(
            resolve_chat(&HashMap::new(), &me, &me, &bad, 0),
            Err(ChatResolutionError::InvalidChatId("not-a-key".into()))
        );
    }

    #[test]
    fn test_group_requires_both_joined() {
        let me = Identity::generate();
        let admin = Identity::generate();
        let outsider = Identity::generate().user_id();
        let chat_id = group_chat_id(&admin.user_id());

        let mut chat = Chat::new(&chat_id, ChatType::PrivateGroup, "g", 0);
        chat.membership_updates = vec![
            MembershipUpdateEvent::chat_created(&admin, &chat_id, "g", 1).unwrap(),
            MembershipUpdateEvent::members_added(&admin, &chat_id, vec![me.user_id()], 2).unwrap(),
        ];
        let mut chats = HashMap::new();
        chats.insert(chat_id.clone(), chat.clone());
        let msg = message(&chat_id, ChatType::PrivateGroup);

        // We were added but have not joined.
        assert!(matches!(
            resolve_chat(&chats, &me.user_id(), &admin.user_id(), &msg, 0),
            Err(ChatResolutionError::NoMatchingGroupChat { .. })
        ));

        chat.membership_updates
            .push(MembershipUpdateEvent::member_joined(&me, &chat_id, 3).unwrap());
        chats.insert(chat_id.clone(), chat);
        assert_eq!(
            resolve_chat(&chats, &me.user_id(), &admin.user_id(), &msg, 0),
            Ok(Resolved::Existing(chat_id.clone()))
        );
        // A sender outside the joined set is rejected.
        assert!(matches!(
            resolve_chat(&chats, &me.user_id(), &outsider, &msg, 0),
            Err(ChatResolutionError::NoMatchingGroupChat { .. })
        ));
        // Unknown group.
        let unknown = message("missing", ChatType::PrivateGroup);
        assert!(resolve_chat(&chats, &me.user_id(), &admin.user_id(), &unknown, 0).is_err());
    }
}
