//! Group membership derived from the signed membership log.
//!
//! The log is the only stored state. [`Group::derive`] replays it in
//! `(clock, signature)` order and skips events that the state reached so far
//! does not permit, so any two peers holding the same set of events derive the
//! same group regardless of arrival order.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::debug;

use murmur_shared::protocol::{MembershipEventKind, MembershipUpdateEvent, MembershipUpdateMessage};
use murmur_shared::UserId;

use crate::error::ValidationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub id: UserId,
    pub admin: bool,
    pub joined: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Group {
    pub chat_id: String,
    pub name: String,
    pub creator: Option<UserId>,
    pub members: BTreeMap<UserId, GroupMember>,
    /// Signatures of the events the replay accepted.
    pub applied: BTreeSet<Vec<u8>>,
}

impl Group {
    /// Replay `events` from scratch. Events are not modified.
    pub fn derive(chat_id: &str, events: &[MembershipUpdateEvent]) -> Self {
        let mut group = Group {
            chat_id: chat_id.to_string(),
            ..Group::default()
        };
        for event in sorted_unique(events) {
            if event.chat_id != chat_id {
                continue;
            }
            if group.apply(event) {
                group.applied.insert(event.signature.clone());
            } else {
                debug!(chat_id, kind = ?event.kind, from = %event.from, clock = event.clock, "Skipping membership event");
            }
        }
        group
    }

    pub fn was_applied(&self, event: &MembershipUpdateEvent) -> bool {
        self.applied.contains(&event.signature)
    }

    fn is_admin(&self, user: &UserId) -> bool {
        self.members.get(user).is_some_and(|m| m.admin)
    }

    fn apply(&mut self, event: &MembershipUpdateEvent) -> bool {
        if self.creator.is_none() && event.kind != MembershipEventKind::ChatCreated {
            return false;
        }
        match event.kind {
            MembershipEventKind::ChatCreated => {
                if self.creator.is_some() || !chat_id_matches_creator(&event.chat_id, &event.from) {
                    return false;
                }
                self.creator = Some(event.from);
                self.name = event.name.clone().unwrap_or_default();
                self.members.insert(
                    event.from,
                    GroupMember {
                        id: event.from,
                        admin: true,
                        joined: true,
                    },
                );
            }
            MembershipEventKind::NameChanged => {
                let name = match &event.name {
                    Some(name) if !name.is_empty() => name,
                    _ => return false,
                };
                if !self.is_admin(&event.from) {
                    return false;
                }
                self.name = name.clone();
            }
            MembershipEventKind::MembersAdded => {
                if event.members.is_empty() || !self.is_admin(&event.from) {
                    return false;
                }
                for member in &event.members {
                    self.members.entry(*member).or_insert(GroupMember {
                        id: *member,
                        admin: false,
                        joined: false,
                    });
                }
            }
            MembershipEventKind::MemberJoined => {
                if event.member != Some(event.from) {
                    return false;
                }
                match self.members.get_mut(&event.from) {
                    Some(member) => member.joined = true,
                    None => return false,
                }
            }
            MembershipEventKind::MemberRemoved => {
                let member = match event.member {
                    Some(member) => member,
                    None => return false,
                };
                let leaving = member == event.from;
                let removable = self.is_admin(&event.from) && Some(member) != self.creator;
                if !(leaving || removable) || !self.members.contains_key(&member) {
                    return false;
                }
                self.members.remove(&member);
            }
            MembershipEventKind::AdminsAdded => {
                if event.members.is_empty() || Some(event.from) != self.creator {
                    return false;
                }
                if event.members.iter().any(|m| !self.members.contains_key(m)) {
                    return false;
                }
                for admin in &event.members {
                    if let Some(member) = self.members.get_mut(admin) {
                        member.admin = true;
                    }
                }
            }
        }
        true
    }

    pub fn is_member(&self, user: &UserId) -> bool {
        self.members.contains_key(user)
    }

    pub fn is_joined(&self, user: &UserId) -> bool {
        self.members.get(user).is_some_and(|m| m.joined)
    }

    pub fn is_admin_member(&self, user: &UserId) -> bool {
        self.is_admin(user)
    }

    pub fn member_ids(&self) -> Vec<UserId> {
        self.members.keys().copied().collect()
    }

    pub fn joined_member_ids(&self) -> Vec<UserId> {
        self.members
            .values()
            .filter(|m| m.joined)
            .map(|m| m.id)
            .collect()
    }

    pub fn admin_ids(&self) -> Vec<UserId> {
        self.members
            .values()
            .filter(|m| m.admin)
            .map(|m| m.id)
            .collect()
    }
}

/// Group chat IDs end with the creator's key.
pub fn chat_id_matches_creator(chat_id: &str, creator: &UserId) -> bool {
    chat_id.ends_with(&creator.to_hex())
}

fn sorted_unique(events: &[MembershipUpdateEvent]) -> Vec<&MembershipUpdateEvent> {
    let mut seen = HashSet::new();
    let mut unique: Vec<&MembershipUpdateEvent> = events
        .iter()
        .filter(|e| seen.insert(e.signature.as_slice()))
        .collect();
    unique.sort_by(|a, b| (a.clock, &a.signature).cmp(&(b.clock, &b.signature)));
    unique
}

/// Set union of two logs, sorted by `(clock, signature)`.
pub fn merge_events(
    local: &[MembershipUpdateEvent],
    remote: &[MembershipUpdateEvent],
) -> Vec<MembershipUpdateEvent> {
    let all: Vec<MembershipUpdateEvent> = local.iter().chain(remote).cloned().collect();
    sorted_unique(&all).into_iter().cloned().collect()
}

/// Structural checks run before a membership update touches any state.
pub fn validate_update(update: &MembershipUpdateMessage) -> Result<(), ValidationError> {
    if update.events.is_empty() {
        return Err(ValidationError::NoEvents);
    }
    for event in &update.events {
        if event.chat_id != update.chat_id {
            return Err(ValidationError::ChatIdMismatch {
                update: update.chat_id.clone(),
                event: event.chat_id.clone(),
            });
        }
        if event.verify().is_err() {
            return Err(ValidationError::InvalidSignature(event.from.to_hex()));
        }
        if event.kind == MembershipEventKind::ChatCreated
            && !chat_id_matches_creator(&event.chat_id, &event.from)
        {
            return Err(ValidationError::InvalidCreator(event.chat_id.clone()));
        }
    }
    if let Some(message) = &update.message {
        if message.chat_id != update.chat_id {
            return Err(ValidationError::ChatIdMismatch {
                update: update.chat_id.clone(),
                event: message.chat_id.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_shared::Identity;

    struct Fixture {
        admin: Identity,
        bob: Identity,
        carol: Identity,
        chat_id: String,
    }

    fn fixture() -> Fixture {
        let admin = Identity::generate();
        let chat_id = format!("c0ffee-{}", admin.user_id().to_hex());
        Fixture {
            admin,
            bob: Identity::generate(),
            carol: Identity::generate(),
            chat_id,
        }
    }

    fn base_log(f: &Fixture) -> Vec<MembershipUpdateEvent> {
        vec![
            MembershipUpdateEvent::chat_created(&f.admin, &f.chat_id, "friends", 1).unwrap(),
            MembershipUpdateEvent::members_added(
                &f.admin,
                &f.chat_id,
                vec![f.bob.user_id(), f.carol.user_id()],
                2,
            )
            .unwrap(),
            MembershipUpdateEvent::member_joined(&f.bob, &f.chat_id, 3).unwrap(),
        ]
    }

    #[test]
    fn test_unauthorized_event_is_not_applied() {
        let f = fixture();
        let mallory = Identity::generate();
        let mut log = base_log(&f);
        let forged =
            MembershipUpdateEvent::members_added(&mallory, &f.chat_id, vec![mallory.user_id()], 4)
                .unwrap();
        log.push(forged.clone());

        let group = Group::derive(&f.chat_id, &log);
        assert!(!group.was_applied(&forged));
        assert!(log[..3].iter().all(|e| group.was_applied(e)));
        assert!(!group.is_member(&mallory.user_id()));
    }

    #[test]
    fn test_replay_derives_members() {
        let f = fixture();
        let group = Group::derive(&f.chat_id, &base_log(&f));

        assert_eq!(group.name, "friends");
        assert_eq!(group.creator, Some(f.admin.user_id()));
        assert!(group.is_joined(&f.admin.user_id()));
        assert!(group.is_joined(&f.bob.user_id()));
        assert!(group.is_member(&f.carol.user_id()));
        assert!(!group.is_joined(&f.carol.user_id()));
        assert_eq!(group.admin_ids(), vec![f.admin.user_id()]);
    }

    #[test]
    fn test_every_permutation_converges() {
        let f = fixture();
        let mut log = base_log(&f);
        log.push(MembershipUpdateEvent::name_changed(&f.admin, &f.chat_id, "renamed", 3).unwrap());
        log.push(MembershipUpdateEvent::member_removed(&f.carol, &f.chat_id, f.carol.user_id(), 4).unwrap());

        let expected = Group::derive(&f.chat_id, &log);
        // Rotations and reversals of the same set, plus duplicates.
        for shift in 0..log.len() {
            let mut permuted = log.clone();
            permuted.rotate_left(shift);
            assert_eq!(Group::derive(&f.chat_id, &permuted), expected);
            permuted.reverse();
            permuted.extend(log.iter().cloned());
            assert_eq!(Group::derive(&f.chat_id, &permuted), expected);
        }
        assert!(!expected.is_member(&f.carol.user_id()));
    }

    #[test]
    fn test_members_added_before_chat_created_arrives() {
        let f = fixture();
        let created = MembershipUpdateEvent::chat_created(&f.admin, &f.chat_id, "g", 1).unwrap();
        let added =
            MembershipUpdateEvent::members_added(&f.admin, &f.chat_id, vec![f.bob.user_id()], 5)
                .unwrap();

        // Only the later event is known at first: nothing can be derived yet.
        let partial = merge_events(&[], &[added.clone()]);
        assert!(Group::derive(&f.chat_id, &partial).members.is_empty());

        let merged = merge_events(&partial, &[created.clone()]);
        assert_eq!(
            Group::derive(&f.chat_id, &merged),
            Group::derive(&f.chat_id, &[created, added])
        );
        assert_eq!(merged[0].kind, MembershipEventKind::ChatCreated);
    }

    #[test]
    fn test_non_admin_cannot_add_or_rename() {
        let f = fixture();
        let mut log = base_log(&f);
        let dave = Identity::generate().user_id();
        log.push(MembershipUpdateEvent::members_added(&f.bob, &f.chat_id, vec![dave], 4).unwrap());
        log.push(MembershipUpdateEvent::name_changed(&f.bob, &f.chat_id, "hijacked", 5).unwrap());

        let group = Group::derive(&f.chat_id, &log);
        assert!(!group.is_member(&dave));
        assert_eq!(group.name, "friends");
    }

    #[test]
    fn test_join_requires_invitation_and_removal_rules() {
        let f = fixture();
        let outsider = Identity::generate();
        let mut log = base_log(&f);
        log.push(MembershipUpdateEvent::member_joined(&outsider, &f.chat_id, 4).unwrap());
        // A plain member cannot remove the creator.
        log.push(MembershipUpdateEvent::member_removed(&f.bob, &f.chat_id, f.admin.user_id(), 5).unwrap());
        // Only the creator may promote admins.
        log.push(MembershipUpdateEvent::admins_added(&f.bob, &f.chat_id, vec![f.bob.user_id()], 6).unwrap());

        let group = Group::derive(&f.chat_id, &log);
        assert!(!group.is_member(&outsider.user_id()));
        assert!(group.is_member(&f.admin.user_id()));
        assert!(!group.is_admin_member(&f.bob.user_id()));

        log.push(MembershipUpdateEvent::admins_added(&f.admin, &f.chat_id, vec![f.bob.user_id()], 7).unwrap());
        log.push(MembershipUpdateEvent::member_removed(&f.bob, &f.chat_id, f.carol.user_id(), 8).unwrap());
        let group = Group::derive(&f.chat_id, &log);
        assert!(group.is_admin_member(&f.bob.user_id()));
        assert!(!group.is_member(&f.carol.user_id()));
    }

    #[test]
    fn test_chat_created_by_wrong_key_is_ignored() {
        let f = fixture();
        let log = vec![MembershipUpdateEvent::chat_created(&f.bob, &f.chat_id, "fake", 1).unwrap()];
        assert!(Group::derive(&f.chat_id, &log).creator.is_none());
    }

    #[test]
    fn test_validate_update() {
        let f = fixture();
        let valid = MembershipUpdateMessage {
            chat_id: f.chat_id.clone(),
            events: base_log(&f),
            message: None,
        };
        assert!(validate_update(&valid).is_ok());

        let empty = MembershipUpdateMessage {
            events: Vec::new(),
            ..valid.clone()
        };
        assert_eq!(validate_update(&empty), Err(ValidationError::NoEvents));

        let mut forged = valid.clone();
        forged.events[1].clock = 99;
        assert!(matches!(validate_update(&forged), Err(ValidationError::InvalidSignature(_))));

        let mut foreign = valid;
        foreign.chat_id = "other".into();
        assert!(matches!(validate_update(&foreign), Err(ValidationError::ChatIdMismatch { .. })));
    }
}
