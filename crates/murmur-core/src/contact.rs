//! Contacts: lazy creation, deterministic aliases and last-writer-wins updates.

use murmur_shared::protocol::ContactUpdate;
use murmur_shared::UserId;
use murmur_store::{Contact, TAG_REQUEST_RECEIVED};

const ADJECTIVES: &[&str] = &[
    "Amber", "Brave", "Calm", "Dusky", "Eager", "Fancy", "Gentle", "Hidden", "Icy", "Jolly",
    "Keen", "Lucky", "Misty", "Noble", "Odd", "Proud", "Quiet", "Rapid", "Silent", "Tidy",
    "Upbeat", "Vivid", "Wild", "Young",
];

const ANIMALS: &[&str] = &[
    "Albatross", "Badger", "Crane", "Dingo", "Egret", "Falcon", "Gecko", "Heron", "Ibis",
    "Jackal", "Kestrel", "Lemur", "Marten", "Newt", "Otter", "Puffin", "Quail", "Raven",
    "Stoat", "Tapir", "Urchin", "Vole", "Wombat", "Yak",
];

/// Three-word display name derived from the key. Stable across devices.
pub fn alias_for(user: &UserId) -> String {
    let hash = blake3::hash(user.as_bytes());
    let bytes = hash.as_bytes();
    let pick = |list: &[&'static str], byte: u8| list[byte as usize % list.len()];
    format!(
        "{} {} {}",
        pick(ADJECTIVES, bytes[0]),
        pick(ADJECTIVES, bytes[1]),
        pick(ANIMALS, bytes[2])
    )
}

/// `#rrggbb` colour derived from the key.
pub fn identicon_for(user: &UserId) -> String {
    let hash = blake3::hash(user.as_bytes());
    format!("#{}", hex::encode(&hash.as_bytes()[..3]))
}

pub fn new_contact(user: &UserId) -> Contact {
    Contact {
        id: *user,
        name: String::new(),
        alias: alias_for(user),
        identicon: identicon_for(user),
        system_tags: Vec::new(),
        last_updated: 0,
        ens_verified: false,
    }
}

/// Apply an update received from the contact. Returns whether anything changed.
pub fn apply_contact_update(contact: &mut Contact, update: &ContactUpdate) -> bool {
    let mut changed = contact.add_tag(TAG_REQUEST_RECEIVED);
    if update.clock > contact.last_updated {
        contact.name = update.name.clone();
        contact.last_updated = update.clock;
        changed = true;
    }
    changed
}
