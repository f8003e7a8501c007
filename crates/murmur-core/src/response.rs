use serde::Serialize;

use murmur_store::{Chat, Contact, Installation, Message};

/// Everything a call touched, handed back to the caller or UI.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MessengerResponse {
    pub chats: Vec<Chat>,
    pub messages: Vec<Message>,
    pub contacts: Vec<Contact>,
    pub installations: Vec<Installation>,
}

impl MessengerResponse {
    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
            && self.messages.is_empty()
            && self.contacts.is_empty()
            && self.installations.is_empty()
    }

    /// Insert or replace by chat ID, keeping the latest copy.
    pub fn add_chat(&mut self, chat: Chat) {
        match self.chats.iter_mut().find(|c| c.id == chat.id) {
            Some(existing) => *existing = chat,
            None => self.chats.push(chat),
        }
    }

    pub fn add_message(&mut self, message: Message) {
        match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message,
            None => self.messages.push(message),
        }
    }

    pub fn add_contact(&mut self, contact: Contact) {
        match self.contacts.iter_mut().find(|c| c.id == contact.id) {
            Some(existing) => *existing = contact,
            None => self.contacts.push(contact),
        }
    }

    pub fn add_installation(&mut self, installation: Installation) {
        match self
            .installations
            .iter_mut()
            .find(|i| i.id == installation.id && i.identity == installation.identity)
        {
            Some(existing) => *existing = installation,
            None => self.installations.push(installation),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_shared::protocol::ChatType;

    #[test]
    fn test_add_chat_replaces_by_id() {
        let mut response = MessengerResponse::default();
        assert!(response.is_empty());

        let mut chat = Chat::new("status", ChatType::Public, "status", 0);
        response.add_chat(chat.clone());
        chat.unviewed_count = 3;
        response.add_chat(chat);

        assert_eq!(response.chats.len(), 1);
        assert_eq!(response.chats[0].unviewed_count, 3);
        assert!(response.to_json().unwrap().contains("\"status\""));
    }
}
