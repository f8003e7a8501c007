//! Inbound message pipeline.
//!
//! Every envelope goes through five stages in order: transport signature,
//! decryption, sync unpacking, metadata signature and application decoding.
//! Only the first stage can reject an envelope outright. The sync stage may
//! fan one envelope out into several [`InboundMessage`]s.

use tracing::{debug, warn};

use murmur_net::{Envelope, EnvelopeHash};
use murmur_shared::protocol::{ApplicationMessage, ApplicationMetadata, MessageType};
use murmur_shared::{message_id, MessageId, Topic, UserId};
use murmur_store::Installation;

use crate::datasync::DataSync;
use crate::encryption::{EncryptionError, EncryptionProtocol, ProtocolMessage, SharedSecret};
use crate::error::Result;

/// One message as it moves through the pipeline.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub transport_hash: EnvelopeHash,
    pub topic: Topic,
    /// Transport timestamp in milliseconds.
    pub whisper_timestamp: u64,
    /// Key that signed the envelope.
    pub transport_signer: UserId,
    /// Authoritative author. Equals `transport_signer` unless the payload
    /// carried its own signature.
    pub signer: UserId,
    pub transport_payload: Vec<u8>,
    pub decrypted_payload: Vec<u8>,
    pub application_payload: Vec<u8>,
    pub id: MessageId,
    pub message_type: Option<MessageType>,
    pub message: ApplicationMessage,
}

impl InboundMessage {
    /// Transport stage. A bad envelope signature is fatal for the message.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        let sender = envelope.verify()?;
        Ok(Self {
            transport_hash: envelope.hash(),
            topic: envelope.topic.clone(),
            whisper_timestamp: envelope.timestamp,
            transport_signer: sender,
            signer: sender,
            transport_payload: envelope.payload.clone(),
            decrypted_payload: envelope.payload.clone(),
            application_payload: Vec::new(),
            id: message_id(&sender, &envelope.payload),
            message_type: None,
            message: ApplicationMessage::Unknown,
        })
    }
}

/// Everything one envelope produced.
#[derive(Debug, Default)]
pub struct PipelineOutput {
    pub messages: Vec<InboundMessage>,
    pub shared_secrets: Vec<SharedSecret>,
    pub installations: Vec<Installation>,
    /// Sender that encrypted for a device we do not have a key for.
    pub advertise_to: Option<UserId>,
}

pub struct Pipeline<'a> {
    encryption: &'a EncryptionProtocol,
    datasync: &'a DataSync,
}

impl<'a> Pipeline<'a> {
    pub fn new(encryption: &'a EncryptionProtocol, datasync: &'a DataSync) -> Self {
        Self {
            encryption,
            datasync,
        }
    }

    pub fn run(&self, envelope: &Envelope) -> Result<PipelineOutput> {
        let mut output = PipelineOutput::default();
        let mut message = InboundMessage::from_envelope(envelope)?;

        if !self.decrypt(&mut message, &mut output) {
            return Ok(output);
        }

        let bodies = self
            .datasync
            .handle(&message.transport_signer, &message.decrypted_payload)?;
        if bodies.len() != 1 || bodies[0] != message.decrypted_payload {
            debug!(hash = %message.transport_hash, bodies = bodies.len(), "Unpacked sync payload");
        }

        for body in bodies {
            let mut inner = message.clone();
            inner.decrypted_payload = body;
            if !unwrap_metadata(&mut inner) {
                continue;
            }
            decode_application(&mut inner);
            output.messages.push(inner);
        }
        Ok(output)
    }

    /// Encryption stage. Returns `false` when there is nothing left to process.
    fn decrypt(&self, message: &mut InboundMessage, output: &mut PipelineOutput) -> bool {
        let protocol = match ProtocolMessage::from_bytes(&message.transport_payload) {
            Ok(Some(protocol)) => protocol,
            Ok(None) => return true,
            Err(e) => {
                debug!(hash = %message.transport_hash, error = %e, "Undecodable encryption envelope");
                return true;
            }
        };

        match self.encryption.decrypt(&message.transport_signer, &protocol) {
            Ok(response) => {
                output.shared_secrets.extend(response.shared_secrets);
                output.installations.extend(response.installations);
                match response.plaintext {
                    Some(plaintext) => {
                        message.decrypted_payload = plaintext;
                        true
                    }
                    None => {
                        debug!(sender = %message.transport_signer, "Received bundle advertisement");
                        false
                    }
                }
            }
            Err(EncryptionError::NotAddressed) => {
                debug!(hash = %message.transport_hash, "Skipping message for another identity");
                false
            }
            Err(EncryptionError::DeviceNotFound) => {
                debug!(
                    hash = %message.transport_hash,
                    sender = %message.transport_signer,
                    "Message not addressed to this device"
                );
                output.advertise_to = Some(message.transport_signer);
                true
            }
            Err(e) => {
                warn!(hash = %message.transport_hash, sender = %message.transport_signer, error = %e, "Failed to decrypt message");
                true
            }
        }
    }
}

/// Metadata stage. Returns `false` when the message must be dropped.
fn unwrap_metadata(message: &mut InboundMessage) -> bool {
    match ApplicationMetadata::unwrap(&message.decrypted_payload) {
        Ok(Some(metadata)) => {
            if let Err(e) = metadata.verify() {
                warn!(hash = %message.transport_hash, signer = %metadata.signer, error = %e, "Dropping message with invalid signature");
                return false;
            }
            message.id = message_id(&metadata.signer, &message.decrypted_payload);
            message.signer = metadata.signer;
            message.message_type = Some(metadata.kind);
            message.application_payload = metadata.payload;
            true
        }
        Ok(None) => {
            message.id = message_id(&message.transport_signer, &message.decrypted_payload);
            message.signer = message.transport_signer;
            message.message_type = None;
            message.application_payload = message.decrypted_payload.clone();
            true
        }
        Err(e) => {
            warn!(hash = %message.transport_hash, error = %e, "Dropping malformed metadata envelope");
            false
        }
    }
}

/// Application stage. Anything that does not decode to the announced kind is `Unknown`.
fn decode_application(message: &mut InboundMessage) {
    let decoded = ApplicationMessage::from_bytes(&message.application_payload);
    message.message = match (message.message_type, decoded.kind()) {
        (Some(expected), Some(actual)) if expected != actual => {
            warn!(id = %message.id, expected = expected.as_str(), actual = actual.as_str(), "Message kind mismatch");
            ApplicationMessage::Unknown
        }
        _ => decoded,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use murmur_net::OutgoingEnvelope;
    use murmur_shared::protocol::{ChatMessage, ChatType, ContentType};
    use murmur_shared::Identity;
    use murmur_store::Database;

    use crate::datasync::GroupId;

    fn protocol(identity: &Arc<Identity>) -> EncryptionProtocol {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        EncryptionProtocol::new(Arc::clone(identity), "device-1", Duration::from_secs(60), db).unwrap()
    }

    fn chat(text: &str) -> ApplicationMessage {
        ApplicationMessage::Chat(ChatMessage {
            clock: 1,
            timestamp: 1,
            text: text.into(),
            chat_id: "status".into(),
            response_to: None,
            chat_type: ChatType::Public,
            content_type: ContentType::Text,
        })
    }

    fn seal(identity: &Identity, payload: Vec<u8>) -> Envelope {
        Envelope::seal(identity, OutgoingEnvelope::new(Topic::public("status"), payload)).unwrap()
    }

    #[test]
    fn test_signed_public_message() {
        let alice = Arc::new(Identity::generate());
        let bob = Arc::new(Identity::generate());
        let encryption = protocol(&bob);
        let sync = DataSync::new(bob.user_id(), false);

        let wrapped =
            ApplicationMetadata::wrap(&alice, MessageType::ChatMessage, chat("hi").to_bytes().unwrap())
                .unwrap();
        let payload = protocol(&alice).encrypt_public(&wrapped).to_bytes().unwrap();
        let envelope = seal(&alice, payload);

        let output = Pipeline::new(&encryption, &sync).run(&envelope).unwrap();
        assert_eq!(output.messages.len(), 1);
        let message = &output.messages[0];
        assert_eq!(message.signer, alice.user_id());
        assert_eq!(message.id, message_id(&alice.user_id(), &wrapped));
        assert_eq!(message.message, chat("hi"));
    }

    #[test]
    fn test_metadata_signer_overrides_relay() {
        let author = Identity::generate();
        let relay = Arc::new(Identity::generate());
        let me = Arc::new(Identity::generate());
        let wrapped =
            ApplicationMetadata::wrap(&author, MessageType::ChatMessage, chat("relayed").to_bytes().unwrap())
                .unwrap();

        let output = Pipeline::new(&protocol(&me), &DataSync::new(me.user_id(), false))
            .run(&seal(&relay, wrapped.clone()))
            .unwrap();
        let message = &output.messages[0];
        assert_eq!(message.transport_signer, relay.user_id());
        assert_eq!(message.signer, author.user_id());
        assert_eq!(message.id, message_id(&author.user_id(), &wrapped));
    }

    #[test]
    fn test_unsigned_payload_uses_transport_key() {
        let alice = Identity::generate();
        let me = Arc::new(Identity::generate());
        let raw = chat("plain").to_bytes().unwrap();

        let output = Pipeline::new(&protocol(&me), &DataSync::new(me.user_id(), false))
            .run(&seal(&alice, raw.clone()))
            .unwrap();
        let message = &output.messages[0];
        assert_eq!(message.id, message_id(&alice.user_id(), &raw));
        assert_eq!(message.message_type, None);
        assert_eq!(message.message, chat("plain"));
    }

    #[test]
    fn test_forged_envelope_is_rejected() {
        let alice = Identity::generate();
        let me = Arc::new(Identity::generate());
        let mut envelope = seal(&alice, b"payload".to_vec());
        envelope.payload = b"tampered".to_vec();

        let result = Pipeline::new(&protocol(&me), &DataSync::new(me.user_id(), false)).run(&envelope);
        assert!(result.is_err());
    }

    #[test]
    fn test_undecodable_payload_is_unknown() {
        let alice = Identity::generate();
        let me = Arc::new(Identity::generate());
        let output = Pipeline::new(&protocol(&me), &DataSync::new(me.user_id(), false))
            .run(&seal(&alice, vec![0xff; 3]))
            .unwrap();
        assert_eq!(output.messages[0].message, ApplicationMessage::Unknown);
    }

    #[test]
    fn test_sync_payload_fans_out() {
        let alice = Arc::new(Identity::generate());
        let bob = Arc::new(Identity::generate());
        let sender = DataSync::new(alice.user_id(), true);
        let group = GroupId::one_to_one(&alice.user_id(), &bob.user_id());
        sender.add_peer(group, bob.user_id()).unwrap();

        let first =
            ApplicationMetadata::wrap(&alice, MessageType::ChatMessage, chat("one").to_bytes().unwrap()).unwrap();
        let second =
            ApplicationMetadata::wrap(&alice, MessageType::ChatMessage, chat("two").to_bytes().unwrap()).unwrap();
        sender.append_message(group, first).unwrap();
        sender.append_message(group, second).unwrap();
        let job = sender.tick().unwrap().pop().unwrap();

        let encryption = protocol(&bob);
        let sync = DataSync::new(bob.user_id(), true);
        let output = Pipeline::new(&encryption, &sync).run(&seal(&alice, job.payload)).unwrap();
        let mut texts: Vec<String> = output
            .messages
            .iter()
            .filter_map(|m| match &m.message {
                ApplicationMessage::Chat(chat) => Some(chat.text.clone()),
                _ => None,
            })
            .collect();
        texts.sort();
        assert_eq!(texts, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn test_foreign_device_requests_advertisement() {
        let alice = Arc::new(Identity::generate());
        let bob = Arc::new(Identity::generate());
        let alice_protocol = protocol(&alice);
        let bob_other_device = {
            let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
            EncryptionProtocol::new(Arc::clone(&bob), "device-2", Duration::from_secs(60), db).unwrap()
        };

        // Alice learns the bundle of Bob's second device only.
        alice_protocol
            .decrypt(&bob.user_id(), &bob_other_device.build_bundle_advertisement())
            .unwrap();
        let spec = alice_protocol.encrypt_direct(&bob.user_id(), b"secret").unwrap();
        let envelope = seal(&alice, spec.to_bytes().unwrap());

        let bob_first_device = protocol(&bob);
        let output = Pipeline::new(&bob_first_device, &DataSync::new(bob.user_id(), false))
            .run(&envelope)
            .unwrap();
        assert_eq!(output.advertise_to, Some(alice.user_id()));
        // The sender's bundle is still learned.
        assert!(bob_first_device.negotiated_secret(&alice.user_id()).unwrap().is_some());
    }
}
