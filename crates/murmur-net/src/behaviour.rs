//! Composed libp2p `NetworkBehaviour` carrying murmur envelopes.
//!
//! GossipSub moves envelopes between topic subscribers, Kademlia finds more
//! peers beyond the bootstrap set and Identify advertises our listen addresses.

use libp2p::{
    gossipsub, identify,
    kad::{self, store::MemoryStore},
    swarm::NetworkBehaviour,
};

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "MurmurEvent")]
pub struct MurmurBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub kademlia: kad::Behaviour<MemoryStore>,
    pub identify: identify::Behaviour,
}

#[derive(Debug)]
pub enum MurmurEvent {
    Gossipsub(gossipsub::Event),
    Kademlia(kad::Event),
    Identify(identify::Event),
}

impl From<gossipsub::Event> for MurmurEvent {
    fn from(event: gossipsub::Event) -> Self {
        MurmurEvent::Gossipsub(event)
    }
}

impl From<kad::Event> for MurmurEvent {
    fn from(event: kad::Event) -> Self {
        MurmurEvent::Kademlia(event)
    }
}

impl From<identify::Event> for MurmurEvent {
    fn from(event: identify::Event) -> Self {
        MurmurEvent::Identify(event)
    }
}
