// src/rendezvous.rs - Peer directory for NAT-traversal introduction
//
// Peers register under a 256-bit id together with every address they can be
// reached at; meet() performs the atomic introduction of two peers. A single
// mutex guards both indices; introduction is rare next to media IO so
// contention is a non-issue.

use crate::net::SocketAddress;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// 256-bit peer identity as carried on the wire.
pub type PeerId = [u8; 32];

struct Peer<D> {
    address: SocketAddress,
    server_address: SocketAddress,
    /// Further addresses the peer advertised (local interfaces, relays).
    addresses: HashSet<SocketAddress>,
    data: Option<Arc<D>>,
}

struct Indexes<D> {
    by_id: HashMap<PeerId, Peer<D>>,
    by_address: HashMap<SocketAddress, PeerId>,
}

/// Thread-safe rendezvous directory, generic over the opaque per-peer
/// payload a protocol wants returned on introduction.
pub struct RendezVous<D = ()> {
    indexes: Mutex<Indexes<D>>,
}

impl<D> Default for RendezVous<D> {
    fn default() -> RendezVous<D> {
        RendezVous::new()
    }
}

impl<D> RendezVous<D> {
    pub fn new() -> RendezVous<D> {
        RendezVous {
            indexes: Mutex::new(Indexes {
                by_id: HashMap::new(),
                by_address: HashMap::new(),
            }),
        }
    }

    /// Insert or update a peer record; a duplicate id replaces the previous
    /// entry entirely (including its address index entries).
    pub fn set(
        &self,
        peer_id: PeerId,
        address: SocketAddress,
        server_address: SocketAddress,
        addresses: HashSet<SocketAddress>,
        data: Option<Arc<D>>,
    ) {
        let mut indexes = self.indexes.lock().unwrap();
        if let Some(previous) = indexes.by_id.remove(&peer_id) {
            indexes.by_address.remove(&previous.address);
            for extra in &previous.addresses {
                indexes.by_address.remove(extra);
            }
        }
        indexes.by_address.insert(address, peer_id);
        for extra in &addresses {
            indexes.by_address.insert(*extra, peer_id);
        }
        indexes.by_id.insert(
            peer_id,
            Peer {
                address,
                server_address,
                addresses,
                data,
            },
        );
    }

    /// Remove a peer from both indices.
    pub fn erase(&self, peer_id: &PeerId) {
        let mut indexes = self.indexes.lock().unwrap();
        if let Some(peer) = indexes.by_id.remove(peer_id) {
            indexes.by_address.remove(&peer.address);
            for extra in &peer.addresses {
                indexes.by_address.remove(extra);
            }
        }
    }

    pub fn lookup_by_address(&self, address: &SocketAddress) -> Option<PeerId> {
        self.indexes.lock().unwrap().by_address.get(address).copied()
    }

    /// Atomic introduction: A (at `a_address`, advertising `a_addresses`)
    /// asks to meet B. On success B's contact set is written into
    /// `b_address`/`b_addresses` and B's opaque payload is returned for A to
    /// hand to its protocol. A's contact data is opportunistically merged
    /// into B's record when A is already registered.
    pub fn meet(
        &self,
        a_address: &SocketAddress,
        b_peer_id: &PeerId,
        a_addresses: &HashSet<SocketAddress>,
        b_address: &mut SocketAddress,
        b_addresses: &mut HashSet<SocketAddress>,
    ) -> Option<Arc<D>> {
        let mut indexes = self.indexes.lock().unwrap();

        // remember A's freshest contact data while we hold the lock
        if let Some(a_id) = indexes.by_address.get(a_address).copied() {
            if let Some(a_peer) = indexes.by_id.get_mut(&a_id) {
                a_peer.address = *a_address;
                a_peer.addresses.extend(a_addresses.iter().copied());
            }
        }

        let Some(b_peer) = indexes.by_id.get(b_peer_id) else {
            debug!("meet with an unknown peer");
            return None;
        };
        *b_address = b_peer.address;
        b_addresses.clear();
        b_addresses.extend(b_peer.addresses.iter().copied());
        b_addresses.insert(b_peer.server_address);
        b_peer.data.clone()
    }
}
