//! PEERS registry and NONCES (§2, §3).
use std::collections::{HashMap, HashSet};
use std::net;

use super::peer::Peer;
use super::{Link, PeerId};

/// The set of version-handshake nonces the local node generated, used to
/// detect self-connection (§4.2.1, §C "self-connection nonce
/// generation").
#[derive(Debug, Default)]
pub struct Nonces {
    seen: HashSet<u64>,
}

impl Nonces {
    /// Draw a fresh, guaranteed non-zero nonce and register it.
    pub fn generate(&mut self, rng: &fastrand::Rng) -> u64 {
        loop {
            let nonce = rng.u64(..);
            if nonce != 0 && self.seen.insert(nonce) {
                return nonce;
            }
        }
    }

    /// Whether a nonce is one of ours (a self-connection indicator).
    pub fn contains(&self, nonce: u64) -> bool {
        self.seen.contains(&nonce)
    }

    /// Remove a nonce, eg. when its peer disconnects (lifecycle, §3).
    pub fn remove(&mut self, nonce: u64) {
        self.seen.remove(&nonce);
    }
}

/// The peer registry: every live connection, plus the designated loader
/// and inbound/outbound counts. PEER is exclusively owned by its slot
/// here (§9); everything else only borrows (`&`/`&mut`).
#[derive(Debug, Default)]
pub struct Peers {
    by_addr: HashMap<PeerId, Peer>,
    /// Insertion order, used for round-robin/iteration purposes where the
    /// teacher's design calls for a "doubly-linked iteration list" — a
    /// plain `Vec` gives the same externally-observable order with none
    /// of the unsafe pointer plumbing a real linked list needs in safe
    /// Rust (§9 notes this is an implementation detail, not a contract).
    order: Vec<PeerId>,
    /// The single designated loader, if any (I1/P4).
    loader: Option<PeerId>,
    inbound: usize,
    outbound: usize,
}

impl Peers {
    /// Insert a newly created peer.
    pub fn insert(&mut self, peer: Peer) {
        let addr = peer.addr;
        match peer.link {
            Link::Inbound => self.inbound += 1,
            Link::Outbound => self.outbound += 1,
        }
        self.order.push(addr);
        self.by_addr.insert(addr, peer);
    }

    /// Remove a peer, eg. on disconnect (lifecycle, §3, P6).
    pub fn remove(&mut self, addr: &PeerId) -> Option<Peer> {
        let peer = self.by_addr.remove(addr)?;
        self.order.retain(|a| a != addr);
        match peer.link {
            Link::Inbound => self.inbound = self.inbound.saturating_sub(1),
            Link::Outbound => self.outbound = self.outbound.saturating_sub(1),
        }
        if self.loader == Some(*addr) {
            self.loader = None;
        }
        Some(peer)
    }

    /// Look up a peer.
    pub fn get(&self, addr: &PeerId) -> Option<&Peer> {
        self.by_addr.get(addr)
    }

    /// Look up a peer, mutably.
    pub fn get_mut(&mut self, addr: &PeerId) -> Option<&mut Peer> {
        self.by_addr.get_mut(addr)
    }

    /// Iterate over all peers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.order.iter().filter_map(|a| self.by_addr.get(a))
    }

    /// Iterate over all peers, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.by_addr.values_mut()
    }

    /// Number of inbound connections (accepted or negotiated).
    pub fn inbound(&self) -> usize {
        self.inbound
    }

    /// Number of outbound connections (dialed or negotiated).
    pub fn outbound(&self) -> usize {
        self.outbound
    }

    /// Total connection count.
    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    /// Whether we're already connected (or connecting) to this address
    /// (§4.3.2, "not already connected to").
    pub fn is_connected_to(&self, addr: &net::SocketAddr) -> bool {
        self.by_addr.contains_key(addr)
    }

    /// The current loader, if any (I1).
    pub fn loader(&self) -> Option<&Peer> {
        self.loader.and_then(|addr| self.by_addr.get(&addr))
    }

    /// The current loader's address.
    pub fn loader_addr(&self) -> Option<PeerId> {
        self.loader
    }

    /// Designate `addr` as the loader, clearing any previous one (I1).
    /// Returns `false` if `addr` isn't a known, connected peer.
    pub fn set_loader(&mut self, addr: PeerId) -> bool {
        if let Some(peer) = self.by_addr.get_mut(&addr) {
            if !peer.is_connected() {
                return false;
            }
        } else {
            return false;
        }
        if let Some(prev) = self.loader.take() {
            if let Some(peer) = self.by_addr.get_mut(&prev) {
                peer.is_loader = false;
            }
        }
        if let Some(peer) = self.by_addr.get_mut(&addr) {
            peer.is_loader = true;
        }
        self.loader = Some(addr);
        true
    }

    /// Clear the loader designation, eg. because it disconnected.
    pub fn clear_loader(&mut self) {
        if let Some(prev) = self.loader.take() {
            if let Some(peer) = self.by_addr.get_mut(&prev) {
                peer.is_loader = false;
            }
        }
    }

    /// The first negotiated outbound peer, a candidate to repurpose as
    /// loader (§4.3.1 rule 2).
    pub fn first_outbound_connected(&self) -> Option<PeerId> {
        self.order.iter().copied().find(|addr| {
            self.by_addr
                .get(addr)
                .map(|p| p.link.is_outbound() && p.is_connected())
                .unwrap_or(false)
        })
    }
}
