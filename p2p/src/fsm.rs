//! Bitcoin protocol state machine: wires the connection pool, per-peer
//! handshake, headers-first sync, inventory relay, and BIP152 compact
//! block reconstruction into a single [`nakamoto_net::StateMachine`].
#![warn(missing_docs)]
use std::fmt;
use std::net;
use std::sync::Arc;

use bitcoin::network::address::Address as WireAddress;
use bitcoin::network::constants::ServiceFlags;
use bitcoin::network::message::{NetworkMessage, RejectReason};
use bitcoin_hashes::{sha256d, Hash as _};

use nakamoto_common::block::time::{AdjustedClock, LocalDuration, LocalTime};
use nakamoto_common::block::tree::BlockTree;
use nakamoto_common::block::Height;
use nakamoto_common::mempool::Mempool;
use nakamoto_common::p2p::peer::{Source, Store};

pub mod event;
pub mod output;

mod addrmgr;
mod cmpctmgr;
mod config;
mod framer;
mod headers;
mod invmgr;
mod peer;
mod peermgr;
mod peers;
mod pingmgr;
mod syncmgr;

#[cfg(test)]
mod tests;

use addrmgr::AddressManager;
use cmpctmgr::CompactBlockManager;
use invmgr::InventoryManager;
use output::Outbox;
use peermgr::PeerManager;
use peers::{Nonces, Peers};
use pingmgr::PingManager;
use syncmgr::SyncManager;

pub use config::{Config, Limits};
pub use event::Event;
pub use nakamoto_net::Link;
pub use output::Io;

/// Peer-to-peer protocol version we speak.
pub const PROTOCOL_VERSION: u32 = 70016;
/// Minimum supported peer protocol version.
pub const MIN_PROTOCOL_VERSION: u32 = 70012;
/// Minimum version a peer must advertise before we honor `sendheaders`
/// (BIP130).
pub const HEADERS_VERSION: u32 = 70012;
/// Minimum version a peer must advertise before we negotiate compact
/// blocks (BIP152).
pub const COMPACT_VERSION: u32 = 70014;
/// User agent included in our `version` messages.
pub const USER_AGENT: &str = "/nakamoto:0.4.0/";

/// Identifies a peer by its socket address.
pub type PeerId = net::SocketAddr;

/// Reason code carried in a `reject` message we send, mirroring the
/// original's `BTC_REJECT_*` constants (§C, "`reject` construction").
#[derive(Debug, Clone, Copy)]
pub enum RejectCode {
    /// The message could not be parsed.
    Malformed,
    /// The message was parsed but semantically invalid.
    Invalid,
    /// The message refers to an obsolete protocol feature.
    Obsolete,
    /// The message duplicates something already processed.
    Duplicate,
    /// The transaction is non-standard.
    NonStandard,
    /// An output is below the dust threshold.
    Dust,
    /// The fee offered was too low.
    InsufficientFee,
    /// The transaction conflicts with a checkpoint.
    Checkpoint,
}

impl From<RejectCode> for RejectReason {
    fn from(code: RejectCode) -> Self {
        match code {
            RejectCode::Malformed => RejectReason::MalFormed,
            RejectCode::Invalid => RejectReason::Invalid,
            RejectCode::Obsolete => RejectReason::Obsolete,
            RejectCode::Duplicate => RejectReason::Duplicate,
            RejectCode::NonStandard => RejectReason::NonStandard,
            RejectCode::Dust => RejectReason::Dust,
            RejectCode::InsufficientFee => RejectReason::Fee,
            RejectCode::Checkpoint => RejectReason::Checkpoint,
        }
    }
}

/// Why a peer was disconnected.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// Peer is misbehaving; a protocol-violation ban score (100) was
    /// just applied.
    PeerMisbehaving(&'static str),
    /// Peer protocol version is too old.
    PeerProtocolVersion(u32),
    /// Peer doesn't have the required services.
    PeerServices(ServiceFlags),
    /// Peer chain is too far behind.
    PeerHeight(Height),
    /// Peer magic is invalid.
    PeerMagic(u32),
    /// Peer timed out against the policy table (§4.2.3).
    PeerTimeout(&'static str),
    /// Connection to self was detected via a NONCES match.
    SelfConnection,
    /// Inbound connection limit reached.
    ConnectionLimit,
    /// The peer's byte stream failed to frame.
    DecodeError(Arc<framer::Error>),
    /// Peer was disconnected for another reason.
    Other(&'static str),
}

impl DisconnectReason {
    /// Whether this reason may no longer apply after some time, eg. the
    /// peer is worth retrying later rather than banning persistently.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLimit | Self::PeerTimeout(_) | Self::PeerHeight(_)
        )
    }
}

impl From<DisconnectReason> for nakamoto_net::Disconnect<DisconnectReason> {
    fn from(reason: DisconnectReason) -> Self {
        Self::StateMachine(reason)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerMisbehaving(reason) => write!(f, "peer misbehaving: {}", reason),
            Self::PeerProtocolVersion(v) => write!(f, "peer protocol version too old: {}", v),
            Self::PeerServices(_) => write!(f, "peer doesn't have the required services"),
            Self::PeerHeight(h) => write!(f, "peer is too far behind: {}", h),
            Self::PeerMagic(magic) => write!(f, "received message with invalid magic: {}", magic),
            Self::PeerTimeout(s) => write!(f, "peer timed out: {}", s),
            Self::SelfConnection => write!(f, "detected self-connection"),
            Self::ConnectionLimit => write!(f, "inbound connection limit reached"),
            Self::DecodeError(err) => write!(f, "message decode error: {}", err),
            Self::Other(reason) => write!(f, "{}", reason),
        }
    }
}

fn framer_reason(err: &framer::Error) -> &'static str {
    match err {
        framer::Error::Magic(_) => "invalid magic",
        framer::Error::Command => "invalid command",
        framer::Error::PayloadTooLarge(_) => "payload too large",
        framer::Error::Checksum => "checksum mismatch",
        framer::Error::Decode(_) => "body decode error",
    }
}

/// The Bitcoin peer-to-peer protocol state machine (§1-§7 of the
/// networking core's design). Generic over the `CHAIN`, `MEMPOOL`,
/// `ADDRMAN` and `TIMEDATA` collaborators so that tests can swap in
/// in-memory mocks.
pub struct StateMachine<T, M, P, C> {
    config: Config,
    chain: T,
    mempool: M,
    clock: C,
    rng: fastrand::Rng,

    peers: Peers,
    nonces: Nonces,

    addrmgr: AddressManager<P>,
    syncmgr: SyncManager,
    pingmgr: PingManager,
    peermgr: PeerManager,
    invmgr: InventoryManager,
    cmpctmgr: CompactBlockManager,

    outbox: Outbox,
}

impl<T, M, P, C> StateMachine<T, M, P, C>
where
    T: BlockTree,
    M: Mempool,
    P: Store,
    C: AdjustedClock<PeerId>,
{
    /// Construct a state machine around its collaborators.
    pub fn new(chain: T, mempool: M, addresses: P, clock: C, rng: fastrand::Rng, config: Config) -> Self {
        let magic = config.network.magic();

        Self {
            addrmgr: AddressManager::new(addresses, config.clone(), rng.clone(), magic),
            syncmgr: SyncManager::new(config.clone(), magic),
            pingmgr: PingManager::new(rng.clone(), magic),
            peermgr: PeerManager::new(config.clone(), rng.clone(), magic),
            invmgr: InventoryManager::new(config.clone(), magic),
            cmpctmgr: CompactBlockManager::new(config.clone(), magic),
            outbox: Outbox::new(magic),
            peers: Peers::default(),
            nonces: Nonces::default(),
            chain,
            mempool,
            clock,
            rng,
            config,
        }
    }

    /// The active chain height.
    pub fn height(&self) -> Height {
        self.chain.height()
    }

    /// Number of connected peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn dispatch(&mut self, addr: PeerId, msg: NetworkMessage, now: LocalTime) {
        self.outbox.event(Event::MessageReceived {
            from: addr,
            message: Arc::new(msg.clone()),
        });
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.received(now);
        }

        let result: Result<(), DisconnectReason> = match msg {
            NetworkMessage::Version(v) => {
                let r = self
                    .peermgr
                    .received_version(&mut self.peers, &mut self.nonces, addr, v, now);
                if r.is_ok() {
                    let inbound_local = self
                        .peers
                        .get(&addr)
                        .filter(|p| p.link.is_inbound())
                        .map(|p| p.local_addr);
                    if let Some(local_addr) = inbound_local {
                        self.addrmgr.record_local(local_addr);
                    }
                }
                r
            }
            NetworkMessage::Verack => {
                let had_loader = self.peers.loader_addr();
                let r = self.peermgr.received_verack(&mut self.peers, addr, now);
                if r.is_ok() {
                    if let Some(services) = self.peers.get(&addr).map(|p| p.services) {
                        self.addrmgr.negotiated(&addr, services);
                    }
                    if had_loader.is_none() {
                        if let Some(loader) = self.peers.loader_addr() {
                            self.syncmgr.loader_changed(&self.chain, &mut self.peers, loader, now);
                        }
                    }
                }
                r
            }
            NetworkMessage::SendCmpct(s) => {
                self.peermgr
                    .received_sendcmpct(&mut self.peers, addr, s.send_compact, s.version);
                Ok(())
            }
            NetworkMessage::SendHeaders => {
                self.peermgr.received_sendheaders(&mut self.peers, addr);
                Ok(())
            }
            NetworkMessage::Ping(nonce) => {
                self.pingmgr.received_ping(&self.peers, addr, nonce);
                Ok(())
            }
            NetworkMessage::Pong(nonce) => {
                self.pingmgr
                    .received_pong(&mut self.peers, &mut self.clock, addr, nonce, now);
                Ok(())
            }
            NetworkMessage::GetAddr => {
                self.received_getaddr(addr);
                Ok(())
            }
            NetworkMessage::Addr(addrs) => self.received_addr(addr, addrs),
            NetworkMessage::Inv(inv) => self.invmgr.received_inv(&mut self.peers, addr, inv, now),
            NetworkMessage::GetData(inv) => {
                self.invmgr
                    .received_getdata(&self.chain, &self.mempool, &mut self.peers, addr, inv);
                Ok(())
            }
            NetworkMessage::NotFound(inv) => self.invmgr.received_notfound(&mut self.peers, addr, inv),
            NetworkMessage::GetBlocks(m) => {
                self.invmgr.received_getblocks(&self.chain, &mut self.peers, addr, m);
                Ok(())
            }
            NetworkMessage::GetHeaders(m) => {
                self.syncmgr.received_getheaders(&self.chain, addr, m);
                Ok(())
            }
            NetworkMessage::Headers(h) => self
                .syncmgr
                .received_headers(&mut self.chain, &mut self.peers, addr, h, now),
            NetworkMessage::Block(b) => self
                .invmgr
                .received_block(&mut self.chain, &mut self.peers, addr, b, now),
            NetworkMessage::Tx(tx) => self
                .invmgr
                .received_tx(&mut self.mempool, &mut self.peers, addr, tx),
            NetworkMessage::MemPool => {
                self.invmgr.received_mempool_request(&self.mempool, addr);
                Ok(())
            }
            NetworkMessage::FeeFilter(rate) => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.fee_rate_filter = Some(rate);
                }
                Ok(())
            }
            NetworkMessage::CmpctBlock(c) => self
                .cmpctmgr
                .received_cmpctblock(&mut self.chain, &self.mempool, &mut self.peers, addr, c, now),
            NetworkMessage::GetBlockTxn(m) => {
                self.cmpctmgr.received_getblocktxn(&self.chain, addr, m);
                Ok(())
            }
            NetworkMessage::BlockTxn(m) => {
                self.cmpctmgr
                    .received_blocktxn(&mut self.chain, &mut self.peers, addr, m, now);
                Ok(())
            }
            // Receiving `reject` is log-only (§4.3.4); it's already
            // surfaced via the `MessageReceived` event above. Sending our
            // own `reject` happens in `close()` for the handshake
            // rejections that warrant one (§C).
            _ => Ok(()),
        };

        if let Err(reason) = result {
            self.close(addr, reason);
        }
    }

    fn close(&mut self, addr: PeerId, reason: DisconnectReason) {
        // A protocol violation always carries the full ban score, which
        // always crosses the threshold and closes the connection
        // (`peer::ban::THRESHOLD == PROTOCOL_VIOLATION`).
        if let DisconnectReason::PeerMisbehaving(why) = reason {
            self.peermgr
                .misbehaved(&mut self.peers, addr, peer::ban::PROTOCOL_VIOLATION, why);
            // PROTOCOL_VIOLATION always crosses peer::ban::THRESHOLD, so the
            // peer above is always disconnected; ban its address too (I4:
            // "ban_score >= 100 => closed AND address banned").
            self.addrmgr.ban(&addr);
            return;
        }
        // `reject` isn't sent for every disconnect, only the handshake
        // rejections `pool.c` itself replies to before hanging up (§C).
        let reject = match &reason {
            DisconnectReason::PeerProtocolVersion(_) => {
                Some((RejectCode::Obsolete, "version is obsolete"))
            }
            DisconnectReason::PeerServices(_) => {
                Some((RejectCode::NonStandard, "required services not offered"))
            }
            DisconnectReason::SelfConnection => {
                Some((RejectCode::Duplicate, "connected to self"))
            }
            _ => None,
        };
        if let Some((ccode, why)) = reject {
            self.outbox
                .reject(addr, "version", ccode, why, sha256d::Hash::all_zeros());
        }
        self.outbox.disconnect(addr, reason);
    }

    fn received_getaddr(&mut self, addr: PeerId) {
        let eligible = self
            .peers
            .get(&addr)
            .map(|p| p.link.is_inbound() && !p.sent_getaddr)
            .unwrap_or(false);
        if !eligible {
            return;
        }
        let peers = &mut self.peers;
        let addrmgr = &mut self.addrmgr;

        if let Some(peer) = peers.get_mut(&addr) {
            peer.sent_getaddr = true;
            let filter = &mut peer.addr_filter;
            addrmgr.received_getaddr(addr, &mut |candidate| {
                if filter.contains(candidate) {
                    false
                } else {
                    filter.insert(candidate);
                    true
                }
            });
        }
    }

    fn received_addr(
        &mut self,
        from: PeerId,
        wire: Vec<(u32, WireAddress)>,
    ) -> Result<(), DisconnectReason> {
        let unsolicited_relay = wire.len() < 10;

        match self.addrmgr.received_addr(from, wire) {
            Ok(accepted) => {
                for addr in &accepted {
                    self.addrmgr.announce_discovery(*addr, Source::Peer(from));
                }
                if unsolicited_relay && !accepted.is_empty() {
                    self.relay_addr(from, &accepted);
                }
                Ok(())
            }
            Err(_) => Err(DisconnectReason::PeerMisbehaving("oversized addr message")),
        }
    }

    /// Forward a small, unsolicited `addr` batch to two other connected
    /// peers, same as Bitcoin Core's gossip amplification (§4.3.4: "if
    /// small (<10) and unsolicited ... forward to 2 peers").
    fn relay_addr(&mut self, from: PeerId, addrs: &[net::SocketAddr]) {
        let mut candidates: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|p| p.addr != from && p.is_connected())
            .map(|p| p.addr)
            .collect();
        if candidates.is_empty() {
            return;
        }
        // Partial Fisher-Yates: we only need up to 2 distinct picks.
        for i in 0..candidates.len().min(2) {
            let j = i + self.rng.usize(..candidates.len() - i);
            candidates.swap(i, j);
        }

        let wire: Vec<(u32, WireAddress)> = addrs
            .iter()
            .map(|a| (0u32, WireAddress::new(a, ServiceFlags::NONE)))
            .collect();

        for &to in candidates.iter().take(2) {
            self.outbox.message(to, NetworkMessage::Addr(wire.clone()));
        }
    }
}

impl<T, M, P, C> Iterator for StateMachine<T, M, P, C> {
    type Item = Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.outbox
            .next()
            .or_else(|| self.peermgr.next())
            .or_else(|| self.addrmgr.next())
            .or_else(|| self.syncmgr.next())
            .or_else(|| self.pingmgr.next())
            .or_else(|| self.invmgr.next())
            .or_else(|| self.cmpctmgr.next())
    }
}

impl<T, M, P, C> nakamoto_net::StateMachine for StateMachine<T, M, P, C>
where
    T: BlockTree,
    M: Mempool,
    P: Store,
    C: AdjustedClock<PeerId>,
{
    type Message = Vec<u8>;
    type Event = Event;
    type DisconnectReason = DisconnectReason;

    fn initialize(&mut self, time: LocalTime) {
        self.clock.set(time);
        self.outbox.event(Event::Initializing);
        self.outbox.set_timer(LocalDuration::from_secs(5));

        self.syncmgr.initialize(&self.chain, &mut self.peers, time);

        self.outbox.event(Event::Ready {
            tip: self.chain.height(),
            time,
        });
    }

    fn received_bytes(&mut self, addr: &net::SocketAddr, bytes: &[u8]) {
        let addr = *addr;
        let now = self.clock.local_time();
        let mut messages = Vec::new();

        let feed_result = match self.peers.get_mut(&addr) {
            Some(peer) if !peer.is_dead() => peer.decoder.feed(bytes, |msg| messages.push(msg)),
            _ => return,
        };

        if let Err(err) = feed_result {
            let reason = framer_reason(&err);
            self.outbox.event(Event::InvalidMessage { addr, reason });
            if let Some(peer) = self.peers.get_mut(&addr) {
                peer.misbehave(peer::ban::BAD_MESSAGE);
            }
            self.outbox.event(Event::PeerMisbehaved {
                addr,
                reason,
                score: peer::ban::BAD_MESSAGE,
            });
            // The decoder latches closed on any framing error, so this
            // connection is done regardless of whether the ban score
            // itself crossed the threshold.
            self.outbox.disconnect(addr, DisconnectReason::DecodeError(Arc::new(err)));
            return;
        }

        for msg in messages {
            self.dispatch(addr, msg, now);
            if self.peers.get(&addr).map(|p| p.is_dead()).unwrap_or(true) {
                break;
            }
        }
    }

    fn attempted(&mut self, addr: &net::SocketAddr) {
        self.addrmgr.attempted(addr);
    }

    fn connected(&mut self, addr: net::SocketAddr, local_addr: &net::SocketAddr, link: Link) {
        if link.is_inbound() && !self.peermgr.accepts_inbound(&self.peers) {
            self.outbox.disconnect(addr, DisconnectReason::ConnectionLimit);
            return;
        }
        let now = self.clock.local_time();
        self.peermgr
            .connected(&mut self.peers, &mut self.nonces, addr, *local_addr, link, now);
        if link.is_outbound() {
            self.addrmgr.connected(&addr);
        }
    }

    fn disconnected(&mut self, addr: &net::SocketAddr, reason: nakamoto_net::Disconnect<Self::DisconnectReason>) {
        let addr = *addr;
        let reason = match reason {
            nakamoto_net::Disconnect::StateMachine(r) => r,
            nakamoto_net::Disconnect::ConnectionError(err) => {
                log::debug!(target: "p2p::peermgr", "{}: connection error: {}", addr, err);
                DisconnectReason::Other("connection error")
            }
        };
        let was_loader = self.peers.loader_addr() == Some(addr);

        self.peermgr.disconnected(&mut self.peers, &mut self.nonces, addr, reason);

        if was_loader {
            if let Some(new_loader) = self.peers.loader_addr() {
                let now = self.clock.local_time();
                self.syncmgr.loader_changed(&self.chain, &mut self.peers, new_loader, now);
            }
        }
    }

    fn tick(&mut self, local_time: LocalTime) {
        self.clock.set(local_time);
    }

    fn timer_expired(&mut self) {
        let now = self.clock.local_time();

        for addr in self.pingmgr.tick(&mut self.peers, now) {
            self.outbox.disconnect(addr, DisconnectReason::PeerTimeout("unanswered ping"));
        }
        for (addr, reason) in self.peermgr.check_timeouts(&self.peers, now) {
            self.outbox.disconnect(addr, reason);
        }
        if let Some(addr) = self.syncmgr.check_stalled(&self.peers, now) {
            self.outbox.disconnect(addr, DisconnectReason::PeerTimeout("getheaders"));
        }
        self.cmpctmgr.check_timeouts(&mut self.peers, now);
        self.invmgr.check_timeouts(&mut self.peers, now);

        if let Some(seeds) = self.addrmgr.refill(now) {
            for seed in seeds {
                // DNS resolution is the reactor/OS's job, not this
                // crate's; `node` is expected to resolve these and feed
                // the results back in as `ADDRMAN` entries (§C).
                log::debug!(target: "p2p::addrmgr", "DNS seed fallback: {}", seed);
            }
        }

        loop {
            if !self.peermgr.wants_outbound(&self.peers) {
                break;
            }
            let peers = &self.peers;
            let candidate = self.addrmgr.sample_outbound(|a| peers.is_connected_to(a), now);
            let Some(candidate) = candidate else {
                break;
            };
            self.addrmgr.attempted(&candidate.addr);
            self.outbox.connect(candidate.addr);
        }

        self.outbox.set_timer(LocalDuration::from_secs(5));
    }
}
