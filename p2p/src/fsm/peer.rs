//! PEER: one instance per connection (§3, §4.2).
use std::collections::HashMap;
use std::net;

use bitcoin::network::constants::ServiceFlags;
use nakamoto_common::block::time::{LocalDuration, LocalTime};
use nakamoto_common::block::{BlockHash, Height};

use super::framer;
use super::{Link, PeerId};
use nakamoto_common::filter::ApproximateSet;

/// A transaction id, reused from `bitcoin` for readability at call sites.
pub type Txid = bitcoin::Txid;

/// The per-connection state machine (§3, "Peer state"). Illegal
/// transitions are rejected by [`Peer::transition`] rather than
/// tolerated — an out-of-order `version`/`verack` closes the peer
/// (§4.2.1, §9 "State machine").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// The socket connect/accept is in flight or was just established.
    Connecting,
    /// Waiting for the remote's `version` (inbound only).
    WaitVersion,
    /// Waiting for the remote's `verack`.
    WaitVerack,
    /// Handshake complete; normal message processing.
    Connected,
    /// Closed. All handlers for this peer must check this and return
    /// immediately (§5, "a close during message processing is sticky").
    Dead,
}

/// An inventory kind, as carried on the wire (`inv`/`getdata`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvType {
    /// A transaction.
    Tx,
    /// A plain block.
    Block,
    /// A witness-serialized block.
    WitnessBlock,
    /// A compact block.
    CompactBlock,
}

/// Compact-block announcement preference (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactMode {
    /// The peer hasn't negotiated compact blocks.
    None,
    /// Announce new tips with a `headers` message (the default,
    /// `sendcmpct` not yet seen, but `sendheaders` has been negotiated).
    HeaderAnnounce,
    /// Announce new tips with a `cmpctblock` directly.
    CmpctAnnounce,
}

/// A pending outstanding request: when it was issued, for timeout
/// purposes (§4.2.3).
pub type RequestTable<K> = HashMap<K, LocalTime>;

/// One connected (or connecting) peer.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Monotonically increasing id, assigned at construction.
    pub id: u32,
    /// The peer's address.
    pub addr: PeerId,
    /// The address we're seen as, by this peer (from their `version`).
    pub local_addr: net::SocketAddr,
    /// Connection direction.
    pub link: Link,
    /// Current state.
    pub state: State,
    /// Whether this peer is the designated loader (§4.3.1). At most one
    /// peer at a time may have this set (invariant I1/P4).
    pub is_loader: bool,
    /// The nonce we generated for our own `version` message.
    pub nonce: u64,
    /// Negotiated protocol version, once known.
    pub version: u32,
    /// Services the peer advertises.
    pub services: ServiceFlags,
    /// The peer's self-reported chain height, from its `version`.
    pub height: Height,
    /// The peer's user agent string.
    pub user_agent: String,
    /// Whether the peer asked us not to relay transactions to it
    /// (`version.relay == false`, BIP37).
    pub no_relay: bool,
    /// Whether the peer prefers `headers` over `inv` for new-tip
    /// announcements (`sendheaders`, §C).
    pub prefers_headers: bool,
    /// The peer's minimum relay fee filter, sat/kB, or `None`.
    pub fee_rate_filter: Option<i64>,
    /// Compact-block announcement mode.
    pub compact_mode: CompactMode,
    /// Whether the peer's compact blocks should include witness data.
    pub compact_witness: bool,

    /// Ban score, 0..100. At 100 the peer is closed and its address
    /// persistently banned (I4).
    pub ban_score: u32,

    /// Connection established at.
    pub time_connected: LocalTime,
    /// Last time a message was sent.
    pub time_last_send: Option<LocalTime>,
    /// Last time a message was received.
    pub time_last_recv: Option<LocalTime>,
    /// When we last sent a `ping`.
    pub time_last_ping_sent: Option<LocalTime>,
    /// When we last received a matching `pong`.
    pub time_last_pong_recv: Option<LocalTime>,
    /// Smallest observed ping round-trip, used as the latency estimate.
    pub ping_min: Option<LocalDuration>,
    /// Last time a `block` was received from this peer.
    pub time_last_block: Option<LocalTime>,
    /// Time a `getblocks` was sent and is still outstanding.
    pub time_getblocks_sent: Option<LocalTime>,
    /// Time a `getheaders` was sent and is still outstanding.
    pub time_getheaders_sent: Option<LocalTime>,
    /// Outstanding ping challenge, if a `pong` is still owed.
    pub ping_nonce: Option<u64>,

    /// `getblocks` hash-continue marker (§4.3.4).
    pub hash_continue: Option<BlockHash>,
    /// Whether this (inbound) peer has already been served a `getaddr`.
    pub sent_getaddr: bool,

    /// Addresses already sent to this peer (§3, capacity 5000, FPR 1e-3).
    pub addr_filter: ApproximateSet,
    /// Inventory already sent or seen from this peer (§3, capacity
    /// 50000, FPR 1e-6).
    pub inv_filter: ApproximateSet,

    /// Outstanding block requests: hash → time requested.
    pub block_map: RequestTable<BlockHash>,
    /// Outstanding tx requests: hash → time requested.
    pub tx_map: RequestTable<Txid>,
    /// Outstanding (partially filled) compact block requests.
    pub compact_map: RequestTable<BlockHash>,

    /// Inventory queued for outbound announcement, coalesced before
    /// being flushed as an `inv` message (§4.2.2).
    pub inv_queue: Vec<(InvType, BlockHash)>,
    /// `getdata` items this peer asked us for, awaiting service.
    pub send_queue: std::collections::VecDeque<(InvType, BlockHash)>,
    /// Last time the inventory queue was flushed.
    pub time_inv_flush: LocalTime,

    /// Inbound decoder for this peer's byte stream.
    pub decoder: framer::Decoder,
    /// Bytes currently queued in the reactor's outbound socket buffer,
    /// as last reported; used for the backpressure checks in §4.2.2.
    pub buffered: usize,
}

/// Ban-score increments (§4.2.3, §7).
pub mod ban {
    /// A framing error (§7 kind 1).
    pub const BAD_MESSAGE: u32 = 10;
    /// A protocol violation: invalid header, oversized announcement,
    /// quota violation (§7 kind 2).
    pub const PROTOCOL_VIOLATION: u32 = 100;
    /// A short-id collision in a compact block (§4.6 step 5).
    pub const SHORT_ID_COLLISION: u32 = 10;
    /// Threshold at which the peer is closed and its address banned (I4).
    pub const THRESHOLD: u32 = 100;
}

impl Peer {
    /// Construct a freshly connecting/accepted peer.
    pub fn new(
        id: u32,
        addr: PeerId,
        local_addr: net::SocketAddr,
        link: Link,
        nonce: u64,
        now: LocalTime,
        magic: u32,
        rng: &fastrand::Rng,
    ) -> Self {
        Self {
            id,
            addr,
            local_addr,
            link,
            state: if link.is_outbound() {
                State::Connecting
            } else {
                State::WaitVersion
            },
            is_loader: false,
            nonce,
            version: 0,
            services: ServiceFlags::NONE,
            height: 0,
            user_agent: String::new(),
            no_relay: false,
            prefers_headers: false,
            fee_rate_filter: None,
            compact_mode: CompactMode::None,
            compact_witness: false,
            ban_score: 0,
            time_connected: now,
            time_last_send: None,
            time_last_recv: None,
            time_last_ping_sent: None,
            time_last_pong_recv: None,
            ping_min: None,
            time_last_block: None,
            time_getblocks_sent: None,
            time_getheaders_sent: None,
            ping_nonce: None,
            hash_continue: None,
            sent_getaddr: false,
            addr_filter: ApproximateSet::new(5000, 0.001, rng),
            inv_filter: ApproximateSet::new(50_000, 0.000_001, rng),
            block_map: HashMap::new(),
            tx_map: HashMap::new(),
            compact_map: HashMap::new(),
            inv_queue: Vec::new(),
            send_queue: std::collections::VecDeque::new(),
            time_inv_flush: now,
            decoder: framer::Decoder::new(magic),
            buffered: 0,
        }
    }

    /// Whether the peer has finished the handshake.
    pub fn is_connected(&self) -> bool {
        self.state == State::Connected
    }

    /// Whether the peer is gone and may no longer be acted on (§5,
    /// "sticky close").
    pub fn is_dead(&self) -> bool {
        self.state == State::Dead
    }

    /// Attempt a state transition, rejecting illegal ones (§9).
    ///
    /// Returns `false` (and leaves state unchanged) on an illegal
    /// transition; the caller is expected to close the peer in that case.
    #[must_use]
    pub fn transition(&mut self, to: State) -> bool {
        use State::*;

        let legal = matches!(
            (self.state, to),
            (Connecting, WaitVerack)
                | (WaitVersion, WaitVerack)
                | (WaitVerack, Connected)
                | (_, Dead)
        );
        if legal {
            self.state = to;
        }
        legal
    }

    /// Add to the ban score, saturating. Returns whether the peer has
    /// now crossed the ban threshold (I4).
    pub fn misbehave(&mut self, score: u32) -> bool {
        self.ban_score = (self.ban_score + score).min(1000);
        self.ban_score >= ban::THRESHOLD
    }

    /// Record that a message was just sent.
    pub fn sent(&mut self, now: LocalTime) {
        self.time_last_send = Some(now);
    }

    /// Record that a message was just received.
    pub fn received(&mut self, now: LocalTime) {
        self.time_last_recv = Some(now);
    }

    /// Whether this peer has completed at least one ping/pong round
    /// trip, which relaxes some timeouts (§4.2.3, "pre-pong version").
    pub fn has_ponged(&self) -> bool {
        self.time_last_pong_recv.is_some()
    }

    /// The peer's inventory type preference for block requests: witness
    /// blocks if negotiated, else plain (§4.3.5, "peer_block_type").
    pub fn block_request_type(&self) -> InvType {
        if self.services.has(ServiceFlags::WITNESS) {
            InvType::WitnessBlock
        } else {
            InvType::Block
        }
    }

    /// Number of outstanding block requests (I3, P2).
    pub fn outstanding_blocks(&self) -> usize {
        self.block_map.len()
    }
}
