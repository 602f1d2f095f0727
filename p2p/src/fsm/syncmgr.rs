//! Headers-first synchronization, with checkpoint acceleration (§4.4).
use bitcoin::hashes::Hash;
use bitcoin::network::message::NetworkMessage;
use bitcoin::network::message_blockdata::GetHeadersMessage;

use nakamoto_common::block::time::{LocalDuration, LocalTime};
use nakamoto_common::block::tree::{BlockReader, BlockTree, ImportResult};
use nakamoto_common::block::{BlockHash, Header};

use super::config::Config;
use super::headers::HeadersChain;
use super::output::Outbox;
use super::peer::State;
use super::peers::Peers;
use super::{DisconnectReason, Event, PeerId};

/// How long a `getheaders` may remain unanswered before the loader is
/// considered stalled (§4.2.3, S7).
pub const GETHEADERS_TIMEOUT: LocalDuration = LocalDuration::from_secs(60);
/// Maximum headers accepted in a single `headers` message (§4.3.4, §7
/// kind 2).
pub const MAX_HEADERS_PER_MESSAGE: usize = 2000;

/// Drives headers-first sync against the designated loader.
pub struct SyncManager {
    config: Config,
    outbox: Outbox,
    window: Option<HeadersChain>,
}

impl SyncManager {
    /// Construct a sync manager.
    pub fn new(config: Config, magic: u32) -> Self {
        Self {
            config,
            outbox: Outbox::new(magic),
            window: None,
        }
    }

    /// Initialize sync state against the current chain, and if a loader
    /// is already present, kick off the first request.
    pub fn initialize<T: BlockReader>(&mut self, chain: &T, peers: &mut Peers, now: LocalTime) {
        self.arm_window(chain);
        if let Some(addr) = peers.loader_addr() {
            self.request(chain, peers, addr, now);
        }
    }

    fn arm_window<T: BlockReader>(&mut self, chain: &T) {
        if !self.config.checkpoints_enabled {
            self.window = None;
            return;
        }
        let (tip_hash, _) = chain.tip();
        let height = chain.height();
        let checkpoints = chain.checkpoints();
        let next = checkpoints
            .range((height + 1)..)
            .next()
            .map(|(h, hash)| (*h, *hash));

        self.window = next.map(|tip| HeadersChain::new((height, tip_hash), tip));
    }

    /// A new loader was designated (§4.3.1): (re)issue the request
    /// against it.
    pub fn loader_changed<T: BlockReader>(&mut self, chain: &T, peers: &mut Peers, addr: PeerId, now: LocalTime) {
        self.arm_window(chain);
        self.request(chain, peers, addr, now);
    }

    fn locator<T: BlockReader>(&self, chain: &T) -> (Vec<BlockHash>, BlockHash) {
        let from = self.window.as_ref().map(|w| w.tail().0).unwrap_or_else(|| chain.height());
        (chain.get_locator(from), BlockHash::all_zeros())
    }

    fn request<T: BlockReader>(&mut self, chain: &T, peers: &mut Peers, addr: PeerId, now: LocalTime) {
        let (locator_hashes, stop) = self.locator(chain);
        self.outbox.message(
            addr,
            NetworkMessage::GetHeaders(GetHeadersMessage {
                version: super::PROTOCOL_VERSION,
                locator_hashes,
                stop_hash: stop,
            }),
        );
        if let Some(peer) = peers.get_mut(&addr) {
            peer.time_getheaders_sent = Some(now);
        }
        self.outbox.set_timer(GETHEADERS_TIMEOUT);
    }

    /// Handle an inbound `headers` message (§4.4, §4.3.4, P5).
    pub fn received_headers<T: BlockTree>(
        &mut self,
        chain: &mut T,
        peers: &mut Peers,
        from: PeerId,
        headers: Vec<Header>,
        now: LocalTime,
    ) -> Result<(), DisconnectReason> {
        if headers.is_empty() {
            return Ok(());
        }
        if headers.len() > MAX_HEADERS_PER_MESSAGE {
            return Err(DisconnectReason::PeerMisbehaving("oversized headers message"));
        }
        let is_loader = peers.loader_addr() == Some(from);

        if let Some(peer) = peers.get_mut(&from) {
            peer.time_last_recv = Some(now);
        }

        if self.config.checkpoints_enabled && is_loader {
            if let Some(window) = self.window.as_mut() {
                for header in &headers {
                    if header.prev_blockhash != window.tail().1 {
                        return Err(DisconnectReason::PeerMisbehaving("discontiguous headers"));
                    }
                    if header.validate_pow(&header.target()).is_err() {
                        return Err(DisconnectReason::PeerMisbehaving("invalid header proof-of-work"));
                    }
                    window
                        .append(*header)
                        .map_err(|_| DisconnectReason::PeerMisbehaving("wrong checkpoint hash"))?;
                }
                if window.reached_checkpoint() {
                    let batch = window.headers().to_vec();
                    match chain.import_headers(batch) {
                        Ok(ImportResult::TipChanged { height, .. }) => {
                            self.outbox.event(Event::CheckpointCrossed { height });
                            self.arm_window(chain);
                            if self.window.is_none() {
                                self.outbox.event(Event::Synced { height });
                            }
                        }
                        Ok(ImportResult::TipUnchanged) => {}
                        Err((_, err)) => {
                            log::debug!(target: "p2p::syncmgr", "header import failed: {}", err);
                            return Err(DisconnectReason::PeerMisbehaving("invalid checkpoint headers"));
                        }
                    }
                }
                self.request(chain, peers, from, now);
                return Ok(());
            }
        }

        if headers.iter().any(|h| h.validate_pow(&h.target()).is_err()) {
            return Err(DisconnectReason::PeerMisbehaving("invalid header proof-of-work"));
        }

        match chain.import_headers(headers) {
            Ok(ImportResult::TipChanged { height, .. }) => {
                if chain.synced() {
                    self.outbox.event(Event::Synced { height });
                } else {
                    self.request(chain, peers, from, now);
                }
            }
            Ok(ImportResult::TipUnchanged) => {}
            Err(_) => return Err(DisconnectReason::PeerMisbehaving("invalid headers")),
        }
        Ok(())
    }

    /// Handle an inbound `getheaders` (§4.3.4): serve up to 2000 of our
    /// own headers, symmetric to the `getblocks`/`inv` serving path.
    pub fn received_getheaders<T: BlockReader>(&mut self, chain: &T, from: PeerId, msg: GetHeadersMessage) {
        let headers = chain.locate_headers(&msg.locator_hashes, msg.stop_hash, MAX_HEADERS_PER_MESSAGE);
        if !headers.is_empty() {
            self.outbox.message(from, NetworkMessage::Headers(headers));
        }
    }

    /// Whether the loader's `getheaders` has stalled (§4.2.3, S7).
    pub fn check_stalled(&self, peers: &Peers, now: LocalTime) -> Option<PeerId> {
        let addr = peers.loader_addr()?;
        let peer = peers.get(&addr)?;
        if peer.state != State::Connected {
            return None;
        }
        let sent = peer.time_getheaders_sent?;
        if now - sent >= GETHEADERS_TIMEOUT {
            Some(addr)
        } else {
            None
        }
    }
}

impl Iterator for SyncManager {
    type Item = super::output::Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.outbox.next()
    }
}
