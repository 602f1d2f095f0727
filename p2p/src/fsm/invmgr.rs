//! `inv`/`getdata`/`notfound` handling (§4.3.4), block and transaction
//! message handling (§4.5), and outbound request batching against the
//! per-peer quotas (I3, P1, P2).
use bitcoin::network::constants::ServiceFlags;
use bitcoin::network::message::NetworkMessage;
use bitcoin::network::message_blockdata::{GetBlocksMessage, Inventory};

use nakamoto_common::block::time::{LocalDuration, LocalTime};
use nakamoto_common::block::tree::{BlockTree, ImportFlags, ImportResult};
use nakamoto_common::block::{Block, BlockHash};
use nakamoto_common::mempool::Mempool;

use super::config::Config;
use super::output::Outbox;
use super::peer::{InvType, Txid};
use super::peers::Peers;
use super::{DisconnectReason, Event, PeerId};

/// Maximum items accepted in one `inv`/`getdata` (§4.3.4, §7 kind 2).
pub const MAX_INV_PER_MESSAGE: usize = 50_000;
/// How long an outstanding block or transaction request may go
/// unanswered before it's forgotten and can be re-requested (§4.2.3,
/// "An outstanding block/tx entry | 120 s").
pub const REQUEST_TIMEOUT: LocalDuration = LocalDuration::from_secs(120);

/// Drives `inv`/`getdata`/`notfound`/`block`/`tx` message handling.
pub struct InventoryManager {
    config: Config,
    outbox: Outbox,
}

impl InventoryManager {
    /// Construct an inventory manager.
    pub fn new(config: Config, magic: u32) -> Self {
        Self {
            config,
            outbox: Outbox::new(magic),
        }
    }

    /// Handle an inbound `inv` (§4.3.4): request unseen blocks/txs up to
    /// the peer's remaining quota, marking the rest to request later.
    pub fn received_inv(
        &mut self,
        peers: &mut Peers,
        from: PeerId,
        inventory: Vec<Inventory>,
        now: LocalTime,
    ) -> Result<(), DisconnectReason> {
        if inventory.len() > MAX_INV_PER_MESSAGE {
            return Err(DisconnectReason::PeerMisbehaving("oversized inv"));
        }
        let Some(peer) = peers.get_mut(&from) else {
            return Ok(());
        };
        let max_blocks = self.config.limits.max_block_request;
        let max_txs = self.config.limits.max_tx_request;
        let mut getdata = Vec::new();

        for item in inventory {
            match item {
                Inventory::Block(hash) | Inventory::WitnessBlock(hash) => {
                    if peer.inv_filter.contains(&hash) {
                        continue;
                    }
                    peer.inv_filter.insert(&hash);
                    if peer.block_map.len() + getdata.len() >= max_blocks {
                        continue;
                    }
                    let kind = peer.block_request_type();
                    getdata.push(Self::inventory_for(kind, hash));
                    peer.block_map.insert(hash, now);
                }
                Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) => {
                    if peer.inv_filter.contains(&txid) {
                        continue;
                    }
                    peer.inv_filter.insert(&txid);
                    if peer.tx_map.len() + getdata.len() >= max_txs {
                        continue;
                    }
                    getdata.push(Inventory::WitnessTransaction(txid));
                    peer.tx_map.insert(txid, now);
                }
                _ => {}
            }
        }
        if !getdata.is_empty() {
            self.outbox.message(from, NetworkMessage::GetData(getdata));
        }
        Ok(())
    }

    fn inventory_for(kind: InvType, hash: BlockHash) -> Inventory {
        match kind {
            InvType::WitnessBlock => Inventory::WitnessBlock(hash),
            _ => Inventory::Block(hash),
        }
    }

    /// Handle an inbound `getdata` (§4.3.4): serve what we have, reply
    /// `notfound` for the rest.
    pub fn received_getdata<T: BlockTree, M: Mempool>(
        &mut self,
        chain: &T,
        mempool: &M,
        peers: &mut Peers,
        from: PeerId,
        inventory: Vec<Inventory>,
    ) {
        let mut not_found = Vec::new();
        let mut continued = false;

        for item in inventory {
            let hash = match item {
                Inventory::Block(hash) | Inventory::WitnessBlock(hash) => {
                    if let Some(raw) = chain.get_raw_block(&hash) {
                        self.outbox
                            .message(from, NetworkMessage::Block(raw_to_block(raw)));
                    } else {
                        not_found.push(item);
                    }
                    Some(hash)
                }
                Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) => {
                    if let Some(tx) = mempool.get(&txid) {
                        self.outbox.message(from, NetworkMessage::Tx(tx));
                    } else {
                        not_found.push(item);
                    }
                    None
                }
                other => {
                    not_found.push(other);
                    None
                }
            };

            // The `getblocks` continuation mechanism (§4.3.4): once the
            // item matching the truncation point has been served, nudge
            // the peer onward with an `inv` for our current tip so it can
            // issue the next `getblocks`.
            if let Some(hash) = hash {
                if peers.get(&from).and_then(|p| p.hash_continue) == Some(hash) {
                    continued = true;
                }
            }
        }
        if continued {
            if let Some(peer) = peers.get_mut(&from) {
                peer.hash_continue = None;
            }
            let (tip_hash, _) = chain.tip();
            self.outbox.message(from, NetworkMessage::Inv(vec![Inventory::Block(tip_hash)]));
        }
        if !not_found.is_empty() {
            self.outbox.message(from, NetworkMessage::NotFound(not_found));
        }
    }

    /// Handle an inbound `getblocks` (§4.3.4): respond with up to 500
    /// `inv` entries, recording a continuation hash if the response was
    /// truncated so a follow-up `getdata` can resume the walk.
    pub fn received_getblocks<T: BlockTree>(&mut self, chain: &T, peers: &mut Peers, from: PeerId, msg: GetBlocksMessage) {
        let headers = chain.locate_headers(&msg.locator_hashes, msg.stop_hash, 500);
        let truncated = headers.len() == 500;
        let inv = headers
            .into_iter()
            .map(|h| Inventory::Block(h.block_hash()))
            .collect::<Vec<_>>();
        if truncated {
            if let (Some(peer), Some(Inventory::Block(last))) = (peers.get_mut(&from), inv.last()) {
                peer.hash_continue = Some(*last);
            }
        }
        if !inv.is_empty() {
            self.outbox.message(from, NetworkMessage::Inv(inv));
        }
    }

    /// Handle an inbound `block` (§4.5).
    pub fn received_block<T: BlockTree>(
        &mut self,
        chain: &mut T,
        peers: &mut Peers,
        from: PeerId,
        block: Block,
        now: LocalTime,
    ) -> Result<(), DisconnectReason> {
        let hash = block.block_hash();
        let requested = peers
            .get_mut(&from)
            .map(|peer| peer.block_map.remove(&hash).is_some())
            .unwrap_or(false);
        if !requested {
            return Err(DisconnectReason::PeerMisbehaving("unsolicited block"));
        }
        if let Some(peer) = peers.get_mut(&from) {
            peer.time_last_block = Some(now);
        }

        match chain.add(block, ImportFlags::default(), from) {
            Ok(ImportResult::TipChanged { height, .. }) => {
                self.outbox.event(Event::BlockReceived {
                    from,
                    hash,
                    height: Some(height),
                });
                if chain.synced() {
                    self.outbox.event(Event::Synced { height });
                }
            }
            Ok(ImportResult::TipUnchanged) => {
                self.outbox.event(Event::BlockReceived {
                    from,
                    hash,
                    height: None,
                });
            }
            Err(err) => {
                let score = err.ban_score();
                if score > 0 {
                    return Err(DisconnectReason::PeerMisbehaving("invalid block"));
                }
            }
        }
        Ok(())
    }

    /// Handle an inbound `tx` (§4.5).
    pub fn received_tx<M: Mempool>(
        &mut self,
        mempool: &mut M,
        peers: &mut Peers,
        from: PeerId,
        tx: nakamoto_common::block::Transaction,
    ) -> Result<(), DisconnectReason> {
        let txid = tx.txid();
        let requested = peers
            .get_mut(&from)
            .map(|peer| peer.tx_map.remove(&txid).is_some())
            .unwrap_or(false);
        if !requested {
            return Err(DisconnectReason::PeerMisbehaving("unsolicited transaction"));
        }

        match mempool.add(tx.clone(), from) {
            Ok(()) => {
                self.announce(mempool, peers, from, txid);
            }
            Err(nakamoto_common::mempool::Error::Orphan(_)) => {
                let missing = mempool.missing(&tx);
                if !missing.is_empty() {
                    let getdata = missing
                        .into_iter()
                        .map(Inventory::WitnessTransaction)
                        .collect();
                    self.outbox.message(from, NetworkMessage::GetData(getdata));
                }
            }
            Err(err) => {
                let score = err.ban_score();
                if score > 0 {
                    return Err(DisconnectReason::PeerMisbehaving("invalid transaction"));
                }
            }
        }
        Ok(())
    }

    /// Relay a transaction already accepted into the mempool to every
    /// eligible peer.
    pub fn relay<M: Mempool>(&mut self, mempool: &M, peers: &mut Peers, origin: PeerId, txid: Txid) {
        self.announce(mempool, peers, origin, txid);
    }

    fn announce<M: Mempool>(&mut self, mempool: &M, peers: &mut Peers, origin: PeerId, txid: Txid) {
        let feerate = mempool.feerate(&txid);

        for peer in peers.iter_mut() {
            if peer.addr == origin || !peer.is_connected() {
                continue;
            }
            if peer.no_relay {
                continue;
            }
            if let Some(min_fee) = peer.fee_rate_filter {
                if feerate.map(|f| f < min_fee as u64).unwrap_or(false) {
                    continue;
                }
            }
            if peer.inv_filter.contains(&txid) {
                continue;
            }
            peer.inv_filter.insert(&txid);
            peer.inv_queue.push((InvType::Tx, BlockHash::from_hash(txid.into())));
        }
    }

    /// Forget outstanding block/tx requests that have gone unanswered
    /// past [`REQUEST_TIMEOUT`], so they can be re-requested on the next
    /// `inv` (§4.2.3).
    pub fn check_timeouts(&mut self, peers: &mut Peers, now: LocalTime) {
        for peer in peers.iter_mut() {
            peer.block_map.retain(|_, sent| now - *sent < REQUEST_TIMEOUT);
            peer.tx_map.retain(|_, sent| now - *sent < REQUEST_TIMEOUT);
        }
    }

    /// Handle an inbound `mempool` request (§4.3.4, BIP37-gated).
    pub fn received_mempool_request<M: Mempool>(&mut self, mempool: &M, from: PeerId) {
        if !self.config.bip37_enabled {
            return;
        }
        let inv: Vec<Inventory> = mempool
            .iter()
            .take(self.config.limits.max_inv)
            .map(Inventory::Transaction)
            .collect();
        if !inv.is_empty() {
            self.outbox.message(from, NetworkMessage::Inv(inv));
        }
    }

    /// Handle an inbound `notfound` (§4.3.4): clear our outstanding
    /// request bookkeeping. An item that doesn't match anything we asked
    /// for is closed on immediately, same as an unsolicited `block`/`tx`.
    pub fn received_notfound(
        &mut self,
        peers: &mut Peers,
        from: PeerId,
        inventory: Vec<Inventory>,
    ) -> Result<(), DisconnectReason> {
        let Some(peer) = peers.get_mut(&from) else {
            return Ok(());
        };
        for item in inventory {
            let resolved = match item {
                Inventory::Block(hash) | Inventory::WitnessBlock(hash) => peer.block_map.remove(&hash).is_some(),
                Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) => {
                    peer.tx_map.remove(&txid).is_some()
                }
                _ => false,
            };
            if !resolved {
                return Err(DisconnectReason::PeerMisbehaving("notfound for unrequested item"));
            }
        }
        Ok(())
    }
}

impl Iterator for InventoryManager {
    type Item = super::output::Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.outbox.next()
    }
}

fn raw_to_block(raw: Vec<u8>) -> Block {
    bitcoin::consensus::encode::deserialize(&raw).expect("CHAIN only returns well-formed blocks")
}
