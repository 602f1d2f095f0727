//! PING/PONG: periodic liveness probing and latency sampling (§4.2.3,
//! §C "ping/pong latency sample").
use bitcoin::network::message::NetworkMessage;

use nakamoto_common::block::time::{AdjustedClock, LocalDuration, LocalTime};

use super::output::Outbox;
use super::peer::State;
use super::peers::Peers;
use super::PeerId;

/// How often a connected peer is pinged (§4.2.3, "Ping timer fires every
/// 30 s in CONNECTED").
pub const PING_INTERVAL: LocalDuration = LocalDuration::from_secs(30);
/// How long we wait for a `pong` before the ping is considered
/// unanswered (§4.2.3).
pub const PING_TIMEOUT: LocalDuration = LocalDuration::from_mins(20);

/// Drives the `ping`/`pong` liveness check.
pub struct PingManager {
    outbox: Outbox,
    rng: fastrand::Rng,
}

impl PingManager {
    /// Construct a ping manager.
    pub fn new(rng: fastrand::Rng, magic: u32) -> Self {
        Self {
            outbox: Outbox::new(magic),
            rng,
        }
    }

    /// Called once per tick: ping any connected peer that is due, and
    /// report peers that never answered their last ping (§4.2.3).
    pub fn tick(&mut self, peers: &mut Peers, now: LocalTime) -> Vec<PeerId> {
        let mut expired = Vec::new();

        for peer in peers.iter_mut() {
            if peer.state != State::Connected {
                continue;
            }
            if let Some(sent) = peer.time_last_ping_sent {
                if peer.ping_nonce.is_some() && now - sent >= PING_TIMEOUT {
                    expired.push(peer.addr);
                    continue;
                }
            }
            let due = peer
                .time_last_ping_sent
                .map(|t| now - t >= PING_INTERVAL)
                .unwrap_or(true);

            if due && peer.ping_nonce.is_none() {
                let nonce = self.rng.u64(..);
                peer.ping_nonce = Some(nonce);
                peer.time_last_ping_sent = Some(now);
                self.outbox.message(peer.addr, NetworkMessage::Ping(nonce));
            }
        }
        self.outbox.set_timer(PING_INTERVAL);
        expired
    }

    /// Handle an inbound `ping`: always answer with the same nonce
    /// (§4.2.3).
    pub fn received_ping(&mut self, peers: &Peers, addr: PeerId, nonce: u64) {
        if peers.get(&addr).is_some() {
            self.outbox.message(addr, NetworkMessage::Pong(nonce));
        }
    }

    /// Handle an inbound `pong`: record the round-trip as a latency
    /// sample if the nonce matches the outstanding challenge (§C).
    pub fn received_pong<C: AdjustedClock<PeerId>>(
        &mut self,
        peers: &mut Peers,
        clock: &mut C,
        addr: PeerId,
        nonce: u64,
        now: LocalTime,
    ) {
        let Some(peer) = peers.get_mut(&addr) else {
            return;
        };
        if peer.ping_nonce != Some(nonce) {
            return;
        }
        peer.ping_nonce = None;
        peer.time_last_pong_recv = Some(now);

        if let Some(sent) = peer.time_last_ping_sent {
            let rtt = now - sent;
            peer.ping_min = Some(peer.ping_min.map(|m| m.min(rtt)).unwrap_or(rtt));
            clock.sample(addr, rtt);
        }
    }
}

impl Iterator for PingManager {
    type Item = super::output::Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.outbox.next()
    }
}
