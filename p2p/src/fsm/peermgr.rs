//! PEER lifecycle: handshake validation (§4.2.1), loader selection
//! (§4.3.1), inbound accept capping (§4.3.3), and the timeout policy
//! table (§4.2.3).
use std::net;

use bitcoin::network::constants::ServiceFlags;
use bitcoin::network::message::NetworkMessage;
use bitcoin::network::message_network::VersionMessage;

use nakamoto_common::block::time::{LocalDuration, LocalTime};
use nakamoto_common::block::Height;

use super::config::Config;
use super::output::Outbox;
use super::peer::{CompactMode, Peer, State};
use super::peers::{Nonces, Peers};
use super::{DisconnectReason, Event, Link, PeerId, COMPACT_VERSION, HEADERS_VERSION, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION, USER_AGENT};

/// Handshake must complete within this window of the connection opening
/// (§4.2.3, "Handshake not complete | 5 s from connect").
pub const HANDSHAKE_TIMEOUT: LocalDuration = LocalDuration::from_secs(5);
/// No traffic at all within this window of connecting closes the peer
/// (§4.2.3, "No bytes sent or received | 60 s after connect").
pub const NO_TRAFFIC_TIMEOUT: LocalDuration = LocalDuration::from_secs(60);
/// A negotiated, idle connection is pinged every 30s; anything longer
/// than this without a send or a recv is stalled (§4.2.3). Quadrupled
/// for a peer that hasn't yet answered its first `pong`.
pub const IDLE_TIMEOUT: LocalDuration = LocalDuration::from_mins(20);

/// Manages peer lifecycle: connect/accept, handshake, loader selection,
/// disconnect cleanup, and idle/handshake timeouts.
pub struct PeerManager {
    config: Config,
    rng: fastrand::Rng,
    outbox: Outbox,
    next_id: u32,
}

impl PeerManager {
    /// Construct a peer manager from its configuration.
    pub fn new(config: Config, rng: fastrand::Rng, magic: u32) -> Self {
        Self {
            config,
            rng,
            outbox: Outbox::new(magic),
            next_id: 0,
        }
    }

    /// Register a freshly connected (outbound) or accepted (inbound)
    /// socket, and for outbound connections, kick off the handshake by
    /// sending our `version` (§4.2.1).
    pub fn connected(
        &mut self,
        peers: &mut Peers,
        nonces: &mut Nonces,
        addr: PeerId,
        local_addr: net::SocketAddr,
        link: Link,
        now: LocalTime,
    ) {
        self.next_id += 1;
        let nonce = nonces.generate(&self.rng);
        let peer = Peer::new(
            self.next_id,
            addr,
            local_addr,
            link,
            nonce,
            now,
            self.magic(),
            &self.rng,
        );
        peers.insert(peer);
        self.outbox.event(Event::PeerConnected { addr, link });

        if link.is_outbound() {
            self.send_version(peers, addr, now);
        }
        self.outbox.set_timer(HANDSHAKE_TIMEOUT);
    }

    fn magic(&self) -> u32 {
        self.config.network.magic()
    }

    fn send_version(&mut self, peers: &mut Peers, addr: PeerId, now: LocalTime) {
        let Some(peer) = peers.get(&addr) else {
            return;
        };
        let msg = VersionMessage {
            version: PROTOCOL_VERSION,
            services: ServiceFlags::NETWORK | ServiceFlags::WITNESS,
            timestamp: now.as_secs() as i64,
            receiver: bitcoin::network::address::Address::new(&addr, ServiceFlags::NONE),
            sender: bitcoin::network::address::Address::new(&peer.local_addr, ServiceFlags::NONE),
            nonce: peer.nonce,
            user_agent: USER_AGENT.to_owned(),
            start_height: 0,
            relay: true,
        };
        self.outbox.message(addr, NetworkMessage::Version(msg));
    }

    /// Handle an inbound `version` (§4.2.1).
    pub fn received_version(
        &mut self,
        peers: &mut Peers,
        nonces: &mut Nonces,
        addr: PeerId,
        msg: VersionMessage,
        now: LocalTime,
    ) -> Result<(), DisconnectReason> {
        if nonces.contains(msg.nonce) {
            return Err(DisconnectReason::SelfConnection);
        }
        if msg.version < MIN_PROTOCOL_VERSION {
            return Err(DisconnectReason::PeerProtocolVersion(msg.version));
        }

        let link = peers.get(&addr).map(|p| p.link).unwrap_or(Link::Inbound);
        if link.is_outbound() {
            let required = self.config.required_services;
            if !msg.services.has(required) {
                return Err(DisconnectReason::PeerServices(msg.services));
            }
        }

        let Some(peer) = peers.get_mut(&addr) else {
            return Ok(());
        };
        peer.version = msg.version;
        peer.services = msg.services;
        peer.user_agent = msg.user_agent.clone();
        peer.height = msg.start_height.max(0) as Height;
        peer.no_relay = !msg.relay;
        nonces.remove(peer.nonce);

        self.outbox.event(Event::VersionReceived {
            addr,
            msg: Box::new(msg),
        });

        let to = match peer.state {
            State::Connecting => State::WaitVerack,
            State::WaitVersion => State::WaitVerack,
            other => other,
        };
        if !peer.transition(to) {
            return Err(DisconnectReason::PeerMisbehaving("unexpected version"));
        }

        if peer.link.is_inbound() {
            self.send_version(peers, addr, now);
        }
        self.outbox.message(addr, NetworkMessage::Verack);
        Ok(())
    }

    /// Handle an inbound `verack` (§4.2.1).
    pub fn received_verack(
        &mut self,
        peers: &mut Peers,
        addr: PeerId,
        now: LocalTime,
    ) -> Result<(), DisconnectReason> {
        let Some(peer) = peers.get_mut(&addr) else {
            return Ok(());
        };
        if !peer.transition(State::Connected) {
            return Err(DisconnectReason::PeerMisbehaving("unexpected verack"));
        }
        let (link, services, height, user_agent, version) = (
            peer.link,
            peer.services,
            peer.height,
            peer.user_agent.clone(),
            peer.version,
        );

        // Ambient supplements sent once the handshake settles (§C).
        if version >= HEADERS_VERSION {
            self.outbox.message(addr, NetworkMessage::SendHeaders);
        }
        if self.config.bip152_enabled && version >= COMPACT_VERSION {
            let witness = services.has(ServiceFlags::WITNESS) && !self.config.compact_allow_non_witness;
            self.outbox.message(
                addr,
                NetworkMessage::SendCmpct(bitcoin::network::message_compact_blocks::SendCmpct {
                    send_compact: true,
                    version: if witness { 2 } else { 1 },
                }),
            );
        }
        if self.config.min_relay_fee > 0 {
            self.outbox
                .message(addr, NetworkMessage::FeeFilter(self.config.min_relay_fee as i64));
        }

        self.outbox.event(Event::PeerNegotiated {
            addr,
            link,
            services,
            height,
            user_agent,
        });

        if peers.loader().is_none() {
            peers.set_loader(addr);
        }
        Ok(())
    }

    /// Handle an inbound `sendcmpct` (§4.6, preference negotiation).
    pub fn received_sendcmpct(&mut self, peers: &mut Peers, addr: PeerId, send_compact: bool, version: u64) {
        if let Some(peer) = peers.get_mut(&addr) {
            peer.compact_mode = if send_compact {
                CompactMode::CmpctAnnounce
            } else {
                CompactMode::HeaderAnnounce
            };
            peer.compact_witness = version >= 2;
        }
    }

    /// Handle an inbound `sendheaders` (§C).
    pub fn received_sendheaders(&mut self, peers: &mut Peers, addr: PeerId) {
        if let Some(peer) = peers.get_mut(&addr) {
            peer.prefers_headers = true;
        }
    }

    /// Whether an inbound connection may be accepted right now (§4.3.3,
    /// hard cap on `max_inbound`).
    pub fn accepts_inbound(&self, peers: &Peers) -> bool {
        peers.inbound() < self.config.max_inbound
    }

    /// Whether another outbound connection should be dialed (§4.3.2).
    pub fn wants_outbound(&self, peers: &Peers) -> bool {
        peers.outbound() < self.config.max_outbound
    }

    /// Clean up state on disconnect, including loader reassignment
    /// (§4.3.1 rule 2, P6).
    pub fn disconnected(&mut self, peers: &mut Peers, nonces: &mut Nonces, addr: PeerId, reason: DisconnectReason) {
        if let Some(peer) = peers.remove(&addr) {
            nonces.remove(peer.nonce);
            self.outbox.event(Event::PeerDisconnected {
                addr,
                reason: std::sync::Arc::new(reason),
            });
        }
        if peers.loader_addr().is_none() {
            if let Some(next) = peers.first_outbound_connected() {
                peers.set_loader(next);
            }
        }
    }

    /// Evaluate timeout policy on every tick (§4.2.3). Returns the
    /// addresses whose connections should be closed for having stalled.
    pub fn check_timeouts(&mut self, peers: &Peers, now: LocalTime) -> Vec<(PeerId, DisconnectReason)> {
        let mut timeouts = Vec::new();
        for peer in peers.iter() {
            match peer.state {
                State::Connecting | State::WaitVersion | State::WaitVerack => {
                    if now - peer.time_connected >= HANDSHAKE_TIMEOUT {
                        timeouts.push((peer.addr, DisconnectReason::PeerTimeout("handshake")));
                        continue;
                    }
                    if peer.time_last_send.is_none()
                        && peer.time_last_recv.is_none()
                        && now - peer.time_connected >= NO_TRAFFIC_TIMEOUT
                    {
                        timeouts.push((peer.addr, DisconnectReason::PeerTimeout("no traffic")));
                    }
                }
                State::Connected => {
                    // Pre-`pong` peers (still negotiating our preferred
                    // protocol version) get 4x the grace period (§4.2.3).
                    let multiplier = if peer.has_ponged() { 1 } else { 4 };
                    let idle = LocalDuration::from_millis(IDLE_TIMEOUT.as_millis() * multiplier);

                    let last_send = peer.time_last_send.unwrap_or(peer.time_connected);
                    let last_recv = peer.time_last_recv.unwrap_or(peer.time_connected);
                    if now - last_send >= idle || now - last_recv >= idle {
                        timeouts.push((peer.addr, DisconnectReason::PeerTimeout("idle")));
                        continue;
                    }
                    if peer.buffered > self.config.limits.max_send_buffer {
                        timeouts.push((peer.addr, DisconnectReason::PeerTimeout("send buffer full")));
                    }
                }
                State::Dead => {}
            }
        }
        timeouts
    }

    /// Misbehave and disconnect if the ban threshold was crossed (§4.2.3,
    /// I4).
    pub fn misbehaved(&mut self, peers: &mut Peers, addr: PeerId, score: u32, reason: &'static str) {
        let crossed = peers.get_mut(&addr).map(|p| p.misbehave(score));
        if let Some(true) = crossed {
            self.outbox.event(Event::PeerMisbehaved { addr, reason, score });
            self.outbox
                .disconnect(addr, DisconnectReason::PeerMisbehaving(reason));
        } else if crossed.is_some() {
            self.outbox.event(Event::PeerMisbehaved { addr, reason, score });
        }
    }
}

impl Iterator for PeerManager {
    type Item = super::output::Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.outbox.next()
    }
}
