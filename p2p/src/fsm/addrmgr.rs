//! ADDRMAN glue: outbound refill candidate selection (§4.3.2), `addr`/
//! `getaddr` wire handling (§4.3.4), and DNS seed fallback (§C).
use std::net;

use bitcoin::network::address::Address as WireAddress;
use bitcoin::network::constants::ServiceFlags;
use bitcoin::network::message::NetworkMessage;

use nakamoto_common::block::time::{LocalDuration, LocalTime};
use nakamoto_common::p2p::peer::{KnownAddress, Source, Store};
use nakamoto_common::p2p::Domain;

use super::config::Config;
use super::output::Outbox;
use super::{Event, PeerId};

/// How often the refill tick runs (§4.3.2).
pub const REFILL_INTERVAL: LocalDuration = LocalDuration::from_secs(3);
/// Within the first 30 candidates tried, require this much time since
/// the last attempt (§4.3.2).
const RECENT_ATTEMPT_FLOOR: LocalDuration = LocalDuration::from_mins(10);
/// Number of leading candidates the "recent attempt" filter applies to.
const RECENT_ATTEMPT_WINDOW: usize = 30;
/// Number of leading candidates the "default port only" filter applies
/// to.
const DEFAULT_PORT_WINDOW: usize = 50;
/// Number of consecutive fruitless refill ticks before DNS seeds are
/// consulted (§C, "DNS seed fallback").
const DNS_FALLBACK_TICKS: u32 = 10;

/// Manages `ADDRMAN` interactions: sampling dial candidates, recording
/// `addr`/`getaddr` traffic, and falling back to DNS seeds.
pub struct AddressManager<P> {
    store: P,
    config: Config,
    rng: fastrand::Rng,
    outbox: Outbox,
    last_refill: LocalTime,
    fruitless_ticks: u32,
}

impl<P: Store> AddressManager<P> {
    /// Construct a manager around the given `ADDRMAN` implementation.
    pub fn new(store: P, config: Config, rng: fastrand::Rng, magic: u32) -> Self {
        Self {
            store,
            config,
            rng,
            outbox: Outbox::new(magic),
            last_refill: LocalTime::default(),
            fruitless_ticks: 0,
        }
    }

    /// Number of addresses known.
    pub fn len(&self) -> usize {
        self.store.size()
    }

    /// Whether no addresses are known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert freshly learned addresses, eg. from an `addr` message or
    /// `ImportAddresses` command.
    pub fn insert(&mut self, addrs: impl Iterator<Item = (u32, net::SocketAddr)>, source: Source) {
        for (_, addr) in addrs {
            self.store.add(addr, ServiceFlags::NONE, source);
        }
    }

    /// Sample one dial candidate, applying the filter chain in the order
    /// §4.3.2 specifies. The first 100 rejects are silently retried.
    pub fn sample_outbound(
        &self,
        connected: impl Fn(&net::SocketAddr) -> bool,
        now: LocalTime,
    ) -> Option<KnownAddress> {
        let required = self.config.required_services;
        let onion_enabled = self.config.onion_enabled;
        let default_port = self.config.network.port();

        for attempt in 0..100 {
            let candidate = self.store.get(&|addr, known| {
                if connected(addr) {
                    return false;
                }
                if known.banned || !known.is_routable() {
                    return false;
                }
                if !known.services.has(required) {
                    return false;
                }
                if known.domain() == Domain::ONION && !onion_enabled {
                    return false;
                }
                if attempt < RECENT_ATTEMPT_WINDOW {
                    if let Some(last) = known.last_attempt {
                        if now - last < RECENT_ATTEMPT_FLOOR {
                            return false;
                        }
                    }
                }
                if attempt < DEFAULT_PORT_WINDOW && addr.port() != default_port {
                    return false;
                }
                true
            });
            if candidate.is_some() {
                return candidate;
            }
        }
        None
    }

    /// Record that we're attempting to connect to `addr`.
    pub fn attempted(&mut self, addr: &net::SocketAddr) {
        self.store.mark_attempt(addr);
    }

    /// Record a successful connection.
    pub fn connected(&mut self, addr: &net::SocketAddr) {
        self.store.mark_success(addr);
    }

    /// Record the services a peer announced post-handshake.
    pub fn negotiated(&mut self, addr: &net::SocketAddr, services: ServiceFlags) {
        self.store.mark_ack(addr, services);
    }

    /// Ban an address persistently (§7 kind 2/3).
    pub fn ban(&mut self, addr: &net::SocketAddr) {
        self.store.ban(addr);
    }

    /// Called once per refill tick (§4.3.2). Returns DNS seeds to
    /// resolve when the address book has been empty for too long, so the
    /// caller (`peermgr`) can issue the actual resolution (out of this
    /// crate's scope: DNS resolution is an OS/`LOOP` concern).
    pub fn refill(&mut self, now: LocalTime) -> Option<&'static [&'static str]> {
        self.last_refill = now;
        self.outbox.set_timer(REFILL_INTERVAL);

        if self.store.size() == 0 {
            self.fruitless_ticks += 1;
            if self.fruitless_ticks >= DNS_FALLBACK_TICKS {
                self.fruitless_ticks = 0;
                return Some(self.config.network.seeds());
            }
        } else {
            self.fruitless_ticks = 0;
        }
        None
    }

    /// Handle an inbound `getaddr` (§4.3.4: "only honored for inbound
    /// peers; only once per peer").
    pub fn received_getaddr(&mut self, addr: PeerId, addr_filter: &mut dyn FnMut(&net::SocketAddr) -> bool) {
        let mut addrs = Vec::new();
        for known in self.store.iter() {
            if addrs.len() >= 1000 {
                break;
            }
            if addr_filter(&known.addr) {
                addrs.push((known.addr.to_string().len() as u32, known.addr, known.services));
            }
        }
        if addrs.is_empty() {
            return;
        }
        let wire = addrs
            .into_iter()
            .map(|(_, a, services)| (0u32, WireAddress::new(&a, services)))
            .collect();

        self.outbox.message(addr, NetworkMessage::Addr(wire));
    }

    /// Handle an inbound `addr` (§4.3.4). Returns the addresses accepted,
    /// for the unsolicited-forwarding decision in `peermgr`.
    pub fn received_addr(
        &mut self,
        from: PeerId,
        addrs: Vec<(u32, WireAddress)>,
    ) -> Result<Vec<net::SocketAddr>, &'static str> {
        if addrs.len() > 1000 {
            return Err("addr message exceeds 1000 items");
        }
        let mut accepted = Vec::new();
        for (_, wire) in addrs {
            if let Ok(socket) = wire.socket_addr() {
                if self.store.add(socket, wire.services, Source::Peer(from)) {
                    accepted.push(socket);
                }
            }
        }
        Ok(accepted)
    }

    /// Record a peer's self-reported local address as a possible local
    /// address of ours (§4.3.4, "record as possible local address").
    pub fn record_local(&mut self, addr: net::SocketAddr) {
        if Domain::for_socket(&addr) != Domain::ONION {
            self.store.mark_local(addr);
        }
    }

    /// Emit the diagnostic event for a just-discovered address.
    pub fn announce_discovery(&mut self, addr: net::SocketAddr, source: Source) {
        self.outbox.event(Event::AddressDiscovered { addr, source });
    }
}

impl<P> Iterator for AddressManager<P> {
    type Item = super::output::Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.outbox.next()
    }
}
