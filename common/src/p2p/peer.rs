//! The address-book collaborator (`ADDRMAN`), out of scope per §1: this
//! module defines only the interface §6 enumerates (`Store`), plus the
//! small value types (`KnownAddress`, `Source`) that flow across it.
use std::net::SocketAddr;
use std::time::SystemTime;

use bitcoin::network::constants::ServiceFlags;

use crate::block::time::LocalTime;
use crate::p2p::Domain;

/// Where an address was learned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Hardcoded DNS seed.
    Dns,
    /// Gossiped to us by another peer.
    Peer(SocketAddr),
    /// Supplied directly by configuration (`--connect`).
    Manual,
    /// Imported from a peer-address dump on startup.
    Imported,
}

/// An address and the bookkeeping `ADDRMAN` keeps about it.
#[derive(Debug, Clone)]
pub struct KnownAddress {
    /// The network address.
    pub addr: SocketAddr,
    /// Services this address last advertised, as of the last successful
    /// handshake (`mark_ack`).
    pub services: ServiceFlags,
    /// Where we learned about this address.
    pub source: Source,
    /// Time of our last connection attempt, if any.
    pub last_attempt: Option<LocalTime>,
    /// Time of our last successful connection, if any.
    pub last_success: Option<LocalTime>,
    /// Whether this address is banned.
    pub banned: bool,
}

impl KnownAddress {
    /// Construct a fresh, never-attempted entry.
    pub fn new(addr: SocketAddr, source: Source) -> Self {
        Self {
            addr,
            services: ServiceFlags::NONE,
            source,
            last_attempt: None,
            last_success: None,
            banned: false,
        }
    }

    /// The address's transport domain.
    pub fn domain(&self) -> Domain {
        Domain::for_socket(&self.addr)
    }

    /// Whether the address is globally routable (not private/loopback).
    pub fn is_routable(&self) -> bool {
        match self.addr.ip() {
            std::net::IpAddr::V4(ip) => {
                !ip.is_private() && !ip.is_loopback() && !ip.is_unspecified()
            }
            std::net::IpAddr::V6(ip) => !ip.is_loopback() && !ip.is_unspecified(),
        }
    }
}

/// The `ADDRMAN` interface (§6).
pub trait Store {
    /// Sample a candidate address matching `predicate`, without removing
    /// it — the POOL outbound-refill path (§4.3.2) applies its own filter
    /// chain via `predicate` and retries with a fresh sample on rejection.
    fn get(
        &self,
        predicate: &dyn Fn(&SocketAddr, &KnownAddress) -> bool,
    ) -> Option<KnownAddress>;
    /// Add a freshly learned address.
    fn add(&mut self, addr: SocketAddr, services: ServiceFlags, source: Source) -> bool;
    /// Record that we just attempted to connect to this address.
    fn mark_attempt(&mut self, addr: &SocketAddr);
    /// Record that we successfully connected to this address.
    fn mark_success(&mut self, addr: &SocketAddr);
    /// Record the services an address announced, post-handshake.
    fn mark_ack(&mut self, addr: &SocketAddr, services: ServiceFlags);
    /// Record an address as belonging to us locally (self-reported by a
    /// peer's `version.receiver`, §4.3.4).
    fn mark_local(&mut self, addr: SocketAddr);
    /// A local address to advertise to the given peer.
    fn get_local(&self, for_peer: &SocketAddr) -> Option<SocketAddr>;
    /// Whether an address is one of our own.
    fn has_local(&self, addr: &SocketAddr) -> bool;
    /// Whether an address is banned.
    fn is_banned(&self, addr: &SocketAddr) -> bool;
    /// Ban an address persistently (§7 kind 2/3).
    fn ban(&mut self, addr: &SocketAddr) -> bool;
    /// Forget an address.
    fn remove(&mut self, addr: &SocketAddr) -> bool;
    /// Total number of addresses known.
    fn size(&self) -> usize;
    /// Iterate over all known addresses.
    fn iter(&self) -> Box<dyn Iterator<Item = KnownAddress> + '_>;
    /// Current time, used to stamp `last_attempt`/`last_success`.
    fn now(&self) -> LocalTime {
        LocalTime::from(
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    //! A minimal in-memory `Store`, used by tests and as `node`'s default
    //! wiring until a real `ADDRMAN` is supplied.
    use super::*;
    use crate::collections::HashMap;

    /// An in-memory address book with no persistence.
    #[derive(Debug, Default)]
    pub struct Book {
        addrs: HashMap<SocketAddr, KnownAddress>,
        locals: HashMap<SocketAddr, ()>,
    }

    impl Book {
        /// Create an empty address book.
        pub fn new(rng: fastrand::Rng) -> Self {
            Self {
                addrs: HashMap::with_hasher(rng.clone().into()),
                locals: HashMap::with_hasher(rng.into()),
            }
        }
    }

    impl Store for Book {
        fn get(
            &self,
            predicate: &dyn Fn(&SocketAddr, &KnownAddress) -> bool,
        ) -> Option<KnownAddress> {
            self.addrs
                .iter()
                .find(|(addr, ka)| predicate(addr, ka))
                .map(|(_, ka)| ka.clone())
        }

        fn add(&mut self, addr: SocketAddr, services: ServiceFlags, source: Source) -> bool {
            if self.addrs.contains_key(&addr) {
                return false;
            }
            let mut known = KnownAddress::new(addr, source);
            known.services = services;
            self.addrs.insert(addr, known);
            true
        }

        fn mark_attempt(&mut self, addr: &SocketAddr) {
            if let Some(ka) = self.addrs.get_mut(addr) {
                ka.last_attempt = Some(self.now_inner());
            }
        }

        fn mark_success(&mut self, addr: &SocketAddr) {
            let now = self.now_inner();
            if let Some(ka) = self.addrs.get_mut(addr) {
                ka.last_success = Some(now);
            }
        }

        fn mark_ack(&mut self, addr: &SocketAddr, services: ServiceFlags) {
            if let Some(ka) = self.addrs.get_mut(addr) {
                ka.services = services;
            }
        }

        fn mark_local(&mut self, addr: SocketAddr) {
            self.locals.insert(addr, ());
        }

        fn get_local(&self, _for_peer: &SocketAddr) -> Option<SocketAddr> {
            self.locals.keys().next().copied()
        }

        fn has_local(&self, addr: &SocketAddr) -> bool {
            self.locals.contains_key(addr)
        }

        fn is_banned(&self, addr: &SocketAddr) -> bool {
            self.addrs.get(addr).map(|ka| ka.banned).unwrap_or(false)
        }

        fn ban(&mut self, addr: &SocketAddr) -> bool {
            if let Some(ka) = self.addrs.get_mut(addr) {
                ka.banned = true;
                true
            } else {
                false
            }
        }

        fn remove(&mut self, addr: &SocketAddr) -> bool {
            self.addrs.remove(addr).is_some()
        }

        fn size(&self) -> usize {
            self.addrs.len()
        }

        fn iter(&self) -> Box<dyn Iterator<Item = KnownAddress> + '_> {
            Box::new(self.addrs.values().cloned())
        }
    }

    impl Book {
        fn now_inner(&self) -> LocalTime {
            Store::now(self)
        }
    }
}
