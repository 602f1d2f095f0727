//! Types shared between the core and its peer-address collaborator
//! (`ADDRMAN`).
pub mod peer;

/// The transport domain of an address, used to apply domain-specific
/// filters (eg. "not onion, unless onion transport is enabled", §4.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    /// An IPv4 address.
    IPV4,
    /// An IPv6 address.
    IPV6,
    /// A Tor onion-service address.
    ONION,
}

impl Domain {
    /// Classify a socket address. Onion addresses never appear as a
    /// `SocketAddr` directly — this always returns `IPV4`/`IPV6`, and
    /// onion peers must be tracked by `ADDRMAN` separately and reported
    /// through `KnownAddress::domain`.
    pub fn for_socket(addr: &std::net::SocketAddr) -> Self {
        match addr {
            std::net::SocketAddr::V4(_) => Domain::IPV4,
            std::net::SocketAddr::V6(_) => Domain::IPV6,
        }
    }

    /// All domains, used to request addresses of any transport.
    pub const ALL: [Self; 3] = [Self::IPV4, Self::IPV6, Self::ONION];
}
