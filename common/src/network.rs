//! The network profile: magic, ports, checkpoints and other per-network
//! constants consumed by the core (§6, "Network profile").
use std::collections::BTreeMap;
use std::str::FromStr;

use bitcoin::blockdata::block::{Block, BlockHeader};
use bitcoin::consensus::params::Params;
use bitcoin::hash_types::BlockHash;
use bitcoin::hashes::hex::FromHex;
use bitcoin::network::constants::ServiceFlags;

use crate::block::Height;

/// Service-bit bundles peers are expected to advertise, per use case.
#[derive(Debug, Copy, Clone)]
pub enum Services {
    /// A peer that only relays the chain (headers and blocks).
    Chain,
    /// A peer that additionally relays witness data and serves it on
    /// request — the default `REQUIRED_SERVICES` for outbound peers.
    Full,
}

impl From<Services> for ServiceFlags {
    fn from(value: Services) -> Self {
        match value {
            Services::Chain => ServiceFlags::NETWORK,
            Services::Full => ServiceFlags::NETWORK | ServiceFlags::WITNESS,
        }
    }
}

impl Default for Services {
    fn default() -> Self {
        Services::Full
    }
}

/// A Bitcoin peer network.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Network {
    /// Bitcoin Mainnet.
    Mainnet,
    /// Bitcoin Testnet.
    Testnet,
    /// Bitcoin regression test network.
    Regtest,
    /// Bitcoin Signet.
    Signet,
}

impl Default for Network {
    fn default() -> Self {
        Self::Mainnet
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" | "bitcoin" => Ok(Self::Mainnet),
            "testnet" => Ok(Self::Testnet),
            "regtest" => Ok(Self::Regtest),
            "signet" => Ok(Self::Signet),
            _ => Err(format!("invalid network specified {:?}", s)),
        }
    }
}

impl From<Network> for bitcoin::Network {
    fn from(value: Network) -> Self {
        match value {
            Network::Mainnet => Self::Bitcoin,
            Network::Testnet => Self::Testnet,
            Network::Regtest => Self::Regtest,
            Network::Signet => Self::Signet,
        }
    }
}

impl From<bitcoin::Network> for Network {
    fn from(value: bitcoin::Network) -> Self {
        match value {
            bitcoin::Network::Bitcoin => Self::Mainnet,
            bitcoin::Network::Testnet => Self::Testnet,
            bitcoin::Network::Regtest => Self::Regtest,
            bitcoin::Network::Signet => Self::Signet,
        }
    }
}

impl Network {
    /// Return the default listen port for the network.
    pub fn port(&self) -> u16 {
        match self {
            Network::Mainnet => 8333,
            Network::Testnet => 18333,
            Network::Regtest => 18444,
            Network::Signet => 38333,
        }
    }

    /// Whether this network permits a node connecting to itself. Regtest
    /// setups commonly loop a node back on itself for testing, so
    /// self-connection there isn't fatal the way it is elsewhere.
    pub fn self_connect(&self) -> bool {
        matches!(self, Network::Regtest)
    }

    /// Blockchain checkpoints, keyed by height.
    pub fn checkpoints(&self) -> BTreeMap<Height, BlockHash> {
        use crate::block::checkpoints;

        let table = match self {
            Network::Mainnet => checkpoints::MAINNET,
            Network::Testnet => checkpoints::TESTNET,
            Network::Regtest => checkpoints::REGTEST,
            Network::Signet => checkpoints::SIGNET,
        };

        table
            .iter()
            .map(|(height, hash)| {
                let hash = BlockHash::from_hex(hash).expect("checkpoint hash is valid hex");
                (*height, hash)
            })
            .collect()
    }

    /// Height of the highest hardcoded checkpoint.
    pub fn last_checkpoint(&self) -> Height {
        self.checkpoints().keys().next_back().copied().unwrap_or(0)
    }

    /// Return the short string representation of this network.
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
            Network::Signet => "signet",
        }
    }

    /// DNS seeds, used to bootstrap the address book when it is empty
    /// (§C, "DNS seed fallback").
    pub fn seeds(&self) -> &[&str] {
        match self {
            Network::Mainnet => &[
                "seed.bitcoin.sipa.be",
                "dnsseed.bluematt.me",
                "dnsseed.bitcoin.dashjr.org",
                "seed.bitcoinstats.com",
                "seed.bitcoin.jonasschnelli.ch",
                "seed.btc.petertodd.org",
                "seed.bitcoin.sprovoost.nl",
                "dnsseed.emzy.de",
            ],
            Network::Testnet => &[
                "testnet-seed.bitcoin.jonasschnelli.ch",
                "seed.tbtc.petertodd.org",
                "seed.testnet.bitcoin.sprovoost.nl",
            ],
            Network::Regtest => &[],
            Network::Signet => &["seed.signet.bitcoin.sprovoost.nl"],
        }
    }
}

impl Network {
    /// Get the genesis block header.
    pub fn genesis(&self) -> BlockHeader {
        self.genesis_block().header
    }

    /// Get the genesis block.
    pub fn genesis_block(&self) -> Block {
        use bitcoin::blockdata::constants;

        constants::genesis_block((*self).into())
    }

    /// Get the hash of the genesis block of this network.
    pub fn genesis_hash(&self) -> BlockHash {
        self.genesis().block_hash()
    }

    /// Get the consensus parameters for this network.
    pub fn params(&self) -> Params {
        Params::new((*self).into())
    }

    /// Get the network magic number for this network.
    pub fn magic(&self) -> u32 {
        bitcoin::Network::from(*self).magic()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_genesis_matches_checkpoint_zero() {
        let network = Network::Mainnet;
        assert_eq!(
            network.genesis_hash().to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26"
        );
    }

    #[test]
    fn checkpoints_are_ordered_by_height() {
        let network = Network::Mainnet;
        let heights: Vec<_> = network.checkpoints().keys().copied().collect();
        let mut sorted = heights.clone();
        sorted.sort_unstable();
        assert_eq!(heights, sorted);
        assert_eq!(network.last_checkpoint(), *heights.last().unwrap());
    }

    #[test]
    fn regtest_has_no_checkpoints() {
        assert!(Network::Regtest.checkpoints().is_empty());
        assert_eq!(Network::Regtest.last_checkpoint(), 0);
    }
}
