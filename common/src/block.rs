//! Block and transaction type aliases shared across the workspace.
use bitcoin::blockdata::block::BlockHeader;

pub mod checkpoints;
pub mod time;
pub mod tree;

/// Height of a block in the chain, with the genesis block at height 0.
pub type Height = u64;
/// Block timestamp, in seconds since the Unix epoch, as carried in the
/// block header.
pub type BlockTime = u32;
/// A block hash.
pub type BlockHash = bitcoin::BlockHash;
/// A full Bitcoin transaction.
pub type Transaction = bitcoin::Transaction;
/// A block header, as it appears on the wire and in the headers chain.
pub type Header = BlockHeader;
/// A full block, header plus transactions.
pub type Block = bitcoin::Block;
/// Accumulated proof-of-work, as tracked by `CHAIN`. The core never adds
/// or compares these itself — difficulty math belongs to the real
/// collaborator — it only carries the value through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Work(u128);

impl Work {
    /// Wrap a raw work value.
    pub fn from_u64(value: u64) -> Self {
        Self(value as u128)
    }
}

/// A block locator: a sparse list of block hashes used to find a common
/// ancestor with a peer, from most to least recent.
pub type Locator = Vec<BlockHash>;
