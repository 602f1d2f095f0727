//! The block chain collaborator (`CHAIN`).
//!
//! `CHAIN` is out of scope (§1): this module defines only the interface the
//! core drives it through (`BlockReader`, `BlockTree`), plus a minimal
//! in-memory implementation (`mock::Cache`) used by tests, which trusts
//! header linkage and does not perform real proof-of-work or difficulty
//! validation — that belongs to the real collaborator.
use std::collections::BTreeMap;
use std::net::SocketAddr;

use bitcoin::hash_types::BlockHash;
use thiserror::Error;

use crate::block::{Header, Height, Locator, Work};

/// Controls how much verification `CHAIN.add` is expected to perform.
/// A BIP152 compact block that already had its header checked only needs
/// body verification (§4.6 step 6: "finalize... call the block handler
/// with `VERIFY_BODY` flags").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportFlags {
    /// Verify the header's proof-of-work.
    pub verify_pow: bool,
    /// Verify the block body against the header (merkle root, weight).
    pub verify_body: bool,
}

impl Default for ImportFlags {
    fn default() -> Self {
        Self {
            verify_pow: true,
            verify_body: true,
        }
    }
}

impl ImportFlags {
    /// Header proof-of-work was already verified by the caller.
    pub const VERIFY_BODY: ImportFlags = ImportFlags {
        verify_pow: false,
        verify_body: true,
    };
}

/// The outcome of importing one or more headers or a block.
#[derive(Debug, Clone)]
pub enum ImportResult {
    /// The active tip changed as a result of the import.
    TipChanged {
        header: Header,
        hash: BlockHash,
        height: Height,
        reverted: Vec<(Height, Header)>,
        connected: Vec<(Height, Header)>,
    },
    /// The header(s) were accepted but didn't affect the active tip, eg.
    /// they extend a side chain with less work.
    TipUnchanged,
}

/// An error from `CHAIN`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid block proof-of-work")]
    InvalidBlockPoW,
    #[error("invalid block difficulty target")]
    InvalidBlockTarget,
    #[error("invalid block hash")]
    InvalidBlockHash,
    #[error("invalid block height")]
    InvalidBlockHeight,
    #[error("invalid block time")]
    InvalidBlockTime,
    #[error("duplicate block {0}")]
    DuplicateBlock(BlockHash),
    #[error("block missing: {0}")]
    BlockMissing(BlockHash),
    #[error("block import was aborted")]
    BlockImportAborted,
    #[error("genesis block mismatch")]
    GenesisMismatch,
    #[error("storage error: {0}")]
    Store(String),
    #[error("the operation was interrupted")]
    Interrupted,
}

impl Error {
    /// The ban-score §7 kind 3 assigns a validation failure, when `CHAIN`
    /// doesn't supply one of its own via `(code, reason, score)`.
    pub fn ban_score(&self) -> u32 {
        match self {
            Error::InvalidBlockPoW
            | Error::InvalidBlockTarget
            | Error::InvalidBlockHash
            | Error::GenesisMismatch => 100,
            Error::InvalidBlockHeight | Error::InvalidBlockTime => 50,
            Error::DuplicateBlock(_) | Error::BlockMissing(_) => 0,
            Error::BlockImportAborted | Error::Store(_) | Error::Interrupted => 0,
        }
    }
}

/// The read-only surface of `CHAIN` — everything the core queries without
/// mutating the validated chain. Method names follow §6 directly.
pub trait BlockReader {
    /// The network's genesis header.
    fn genesis(&self) -> &Header;
    /// The active tip: hash and header.
    fn tip(&self) -> (BlockHash, Header);
    /// The active tip's height.
    fn height(&self) -> Height;
    /// Accumulated proof-of-work on the active chain.
    fn chain_work(&self) -> Work;
    /// Whether the chain is caught up with the network.
    fn synced(&self) -> bool;
    /// Look up a header by hash.
    fn by_hash(&self, hash: &BlockHash) -> Option<(Height, Header)>;
    /// Look up a header by height on the active chain.
    fn get_block_by_height(&self, height: Height) -> Option<Header>;
    /// Whether a hash is a known header (on any chain).
    fn has_hash(&self, hash: &BlockHash) -> bool {
        self.by_hash(hash).is_some()
    }
    /// Whether a hash is a known orphan (parent unknown).
    fn has_orphan(&self, hash: &BlockHash) -> bool;
    /// Whether a hash was previously rejected as invalid.
    fn has_invalid(&self, hash: &BlockHash) -> bool;
    /// Walk an orphan chain back to its root, the first header whose
    /// parent we don't have.
    fn get_orphan_root(&self, hash: &BlockHash) -> BlockHash;
    /// Height of the highest checkpoint at or below the active tip.
    fn last_checkpoint(&self) -> Height;
    /// The network's hardcoded checkpoints.
    fn checkpoints(&self) -> BTreeMap<Height, BlockHash>;
    /// Build a locator for the active chain, starting from `from`.
    fn get_locator(&self, from: Height) -> Locator;
    /// Find the best-matching locator entry we know about, and its height.
    fn find_locator(&self, locator: &Locator) -> Option<(Height, BlockHash)>;
    /// Collect up to `max` headers starting after the locator's match
    /// point, stopping at `stop` if given.
    fn locate_headers(&self, locator: &Locator, stop: BlockHash, max: usize) -> Vec<Header>;
}

/// The mutating surface of `CHAIN`.
pub trait BlockTree: BlockReader {
    /// Import a batch of headers (headers-first sync, §4.4).
    fn import_headers(
        &mut self,
        headers: Vec<Header>,
    ) -> Result<ImportResult, (Vec<Header>, Error)>;
    /// Import a full block, received from `peer`, with the given
    /// verification flags (§4.6 step 6 for the `VERIFY_BODY` case).
    fn add(
        &mut self,
        block: crate::block::Block,
        flags: ImportFlags,
        peer: SocketAddr,
    ) -> Result<ImportResult, Error>;
    /// Fetch a full block's raw serialized bytes.
    fn get_raw_block(&self, hash: &BlockHash) -> Option<Vec<u8>>;
    /// The last error recorded by a failed `add`, if any.
    fn error(&self) -> Option<&Error>;
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    //! A minimal `BlockTree` used by tests.
    use super::*;
    use std::collections::HashMap;

    /// An in-memory chain that trusts linkage but not consensus. Only
    /// suitable for exercising the networking core, never for production.
    #[derive(Debug, Clone)]
    pub struct Cache {
        headers: Vec<Header>,
        hashes: HashMap<BlockHash, Height>,
        checkpoints: BTreeMap<Height, BlockHash>,
        orphans: HashMap<BlockHash, Header>,
        invalid: std::collections::HashSet<BlockHash>,
        last_error: Option<Error>,
    }

    impl Cache {
        /// Create a new cache, seeded with the given network's genesis
        /// block (§6, "Network profile": each network has its own
        /// genesis and checkpoint table).
        pub fn new(genesis: Header, checkpoints: BTreeMap<Height, BlockHash>) -> Self {
            let hash = genesis.block_hash();
            let mut hashes = HashMap::new();
            hashes.insert(hash, 0);
            Self {
                headers: vec![genesis],
                hashes,
                checkpoints,
                orphans: HashMap::new(),
                invalid: std::collections::HashSet::new(),
                last_error: None,
            }
        }
    }

    impl BlockReader for Cache {
        fn genesis(&self) -> &Header {
            &self.headers[0]
        }

        fn tip(&self) -> (BlockHash, Header) {
            let header = *self.headers.last().expect("genesis is always present");
            (header.block_hash(), header)
        }

        fn height(&self) -> Height {
            self.headers.len() as Height - 1
        }

        fn chain_work(&self) -> Work {
            Work::from_u64(self.height())
        }

        fn synced(&self) -> bool {
            self.height() >= self.last_checkpoint()
        }

        fn by_hash(&self, hash: &BlockHash) -> Option<(Height, Header)> {
            self.hashes
                .get(hash)
                .map(|h| (*h, self.headers[*h as usize]))
        }

        fn get_block_by_height(&self, height: Height) -> Option<Header> {
            self.headers.get(height as usize).copied()
        }

        fn has_orphan(&self, hash: &BlockHash) -> bool {
            self.orphans.contains_key(hash)
        }

        fn has_invalid(&self, hash: &BlockHash) -> bool {
            self.invalid.contains(hash)
        }

        fn get_orphan_root(&self, hash: &BlockHash) -> BlockHash {
            let mut root = *hash;
            while let Some(header) = self.orphans.get(&root) {
                if self.orphans.contains_key(&header.prev_blockhash) {
                    root = header.prev_blockhash;
                } else {
                    break;
                }
            }
            root
        }

        fn last_checkpoint(&self) -> Height {
            self.checkpoints
                .range(..=self.height())
                .next_back()
                .map(|(h, _)| *h)
                .unwrap_or(0)
        }

        fn checkpoints(&self) -> BTreeMap<Height, BlockHash> {
            self.checkpoints.clone()
        }

        fn get_locator(&self, from: Height) -> Locator {
            let mut locator = Vec::new();
            let mut height = from;
            let mut step = 1;

            loop {
                if let Some(header) = self.get_block_by_height(height) {
                    locator.push(header.block_hash());
                }
                if height == 0 {
                    break;
                }
                height = height.saturating_sub(step);
                if locator.len() >= 10 {
                    step *= 2;
                }
            }
            locator
        }

        fn find_locator(&self, locator: &Locator) -> Option<(Height, BlockHash)> {
            locator
                .iter()
                .find_map(|hash| self.by_hash(hash).map(|(h, _)| (h, *hash)))
        }

        fn locate_headers(&self, locator: &Locator, _stop: BlockHash, max: usize) -> Vec<Header> {
            let start = self.find_locator(locator).map(|(h, _)| h + 1).unwrap_or(1);

            self.headers
                .iter()
                .skip(start as usize)
                .take(max)
                .cloned()
                .collect()
        }
    }

    impl BlockTree for Cache {
        fn import_headers(
            &mut self,
            headers: Vec<Header>,
        ) -> Result<ImportResult, (Vec<Header>, Error)> {
            let mut connected = Vec::new();

            for header in headers {
                let (tip, _) = self.tip();
                if header.prev_blockhash != tip {
                    return Err((vec![header], Error::InvalidBlockHash));
                }
                let height = self.height() + 1;
                let hash = header.block_hash();

                if let Some(expected) = self.checkpoints.get(&height) {
                    if expected != &hash {
                        return Err((vec![header], Error::InvalidBlockHash));
                    }
                }
                self.headers.push(header);
                self.hashes.insert(hash, height);
                connected.push((height, header));
            }
            let (hash, header) = self.tip();
            Ok(ImportResult::TipChanged {
                header,
                hash,
                height: self.height(),
                reverted: vec![],
                connected,
            })
        }

        fn add(
            &mut self,
            block: crate::block::Block,
            _flags: ImportFlags,
            _peer: SocketAddr,
        ) -> Result<ImportResult, Error> {
            match self.import_headers(vec![block.header]) {
                Ok(result) => Ok(result),
                Err((_, err)) => {
                    self.last_error = Some(Error::InvalidBlockHash);
                    Err(err)
                }
            }
        }

        fn get_raw_block(&self, hash: &BlockHash) -> Option<Vec<u8>> {
            self.by_hash(hash).map(|_| Vec::new())
        }

        fn error(&self) -> Option<&Error> {
            self.last_error.as_ref()
        }
    }
}
