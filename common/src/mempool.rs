//! The mempool collaborator (`MEMPOOL`), out of scope per §1: this module
//! only defines the interface §6 enumerates.
use std::net::SocketAddr;

use bitcoin::Txid;
use thiserror::Error;

use crate::block::Transaction;

/// An error returned by `MEMPOOL.add`.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("transaction already in mempool")]
    Duplicate,
    #[error("transaction previously rejected")]
    Rejected,
    #[error("transaction is an orphan, missing {0} input(s)")]
    Orphan(usize),
    #[error("transaction conflicts with one already in the mempool")]
    Conflict,
    #[error("transaction fee is below the minimum relay fee")]
    InsufficientFee,
}

impl Error {
    /// Ban-score contribution for this rejection (§7 kind 3).
    pub fn ban_score(&self) -> u32 {
        match self {
            Error::Duplicate | Error::Rejected | Error::Conflict => 0,
            Error::Orphan(_) => 0,
            Error::InsufficientFee => 0,
        }
    }
}

/// The `MEMPOOL` interface (§6).
pub trait Mempool {
    /// Whether a transaction is already in the mempool.
    fn has(&self, txid: &Txid) -> bool;
    /// Whether a transaction was previously rejected.
    fn has_reject(&self, txid: &Txid) -> bool;
    /// Whether a transaction is a known orphan awaiting its parents.
    fn has_orphan(&self, txid: &Txid) -> bool;
    /// Fetch a transaction by id.
    fn get(&self, txid: &Txid) -> Option<Transaction>;
    /// The fee rate, in satoshis per virtual byte, of an already-accepted
    /// transaction. Used by the fee-rate filter (§4.2.4).
    fn feerate(&self, txid: &Txid) -> Option<u64>;
    /// Attempt to add a transaction received from `peer`.
    fn add(&mut self, tx: Transaction, peer: SocketAddr) -> Result<(), Error>;
    /// The last error recorded by a failed `add`, if any.
    fn error(&self) -> Option<&Error>;
    /// The set of parent transaction ids a just-added orphan is missing.
    fn missing(&self, tx: &Transaction) -> Vec<Txid>;
    /// Iterate over all mempool entries, for `mempool` message responses.
    fn iter(&self) -> Box<dyn Iterator<Item = Txid> + '_>;
    /// Number of entries in the mempool.
    fn len(&self) -> usize;
    /// Whether the mempool is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    //! A minimal in-memory `Mempool`, used by tests and as `node`'s
    //! default wiring until a real `MEMPOOL` is supplied.
    use super::*;
    use crate::collections::HashMap;
    use bitcoin::consensus::encode;

    /// An in-memory mempool that accepts anything not already present.
    #[derive(Debug, Default)]
    pub struct Pool {
        txs: HashMap<Txid, Transaction>,
        rejected: std::collections::HashSet<Txid>,
        last_error: Option<Error>,
    }

    impl Pool {
        /// Create an empty mempool.
        pub fn new(rng: fastrand::Rng) -> Self {
            Self {
                txs: HashMap::with_hasher(rng.into()),
                rejected: std::collections::HashSet::new(),
                last_error: None,
            }
        }
    }

    impl Mempool for Pool {
        fn has(&self, txid: &Txid) -> bool {
            self.txs.contains_key(txid)
        }

        fn has_reject(&self, txid: &Txid) -> bool {
            self.rejected.contains(txid)
        }

        fn has_orphan(&self, _txid: &Txid) -> bool {
            false
        }

        fn get(&self, txid: &Txid) -> Option<Transaction> {
            self.txs.get(txid).cloned()
        }

        fn feerate(&self, txid: &Txid) -> Option<u64> {
            self.txs.get(txid).map(|tx| {
                let weight = encode::serialize(tx).len().max(1) as u64;
                // No UTXO view to compute an actual fee from here; treat
                // every locally-accepted tx as clearing the relay floor.
                1000 / weight.max(1)
            })
        }

        fn add(&mut self, tx: Transaction, _peer: SocketAddr) -> Result<(), Error> {
            let txid = tx.txid();
            if self.txs.contains_key(&txid) {
                self.last_error = Some(Error::Duplicate);
                return Err(Error::Duplicate);
            }
            if self.rejected.contains(&txid) {
                self.last_error = Some(Error::Rejected);
                return Err(Error::Rejected);
            }
            self.txs.insert(txid, tx);
            Ok(())
        }

        fn error(&self) -> Option<&Error> {
            self.last_error.as_ref()
        }

        fn missing(&self, _tx: &Transaction) -> Vec<Txid> {
            Vec::new()
        }

        fn iter(&self) -> Box<dyn Iterator<Item = Txid> + '_> {
            Box::new(self.txs.keys().copied())
        }

        fn len(&self) -> usize {
            self.txs.len()
        }
    }
}
