//! Common types shared by the peer-to-peer networking core and its
//! collaborators.
#![allow(clippy::too_many_arguments)]

pub mod block;
pub mod collections;
pub mod filter;
pub mod mempool;
pub mod network;
pub mod p2p;

/// Re-export of the Bitcoin protocol types used throughout this workspace.
pub use bitcoin;
/// Re-export of the hash functions used to identify blocks and transactions.
pub use bitcoin_hashes;

/// Emits a `module::function` string for use in log targets and panic
/// messages, the way the teacher's own `source!()` does.
#[macro_export]
macro_rules! source {
    () => {
        concat!(module_path!(), ":", line!())
    };
}
