//! Hardcoded `(height, hash)` checkpoints per network, used to accelerate
//! and harden headers-first sync (§4.4).
use crate::block::Height;

/// Mainnet checkpoints, taken from the network's well-known history.
pub const MAINNET: &[(Height, &str)] = &[
    (
        11111,
        "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d",
    ),
    (
        33333,
        "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6",
    ),
    (
        74000,
        "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20",
    ),
    (
        105000,
        "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97",
    ),
    (
        134444,
        "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d9b6fe",
    ),
    (
        210000,
        "00000000000004c5c00ba3ca8464ecf26cd3d76e84e78cca72658c5e71e3f0c5",
    ),
    (
        350000,
        "0000000000000d2365a4ce7a4a6c7f1af2cdda26a84dadd85ab92f5b82c6c03e",
    ),
];

/// Testnet checkpoints.
pub const TESTNET: &[(Height, &str)] = &[(
    546,
    "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70",
)];

/// Regtest has no meaningful checkpoints: the chain is local and
/// reorganizable at will.
pub const REGTEST: &[(Height, &str)] = &[];

/// Signet checkpoints.
pub const SIGNET: &[(Height, &str)] = &[];
