//! Every knob enumerated in spec.md §6 ("Environment / configuration"),
//! plus the numeric quotas from §5, collected the way the teacher's own
//! `fsm::Config` does.
use nakamoto_common::network::Network;

/// Numeric quotas enforced throughout the core (§5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Outstanding block requests per peer (I3, §4.3.5).
    pub max_block_request: usize,
    /// Outstanding tx requests per peer (§9 open question 3: same
    /// default as `max_block_request` unless overridden).
    pub max_tx_request: usize,
    /// In-flight compact blocks per peer (§4.6 step 7, §5).
    pub max_inflight_compact: usize,
    /// Maximum frame payload size (§3, §5).
    pub max_message: u32,
    /// Maximum items in one `inv`/`getdata` (§4.3.4, §5).
    pub max_inv: usize,
    /// Maximum addresses accepted in one `addr` (§4.3.4, §5).
    pub max_addr: usize,
    /// Hard cap on a peer's outbound socket buffer before it is closed
    /// as stalled (§4.2.2, §5).
    pub max_send_buffer: usize,
    /// While serving `getdata`, stop filling once buffered + queued
    /// reaches this (§4.2.2).
    pub send_buffer_watermark: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_block_request: 16,
            max_tx_request: 16,
            max_inflight_compact: 15,
            max_message: super::framer::MAX_MESSAGE,
            max_inv: 50_000,
            max_addr: 1000,
            max_send_buffer: 30 * 1024 * 1024,
            send_buffer_watermark: 10 * 1024 * 1024,
        }
    }
}

/// The core's full runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// The network this node participates in.
    pub network: Network,
    /// Target outbound peer count (§4.3.2).
    pub max_outbound: usize,
    /// Listen backlog / inbound cap (§4.3.3, §C "hard cap").
    pub max_inbound: usize,
    /// Engage headers-first sync with the network's hardcoded
    /// checkpoints (§4.4).
    pub checkpoints_enabled: bool,
    /// Honor BIP37 `filterload`/`mempool` requests.
    pub bip37_enabled: bool,
    /// Negotiate BIP152 compact blocks.
    pub bip152_enabled: bool,
    /// 0 = accept `cmpctblock` announcements; 1 = accept *and* announce
    /// our own new blocks as compact (§6).
    pub block_mode: u8,
    /// Allow the non-witness (v1) compact-block variant (§9 open
    /// question 2; defaults to `false`, kept feature-flagged off).
    pub compact_allow_non_witness: bool,
    /// Service bits mandatory on outbound peers (§4.3.2).
    pub required_services: bitcoin::network::constants::ServiceFlags,
    /// Allow dialing `.onion` addresses (§4.3.2).
    pub onion_enabled: bool,
    /// Locally configured minimum relay fee, sat/kB; `0` disables
    /// `feefilter` announcements (§C "feefilter").
    pub min_relay_fee: u64,
    /// User agent string advertised in our `version` message.
    pub user_agent: &'static str,
    /// Numeric quotas.
    pub limits: Limits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            max_outbound: 8,
            max_inbound: 8,
            checkpoints_enabled: true,
            bip37_enabled: false,
            bip152_enabled: true,
            block_mode: 0,
            compact_allow_non_witness: false,
            required_services: bitcoin::network::constants::ServiceFlags::NETWORK
                | bitcoin::network::constants::ServiceFlags::WITNESS,
            onion_enabled: false,
            min_relay_fee: 1000,
            user_agent: crate::fsm::USER_AGENT,
            limits: Limits::default(),
        }
    }
}
