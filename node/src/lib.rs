//! A thin binary wiring [`nakamoto_p2p::fsm::StateMachine`] to
//! [`nakamoto_net_poll::Reactor`]: CLI flags in, a running node out. No
//! protocol logic lives here (§A, "`node` — a thin binary").
#![allow(clippy::too_many_arguments)]
use std::net;

use bitcoin::network::constants::ServiceFlags;
use nakamoto_common::block::time::RefClock;
use nakamoto_common::block::tree;
use nakamoto_common::mempool;
use nakamoto_common::network::Network;
use nakamoto_common::p2p::peer;
use nakamoto_net::Reactor as _;
use nakamoto_p2p::fsm::{self, Config};

use thiserror::Error;

/// Command-line / config-file options understood by the node (§B,
/// "Configuration": `node` layers CLI parsing on top of `p2p::Config`).
#[derive(argh::FromArgs, Debug)]
#[argh(description = "a Bitcoin peer-to-peer full node")]
pub struct Options {
    /// connect only to these addresses, skipping address discovery
    #[argh(option, short = 'c')]
    pub connect: Vec<net::SocketAddr>,

    /// listen for inbound connections on these addresses
    #[argh(option, short = 'l')]
    pub listen: Vec<net::SocketAddr>,

    /// network to connect to: mainnet, testnet, regtest or signet
    #[argh(option, default = "Network::Mainnet")]
    pub network: Network,

    /// disable headers-first checkpoint acceleration (§4.4)
    #[argh(switch)]
    pub no_checkpoints: bool,

    /// enable debug logging
    #[argh(switch, short = 'v')]
    pub verbose: bool,
}

/// Errors that can prevent the node from starting or running.
#[derive(Error, Debug)]
pub enum Error {
    /// An error occurred in the reactor or its sockets.
    #[error(transparent)]
    Net(#[from] nakamoto_net::Error),
}

/// Run the node to completion (or until the reactor errors out). Blocks
/// the calling thread; `LOOP` is single-threaded (§A).
pub fn run(options: Options) -> Result<(), Error> {
    log::info!("starting on {}", options.network.as_str());

    let network = options.network;
    let rng = fastrand::Rng::new();
    let genesis = network.genesis();
    let checkpoints = if options.no_checkpoints {
        Default::default()
    } else {
        network.checkpoints()
    };

    let chain = tree::mock::Cache::new(genesis, checkpoints);
    let mempool = mempool::mock::Pool::new(rng.clone());
    let clock = RefClock::default();

    let mut addresses = peer::mock::Book::new(rng.clone());
    for addr in &options.connect {
        addresses.add(*addr, ServiceFlags::NONE, peer::Source::Manual);
    }

    let mut config = Config {
        network,
        checkpoints_enabled: !options.no_checkpoints,
        ..Config::default()
    };
    if !options.connect.is_empty() {
        // A manual peer set means we rely on it exclusively, not discovery.
        config.max_outbound = options.connect.len();
    }

    log::info!("genesis hash is {}", network.genesis_hash());
    log::debug!("{:?}", config);

    let protocol = fsm::StateMachine::new(chain, mempool, addresses, clock, rng, config);
    let mut reactor = nakamoto_net_poll::Reactor::new()?;

    let listen: Vec<net::SocketAddr> = if options.listen.is_empty() {
        vec![([0, 0, 0, 0], network.port()).into()]
    } else {
        options.listen.clone()
    };

    reactor.run(&listen, protocol)?;

    Ok(())
}
