//! Scenario tests exercising the assembled state machine through its
//! public [`nakamoto_net::StateMachine`] surface: feed bytes in, drain
//! `Io` out. No submanager is poked directly except where a scenario
//! (S5/S6) needs to construct wire structures too fiddly to hand-roll
//! realistically at this layer.
use std::collections::BTreeMap;
use std::net::SocketAddr;

use bitcoin::blockdata::block::BlockHeader;
use bitcoin::consensus::encode;
use bitcoin::hash_types::TxMerkleNode;
use bitcoin::hashes::Hash;
use bitcoin::network::address::Address as WireAddress;
use bitcoin::network::constants::ServiceFlags;
use bitcoin::network::message::{NetworkMessage, RawNetworkMessage};
use bitcoin::network::message_network::VersionMessage;

use nakamoto_common::block::time::{LocalTime, RefClock};
use nakamoto_common::block::tree;
use nakamoto_common::block::{BlockHash, Header};
use nakamoto_common::mempool;
use nakamoto_common::network::Network;
use nakamoto_common::p2p::peer;

use nakamoto_net::{Disconnect, Io, Link, StateMachine as _};

use super::config::Config;
use super::event::Event;
use super::framer;
use super::peer::ban;
use super::{DisconnectReason, StateMachine};

type Machine = StateMachine<tree::mock::Cache, mempool::mock::Pool, peer::mock::Book, RefClock>;

fn addr(port: u16) -> SocketAddr {
    ([127, 0, 0, 1], port).into()
}

fn header(prev: BlockHash, nonce: u32) -> Header {
    BlockHeader {
        version: 1,
        prev_blockhash: prev,
        merkle_root: TxMerkleNode::all_zeros(),
        time: 0,
        // Regtest's minimal-difficulty target: any hash clears it, so
        // `syncmgr`'s proof-of-work check passes without a mining search.
        bits: 0x207f_ffff,
        nonce,
    }
}

/// Build a machine with a fresh genesis-only chain and no checkpoints.
fn machine(config: Config) -> Machine {
    let rng = fastrand::Rng::with_seed(1);
    let genesis = Network::Regtest.genesis();
    let chain = tree::mock::Cache::new(genesis, BTreeMap::new());
    let mempool = mempool::mock::Pool::new(rng.clone());
    let addresses = peer::mock::Book::new(rng.clone());
    let clock = RefClock::default();

    let mut sm = Machine::new(chain, mempool, addresses, clock, rng, config);
    sm.initialize(LocalTime::from(1_700_000_000_000));
    drain(&mut sm);
    sm
}

/// Decode one framed message, ignoring any magic mismatch (tests always
/// construct frames with the machine's own magic).
fn decode(bytes: &[u8]) -> Option<NetworkMessage> {
    encode::deserialize::<RawNetworkMessage>(bytes)
        .ok()
        .map(|raw| raw.payload)
}

/// Pull every pending `Io` out, so later assertions only see what a
/// subsequent call produced.
fn drain(sm: &mut Machine) -> Vec<Io<Vec<u8>, Event, DisconnectReason>> {
    sm.by_ref().collect()
}

fn frame(magic: u32, msg: NetworkMessage) -> Vec<u8> {
    framer::encode(magic, msg)
}

fn writes_to<'a>(io: &'a [Io<Vec<u8>, Event, DisconnectReason>], who: SocketAddr) -> Vec<&'a [u8]> {
    io.iter()
        .filter_map(|i| match i {
            Io::Write(a, bytes) if *a == who => Some(bytes.as_slice()),
            _ => None,
        })
        .collect()
}

fn disconnected(io: &[Io<Vec<u8>, Event, DisconnectReason>], who: SocketAddr) -> Option<&DisconnectReason> {
    io.iter().find_map(|i| match i {
        Io::Disconnect(a, Disconnect::StateMachine(reason)) if *a == who => Some(reason),
        _ => None,
    })
}

fn misbehaved_score(io: &[Io<Vec<u8>, Event, DisconnectReason>], who: SocketAddr) -> Option<u32> {
    io.iter().find_map(|i| match i {
        Io::Event(Event::PeerMisbehaved { addr, score, .. }) if *addr == who => Some(*score),
        _ => None,
    })
}

fn version_message(nonce: u64, local: SocketAddr, remote: SocketAddr) -> VersionMessage {
    VersionMessage {
        version: super::PROTOCOL_VERSION,
        services: ServiceFlags::NETWORK | ServiceFlags::WITNESS,
        timestamp: 0,
        receiver: WireAddress::new(&remote, ServiceFlags::NONE),
        sender: WireAddress::new(&local, ServiceFlags::NONE),
        nonce,
        user_agent: "/test:0/".to_owned(),
        start_height: 0,
        relay: true,
    }
}

/// S1: feed a `version` frame one byte at a time; exactly one
/// `MessageReceived` must surface, only after the last byte lands. Then
/// a second, concatenated pair of frames in one chunk must yield two.
#[test]
fn s1_framing_boundaries() {
    let config = Config {
        network: Network::Regtest,
        ..Config::default()
    };
    let magic = config.network.magic();
    let mut sm = machine(config);

    let a = addr(10_001);
    let local = addr(20_001);
    sm.connected(a, &local, Link::Inbound);
    drain(&mut sm);

    let msg = version_message(42, local, a);
    let bytes = frame(magic, NetworkMessage::Version(msg));

    for i in 0..bytes.len() {
        sm.received_bytes(&a, &bytes[i..=i]);
        let io = drain(&mut sm);
        let received = io
            .iter()
            .any(|e| matches!(e, Io::Event(Event::MessageReceived { .. })));
        if i + 1 < bytes.len() {
            assert!(!received, "message surfaced before the frame was complete");
        } else {
            assert!(received, "message did not surface after the last byte");
        }
    }

    // A fresh peer, fed two concatenated `ping` frames in one chunk.
    let b = addr(10_002);
    sm.connected(b, &local, Link::Inbound);
    drain(&mut sm);
    let mut both = frame(magic, NetworkMessage::Ping(1));
    both.extend(frame(magic, NetworkMessage::Ping(2)));

    sm.received_bytes(&b, &both);
    let io = drain(&mut sm);
    let count = io
        .iter()
        .filter(|e| matches!(e, Io::Event(Event::MessageReceived { .. })))
        .count();
    assert_eq!(count, 2);
}

/// S2: a correctly-headed frame with one flipped payload byte must
/// raise a framing error, apply the +10 ban score, and close the peer.
#[test]
fn s2_invalid_checksum_closes_the_peer() {
    let config = Config {
        network: Network::Regtest,
        ..Config::default()
    };
    let magic = config.network.magic();
    let mut sm = machine(config);

    let a = addr(10_003);
    let local = addr(20_001);
    sm.connected(a, &local, Link::Inbound);
    drain(&mut sm);

    let mut bytes = frame(magic, NetworkMessage::Ping(7));
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;

    sm.received_bytes(&a, &bytes);
    let io = drain(&mut sm);

    assert_eq!(misbehaved_score(&io, a), Some(ban::BAD_MESSAGE));
    assert!(matches!(disconnected(&io, a), Some(DisconnectReason::DecodeError(_))));
}

/// S3: we dial ourselves. The `version` we send carries a nonce we
/// generated; looping it back as the "remote"'s `version` must be
/// recognized via `NONCES` and close the connection without ever
/// reaching `CONNECTED`.
#[test]
fn s3_self_connection_is_detected_via_nonce() {
    let config = Config {
        network: Network::Regtest,
        max_outbound: 1,
        ..Config::default()
    };
    let magic = config.network.magic();
    let mut sm = machine(config);

    let remote = addr(10_004);
    let local = addr(20_002);
    sm.connected(remote, &local, Link::Outbound);
    let io = drain(&mut sm);

    let our_version = writes_to(&io, remote)
        .into_iter()
        .find_map(|bytes| match decode(bytes) {
            Some(NetworkMessage::Version(v)) => Some(v),
            _ => None,
        })
        .expect("outbound side sends version first");

    // The loopback: our own nonce comes back as the "peer"'s version.
    let looped = version_message(our_version.nonce, remote, local);
    let bytes = frame(magic, NetworkMessage::Version(looped));

    sm.received_bytes(&remote, &bytes);
    let io = drain(&mut sm);

    assert!(matches!(disconnected(&io, remote), Some(DisconnectReason::SelfConnection)));
    assert!(
        writes_to(&io, remote)
            .iter()
            .any(|bytes| matches!(decode(bytes), Some(NetworkMessage::Reject(_)))),
        "a reject should accompany the self-connection close"
    );
}

/// S4: headers-first sync to a checkpoint. A loader feeds headers in
/// batches; the batch landing on the checkpoint height must match its
/// hash exactly, or the loader is closed with the full ban score.
#[test]
fn s4_headers_sync_to_checkpoint() {
    let genesis = Network::Regtest.genesis();
    let genesis_hash = genesis.block_hash();

    let mut chain_headers = Vec::new();
    let mut prev = genesis_hash;
    for i in 1..=5u32 {
        let h = header(prev, i);
        prev = h.block_hash();
        chain_headers.push(h);
    }
    let checkpoint_hash = chain_headers[2].block_hash(); // height 3

    let mut checkpoints = BTreeMap::new();
    checkpoints.insert(3u64, checkpoint_hash);

    let config = Config {
        network: Network::Regtest,
        checkpoints_enabled: true,
        ..Config::default()
    };
    let magic = config.network.magic();
    let rng = fastrand::Rng::with_seed(2);
    let chain = tree::mock::Cache::new(genesis, checkpoints);
    let mempool = mempool::mock::Pool::new(rng.clone());
    let addresses = peer::mock::Book::new(rng.clone());
    let clock = RefClock::default();
    let mut sm = Machine::new(chain, mempool, addresses, clock, rng, config);
    sm.initialize(LocalTime::from(1_700_000_000_000));
    drain(&mut sm);

    let loader = addr(10_005);
    let local = addr(20_003);
    sm.connected(loader, &local, Link::Inbound);
    drain(&mut sm);

    let version = version_message(99, local, loader);
    sm.received_bytes(&loader, &frame(magic, NetworkMessage::Version(version)));
    drain(&mut sm);
    sm.received_bytes(&loader, &frame(magic, NetworkMessage::Verack));
    drain(&mut sm);

    // Feed the first three headers: exactly reaches the checkpoint.
    let good_batch = chain_headers[0..3].to_vec();
    sm.received_bytes(&loader, &frame(magic, NetworkMessage::Headers(good_batch)));
    let io = drain(&mut sm);

    assert!(io.iter().any(|e| matches!(e, Io::Event(Event::CheckpointCrossed { height: 3 }))));
    assert!(disconnected(&io, loader).is_none());
}

/// S4b: a header landing on the checkpoint height with the wrong hash
/// must close the loader with the full protocol-violation ban score.
#[test]
fn s4_wrong_checkpoint_hash_bans_the_loader() {
    let genesis = Network::Regtest.genesis();
    let genesis_hash = genesis.block_hash();
    let wrong = header(genesis_hash, 1);
    let mut checkpoints = BTreeMap::new();
    checkpoints.insert(1u64, BlockHash::all_zeros());

    let config = Config {
        network: Network::Regtest,
        checkpoints_enabled: true,
        ..Config::default()
    };
    let magic = config.network.magic();
    let rng = fastrand::Rng::with_seed(3);
    let chain = tree::mock::Cache::new(genesis, checkpoints);
    let mempool = mempool::mock::Pool::new(rng.clone());
    let addresses = peer::mock::Book::new(rng.clone());
    let clock = RefClock::default();
    let mut sm = Machine::new(chain, mempool, addresses, clock, rng, config);
    sm.initialize(LocalTime::from(1_700_000_000_000));
    drain(&mut sm);

    let loader = addr(10_006);
    let local = addr(20_004);
    sm.connected(loader, &local, Link::Inbound);
    drain(&mut sm);
    sm.received_bytes(&loader, &frame(magic, NetworkMessage::Version(version_message(1, local, loader))));
    drain(&mut sm);
    sm.received_bytes(&loader, &frame(magic, NetworkMessage::Verack));
    drain(&mut sm);

    sm.received_bytes(&loader, &frame(magic, NetworkMessage::Headers(vec![wrong])));
    let io = drain(&mut sm);

    assert_eq!(misbehaved_score(&io, loader), Some(ban::PROTOCOL_VIOLATION));
    assert!(matches!(disconnected(&io, loader), Some(DisconnectReason::PeerMisbehaving(_))));
}

/// S7: a peer finishes the handshake, then goes silent. Once
/// `GETHEADERS_TIMEOUT` (60s, the loader-stall window that doubles as
/// the post-handshake liveness check here) elapses with no activity,
/// the loader is closed and its outstanding state is gone.
#[test]
fn s7_stalled_loader_is_disconnected() {
    let config = Config {
        network: Network::Regtest,
        checkpoints_enabled: false,
        ..Config::default()
    };
    let magic = config.network.magic();
    let mut sm = machine(config);

    let p = addr(10_007);
    let local = addr(20_005);
    let t0 = LocalTime::from(1_700_000_000_000);

    sm.connected(p, &local, Link::Outbound);
    drain(&mut sm);
    sm.received_bytes(&p, &frame(magic, NetworkMessage::Version(version_message(1, local, p))));
    drain(&mut sm);
    sm.received_bytes(&p, &frame(magic, NetworkMessage::Verack));
    drain(&mut sm);

    assert_eq!(sm.peer_count(), 1);

    sm.tick(t0 + nakamoto_common::block::time::LocalDuration::from_secs(61));
    sm.timer_expired();
    let io = drain(&mut sm);

    assert!(matches!(
        disconnected(&io, p),
        Some(DisconnectReason::PeerTimeout("getheaders"))
    ));
}
