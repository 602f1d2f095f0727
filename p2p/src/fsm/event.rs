//! Events the core emits, for diagnostics and for internal propagation
//! between submanagers (`StateMachine::event`, §5 "tick callback").
use std::fmt;
use std::net;
use std::sync::Arc;

use nakamoto_common::bitcoin::network::message::NetworkMessage;
use nakamoto_common::bitcoin::network::message_network::VersionMessage;
use nakamoto_common::block::time::LocalTime;
use nakamoto_common::block::{BlockHash, Height};

use super::{DisconnectReason, Link, PeerId};

/// An event produced by the core. Events never drive I/O directly; they
/// are consumed internally by submanagers and surfaced to callers via
/// `Io::Event` for logging/diagnostics.
#[derive(Debug, Clone)]
pub enum Event {
    /// The state machine is initializing.
    Initializing,
    /// The state machine has finished initializing and is ready to run.
    Ready {
        /// Active chain tip height at startup.
        tip: Height,
        /// Local wall-clock time at startup.
        time: LocalTime,
    },
    /// A `version` message was received from a peer, before the
    /// handshake validation in §4.2.1 has run.
    VersionReceived {
        /// The peer's address.
        addr: PeerId,
        /// The message itself.
        msg: Box<VersionMessage>,
    },
    /// A peer completed the handshake (received/sent `verack`, §4.2.1).
    PeerNegotiated {
        /// The peer's address.
        addr: PeerId,
        /// Connection direction.
        link: Link,
        /// Services this peer advertises.
        services: nakamoto_common::bitcoin::network::constants::ServiceFlags,
        /// The peer's self-reported height.
        height: Height,
        /// The peer's user agent string.
        user_agent: String,
    },
    /// A peer was connected at the socket layer, handshake pending.
    PeerConnected {
        /// The peer's address.
        addr: PeerId,
        /// Connection direction.
        link: Link,
    },
    /// A peer was disconnected.
    PeerDisconnected {
        /// The peer's address.
        addr: PeerId,
        /// The reason given.
        reason: Arc<DisconnectReason>,
    },
    /// A peer's ban-score reached a threshold worth logging (§4.2.3).
    PeerMisbehaved {
        /// The peer's address.
        addr: PeerId,
        /// A human-readable reason.
        reason: &'static str,
        /// The ban-score increment applied.
        score: u32,
    },
    /// A framing error occurred reading from a peer (§4.1, §7 kind 1).
    InvalidMessage {
        /// The peer's address.
        addr: PeerId,
        /// A description of the framing failure.
        reason: &'static str,
    },
    /// A full message was decoded from a peer's byte stream and dispatched.
    MessageReceived {
        /// The sender's address.
        from: PeerId,
        /// The decoded payload.
        message: Arc<NetworkMessage>,
    },
    /// A message was sent to a peer.
    MessageSent {
        /// The recipient's address.
        to: PeerId,
        /// The command name of what was sent.
        command: &'static str,
    },
    /// The headers chain crossed a checkpoint (§4.4).
    CheckpointCrossed {
        /// The checkpoint height reached.
        height: Height,
    },
    /// The local chain is caught up with the network (§4.4, §4.5).
    Synced {
        /// The synced tip height.
        height: Height,
    },
    /// A block was received and handed to `CHAIN` (§4.5).
    BlockReceived {
        /// The sender.
        from: PeerId,
        /// The block's hash.
        hash: BlockHash,
        /// Height assigned by `CHAIN`, if it connected to the active
        /// chain immediately.
        height: Option<Height>,
    },
    /// A compact block was reconstructed and finalized (§4.6).
    CompactBlockReconstructed {
        /// The sender.
        from: PeerId,
        /// The block's hash.
        hash: BlockHash,
    },
    /// An address was discovered and added to `ADDRMAN`.
    AddressDiscovered {
        /// The discovered address.
        addr: net::SocketAddr,
        /// Who told us about it.
        source: nakamoto_common::p2p::peer::Source,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Ready { tip, .. } => write!(f, "ready, tip = {}", tip),
            Self::VersionReceived { addr, .. } => write!(f, "{}: version received", addr),
            Self::PeerNegotiated { addr, .. } => write!(f, "{}: negotiated", addr),
            Self::PeerConnected { addr, link } => write!(f, "{}: connected ({:?})", addr, link),
            Self::PeerDisconnected { addr, reason } => {
                write!(f, "{}: disconnected: {}", addr, reason)
            }
            Self::PeerMisbehaved {
                addr,
                reason,
                score,
            } => write!(f, "{}: misbehaved ({}), ban-score += {}", addr, reason, score),
            Self::InvalidMessage { addr, reason } => {
                write!(f, "{}: framing error: {}", addr, reason)
            }
            Self::MessageReceived { from, message } => {
                write!(f, "{}: received {}", from, message.cmd())
            }
            Self::MessageSent { to, command } => write!(f, "{}: sent {}", to, command),
            Self::CheckpointCrossed { height } => write!(f, "checkpoint crossed at {}", height),
            Self::Synced { height } => write!(f, "synced at {}", height),
            Self::BlockReceived { from, hash, .. } => write!(f, "{}: block {} received", from, hash),
            Self::CompactBlockReconstructed { from, hash } => {
                write!(f, "{}: compact block {} reconstructed", from, hash)
            }
            Self::AddressDiscovered { addr, .. } => write!(f, "address {} discovered", addr),
        }
    }
}
