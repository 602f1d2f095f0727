//! The shared output queue every submanager pushes instructions into.
//! Draining it is how the core's `Iterator` surface (required by
//! [`nakamoto_net::StateMachine`]) is implemented (§5: "suspension occurs
//! only by returning to the loop").
use std::collections::VecDeque;
use std::net;

use bitcoin::network::message::{NetworkMessage, Reject};
use bitcoin_hashes::sha256d;
use nakamoto_common::block::time::LocalDuration;

use super::framer;
use super::{DisconnectReason, Event, PeerId, RejectCode};

/// The core's `Io` type: outbound bytes are pre-framed before they leave
/// the `p2p` crate, so the reactor never needs to know about `MSG_CODEC`.
pub type Io = nakamoto_net::Io<Vec<u8>, Event, DisconnectReason>;

/// A FIFO queue of pending [`Io`] instructions, plus the network magic
/// needed to frame outbound messages.
#[derive(Debug)]
pub struct Outbox {
    magic: u32,
    queue: VecDeque<Io>,
}

impl Outbox {
    /// Construct an outbox for the given network magic.
    pub fn new(magic: u32) -> Self {
        Self {
            magic,
            queue: VecDeque::new(),
        }
    }

    /// Frame and queue a message for a peer.
    pub fn message(&mut self, addr: PeerId, message: NetworkMessage) {
        let command = message.cmd();
        let bytes = framer::encode(self.magic, message);

        self.queue.push_back(Io::Write(addr, bytes));
        self.queue.push_back(Io::Event(Event::MessageSent {
            to: addr,
            command,
        }));
    }

    /// Queue a `reject` for a message we refused to honor (§C, "`reject`
    /// construction"). `hash` is the zero hash for rejects that aren't
    /// about a specific tx/block, matching the original's convention.
    pub fn reject(
        &mut self,
        addr: PeerId,
        message: &'static str,
        ccode: RejectCode,
        reason: &'static str,
        hash: sha256d::Hash,
    ) {
        self.message(
            addr,
            NetworkMessage::Reject(Reject {
                message: message.into(),
                ccode: ccode.into(),
                reason: reason.into(),
                hash,
            }),
        );
    }

    /// Queue a connection attempt.
    pub fn connect(&mut self, addr: net::SocketAddr) {
        self.queue.push_back(Io::Connect(addr));
    }

    /// Queue a disconnection.
    pub fn disconnect(&mut self, addr: PeerId, reason: DisconnectReason) {
        self.queue
            .push_back(Io::Disconnect(addr, reason.into()));
    }

    /// Queue a timer (re)set.
    pub fn set_timer(&mut self, duration: LocalDuration) {
        self.queue.push_back(Io::SetTimer(duration));
    }

    /// Queue an event for diagnostics.
    pub fn event(&mut self, event: Event) {
        self.queue.push_back(Io::Event(event));
    }
}

impl Iterator for Outbox {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        self.queue.pop_front()
    }
}
