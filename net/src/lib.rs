//! The sans-I/O seam between the protocol core and whatever drives its
//! sockets (`LOOP`, §6).
//!
//! This crate defines no sockets and spawns no threads. It only names the
//! shape of the conversation between a [`StateMachine`] and a [`Reactor`]:
//! the state machine is a pure value that consumes inbound bytes and
//! timer/connection events and produces an iterator of [`Io`] instructions;
//! the reactor is whatever turns those instructions into actual socket
//! calls and feeds results back in. `nakamoto-net-poll` is the one concrete
//! reactor this workspace ships.
#![allow(clippy::too_many_arguments)]
use std::fmt::Debug;
use std::io;
use std::net;
use std::sync::Arc;

use nakamoto_common::block::time::LocalDuration;
pub use nakamoto_common::block::time::LocalTime;

/// The direction a connection was established in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    /// We dialed out to the peer.
    Outbound,
    /// The peer connected to us.
    Inbound,
}

impl Link {
    /// Whether this is an outbound link.
    pub fn is_outbound(&self) -> bool {
        matches!(self, Self::Outbound)
    }

    /// Whether this is an inbound link.
    pub fn is_inbound(&self) -> bool {
        matches!(self, Self::Inbound)
    }
}

/// Why a connection was dropped.
#[derive(Debug, Clone)]
pub enum Disconnect<T> {
    /// The state machine asked for the disconnection.
    StateMachine(T),
    /// The connection failed or was dropped at the socket layer, with no
    /// involvement from the state machine (§7 kind 5, "socket error").
    ConnectionError(Arc<io::Error>),
}

impl<T: Debug> Disconnect<T> {
    /// Whether this disconnect reason may no longer apply after some
    /// time has passed (used by the reactor to decide whether to retry
    /// a dial).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionError(_))
    }
}

impl<T: std::fmt::Display> std::fmt::Display for Disconnect<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StateMachine(reason) => write!(f, "{}", reason),
            Self::ConnectionError(err) => write!(f, "{}", err),
        }
    }
}

/// An instruction emitted by a [`StateMachine`] for the [`Reactor`] to
/// carry out. The state machine never performs I/O itself; it only
/// describes what should happen.
#[derive(Debug)]
pub enum Io<M, E, D = ()> {
    /// Write a message to the given peer.
    Write(net::SocketAddr, M),
    /// Connect to the given peer.
    Connect(net::SocketAddr),
    /// Disconnect from the given peer, for the given reason.
    Disconnect(net::SocketAddr, Disconnect<D>),
    /// (Re-)set the global wake-up timer to fire after the given duration.
    SetTimer(LocalDuration),
    /// Emit an event, for diagnostics or downstream consumers; carries no
    /// socket action.
    Event(E),
}

/// The driving surface of the protocol core. A type implementing this is
/// handed socket-level events by a [`Reactor`] and answers with an
/// iterator of [`Io`] instructions (via [`Iterator`]) until it runs dry for
/// this round of the event loop — "suspension occurs only by returning to
/// the loop" (§5).
pub trait StateMachine:
    Iterator<Item = Io<Self::Message, Self::Event, Self::DisconnectReason>>
{
    /// The wire message type this state machine speaks.
    type Message;
    /// The event type this state machine emits for diagnostics.
    type Event;
    /// The reason a disconnection was requested by this state machine.
    type DisconnectReason: Into<Disconnect<Self::DisconnectReason>> + Debug;

    /// Called once, before the reactor starts polling, with the current
    /// local time.
    fn initialize(&mut self, _time: LocalTime) {}

    /// Fresh bytes were read off `addr`'s socket. The state machine owns
    /// framing (§4.1): it is responsible for buffering partial frames
    /// across calls and for emitting whatever `Event`s a fully decoded
    /// message produces. The reactor never interprets the byte stream.
    fn received_bytes(&mut self, addr: &net::SocketAddr, bytes: &[u8]);

    /// A connection attempt to `addr` was made (the dial was issued, not
    /// necessarily that it succeeded).
    fn attempted(&mut self, addr: &net::SocketAddr);

    /// A connection to `addr` was established.
    fn connected(&mut self, addr: net::SocketAddr, local_addr: &net::SocketAddr, link: Link);

    /// A connection to `addr` was lost, for the given reason.
    fn disconnected(
        &mut self,
        addr: &net::SocketAddr,
        reason: Disconnect<Self::DisconnectReason>,
    );

    /// The event loop ticked. Called at most once per iteration (§5); must
    /// return quickly.
    fn tick(&mut self, local_time: LocalTime);

    /// The timer set via `Io::SetTimer` has expired.
    fn timer_expired(&mut self);
}

/// Errors a [`Reactor`] can report back to its caller.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An I/O error occurred at the socket layer.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Whatever drives a [`StateMachine`]'s sockets. `nakamoto-net-poll`
/// supplies the one concrete implementation this workspace ships; `LOOP`
/// is otherwise an external collaborator (§1).
pub trait Reactor<M> {
    /// A handle other threads can use to wake the reactor up out of band
    /// (eg. to deliver a `Command`).
    type Waker;

    /// Run the given state machine against the given listen addresses,
    /// until the reactor is shut down.
    fn run<S>(
        &mut self,
        listen_addrs: &[net::SocketAddr],
        state_machine: S,
    ) -> Result<(), Error>
    where
        S: StateMachine<Message = M>;

    /// Construct a waker usable from another thread.
    fn waker(&self) -> Self::Waker;
}
