//! A single-threaded, readiness-based reactor (`LOOP`, §6) built on
//! [`popol`]. This is deliberately thin: `LOOP` is an external
//! collaborator per the core's scope (§1), so this crate's only job is to
//! prove that [`nakamoto_net::StateMachine`] is drivable by a real,
//! non-blocking socket layer — accept, connect, read, write, timers.
#![allow(clippy::too_many_arguments)]
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixDatagram;
use std::sync::Arc;
use std::time;

use nakamoto_common::block::time::{LocalDuration, LocalTime};
use nakamoto_net::{Disconnect, Error, Io, Link, Reactor as ReactorTrait, StateMachine};

/// Maximum number of bytes read off a socket per readiness notification.
const READ_BUFFER_SIZE: usize = 1 << 16;

/// Internal bookkeeping per connected (or connecting) peer socket.
struct Peer {
    stream: net::TcpStream,
    /// Bytes queued for write that haven't been accepted by the socket
    /// yet, eg. because a previous write would have blocked (§4.2.2).
    outgoing: Vec<u8>,
    /// Whether the connection handshake with the OS (`connect()`) has
    /// resolved yet.
    connecting: bool,
}

/// A handle used to wake the reactor from another thread, eg. to deliver
/// a user command. Writing a byte to the paired socket causes the next
/// `wait_timeout` in the main loop to return immediately.
#[derive(Clone)]
pub struct Waker(Arc<UnixDatagram>);

impl Waker {
    fn pair() -> io::Result<(Self, UnixDatagram)> {
        let (a, b) = UnixDatagram::pair()?;
        a.set_nonblocking(true)?;
        b.set_nonblocking(true)?;
        Ok((Self(Arc::new(a)), b))
    }

    /// Wake the reactor up.
    pub fn wake(&self) -> io::Result<()> {
        match self.0.send(&[0x1]) {
            Ok(_) => Ok(()),
            // The pipe is full, meaning a wake is already pending: fine.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// A fixed, sentinel key identifying the waker's datagram socket among
/// the reactor's poll sources, distinct from any `SocketAddr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Source {
    Waker,
    Listener(net::SocketAddr),
    Peer(net::SocketAddr),
}

/// The concrete `LOOP`: one thread, one `popol::Sources` readiness set,
/// driving a single [`StateMachine`] to completion.
pub struct Reactor {
    peers: HashMap<net::SocketAddr, Peer>,
    listeners: Vec<net::TcpListener>,
    sources: popol::Sources<Source>,
    waker_socket: UnixDatagram,
    waker: Waker,
    timeout: Option<LocalDuration>,
}

impl Reactor {
    /// Construct a new reactor, not yet bound to any listener.
    pub fn new() -> Result<Self, Error> {
        let (waker, waker_socket) = Waker::pair()?;
        let mut sources = popol::Sources::new();

        sources.register(Source::Waker, &waker_socket, popol::interest::READ);

        Ok(Self {
            peers: HashMap::new(),
            listeners: Vec::new(),
            sources,
            waker_socket,
            waker,
            timeout: None,
        })
    }

    fn register_peer(&mut self, addr: net::SocketAddr, stream: net::TcpStream, connecting: bool) {
        stream.set_nonblocking(true).ok();
        self.sources.register(
            Source::Peer(addr),
            &stream,
            if connecting {
                popol::interest::WRITE
            } else {
                popol::interest::READ
            },
        );
        self.peers.insert(
            addr,
            Peer {
                stream,
                outgoing: Vec::new(),
                connecting,
            },
        );
    }

    fn unregister_peer(&mut self, addr: &net::SocketAddr) {
        self.sources.unregister(&Source::Peer(*addr));
        self.peers.remove(addr);
    }

    /// Write as much of a peer's outgoing buffer as the socket accepts
    /// without blocking. Partial writes are re-queued (§4.2.2: "Outbound
    /// writes to a given socket are emitted in enqueue order").
    fn flush(&mut self, addr: &net::SocketAddr) -> io::Result<()> {
        let peer = match self.peers.get_mut(addr) {
            Some(p) => p,
            None => return Ok(()),
        };
        while !peer.outgoing.is_empty() {
            match peer.stream.write(&peer.outgoing) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    peer.outgoing.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.sources
                        .set(&Source::Peer(*addr), popol::interest::WRITE);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        self.sources
            .unset(&Source::Peer(*addr), popol::interest::WRITE);
        Ok(())
    }

    fn write(&mut self, addr: net::SocketAddr, bytes: Vec<u8>) -> io::Result<()> {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.outgoing.extend(bytes);
            self.flush(&addr)?;
        }
        Ok(())
    }

    fn connect(&mut self, addr: net::SocketAddr) -> io::Result<()> {
        let stream = connect_nonblocking(addr)?;
        self.register_peer(addr, stream, true);
        Ok(())
    }

    fn disconnect(&mut self, addr: net::SocketAddr) {
        if let Some(peer) = self.peers.get(&addr) {
            peer.stream.shutdown(net::Shutdown::Both).ok();
        }
        self.unregister_peer(&addr);
    }
}

fn connect_nonblocking(addr: net::SocketAddr) -> io::Result<net::TcpStream> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;

    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(115) => {}
        Err(e) => return Err(e),
    }
    Ok(socket.into())
}

impl<M: Into<Vec<u8>>> ReactorTrait<M> for Reactor {
    type Waker = Waker;

    fn waker(&self) -> Self::Waker {
        self.waker.clone()
    }

    fn run<S>(&mut self, listen_addrs: &[net::SocketAddr], mut state_machine: S) -> Result<(), Error>
    where
        S: StateMachine<Message = M>,
    {
        for addr in listen_addrs {
            let listener = net::TcpListener::bind(addr)?;
            listener.set_nonblocking(true)?;
            self.sources
                .register(Source::Listener(*addr), &listener, popol::interest::READ);
            self.listeners.push(listener);
        }

        state_machine.initialize(LocalTime::now());
        self.drain(&mut state_machine)?;

        let mut events = popol::Events::new();

        loop {
            let timeout = self
                .timeout
                .map(|d| time::Duration::from_millis(d.as_millis() as u64))
                .unwrap_or(time::Duration::from_secs(5));

            match self.sources.wait_timeout(&mut events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }

            state_machine.tick(LocalTime::now());

            if events.iter().next().is_none() {
                state_machine.timer_expired();
            }

            for (source, event) in events.iter() {
                self.handle_event(source, event, &mut state_machine)?;
            }

            self.drain(&mut state_machine)?;
        }
    }
}

impl Reactor {
    fn handle_event<S>(
        &mut self,
        source: Source,
        event: popol::Event,
        state_machine: &mut S,
    ) -> Result<(), Error>
    where
        S: StateMachine,
    {
        match source {
            Source::Waker => {
                let mut buf = [0u8; 64];
                while self.waker_socket.recv(&mut buf).is_ok() {}
            }
            Source::Listener(local_addr) => {
                if event.readable {
                    self.accept(local_addr, state_machine)?;
                }
            }
            Source::Peer(addr) => {
                if event.writable {
                    let was_connecting = self
                        .peers
                        .get(&addr)
                        .map(|p| p.connecting)
                        .unwrap_or(false);

                    if was_connecting {
                        self.complete_connect(addr, state_machine)?;
                    } else if let Err(e) = self.flush(&addr) {
                        self.drop_peer(addr, e, state_machine);
                    }
                }
                if event.readable {
                    self.read(addr, state_machine);
                }
                if event.errored || event.hangup {
                    let err = self
                        .peers
                        .get(&addr)
                        .and_then(|p| p.stream.take_error().ok().flatten())
                        .unwrap_or_else(|| io::ErrorKind::ConnectionReset.into());
                    self.drop_peer(addr, err, state_machine);
                }
            }
        }
        Ok(())
    }

    fn accept<S: StateMachine>(
        &mut self,
        local_addr: net::SocketAddr,
        state_machine: &mut S,
    ) -> Result<(), Error> {
        let listener = self
            .listeners
            .iter()
            .find(|l| l.local_addr().ok() == Some(local_addr));
        let listener = match listener {
            Some(l) => l,
            None => return Ok(()),
        };

        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    stream.set_nodelay(true).ok();
                    self.register_peer(addr, stream, false);
                    state_machine.attempted(&addr);
                    state_machine.connected(addr, &local_addr, Link::Inbound);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!(target: "p2p::reactor", "accept() failed: {}", e);
                    break;
                }
            }
        }
        Ok(())
    }

    fn complete_connect<S: StateMachine>(&mut self, addr: net::SocketAddr, state_machine: &mut S) -> Result<(), Error> {
        let err = self
            .peers
            .get(&addr)
            .and_then(|p| p.stream.take_error().ok().flatten());

        if let Some(err) = err {
            self.drop_peer(addr, err, state_machine);
            return Ok(());
        }
        let local_addr = self
            .peers
            .get(&addr)
            .and_then(|p| p.stream.local_addr().ok());

        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.connecting = false;
        }
        self.sources.set(&Source::Peer(addr), popol::interest::READ);
        self.sources.unset(&Source::Peer(addr), popol::interest::WRITE);

        if let Some(local_addr) = local_addr {
            state_machine.connected(addr, &local_addr, Link::Outbound);
        }
        Ok(())
    }

    fn read<S: StateMachine>(&mut self, addr: net::SocketAddr, state_machine: &mut S) {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            let n = match self.peers.get_mut(&addr) {
                Some(peer) => peer.stream.read(&mut buf),
                None => return,
            };
            match n {
                Ok(0) => {
                    self.drop_peer(addr, io::ErrorKind::UnexpectedEof.into(), state_machine);
                    return;
                }
                Ok(n) => {
                    state_machine.received_bytes(&addr, &buf[..n]);
                    if n < buf.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.drop_peer(addr, e, state_machine);
                    return;
                }
            }
        }
    }

    fn drop_peer<S: StateMachine>(&mut self, addr: net::SocketAddr, err: io::Error, state_machine: &mut S) {
        self.unregister_peer(&addr);
        state_machine.disconnected(&addr, Disconnect::ConnectionError(Arc::new(err)));
    }

    /// Pull every pending `Io` instruction out of the state machine and
    /// carry it out, until it runs dry for this round (§5).
    fn drain<S: StateMachine<Message = M>, M: Into<Vec<u8>>>(
        &mut self,
        state_machine: &mut S,
    ) -> Result<(), Error> {
        while let Some(io) = state_machine.next() {
            match io {
                Io::Write(addr, bytes) => {
                    if let Err(e) = self.write(addr, bytes.into()) {
                        self.drop_peer(addr, e, state_machine);
                    }
                }
                Io::Connect(addr) => {
                    state_machine.attempted(&addr);
                    if let Err(e) = self.connect(addr) {
                        log::warn!(target: "p2p::reactor", "connect({}) failed: {}", addr, e);
                        state_machine
                            .disconnected(&addr, Disconnect::ConnectionError(Arc::new(e)));
                    }
                }
                Io::Disconnect(addr, reason) => {
                    log::debug!(target: "p2p::reactor", "disconnecting {}: {:?}", addr, reason);
                    self.disconnect(addr);
                    state_machine.disconnected(&addr, reason.into());
                }
                Io::SetTimer(duration) => {
                    self.timeout = Some(duration);
                }
                Io::Event(_) => {}
            }
        }
        Ok(())
    }
}
