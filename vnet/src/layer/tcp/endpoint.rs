//! The transport core: the connection table and the packet-in dispatcher.
use core::fmt;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};

use log::{debug, trace};

use crate::layer::ip::{IpStack, Received};
use crate::layer::{Error, Result};
use crate::wire::{tcp_segment, Checksum, IpProtocol, Ipv4Address, TcpFlags, TcpRepr,
                  TcpSeqNumber, TCP_HEADER_LEN};

use super::rto::RttEstimator;
use super::socket::StreamSocket;
use super::{State, TcpParams};

/// The shell-visible identifier of a socket.
pub type SocketId = u32;

/// First port of the ephemeral allocation range.
const EPHEMERAL_BASE: u16 = 49152;

/// Pending handshakes a listener holds before it starts dropping SYNs.
const ACCEPT_BACKLOG: usize = 64;

/// The four numbers that name a connection.
///
/// A listening socket wildcards the remote half (and usually the local
/// address) with zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourTuple {
    pub local: Ipv4Address,
    pub local_port: u16,
    pub remote: Ipv4Address,
    pub remote_port: u16,
}

impl FourTuple {
    fn listening(port: u16) -> FourTuple {
        FourTuple {
            local: Ipv4Address::UNSPECIFIED,
            local_port: port,
            remote: Ipv4Address::UNSPECIFIED,
            remote_port: 0,
        }
    }
}

impl fmt::Display for FourTuple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{} {}:{}",
               self.local, self.local_port, self.remote, self.remote_port)
    }
}

/// Either kind of socket, stored uniformly in the connection table.
#[derive(Clone)]
pub enum SocketHandle {
    Listen(Arc<ListenSocket>),
    Stream(Arc<StreamSocket>),
}

impl SocketHandle {
    /// The shell-visible identifier.
    pub fn id(&self) -> SocketId {
        match self {
            SocketHandle::Listen(socket) => socket.id(),
            SocketHandle::Stream(socket) => socket.id(),
        }
    }

    /// Close either kind of socket.
    pub fn close(&self) -> Result<()> {
        match self {
            SocketHandle::Listen(socket) => {
                socket.close();
                Ok(())
            }
            SocketHandle::Stream(socket) => socket.close(),
        }
    }
}

/// One row of the `ls` listing.
#[derive(Debug, Clone)]
pub struct SocketInfo {
    pub sid: SocketId,
    pub tuple: FourTuple,
    pub state: State,
}

struct TableEntry {
    tuple: FourTuple,
    socket: SocketHandle,
}

struct Table {
    entries: Vec<TableEntry>,
    next_sid: SocketId,
    next_port: u16,
}

/// The transport core of one node.
pub struct TcpStack {
    me: Weak<TcpStack>,
    ip: Arc<IpStack>,
    params: TcpParams,
    table: Mutex<Table>,
}

impl TcpStack {
    /// A transport core with the default protocol constants.
    pub fn new(ip: Arc<IpStack>) -> Arc<TcpStack> {
        Self::with_params(ip, TcpParams::default())
    }

    /// A transport core with explicit tunables.
    pub fn with_params(ip: Arc<IpStack>, params: TcpParams) -> Arc<TcpStack> {
        Arc::new_cyclic(|me| TcpStack {
            me: me.clone(),
            ip,
            params,
            table: Mutex::new(Table {
                entries: Vec::new(),
                next_sid: 0,
                next_port: EPHEMERAL_BASE,
            }),
        })
    }

    /// Install the protocol handler on the IP core.
    ///
    /// The handler keeps only a weak reference; the node wiring owns the
    /// transport core, while the core itself owns a sending reference to
    /// the IP layer below.
    pub fn register(&self) {
        let stack = self.me.clone();
        self.ip.register_handler(IpProtocol::TCP, move |recv| {
            if let Some(stack) = stack.upgrade() {
                stack.on_datagram(recv);
            }
        });
    }

    /// The tunables this stack runs with.
    pub fn params(&self) -> &TcpParams {
        &self.params
    }

    /// The IP core segments leave through.
    pub fn ip(&self) -> &Arc<IpStack> {
        &self.ip
    }

    /// A fresh round-trip estimator seeded from the tunables.
    pub(super) fn estimator(&self) -> RttEstimator {
        RttEstimator::new(self.params.rto_initial, self.params.rto_min, self.params.rto_max)
    }

    /// Open a listening socket on `port`.
    pub fn listen(&self, port: u16) -> Result<Arc<ListenSocket>> {
        let mut table = self.table.lock().unwrap();

        let occupied = table.entries.iter().any(|entry| {
            matches!(entry.socket, SocketHandle::Listen(_))
                && entry.tuple.local_port == port
        });
        if occupied {
            return Err(Error::ConnectionExists);
        }

        let sid = table.alloc_sid();
        let listener = ListenSocket::new(sid, port, self.me.clone());
        table.entries.push(TableEntry {
            tuple: FourTuple::listening(port),
            socket: SocketHandle::Listen(Arc::clone(&listener)),
        });
        Ok(listener)
    }

    /// Actively open a connection and block until it is established or the
    /// handshake gives up.
    pub fn connect(&self, remote: Ipv4Address, remote_port: u16)
        -> Result<Arc<StreamSocket>>
    {
        let this = self.me.upgrade().ok_or(Error::ConnectionAborted)?;
        let local = self.ip.source_for(remote).ok_or(Error::NoRoute)?;

        let socket = {
            let mut table = self.table.lock().unwrap();
            let local_port = table.alloc_port();
            let tuple = FourTuple { local, local_port, remote, remote_port };
            let sid = table.alloc_sid();

            let socket = StreamSocket::active_open(&this, sid, tuple);
            table.entries.push(TableEntry {
                tuple,
                socket: SocketHandle::Stream(Arc::clone(&socket)),
            });
            socket
        };

        socket.launch();
        socket.wait_established()?;
        Ok(socket)
    }

    /// Copy the table out for listing.
    pub fn sockets(&self) -> Vec<SocketInfo> {
        let table = self.table.lock().unwrap();
        table.entries.iter().map(|entry| SocketInfo {
            sid: entry.socket.id(),
            tuple: entry.tuple,
            state: match &entry.socket {
                SocketHandle::Listen(_) => State::Listen,
                SocketHandle::Stream(socket) => socket.state(),
            },
        }).collect()
    }

    /// Find a socket by its shell identifier.
    pub fn socket(&self, sid: SocketId) -> Option<SocketHandle> {
        let table = self.table.lock().unwrap();
        table.entries.iter()
            .find(|entry| entry.socket.id() == sid)
            .map(|entry| entry.socket.clone())
    }

    /// Dispatch one datagram's payload to the owning socket.
    fn on_datagram(&self, recv: &Received<'_>) {
        let segment = match tcp_segment::new_checked(recv.payload) {
            Ok(segment) => segment,
            Err(err) => {
                debug!("dropping transport segment: {}", err);
                return;
            }
        };
        let repr = match TcpRepr::parse(segment, recv.src, recv.dst, Checksum::Manual) {
            Ok(repr) => repr,
            Err(err) => {
                debug!("dropping transport segment: {}", err);
                return;
            }
        };

        let tuple = FourTuple {
            local: recv.dst,
            local_port: repr.dst_port,
            remote: recv.src,
            remote_port: repr.src_port,
        };

        match self.lookup(&tuple) {
            Some(SocketHandle::Stream(socket)) => {
                socket.on_segment(&repr, segment.payload());
            }
            Some(SocketHandle::Listen(listener)) => {
                // Only a bare SYN may clone a listener.
                if repr.flags.contains(TcpFlags::SYN) && !repr.flags.contains(TcpFlags::ACK) {
                    self.handle_syn(&listener, tuple, &repr);
                } else {
                    trace!("{}: non-SYN for listener, dropped", tuple);
                }
            }
            None => {
                debug!("{}: no matching connection, dropped", tuple);
            }
        }
    }

    /// Exact four-tuple match first, listening fallback second.
    fn lookup(&self, tuple: &FourTuple) -> Option<SocketHandle> {
        let table = self.table.lock().unwrap();

        table.entries.iter()
            .find(|entry| entry.tuple == *tuple)
            .or_else(|| table.entries.iter().find(|entry| {
                matches!(entry.socket, SocketHandle::Listen(_))
                    && entry.tuple.local_port == tuple.local_port
            }))
            .map(|entry| entry.socket.clone())
    }

    /// Clone a child connection off a listener for an incoming SYN.
    fn handle_syn(&self, listener: &Arc<ListenSocket>, tuple: FourTuple,
                  repr: &TcpRepr) {
        if !listener.has_room() {
            debug!("{}: accept queue full, SYN dropped", tuple);
            return;
        }
        let this = match self.me.upgrade() {
            Some(this) => this,
            None => return,
        };

        let child = {
            let mut table = self.table.lock().unwrap();
            let sid = table.alloc_sid();
            let child = StreamSocket::passive_open(
                &this, sid, tuple, listener, repr.seq_number, repr.window);
            table.entries.push(TableEntry {
                tuple,
                socket: SocketHandle::Stream(Arc::clone(&child)),
            });
            child
        };

        trace!("{}: handshake in progress", tuple);
        child.launch();
    }

    /// Emit one segment towards the peer of `tuple`.
    pub(super) fn transmit(&self, tuple: &FourTuple, seq: TcpSeqNumber, ack: TcpSeqNumber,
                           flags: TcpFlags, wnd: u16, payload: &[u8]) -> Result<()> {
        let repr = TcpRepr {
            src_port: tuple.local_port,
            dst_port: tuple.remote_port,
            seq_number: seq,
            ack_number: ack,
            flags,
            window: wnd,
        };

        let mut buffer = vec![0; TCP_HEADER_LEN + payload.len()];
        buffer[TCP_HEADER_LEN..].copy_from_slice(payload);
        repr.emit(
            tcp_segment::new_unchecked_mut(&mut buffer),
            tuple.local, tuple.remote, Checksum::Manual);

        self.ip.send(tuple.remote, IpProtocol::TCP, self.params.ttl, &buffer)
    }

    /// Drop a connection's table entry.
    pub(super) fn remove_entry(&self, tuple: &FourTuple) {
        let mut table = self.table.lock().unwrap();
        table.entries.retain(|entry| entry.tuple != *tuple);
    }

    /// Drop a listener's table entry.
    fn remove_listener(&self, port: u16, sid: SocketId) {
        let mut table = self.table.lock().unwrap();
        table.entries.retain(|entry| {
            !(matches!(entry.socket, SocketHandle::Listen(_))
                && entry.tuple.local_port == port
                && entry.socket.id() == sid)
        });
    }
}

impl Table {
    fn alloc_sid(&mut self) -> SocketId {
        let sid = self.next_sid;
        self.next_sid += 1;
        sid
    }

    /// The next free ephemeral port, wrapping within the dynamic range.
    fn alloc_port(&mut self) -> u16 {
        loop {
            let port = self.next_port;
            self.next_port = match self.next_port.checked_add(1) {
                Some(next) => next,
                None => EPHEMERAL_BASE,
            };

            let used = self.entries.iter().any(|entry| entry.tuple.local_port == port);
            if !used {
                return port;
            }
        }
    }
}

/// A passively opened socket: a port and a queue of completed handshakes.
pub struct ListenSocket {
    sid: SocketId,
    port: u16,
    stack: Weak<TcpStack>,
    queue: Mutex<AcceptQueue>,
    cond: Condvar,
}

struct AcceptQueue {
    pending: VecDeque<Arc<StreamSocket>>,
    closed: bool,
}

impl ListenSocket {
    fn new(sid: SocketId, port: u16, stack: Weak<TcpStack>) -> Arc<ListenSocket> {
        Arc::new(ListenSocket {
            sid,
            port,
            stack,
            queue: Mutex::new(AcceptQueue {
                pending: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        })
    }

    /// The shell-visible identifier.
    pub fn id(&self) -> SocketId {
        self.sid
    }

    /// The port this socket listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Take the next established child connection, blocking while the
    /// queue is empty.
    pub fn accept(&self) -> Result<Arc<StreamSocket>> {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(child) = queue.pending.pop_front() {
                return Ok(child);
            }
            if queue.closed {
                return Err(Error::ConnectionAborted);
            }
            queue = self.cond.wait(queue).unwrap();
        }
    }

    /// Stop listening and wake pending accepts.
    pub fn close(&self) {
        {
            let mut queue = self.queue.lock().unwrap();
            queue.closed = true;
        }
        self.cond.notify_all();
        if let Some(stack) = self.stack.upgrade() {
            stack.remove_listener(self.port, self.sid);
        }
    }

    /// Whether another handshake may start against this listener.
    pub(super) fn has_room(&self) -> bool {
        let queue = self.queue.lock().unwrap();
        !queue.closed && queue.pending.len() < ACCEPT_BACKLOG
    }

    /// Hand a completed handshake to `accept`, refusing when full.
    pub(super) fn deliver(&self, child: Arc<StreamSocket>) -> bool {
        let mut queue = self.queue.lock().unwrap();
        if queue.closed || queue.pending.len() >= ACCEPT_BACKLOG {
            return false;
        }
        queue.pending.push_back(child);
        drop(queue);
        self.cond.notify_all();
        true
    }
}

impl fmt::Debug for ListenSocket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ListenSocket")
            .field("sid", &self.sid)
            .field("port", &self.port)
            .finish()
    }
}
