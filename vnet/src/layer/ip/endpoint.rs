use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::iface::{Interface, MTU};
use crate::layer::{Error, Result};
use crate::wire::{ipv4_packet, Checksum, IpProtocol, Ipv4Address, Ipv4Repr};

use super::route::{Route, RouteSource, RouteTable};

/// Initial TTL for locally originated datagrams.
pub const DEFAULT_TTL: u8 = 16;

/// A datagram delivered to an upper-layer handler.
#[derive(Debug, Clone, Copy)]
pub struct Received<'a> {
    pub src: Ipv4Address,
    pub dst: Ipv4Address,
    pub ttl: u8,
    pub protocol: IpProtocol,
    pub payload: &'a [u8],
}

type Handler = Box<dyn Fn(&Received<'_>) + Send + Sync>;

/// Whether a datagram entered the dispatcher from a link or from this node.
///
/// Only transit traffic pays a hop: the TTL a caller passes to [`IpStack::send`]
/// is what the first receiver sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Link,
    Local,
}

/// The per-node IP dispatcher.
///
/// Owns the interfaces, the forwarding table and the map from upper-layer
/// protocol numbers to handlers. The receive path and the send path share
/// one dispatch routine, so local delivery and forwarding follow the same
/// rules regardless of where a datagram came from.
pub struct IpStack {
    me: Weak<IpStack>,
    interfaces: Vec<Arc<Interface>>,
    table: RouteTable,
    handlers: RwLock<HashMap<IpProtocol, Handler>>,
}

impl IpStack {
    /// Assemble a node from its interfaces.
    ///
    /// Each interface contributes a connected-subnet route to the table.
    pub fn new(interfaces: Vec<Interface>) -> Arc<IpStack> {
        let interfaces: Vec<_> = interfaces.into_iter().map(Arc::new).collect();
        let table = RouteTable::new();
        for iface in &interfaces {
            table.install(Route::local(
                iface.cidr().subnet(), iface.addr(), iface.name()));
        }

        Arc::new_cyclic(|me| IpStack {
            me: me.clone(),
            interfaces,
            table,
            handlers: RwLock::new(HashMap::new()),
        })
    }

    /// Register the handler for an upper-layer protocol number.
    ///
    /// A datagram for a protocol without a handler is dropped.
    pub fn register_handler<F>(&self, protocol: IpProtocol, handler: F)
    where
        F: Fn(&Received<'_>) + Send + Sync + 'static,
    {
        self.handlers.write().unwrap().insert(protocol, Box::new(handler));
    }

    /// The forwarding table.
    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    /// Look up an interface by name.
    pub fn interface(&self, name: &str) -> Option<&Arc<Interface>> {
        self.interfaces.iter().find(|iface| iface.name() == name)
    }

    /// All interfaces of this node.
    pub fn interfaces(&self) -> &[Arc<Interface>] {
        &self.interfaces
    }

    /// Whether `addr` is the address of a local interface that is up.
    pub fn is_local_addr(&self, addr: Ipv4Address) -> bool {
        self.interfaces.iter()
            .any(|iface| iface.is_up() && iface.addr() == addr)
    }

    /// The source address a datagram towards `dst` will carry: the address
    /// of the egress interface the forwarding rules pick.
    pub fn source_for(&self, dst: Ipv4Address) -> Option<Ipv4Address> {
        if self.is_local_addr(dst) {
            return Some(dst);
        }

        if let Some(iface) = self.direct_iface(dst) {
            return Some(iface.addr());
        }

        let route = self.table.next_hop(dst)?;
        self.interface(&route.ifname).map(|iface| iface.addr())
    }

    /// Send an upper-layer payload to `dst`.
    ///
    /// The datagram is fed through the shared dispatch path, so a
    /// self-addressed send is delivered like any received one.
    pub fn send(&self, dst: Ipv4Address, protocol: IpProtocol, ttl: u8, payload: &[u8])
        -> Result<()>
    {
        let src = self.source_for(dst).ok_or(Error::NoRoute)?;

        let repr = Ipv4Repr {
            src_addr: src,
            dst_addr: dst,
            protocol,
            payload_len: payload.len(),
            ttl,
        };
        if repr.buffer_len() + payload.len() > MTU {
            return Err(Error::Exhausted);
        }

        let mut frame = vec![0; repr.buffer_len() + payload.len()];
        frame[repr.buffer_len()..].copy_from_slice(payload);
        repr.emit(ipv4_packet::new_unchecked_mut(&mut frame), Checksum::Manual);

        self.dispatch(&mut frame, Entry::Local)
    }

    /// Run one frame that came off a link through validation and dispatch.
    pub fn receive_frame(&self, frame: &mut [u8]) {
        // The receive path drops silently, the log line is all diagnosis.
        if let Err(err) = self.dispatch(frame, Entry::Link) {
            debug!("dropping datagram: {}", err);
        }
    }

    fn direct_iface(&self, dst: Ipv4Address) -> Option<&Arc<Interface>> {
        self.interfaces.iter()
            .find(|iface| iface.is_up() && iface.cidr().subnet().contains(dst))
    }

    fn dispatch(&self, frame: &mut [u8], entry: Entry) -> Result<()> {
        let packet = ipv4_packet::new_checked_mut(frame)?;
        let repr = Ipv4Repr::parse(packet, Checksum::Manual)?;

        if repr.ttl == 0 {
            return Err(Error::Wire(crate::wire::Error::Malformed));
        }

        // For this node? Deliver to the protocol handler.
        if self.is_local_addr(repr.dst_addr) {
            let handlers = self.handlers.read().unwrap();
            match handlers.get(&repr.protocol) {
                Some(handler) => {
                    trace!("delivering {} datagram from {}", repr.protocol, repr.src_addr);
                    handler(&Received {
                        src: repr.src_addr,
                        dst: repr.dst_addr,
                        ttl: repr.ttl,
                        protocol: repr.protocol,
                        payload: packet.payload(),
                    });
                    return Ok(());
                }
                None => {
                    debug!("no handler for {}, dropping", repr.protocol);
                    return Ok(());
                }
            }
        }

        // On a connected network? Hand it over directly.
        if let Some(iface) = self.direct_iface(repr.dst_addr) {
            let iface = Arc::clone(iface);
            return self.transmit(packet, repr.ttl, &iface, repr.dst_addr, entry);
        }

        // Otherwise ask the forwarding table.
        let route = self.table.next_hop(repr.dst_addr).ok_or(Error::NoRoute)?;
        let iface = match self.interface(&route.ifname) {
            Some(iface) => Arc::clone(iface),
            None => return Err(Error::NoRoute),
        };
        let next_hop = match route.source {
            // The matched subnet is connected but its interface did not
            // qualify above, it must be down.
            RouteSource::Local => return Err(Error::IfaceDown),
            _ => route.next_hop,
        };

        self.transmit(packet, repr.ttl, &iface, next_hop, entry)
    }

    fn transmit(&self, packet: &mut ipv4_packet, ttl: u8, iface: &Interface,
                next_hop: Ipv4Address, entry: Entry) -> Result<()> {
        if entry == Entry::Link {
            // A forward that would zero the TTL ends here, the wire never
            // carries a dead datagram.
            if ttl <= 1 {
                debug!("TTL expired towards {}", packet.dst_addr());
                return Ok(());
            }
            packet.set_ttl(ttl - 1);
            packet.fill_checksum();
        }

        iface.send(packet.as_bytes(), next_hop)
    }

    /// Spawn one receiver thread per interface.
    ///
    /// Receivers feed frames into the dispatch path and exit once the stack
    /// is dropped.
    pub fn spawn_receivers(&self) -> Vec<thread::JoinHandle<()>> {
        self.interfaces.iter().map(|iface| {
            let iface = Arc::clone(iface);
            let stack = self.me.clone();
            iface.set_recv_timeout(Some(Duration::from_millis(200)));

            thread::Builder::new()
                .name(format!("rx-{}", iface.name()))
                .spawn(move || {
                    let mut buf = [0u8; MTU];
                    loop {
                        match iface.recv(&mut buf) {
                            Ok(n) => {
                                let stack = match stack.upgrade() {
                                    Some(stack) => stack,
                                    None => break,
                                };
                                if !iface.is_up() {
                                    continue;
                                }
                                stack.receive_frame(&mut buf[..n]);
                            }
                            Err(ref err) if is_timeout(err) => {
                                if stack.upgrade().is_none() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!("{}: link receive failed: {}", iface.name(), err);
                                break;
                            }
                        }
                    }
                })
                .expect("spawning a receiver thread")
        }).collect()
    }
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut)
}
