//! Interfaces over emulated links.
//!
//! A physical link is emulated by a UDP socket: every datagram sent on the
//! link is one UDP payload to the neighbor process at the other end. An
//! interface owns its socket, knows its own address and prefix, and maps
//! each reachable neighbor address to that neighbor's link endpoint.
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};

use crate::layer::{Error, Result};
use crate::wire::{Ipv4Address, Ipv4Cidr};

/// Largest datagram an emulated link carries.
pub const MTU: usize = 1400;

/// One emulated link of a node.
#[derive(Debug)]
pub struct Interface {
    name: String,
    cidr: Ipv4Cidr,
    up: AtomicBool,
    socket: UdpSocket,
    neighbors: HashMap<Ipv4Address, SocketAddr>,
    loss: Mutex<LossGate>,
}

impl Interface {
    /// Bind the link socket and bring the interface up.
    pub fn open(name: &str, cidr: Ipv4Cidr, bind: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(bind)?;
        Ok(Interface {
            name: name.to_owned(),
            cidr,
            up: AtomicBool::new(true),
            socket,
            neighbors: HashMap::new(),
            loss: Mutex::new(LossGate::off()),
        })
    }

    /// Record one neighbor reachable on this link.
    pub fn add_neighbor(&mut self, addr: Ipv4Address, endpoint: SocketAddr) {
        self.neighbors.insert(addr, endpoint);
    }

    /// The interface name, unique per node.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The address assigned to this interface.
    pub fn addr(&self) -> Ipv4Address {
        self.cidr.address()
    }

    /// The address and prefix assigned to this interface.
    pub fn cidr(&self) -> Ipv4Cidr {
        self.cidr
    }

    /// The local endpoint of the emulated link.
    pub fn local_endpoint(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Whether the interface is enabled.
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    /// Enable or disable the interface.
    ///
    /// A disabled interface silently discards outbound sends and inbound
    /// frames until it is enabled again.
    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    /// The neighbors reachable over this link.
    pub fn neighbors(&self) -> impl Iterator<Item = (Ipv4Address, SocketAddr)> + '_ {
        self.neighbors.iter().map(|(&addr, &endpoint)| (addr, endpoint))
    }

    /// Whether `addr` is a neighbor on this link.
    pub fn has_neighbor(&self, addr: Ipv4Address) -> bool {
        self.neighbors.contains_key(&addr)
    }

    /// Transmit one link frame towards the given next hop.
    pub fn send(&self, frame: &[u8], next_hop: Ipv4Address) -> Result<()> {
        if !self.is_up() {
            return Err(Error::IfaceDown);
        }

        let endpoint = match self.neighbors.get(&next_hop) {
            Some(&endpoint) => endpoint,
            None => return Err(Error::NoNeighbor),
        };

        if self.loss.lock().unwrap().swallows() {
            debug!("{}: loss gate dropped frame for {}", self.name, next_hop);
            return Ok(());
        }

        // The emulated link is unreliable anyway, a failed transmit is a
        // dropped frame like any other.
        if let Err(err) = self.socket.send_to(frame, endpoint) {
            warn!("{}: link send to {} failed: {}", self.name, endpoint, err);
        }
        Ok(())
    }

    /// Block for the next frame on the emulated link.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let (n, _from) = self.socket.recv_from(buf)?;
        Ok(n)
    }

    /// Bound how long [recv] blocks, `None` restores indefinite blocking.
    ///
    /// [recv]: #method.recv
    pub fn set_recv_timeout(&self, timeout: Option<std::time::Duration>) {
        // Only fails for a zero duration, which `Some` never carries here.
        let _ = self.socket.set_read_timeout(timeout);
    }

    /// Configure random frame loss on the outbound direction.
    ///
    /// `rate` is a (0, 32)-bit fixed point loss probability, or `None` to
    /// turn loss off. This exists for exercising retransmission; the shell
    /// never enables it.
    pub fn set_loss(&self, rate: Option<u32>, seed: u64) {
        *self.loss.lock().unwrap() = LossGate { lossrate: rate, state: seed | 1 };
    }
}

/// Pseudo-random loss applied to outbound frames, xorshift64* driven.
#[derive(Debug)]
struct LossGate {
    /// Loss rate as a (0, 32)-bit fixed point number, `None` for no loss.
    lossrate: Option<u32>,
    state: u64,
}

impl LossGate {
    fn off() -> Self {
        LossGate { lossrate: None, state: 1 }
    }

    /// Decide the fate of the next frame, `true` meaning dropped.
    fn swallows(&mut self) -> bool {
        let rate = match self.lossrate {
            Some(rate) => rate,
            None => return false,
        };

        self.state ^= self.state >> 12;
        self.state ^= self.state << 25;
        self.state ^= self.state >> 27;
        let roll = (self.state.wrapping_mul(0x2545_f491_4f6c_dd1d) >> 32) as u32;

        roll <= rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn frames_cross_the_link() {
        let mut a = Interface::open("if0", "10.0.0.1/24".parse().unwrap(), localhost()).unwrap();
        let b = Interface::open("if0", "10.0.0.2/24".parse().unwrap(), localhost()).unwrap();
        a.add_neighbor(b.addr(), b.local_endpoint().unwrap());

        a.send(b"over the wire", b.addr()).unwrap();

        let mut buf = [0; MTU];
        let n = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"over the wire");
    }

    #[test]
    fn down_interface_rejects_sends() {
        let mut a = Interface::open("if0", "10.0.0.1/24".parse().unwrap(), localhost()).unwrap();
        a.add_neighbor(Ipv4Address::new(10, 0, 0, 2), localhost());
        a.set_up(false);
        assert_eq!(a.send(b"x", Ipv4Address::new(10, 0, 0, 2)), Err(Error::IfaceDown));

        a.set_up(true);
        assert_eq!(a.send(b"x", Ipv4Address::new(10, 0, 0, 9)), Err(Error::NoNeighbor));
    }

    #[test]
    fn loss_gate_rates() {
        let mut gate = LossGate { lossrate: Some(u32::max_value()), state: 7 };
        assert!((0..32).all(|_| gate.swallows()));

        let mut gate = LossGate::off();
        assert!((0..32).all(|_| !gate.swallows()));

        // Half rate loses roughly half, leave wide margins.
        let mut gate = LossGate { lossrate: Some(u32::max_value() / 2), state: 99 };
        let lost = (0..10_000).filter(|_| gate.swallows()).count();
        assert!(lost > 3_000 && lost < 7_000, "lost {}", lost);
    }
}
