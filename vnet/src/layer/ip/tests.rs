use std::net::UdpSocket;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::*;
use crate::iface::Interface;
use crate::layer::Error;
use crate::wire::{ipv4_packet, Checksum, IpProtocol, Ipv4Address, Ipv4Repr};

const TEST_PROTO: IpProtocol = IpProtocol(0);

/// A link peer that is a raw socket rather than a stack, to observe frames.
struct Peer {
    addr: Ipv4Address,
    socket: UdpSocket,
}

impl Peer {
    fn new(addr: &str) -> Peer {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
        Peer { addr: addr.parse().unwrap(), socket }
    }

    fn frame(&self) -> Option<Vec<u8>> {
        let mut buf = [0; 2048];
        match self.socket.recv_from(&mut buf) {
            Ok((n, _)) => Some(buf[..n].to_vec()),
            Err(_) => None,
        }
    }

    fn inject(&self, target: &Interface, frame: &[u8]) {
        let endpoint = target.local_endpoint().unwrap();
        self.socket.send_to(frame, endpoint).unwrap();
    }
}

fn iface_with_peer(name: &str, cidr: &str, peer: &Peer) -> Interface {
    let mut iface = Interface::open(
        name, cidr.parse().unwrap(), "127.0.0.1:0".parse().unwrap()).unwrap();
    iface.add_neighbor(peer.addr, peer.socket.local_addr().unwrap());
    iface
}

fn build_frame(src: &str, dst: &str, ttl: u8, payload: &[u8]) -> Vec<u8> {
    let repr = Ipv4Repr {
        src_addr: src.parse().unwrap(),
        dst_addr: dst.parse().unwrap(),
        protocol: TEST_PROTO,
        payload_len: payload.len(),
        ttl,
    };
    let mut frame = vec![0; repr.buffer_len() + payload.len()];
    frame[repr.buffer_len()..].copy_from_slice(payload);
    repr.emit(ipv4_packet::new_unchecked_mut(&mut frame), Checksum::Manual);
    frame
}

type Delivered = Arc<Mutex<Vec<(Ipv4Address, Ipv4Address, u8, Vec<u8>)>>>;

fn capture_handler(stack: &IpStack) -> Delivered {
    let seen: Delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    stack.register_handler(TEST_PROTO, move |recv| {
        sink.lock().unwrap().push((recv.src, recv.dst, recv.ttl, recv.payload.to_vec()));
    });
    seen
}

#[test]
fn self_send_is_delivered_unchanged() {
    let peer = Peer::new("10.0.0.2");
    let stack = IpStack::new(vec![iface_with_peer("if0", "10.0.0.1/24", &peer)]);
    let seen = capture_handler(&stack);

    stack.send("10.0.0.1".parse().unwrap(), TEST_PROTO, DEFAULT_TTL, b"loop").unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (src, dst, ttl, payload) = &seen[0];
    assert_eq!(*src, "10.0.0.1".parse().unwrap());
    assert_eq!(*dst, "10.0.0.1".parse().unwrap());
    assert_eq!(*ttl, DEFAULT_TTL);
    assert_eq!(payload, b"loop");
}

#[test]
fn origin_pays_no_hop() {
    let peer = Peer::new("10.0.0.2");
    let stack = IpStack::new(vec![iface_with_peer("if0", "10.0.0.1/24", &peer)]);

    stack.send(peer.addr, TEST_PROTO, 16, b"hello").unwrap();

    let frame = peer.frame().expect("frame reaches the neighbor");
    let packet = ipv4_packet::new_checked(&frame).unwrap();
    assert!(packet.verify_checksum());
    assert_eq!(packet.ttl(), 16);
    assert_eq!(packet.src_addr(), "10.0.0.1".parse().unwrap());
    assert_eq!(packet.dst_addr(), peer.addr);
    assert_eq!(packet.payload(), b"hello");
}

#[test]
fn transit_decrements_and_rechecksums() {
    // One node with two links, forwarding between the attached peers.
    let left = Peer::new("10.0.0.2");
    let right = Peer::new("10.1.0.2");
    let stack = IpStack::new(vec![
        iface_with_peer("if0", "10.0.0.1/24", &left),
        iface_with_peer("if1", "10.1.0.1/24", &right),
    ]);

    let frame = build_frame("10.0.0.2", "10.1.0.2", 5, b"through");
    left.inject(stack.interface("if0").unwrap(), &frame);

    // Drive the frame by hand rather than through receiver threads.
    let mut buf = [0u8; 2048];
    let n = stack.interface("if0").unwrap().recv(&mut buf).unwrap();
    stack.receive_frame(&mut buf[..n]);

    let forwarded = right.frame().expect("forwarded to the right peer");
    let packet = ipv4_packet::new_checked(&forwarded).unwrap();
    assert!(packet.verify_checksum());
    assert_eq!(packet.ttl(), 4);
    assert_eq!(packet.payload(), b"through");
}

#[test]
fn expiring_ttl_stops_the_datagram() {
    let left = Peer::new("10.0.0.2");
    let right = Peer::new("10.1.0.2");
    let stack = IpStack::new(vec![
        iface_with_peer("if0", "10.0.0.1/24", &left),
        iface_with_peer("if1", "10.1.0.1/24", &right),
    ]);

    let mut frame = build_frame("10.0.0.2", "10.1.0.2", 1, b"dying");
    stack.receive_frame(&mut frame);
    assert_eq!(right.frame(), None);

    // TTL 2 still makes it with one to spare.
    let mut frame = build_frame("10.0.0.2", "10.1.0.2", 2, b"alive");
    stack.receive_frame(&mut frame);
    let forwarded = right.frame().expect("one hop left");
    assert_eq!(ipv4_packet::new_checked(&forwarded).unwrap().ttl(), 1);
}

#[test]
fn corrupted_frames_are_dropped() {
    let peer = Peer::new("10.0.0.2");
    let stack = IpStack::new(vec![iface_with_peer("if0", "10.0.0.1/24", &peer)]);
    let seen = capture_handler(&stack);

    let mut frame = build_frame("10.0.0.2", "10.0.0.1", 4, b"junk");
    frame[8] = frame[8].wrapping_add(1);
    stack.receive_frame(&mut frame);

    // Truncation below the header size as well.
    let mut stub = build_frame("10.0.0.2", "10.0.0.1", 4, b"");
    stack.receive_frame(&mut stub[..12]);

    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn missing_handler_is_not_fatal() {
    let peer = Peer::new("10.0.0.2");
    let stack = IpStack::new(vec![iface_with_peer("if0", "10.0.0.1/24", &peer)]);

    let mut frame = build_frame("10.0.0.2", "10.0.0.1", 4, b"nobody home");
    stack.receive_frame(&mut frame);
}

#[test]
fn send_without_route_errors() {
    let peer = Peer::new("10.0.0.2");
    let stack = IpStack::new(vec![iface_with_peer("if0", "10.0.0.1/24", &peer)]);

    assert_eq!(
        stack.send("192.168.7.7".parse().unwrap(), TEST_PROTO, DEFAULT_TTL, b"x"),
        Err(Error::NoRoute));
}

#[test]
fn forwarding_table_routes_off_link_traffic() {
    let peer = Peer::new("10.0.0.2");
    let stack = IpStack::new(vec![iface_with_peer("if0", "10.0.0.1/24", &peer)]);
    stack.table().install(Route::static_via(
        "10.9.0.0/24".parse().unwrap(), peer.addr, "if0"));

    stack.send("10.9.0.5".parse().unwrap(), TEST_PROTO, 16, b"routed").unwrap();

    let frame = peer.frame().expect("sent towards the static next hop");
    let packet = ipv4_packet::new_checked(&frame).unwrap();
    assert_eq!(packet.dst_addr(), "10.9.0.5".parse().unwrap());
}

#[test]
fn down_interface_silences_the_wire() {
    let peer = Peer::new("10.0.0.2");
    let stack = IpStack::new(vec![iface_with_peer("if0", "10.0.0.1/24", &peer)]);

    stack.interface("if0").unwrap().set_up(false);
    assert_eq!(
        stack.send(peer.addr, TEST_PROTO, DEFAULT_TTL, b"x"),
        Err(Error::IfaceDown));
    assert_eq!(peer.frame(), None);

    stack.interface("if0").unwrap().set_up(true);
    stack.send(peer.addr, TEST_PROTO, DEFAULT_TTL, b"x").unwrap();
    assert!(peer.frame().is_some());
}
