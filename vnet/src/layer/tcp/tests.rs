use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::*;
use crate::iface::Interface;
use crate::layer::ip::IpStack;
use crate::layer::Error;
use crate::wire::{ipv4_packet, tcp_segment, Checksum, IpProtocol, Ipv4Address, Ipv4Repr,
                  TcpFlags, TcpRepr, TcpSeqNumber, TCP_HEADER_LEN};

const ADDR_A: &str = "10.0.0.1";
const ADDR_B: &str = "10.0.0.2";

fn addr(s: &str) -> Ipv4Address {
    s.parse().unwrap()
}

fn wait_until(what: &str, deadline: Duration, mut cond: impl FnMut() -> bool) {
    let until = Instant::now() + deadline;
    while !cond() {
        assert!(Instant::now() < until, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

fn quick_params() -> TcpParams {
    TcpParams {
        rto_initial: Duration::from_millis(500),
        rto_min: Duration::from_millis(100),
        rto_max: Duration::from_secs(2),
        probe_interval: Duration::from_millis(100),
        msl: Duration::from_millis(100),
        ..TcpParams::default()
    }
}

/// Two full stacks joined by one emulated link.
fn linked_pair(params: TcpParams) -> (Arc<TcpStack>, Arc<TcpStack>) {
    let mut a = Interface::open(
        "if0", format!("{}/24", ADDR_A).parse().unwrap(),
        "127.0.0.1:0".parse().unwrap()).unwrap();
    let mut b = Interface::open(
        "if0", format!("{}/24", ADDR_B).parse().unwrap(),
        "127.0.0.1:0".parse().unwrap()).unwrap();
    let endpoint_a = a.local_endpoint().unwrap();
    let endpoint_b = b.local_endpoint().unwrap();
    a.add_neighbor(addr(ADDR_B), endpoint_b);
    b.add_neighbor(addr(ADDR_A), endpoint_a);

    let ip_a = IpStack::new(vec![a]);
    let ip_b = IpStack::new(vec![b]);
    ip_a.spawn_receivers();
    ip_b.spawn_receivers();

    let tcp_a = TcpStack::with_params(Arc::clone(&ip_a), params.clone());
    tcp_a.register();
    let tcp_b = TcpStack::with_params(ip_b, params);
    tcp_b.register();

    (tcp_a, tcp_b)
}

#[test]
fn three_way_handshake() {
    let (tcp_a, tcp_b) = linked_pair(quick_params());

    let listener = tcp_b.listen(9999).unwrap();
    let accepted = thread::spawn(move || listener.accept().unwrap());

    let client = tcp_a.connect(addr(ADDR_B), 9999).unwrap();
    let server = accepted.join().unwrap();

    assert_eq!(client.state(), State::Established);
    assert_eq!(server.state(), State::Established);

    // Matching four-tuples, mirrored.
    let ct = client.tuple();
    let st = server.tuple();
    assert_eq!((ct.local, ct.local_port), (st.remote, st.remote_port));
    assert_eq!((ct.remote, ct.remote_port), (st.local, st.local_port));

    // Quiet connections have nothing in flight and synchronized numbers.
    for socket in [&client, &server] {
        socket.inspect(|tcb| {
            assert_eq!(tcb.snd_una, tcb.snd_nxt);
            assert_eq!(tcb.rcv_nxt, tcb.irs + 1);
        });
        assert!(socket.rtx_covers_flight());
    }
}

#[test]
fn lookup_prefers_the_exact_connection() {
    let (tcp_a, tcp_b) = linked_pair(quick_params());

    let listener = tcp_b.listen(9999).unwrap();
    let accepted = thread::spawn(move || {
        let first = listener.accept().unwrap();
        let second = listener.accept().unwrap();
        (first, second)
    });

    let one = tcp_a.connect(addr(ADDR_B), 9999).unwrap();
    let two = tcp_a.connect(addr(ADDR_B), 9999).unwrap();
    let (first, second) = accepted.join().unwrap();

    assert_ne!(one.tuple().local_port, two.tuple().local_port);
    assert_ne!(first.tuple(), second.tuple());

    // The listener still sits in the table next to both children.
    let infos = tcp_b.sockets();
    assert_eq!(infos.len(), 3);
    assert_eq!(infos.iter().filter(|info| info.state == State::Listen).count(), 1);
}

#[test]
fn duplicate_listen_is_refused() {
    let (_tcp_a, tcp_b) = linked_pair(quick_params());

    let _listener = tcp_b.listen(9999).unwrap();
    assert!(matches!(tcp_b.listen(9999), Err(Error::ConnectionExists)));
}

#[test]
fn connect_needs_a_route() {
    let (tcp_a, _tcp_b) = linked_pair(quick_params());
    assert!(matches!(
        tcp_a.connect(addr("192.168.99.1"), 80),
        Err(Error::NoRoute)));
}

#[test]
fn write_read_round_trip() {
    let (tcp_a, tcp_b) = linked_pair(quick_params());

    let listener = tcp_b.listen(9999).unwrap();
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i * 31 % 251) as u8).collect();
    let expected = payload.clone();

    let reader = thread::spawn(move || {
        let server = listener.accept().unwrap();
        let mut collected = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match server.read(&mut buf).unwrap() {
                0 => break,
                n => collected.extend_from_slice(&buf[..n]),
            }
        }
        collected
    });

    let client = tcp_a.connect(addr(ADDR_B), 9999).unwrap();
    assert_eq!(client.write(&payload).unwrap(), payload.len());
    client.close().unwrap();

    // The stream arrives intact regardless of segmentation.
    assert_eq!(reader.join().unwrap(), expected);
}

#[test]
fn bulk_transfer_through_a_lossy_link() {
    let mut params = quick_params();
    params.max_retransmits = 12;
    let (tcp_a, tcp_b) = linked_pair(params);

    // Five percent loss in both directions.
    let rate = Some(u32::max_value() / 20);
    tcp_a.ip().interface("if0").unwrap().set_loss(rate, 0x5eed);
    tcp_b.ip().interface("if0").unwrap().set_loss(rate, 0xfeed);

    let listener = tcp_b.listen(9999).unwrap();
    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 256) as u8).collect();
    let expected = payload.clone();

    let reader = thread::spawn(move || {
        let server = listener.accept().unwrap();
        let mut collected = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match server.read(&mut buf).unwrap() {
                0 => break,
                n => collected.extend_from_slice(&buf[..n]),
            }
        }
        collected
    });

    let client = tcp_a.connect(addr(ADDR_B), 9999).unwrap();
    client.write(&payload).unwrap();

    // The timers stay inside their clamps however the loss played out.
    client.inspect(|tcb| {
        let rto = tcb.rtt.rto();
        assert!(rto >= Duration::from_millis(100) && rto <= Duration::from_secs(2));
    });

    client.close().unwrap();
    assert_eq!(reader.join().unwrap(), expected);
}

#[test]
fn orderly_close_walks_both_state_chains() {
    let (tcp_a, tcp_b) = linked_pair(quick_params());

    let listener = tcp_b.listen(9999).unwrap();
    let accepted = thread::spawn(move || listener.accept().unwrap());
    let client = tcp_a.connect(addr(ADDR_B), 9999).unwrap();
    let server = accepted.join().unwrap();

    client.close().unwrap();

    // The passive side lands in CLOSE_WAIT and sees end-of-stream.
    wait_until("CLOSE_WAIT on the passive side", Duration::from_secs(5),
        || server.state() == State::CloseWait);
    assert_eq!(server.read(&mut [0u8; 16]).unwrap(), 0);

    // The active side advances to FIN_WAIT_2 on the ack of its FIN.
    wait_until("FIN_WAIT_2 on the active side", Duration::from_secs(5),
        || client.state() == State::FinWait2);

    server.close().unwrap();

    // Passive side: LAST_ACK resolves to CLOSED and the entry is gone,
    // leaving only the listener in the table.
    wait_until("passive teardown", Duration::from_secs(5),
        || tcp_b.sockets().iter().all(|info| info.state == State::Listen));

    // Active side: TIME_WAIT, then reaped after 2 MSL (200 ms here).
    wait_until("TIME_WAIT on the active side", Duration::from_secs(5),
        || client.state() == State::TimeWait);
    wait_until("active reap", Duration::from_secs(5),
        || tcp_a.sockets().is_empty());
    assert_eq!(client.state(), State::Closed);
}

#[test]
fn close_from_wrong_state_is_rejected() {
    let (tcp_a, tcp_b) = linked_pair(quick_params());

    let listener = tcp_b.listen(9999).unwrap();
    let accepted = thread::spawn(move || listener.accept().unwrap());
    let client = tcp_a.connect(addr(ADDR_B), 9999).unwrap();
    let _server = accepted.join().unwrap();

    client.close().unwrap();
    assert_eq!(client.close(), Err(Error::NotEstablished));
    assert!(matches!(client.write(b"late"), Err(_)));
}

/// A scripted remote endpoint: a bare UDP socket that speaks just enough
/// of the wire format to exercise one stack from the outside.
struct RawPeer {
    vip: Ipv4Address,
    socket: UdpSocket,
    target: SocketAddr,
    /// Sequence number of the next byte we expect from the stack.
    rcv_nxt: TcpSeqNumber,
    /// Sequence number of the next byte we send.
    snd_nxt: TcpSeqNumber,
    local_port: u16,
    remote_port: u16,
    remote_vip: Ipv4Address,
}

impl RawPeer {
    fn new(vip: &str) -> RawPeer {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        RawPeer {
            vip: addr(vip),
            socket,
            target: "127.0.0.1:1".parse().unwrap(),
            rcv_nxt: TcpSeqNumber(0),
            snd_nxt: TcpSeqNumber(7000),
            local_port: 0,
            remote_port: 0,
            remote_vip: Ipv4Address::UNSPECIFIED,
        }
    }

    /// A stack whose only neighbor is this scripted peer.
    fn stack_against(&mut self, params: TcpParams) -> Arc<TcpStack> {
        let mut iface = Interface::open(
            "if0", format!("{}/24", ADDR_A).parse().unwrap(),
            "127.0.0.1:0".parse().unwrap()).unwrap();
        self.target = iface.local_endpoint().unwrap();
        iface.add_neighbor(self.vip, self.socket.local_addr().unwrap());

        let ip = IpStack::new(vec![iface]);
        ip.spawn_receivers();
        let tcp = TcpStack::with_params(ip, params);
        tcp.register();
        self.remote_vip = addr(ADDR_A);
        tcp
    }

    fn recv_seg(&self) -> Option<(TcpRepr, Vec<u8>)> {
        let mut buf = [0u8; 2048];
        let (n, _) = match self.socket.recv_from(&mut buf) {
            Ok(got) => got,
            Err(_) => return None,
        };

        let packet = ipv4_packet::new_checked(&buf[..n]).unwrap();
        assert!(packet.verify_checksum(), "stack emitted a bad IP checksum");
        assert_eq!(packet.protocol(), IpProtocol::TCP);

        let segment = tcp_segment::new_checked(packet.payload()).unwrap();
        assert!(
            segment.verify_checksum(packet.src_addr(), packet.dst_addr()),
            "stack emitted a bad segment checksum");

        let repr = TcpRepr::parse(
            segment, packet.src_addr(), packet.dst_addr(), Checksum::Manual).unwrap();
        Some((repr, segment.payload().to_vec()))
    }

    fn send_seg(&self, flags: TcpFlags, seq: TcpSeqNumber, ack: TcpSeqNumber,
                window: u16, payload: &[u8]) {
        let repr = TcpRepr {
            src_port: self.local_port,
            dst_port: self.remote_port,
            seq_number: seq,
            ack_number: ack,
            flags,
            window,
        };

        let mut segment = vec![0u8; TCP_HEADER_LEN + payload.len()];
        segment[TCP_HEADER_LEN..].copy_from_slice(payload);
        repr.emit(
            tcp_segment::new_unchecked_mut(&mut segment),
            self.vip, self.remote_vip, Checksum::Manual);

        let ip = Ipv4Repr {
            src_addr: self.vip,
            dst_addr: self.remote_vip,
            protocol: IpProtocol::TCP,
            payload_len: segment.len(),
            ttl: 16,
        };
        let mut frame = vec![0u8; ip.buffer_len() + segment.len()];
        frame[ip.buffer_len()..].copy_from_slice(&segment);
        ip.emit(ipv4_packet::new_unchecked_mut(&mut frame), Checksum::Manual);

        self.socket.send_to(&frame, self.target).unwrap();
    }

    /// Play the passive half of the handshake against a connecting stack.
    fn accept_handshake(&mut self, port: u16, window: u16) {
        let (syn, _) = self.recv_seg().expect("the SYN");
        assert!(syn.flags.contains(TcpFlags::SYN));
        assert!(!syn.flags.contains(TcpFlags::ACK));
        assert_eq!(syn.dst_port, port);

        self.local_port = port;
        self.remote_port = syn.src_port;
        self.rcv_nxt = syn.seq_number + 1;

        self.send_seg(
            TcpFlags::SYN | TcpFlags::ACK,
            self.snd_nxt, self.rcv_nxt, window, &[]);
        self.snd_nxt = self.snd_nxt + 1;

        let (ack, _) = self.recv_seg().expect("the handshake ack");
        assert!(ack.flags.contains(TcpFlags::ACK));
        assert_eq!(ack.ack_number, self.snd_nxt);
    }
}

#[test]
fn the_send_loop_respects_mss_and_order() {
    let mut peer = RawPeer::new(ADDR_B);
    let tcp = peer.stack_against(quick_params());

    let connecting = {
        let tcp = Arc::clone(&tcp);
        thread::spawn(move || tcp.connect(addr(ADDR_B), 4433).unwrap())
    };
    peer.accept_handshake(4433, u16::max_value());
    let client = connecting.join().unwrap();

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 256) as u8).collect();
    let expected = payload.clone();
    let writer = thread::spawn(move || client.write(&payload).unwrap());

    let mut collected = Vec::new();
    while collected.len() < expected.len() {
        let (repr, data) = peer.recv_seg().expect("a data segment");
        assert!(data.len() <= MSS, "segment of {} bytes exceeds the MSS", data.len());
        if data.is_empty() {
            continue;
        }
        if repr.seq_number.lt(peer.rcv_nxt) {
            // A retransmission raced our acknowledgment; not news.
            continue;
        }
        // The link is loss-free, so nothing ever arrives early either.
        assert_eq!(repr.seq_number, peer.rcv_nxt);
        collected.extend_from_slice(&data);
        peer.rcv_nxt = peer.rcv_nxt + data.len();
        let (rcv_nxt, snd_nxt) = (peer.rcv_nxt, peer.snd_nxt);
        peer.send_seg(TcpFlags::ACK, snd_nxt, rcv_nxt, u16::max_value(), &[]);
    }

    assert_eq!(collected, expected);
    writer.join().unwrap();
}

#[test]
fn retransmission_repeats_the_oldest_segment() {
    let mut peer = RawPeer::new(ADDR_B);
    let tcp = peer.stack_against(quick_params());

    let connecting = {
        let tcp = Arc::clone(&tcp);
        thread::spawn(move || tcp.connect(addr(ADDR_B), 4433).unwrap())
    };
    peer.accept_handshake(4433, u16::max_value());
    let client = connecting.join().unwrap();

    client.write(b"impatient").unwrap();

    // Withhold the acknowledgment: the same bytes come again.
    let (first, data_one) = peer.recv_seg().expect("the original");
    let (second, data_two) = peer.recv_seg().expect("the retransmission");
    assert_eq!(first.seq_number, second.seq_number);
    assert_eq!(data_one, data_two);
    assert_eq!(&data_one[..], b"impatient");

    // Acknowledge and verify the queue drains.
    peer.rcv_nxt = first.seq_number + data_one.len();
    let (rcv_nxt, snd_nxt) = (peer.rcv_nxt, peer.snd_nxt);
    peer.send_seg(TcpFlags::ACK, snd_nxt, rcv_nxt, u16::max_value(), &[]);

    wait_until("the queue to drain", Duration::from_secs(5),
        || client.inspect(|tcb| tcb.snd_una == tcb.snd_nxt));
    assert!(client.rtx_covers_flight());
}

#[test]
fn retransmission_exhaustion_aborts() {
    let mut params = quick_params();
    params.rto_initial = Duration::from_millis(100);
    params.rto_min = Duration::from_millis(50);

    let mut peer = RawPeer::new(ADDR_B);
    let tcp = peer.stack_against(params);

    // Nobody ever answers the SYN.
    let outcome = tcp.connect(addr(ADDR_B), 4433);
    assert_eq!(outcome.err(), Some(Error::ConnectionAborted));
    assert!(tcp.sockets().is_empty());
}

#[test]
fn duplicate_segments_deliver_once() {
    let mut peer = RawPeer::new(ADDR_B);
    let tcp = peer.stack_against(quick_params());

    let connecting = {
        let tcp = Arc::clone(&tcp);
        thread::spawn(move || tcp.connect(addr(ADDR_B), 4433).unwrap())
    };
    peer.accept_handshake(4433, u16::max_value());
    let client = connecting.join().unwrap();

    let seq = peer.snd_nxt;
    let rcv_nxt = peer.rcv_nxt;
    peer.send_seg(TcpFlags::ACK, seq, rcv_nxt, u16::max_value(), b"once");
    let (ack_one, _) = peer.recv_seg().expect("first ack");
    assert_eq!(ack_one.ack_number, seq + 4);

    // The identical segment again: same cumulative ack, no new bytes.
    peer.send_seg(TcpFlags::ACK, seq, rcv_nxt, u16::max_value(), b"once");
    let (ack_two, _) = peer.recv_seg().expect("duplicate ack");
    assert_eq!(ack_two.ack_number, seq + 4);

    let mut buf = [0u8; 16];
    assert_eq!(client.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"once");
    client.inspect(|tcb| assert_eq!(tcb.rcv_nxt, seq + 4));
}

#[test]
fn early_segments_wait_for_their_turn() {
    let mut peer = RawPeer::new(ADDR_B);
    let tcp = peer.stack_against(quick_params());

    let connecting = {
        let tcp = Arc::clone(&tcp);
        thread::spawn(move || tcp.connect(addr(ADDR_B), 4433).unwrap())
    };
    peer.accept_handshake(4433, u16::max_value());
    let client = connecting.join().unwrap();

    let base = peer.snd_nxt;
    let rcv_nxt = peer.rcv_nxt;

    // Second block first: held, answered with a duplicate ack at the gap.
    peer.send_seg(TcpFlags::ACK, base + 5, rcv_nxt, u16::max_value(), b"world");
    let (dup, _) = peer.recv_seg().expect("gap ack");
    assert_eq!(dup.ack_number, base);

    // The gap filler releases both blocks at once.
    peer.send_seg(TcpFlags::ACK, base, rcv_nxt, u16::max_value(), b"hello");
    wait_until("the cumulative ack", Duration::from_secs(5), || {
        match peer.recv_seg() {
            Some((ack, _)) => ack.ack_number == base + 10,
            None => false,
        }
    });

    let mut buf = [0u8; 16];
    let mut got = Vec::new();
    while got.len() < 10 {
        let n = client.read(&mut buf).unwrap();
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(&got, b"helloworld");
}

#[test]
fn zero_window_probing_paces_single_bytes() {
    let mut params = quick_params();
    params.probe_interval = Duration::from_millis(150);

    let mut peer = RawPeer::new(ADDR_B);
    let tcp = peer.stack_against(params);

    let connecting = {
        let tcp = Arc::clone(&tcp);
        thread::spawn(move || tcp.connect(addr(ADDR_B), 4433).unwrap())
    };
    // Advertise a shut window from the very start.
    peer.accept_handshake(4433, 0);
    let client = connecting.join().unwrap();

    let writer = {
        let client = Arc::clone(&client);
        thread::spawn(move || client.write(b"pressure").unwrap())
    };

    // Exactly one byte per probe, at the same sequence number, and none
    // of them protected by the retransmit queue.
    let (first_probe, data) = peer.recv_seg().expect("first probe");
    assert_eq!(data.len(), 1);
    assert_eq!(data[0], b'p');
    let probe_seq = first_probe.seq_number;

    let started = Instant::now();
    let (second_probe, data) = peer.recv_seg().expect("second probe");
    assert_eq!(data.len(), 1);
    assert_eq!(second_probe.seq_number, probe_seq);
    assert!(started.elapsed() >= Duration::from_millis(75),
            "probes arrived faster than the probe interval");

    assert!(client.rtx_covers_flight());

    // Accept the probed byte and open the window: the rest flows.
    peer.rcv_nxt = probe_seq + 1;
    let (rcv_nxt, snd_nxt) = (peer.rcv_nxt, peer.snd_nxt);
    peer.send_seg(TcpFlags::ACK, snd_nxt, rcv_nxt, u16::max_value(), &[]);

    let mut collected = vec![b'p'];
    while collected.len() < 8 {
        let (repr, data) = peer.recv_seg().expect("the remainder");
        if data.is_empty() {
            continue;
        }
        assert_eq!(repr.seq_number, peer.rcv_nxt);
        collected.extend_from_slice(&data);
        peer.rcv_nxt = peer.rcv_nxt + data.len();
        let (rcv_nxt, snd_nxt) = (peer.rcv_nxt, peer.snd_nxt);
        peer.send_seg(TcpFlags::ACK, snd_nxt, rcv_nxt, u16::max_value(), &[]);
    }
    assert_eq!(&collected, b"pressure");
    writer.join().unwrap();
}

#[test]
fn reset_tears_the_connection_down() {
    let mut peer = RawPeer::new(ADDR_B);
    let tcp = peer.stack_against(quick_params());

    let connecting = {
        let tcp = Arc::clone(&tcp);
        thread::spawn(move || tcp.connect(addr(ADDR_B), 4433).unwrap())
    };
    peer.accept_handshake(4433, u16::max_value());
    let client = connecting.join().unwrap();

    let (rcv_nxt, snd_nxt) = (peer.rcv_nxt, peer.snd_nxt);
    peer.send_seg(TcpFlags::RST, snd_nxt, rcv_nxt, 0, &[]);

    wait_until("the reset to land", Duration::from_secs(5),
        || client.state() == State::Closed);
    assert!(tcp.sockets().is_empty());
    assert_eq!(client.read(&mut [0u8; 8]), Err(Error::ConnectionAborted));
    assert!(matches!(client.write(b"x"), Err(Error::ConnectionAborted)));
}
