//! The interactive command shell.
//!
//! One command per line; the IP commands (`li`, `ln`, `lr`, `up`, `down`,
//! `send`) work on every node, the transport commands (`a`, `c`, `ls`,
//! `s`, `r`, `cl`, `sf`, `rf`) only where the node carries a transport.
use std::fs::File;
use std::io::{self, BufRead, Read, Write};
use std::sync::Arc;
use std::thread;

use vnet::layer::ip::{RouteSource, DEFAULT_TTL};
use vnet::layer::tcp::{SocketHandle, SocketId, TcpStack};
use vnet::wire::Ipv4Address;

use crate::node::Node;

/// Read commands until `exit` or end of input.
pub fn run(node: &Node) {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("> ");
        let _ = io::stdout().flush();

        let line = match lines.next() {
            Some(Ok(line)) => line,
            _ => break,
        };
        let args: Vec<&str> = line.split_whitespace().collect();
        if args.is_empty() {
            continue;
        }

        match args[0] {
            "li" => list_interfaces(node),
            "ln" => list_neighbors(node),
            "lr" => list_routes(node),
            "up" => set_iface(node, &args[1..], true),
            "down" => set_iface(node, &args[1..], false),
            "send" => send_test(node, &args[1..]),
            "a" | "c" | "ls" | "s" | "r" | "cl" | "sf" | "rf" => {
                match node.tcp() {
                    Some(tcp) => transport_command(tcp, args[0], &args[1..]),
                    None => println!("this node has no transport layer"),
                }
            }
            "exit" => break,
            other => println!("unknown command `{}`", other),
        }
    }
}

fn list_interfaces(node: &Node) {
    println!("Name  Addr/Prefix State");
    for iface in node.ip().interfaces() {
        let state = if iface.is_up() { "up" } else { "down" };
        println!("{}  {} {}", iface.name(), iface.cidr(), state);
    }
}

fn list_neighbors(node: &Node) {
    println!("Iface          VIP          UDPAddr");
    for iface in node.ip().interfaces() {
        if !iface.is_up() {
            continue;
        }
        for (addr, endpoint) in iface.neighbors() {
            println!("{}  {}  {}", iface.name(), addr, endpoint);
        }
    }
}

fn list_routes(node: &Node) {
    println!("T       Prefix   Next hop   Cost");
    for route in node.ip().table().snapshot() {
        match route.source {
            RouteSource::Local => {
                println!("L  {}  LOCAL:{}  0", route.subnet, route.ifname)
            }
            RouteSource::Static => {
                println!("S  {}  {}  -", route.subnet, route.next_hop)
            }
            RouteSource::Rip => {
                println!("R  {}  {}  {}", route.subnet, route.next_hop, route.metric)
            }
        }
    }
}

fn set_iface(node: &Node, args: &[&str], up: bool) {
    let name = match args {
        [name] => *name,
        _ => return println!("usage: {} <ifname>", if up { "up" } else { "down" }),
    };
    match node.ip().interface(name) {
        Some(iface) => iface.set_up(up),
        None => println!("no interface `{}`", name),
    }
}

fn send_test(node: &Node, args: &[&str]) {
    if args.len() < 2 {
        return println!("usage: send <addr> <message …>");
    }
    let dst: Ipv4Address = match args[0].parse() {
        Ok(dst) => dst,
        Err(_) => return println!("invalid address `{}`", args[0]),
    };
    let message = args[1..].join(" ");

    if let Err(err) = node.ip().send(
        dst, node.test_protocol(), DEFAULT_TTL, message.as_bytes())
    {
        println!("send failed: {}", err);
    }
}

fn transport_command(tcp: &Arc<TcpStack>, command: &str, args: &[&str]) {
    match command {
        "a" => accept_port(tcp, args),
        "c" => connect_to(tcp, args),
        "ls" => list_sockets(tcp),
        "s" => send_bytes(tcp, args),
        "r" => read_bytes(tcp, args),
        "cl" => close_socket(tcp, args),
        "sf" => send_file(tcp, args),
        "rf" => receive_file(tcp, args),
        _ => unreachable!(),
    }
}

fn parse_port(token: &str) -> Option<u16> {
    token.parse().ok()
}

fn parse_sid(token: &str) -> Option<SocketId> {
    token.parse().ok()
}

fn accept_port(tcp: &Arc<TcpStack>, args: &[&str]) {
    let port = match args {
        [port] => match parse_port(port) {
            Some(port) => port,
            None => return println!("invalid port `{}`", port),
        },
        _ => return println!("usage: a <port>"),
    };

    let tcp = Arc::clone(tcp);
    thread::spawn(move || {
        let listener = match tcp.listen(port) {
            Ok(listener) => listener,
            Err(err) => return println!("listen failed: {}", err),
        };
        println!("Listening on port {} (socket {})", port, listener.id());

        while let Ok(child) = listener.accept() {
            let tuple = child.tuple();
            println!("Accepted connection from {}:{} (socket {})",
                     tuple.remote, tuple.remote_port, child.id());
        }
    });
}

fn connect_to(tcp: &Arc<TcpStack>, args: &[&str]) {
    let (addr, port) = match args {
        [addr, port] => match (addr.parse::<Ipv4Address>(), parse_port(port)) {
            (Ok(addr), Some(port)) => (addr, port),
            _ => return println!("usage: c <addr> <port>"),
        },
        _ => return println!("usage: c <addr> <port>"),
    };

    let tcp = Arc::clone(tcp);
    thread::spawn(move || match tcp.connect(addr, port) {
        Ok(socket) => println!("Connected to {}:{} (socket {})", addr, port, socket.id()),
        Err(err) => println!("connect failed: {}", err),
    });
}

fn list_sockets(tcp: &Arc<TcpStack>) {
    println!("SID    Local           Remote          State");
    for info in tcp.sockets() {
        println!("{}  {}:{}  {}:{}  {}",
                 info.sid,
                 info.tuple.local, info.tuple.local_port,
                 info.tuple.remote, info.tuple.remote_port,
                 info.state);
    }
}

fn with_stream(tcp: &Arc<TcpStack>, token: &str,
               f: impl FnOnce(&Arc<vnet::layer::tcp::StreamSocket>)) {
    let sid = match parse_sid(token) {
        Some(sid) => sid,
        None => return println!("invalid socket id `{}`", token),
    };
    match tcp.socket(sid) {
        Some(SocketHandle::Stream(socket)) => f(&socket),
        Some(SocketHandle::Listen(_)) => {
            println!("socket {} is listening, not connected", sid)
        }
        None => println!("no socket {}", sid),
    }
}

fn send_bytes(tcp: &Arc<TcpStack>, args: &[&str]) {
    if args.len() < 2 {
        return println!("usage: s <socket> <data …>");
    }
    let data = args[1..].join(" ");
    with_stream(tcp, args[0], |socket| match socket.write(data.as_bytes()) {
        Ok(n) => println!("Sent {} bytes", n),
        Err(err) => println!("send failed: {}", err),
    });
}

fn read_bytes(tcp: &Arc<TcpStack>, args: &[&str]) {
    let (token, count) = match args {
        [token, count] => match count.parse::<usize>() {
            Ok(count) => (*token, count),
            Err(_) => return println!("invalid byte count `{}`", count),
        },
        _ => return println!("usage: r <socket> <numbytes>"),
    };

    with_stream(tcp, token, |socket| {
        let mut buf = vec![0u8; count];
        match socket.read(&mut buf) {
            Ok(0) => println!("Read 0 bytes: stream closed"),
            Ok(n) => println!("Read {} bytes: {}", n, String::from_utf8_lossy(&buf[..n])),
            Err(err) => println!("read failed: {}", err),
        }
    });
}

fn close_socket(tcp: &Arc<TcpStack>, args: &[&str]) {
    let sid = match args {
        [token] => match parse_sid(token) {
            Some(sid) => sid,
            None => return println!("invalid socket id `{}`", token),
        },
        _ => return println!("usage: cl <socket>"),
    };

    match tcp.socket(sid) {
        Some(handle) => {
            if let Err(err) = handle.close() {
                println!("close failed: {}", err);
            }
        }
        None => println!("no socket {}", sid),
    }
}

fn send_file(tcp: &Arc<TcpStack>, args: &[&str]) {
    let (path, addr, port) = match args {
        [path, addr, port] => {
            match (addr.parse::<Ipv4Address>(), parse_port(port)) {
                (Ok(addr), Some(port)) => ((*path).to_owned(), addr, port),
                _ => return println!("usage: sf <path> <addr> <port>"),
            }
        }
        _ => return println!("usage: sf <path> <addr> <port>"),
    };

    let tcp = Arc::clone(tcp);
    thread::spawn(move || {
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) => return println!("sf: {}: {}", path, err),
        };
        let socket = match tcp.connect(addr, port) {
            Ok(socket) => socket,
            Err(err) => return println!("sf: connect failed: {}", err),
        };

        let mut total = 0usize;
        let mut chunk = [0u8; 4096];
        loop {
            let n = match file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => return println!("sf: {}: {}", path, err),
            };
            match socket.write(&chunk[..n]) {
                Ok(written) => total += written,
                Err(err) => return println!("sf: send failed: {}", err),
            }
        }

        if let Err(err) = socket.close() {
            println!("sf: close failed: {}", err);
        }
        println!("Sent {} bytes", total);
    });
}

fn receive_file(tcp: &Arc<TcpStack>, args: &[&str]) {
    let (path, port) = match args {
        [path, port] => match parse_port(port) {
            Some(port) => ((*path).to_owned(), port),
            None => return println!("usage: rf <path> <port>"),
        },
        _ => return println!("usage: rf <path> <port>"),
    };

    let tcp = Arc::clone(tcp);
    thread::spawn(move || {
        let mut file = match File::create(&path) {
            Ok(file) => file,
            Err(err) => return println!("rf: {}: {}", path, err),
        };
        let listener = match tcp.listen(port) {
            Ok(listener) => listener,
            Err(err) => return println!("rf: listen failed: {}", err),
        };
        let socket = match listener.accept() {
            Ok(socket) => socket,
            Err(err) => return println!("rf: accept failed: {}", err),
        };

        let mut total = 0usize;
        let mut chunk = [0u8; 4096];
        loop {
            match socket.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(err) = file.write_all(&chunk[..n]) {
                        return println!("rf: {}: {}", path, err);
                    }
                    total += n;
                }
                Err(err) => return println!("rf: receive failed: {}", err),
            }
        }

        listener.close();
        println!("Received {} bytes", total);
    });
}
