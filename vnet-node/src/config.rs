//! The topology file.
//!
//! Line oriented, `#` starts a comment, tokens are whitespace separated:
//!
//! ```text
//! interface if0 10.0.0.1/24 127.0.0.1:5001
//! neighbor  if0 10.0.0.2 127.0.0.1:5002
//! routing   rip
//! route     10.9.0.0/24 via 10.0.0.2
//! rip       neighbor 10.0.0.2
//! rip       update-interval 5
//! rip       timeout 12
//! test      protocol 0
//! ```
use core::fmt;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::Path;

use vnet::time::Duration;
use vnet::wire::{IpProtocol, Ipv4Address, Ipv4Cidr, Ipv4Subnet};

/// One interface stanza: a name, an address with prefix, and the local
/// endpoint of the emulated link.
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub name: String,
    pub cidr: Ipv4Cidr,
    pub bind: SocketAddr,
}

/// One neighbor stanza: who is reachable on which interface, and where
/// their emulated link ends.
#[derive(Debug, Clone)]
pub struct NeighborConfig {
    pub ifname: String,
    pub addr: Ipv4Address,
    pub endpoint: SocketAddr,
}

/// A statically configured route.
#[derive(Debug, Clone)]
pub struct StaticRoute {
    pub subnet: Ipv4Subnet,
    pub next_hop: Ipv4Address,
}

/// Whether the node participates in route exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    None,
    Rip,
}

/// Everything a node needs to come up.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub interfaces: Vec<InterfaceConfig>,
    pub neighbors: Vec<NeighborConfig>,
    pub routing: RoutingMode,
    pub static_routes: Vec<StaticRoute>,
    pub rip_neighbors: Vec<Ipv4Address>,
    pub rip_update_interval: Duration,
    pub rip_timeout: Duration,
    pub test_protocol: IpProtocol,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            interfaces: Vec::new(),
            neighbors: Vec::new(),
            routing: RoutingMode::None,
            static_routes: Vec::new(),
            rip_neighbors: Vec::new(),
            rip_update_interval: Duration::from_secs(5),
            rip_timeout: Duration::from_secs(12),
            test_protocol: IpProtocol(0),
        }
    }
}

/// Why a topology file was rejected.
#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse { line: usize, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "{}", err),
            ConfigError::Parse { line, reason } => write!(f, "line {}: {}", line, reason),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> ConfigError {
        ConfigError::Io(err)
    }
}

fn bad(line: usize, reason: impl Into<String>) -> ConfigError {
    ConfigError::Parse { line, reason: reason.into() }
}

impl NodeConfig {
    /// Read and parse a topology file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<NodeConfig, ConfigError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Parse topology text.
    pub fn parse(text: &str) -> Result<NodeConfig, ConfigError> {
        let mut config = NodeConfig::default();

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let content = raw.split('#').next().unwrap_or("");
            let mut tokens = content.split_whitespace();
            let directive = match tokens.next() {
                Some(directive) => directive,
                None => continue,
            };
            let rest: Vec<&str> = tokens.collect();

            match directive {
                "interface" => config.parse_interface(line, &rest)?,
                "neighbor" => config.parse_neighbor(line, &rest)?,
                "routing" => config.parse_routing(line, &rest)?,
                "route" => config.parse_route(line, &rest)?,
                "rip" => config.parse_rip(line, &rest)?,
                "test" => config.parse_test(line, &rest)?,
                other => return Err(bad(line, format!("unknown directive `{}`", other))),
            }
        }

        config.check()?;
        Ok(config)
    }

    fn parse_interface(&mut self, line: usize, rest: &[&str]) -> Result<(), ConfigError> {
        match rest {
            [name, cidr, bind] => {
                let cidr: Ipv4Cidr = cidr.parse()
                    .map_err(|err| bad(line, format!("interface address: {}", err)))?;
                let bind: SocketAddr = bind.parse()
                    .map_err(|_| bad(line, "invalid link endpoint"))?;
                if self.interfaces.iter().any(|iface| iface.name == *name) {
                    return Err(bad(line, format!("duplicate interface `{}`", name)));
                }
                self.interfaces.push(InterfaceConfig {
                    name: (*name).to_owned(),
                    cidr,
                    bind,
                });
                Ok(())
            }
            _ => Err(bad(line, "expected: interface <name> <addr>/<prefix> <host:port>")),
        }
    }

    fn parse_neighbor(&mut self, line: usize, rest: &[&str]) -> Result<(), ConfigError> {
        match rest {
            [ifname, addr, endpoint] => {
                let addr: Ipv4Address = addr.parse()
                    .map_err(|_| bad(line, "invalid neighbor address"))?;
                let endpoint: SocketAddr = endpoint.parse()
                    .map_err(|_| bad(line, "invalid link endpoint"))?;
                self.neighbors.push(NeighborConfig {
                    ifname: (*ifname).to_owned(),
                    addr,
                    endpoint,
                });
                Ok(())
            }
            _ => Err(bad(line, "expected: neighbor <ifname> <addr> <host:port>")),
        }
    }

    fn parse_routing(&mut self, line: usize, rest: &[&str]) -> Result<(), ConfigError> {
        match rest {
            ["rip"] => {
                self.routing = RoutingMode::Rip;
                Ok(())
            }
            ["none"] => {
                self.routing = RoutingMode::None;
                Ok(())
            }
            _ => Err(bad(line, "expected: routing <rip|none>")),
        }
    }

    fn parse_route(&mut self, line: usize, rest: &[&str]) -> Result<(), ConfigError> {
        match rest {
            [subnet, "via", next_hop] => {
                let subnet: Ipv4Subnet = subnet.parse()
                    .map_err(|err| bad(line, format!("route prefix: {}", err)))?;
                let next_hop: Ipv4Address = next_hop.parse()
                    .map_err(|_| bad(line, "invalid next hop"))?;
                self.static_routes.push(StaticRoute { subnet, next_hop });
                Ok(())
            }
            _ => Err(bad(line, "expected: route <net>/<prefix> via <next-hop>")),
        }
    }

    fn parse_rip(&mut self, line: usize, rest: &[&str]) -> Result<(), ConfigError> {
        match rest {
            ["neighbor", addr] => {
                let addr: Ipv4Address = addr.parse()
                    .map_err(|_| bad(line, "invalid rip neighbor"))?;
                self.rip_neighbors.push(addr);
                Ok(())
            }
            ["update-interval", seconds] => {
                let seconds: u64 = seconds.parse()
                    .map_err(|_| bad(line, "invalid update interval"))?;
                self.rip_update_interval = Duration::from_secs(seconds);
                Ok(())
            }
            ["timeout", seconds] => {
                let seconds: u64 = seconds.parse()
                    .map_err(|_| bad(line, "invalid timeout"))?;
                self.rip_timeout = Duration::from_secs(seconds);
                Ok(())
            }
            _ => Err(bad(line, "expected: rip <neighbor|update-interval|timeout> …")),
        }
    }

    fn parse_test(&mut self, line: usize, rest: &[&str]) -> Result<(), ConfigError> {
        match rest {
            ["protocol", number] => {
                let number: u8 = number.parse()
                    .map_err(|_| bad(line, "invalid protocol number"))?;
                if number > 1 {
                    return Err(bad(line, "test protocol must be 0 or 1"));
                }
                self.test_protocol = IpProtocol(number);
                Ok(())
            }
            _ => Err(bad(line, "expected: test protocol <0|1>")),
        }
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.interfaces.is_empty() {
            return Err(bad(0, "a node needs at least one interface"));
        }
        for neighbor in &self.neighbors {
            if !self.interfaces.iter().any(|iface| iface.name == neighbor.ifname) {
                return Err(bad(0, format!(
                    "neighbor {} references unknown interface `{}`",
                    neighbor.addr, neighbor.ifname)));
            }
        }
        Ok(())
    }
}
