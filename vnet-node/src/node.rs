//! Wiring a parsed topology into a running stack.
use std::io;
use std::sync::Arc;

use log::info;

use vnet::iface::Interface;
use vnet::layer::ip::{IpStack, Route};
use vnet::layer::rip::{RipConfig, Router};
use vnet::layer::tcp::{TcpParams, TcpStack};

use crate::config::{NodeConfig, RoutingMode};

/// What kind of node a binary runs.
///
/// Routers have no transport layer; hosts always carry one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Router,
}

/// A running node: the stacks plus the background duties keeping it alive.
pub struct Node {
    ip: Arc<IpStack>,
    tcp: Option<Arc<TcpStack>>,
    router: Option<Arc<Router>>,
    test_protocol: vnet::wire::IpProtocol,
}

impl Node {
    /// Bring a node up from its configuration.
    ///
    /// Binds every link socket, installs static routes, registers the test
    /// protocol printer (and the transport and router where configured),
    /// and spawns the receive loops and periodic duties.
    pub fn start(config: &NodeConfig, role: Role) -> io::Result<Node> {
        Self::start_with_tcp_params(config, role, TcpParams::default())
    }

    /// Like [start], with transport tunables for tests.
    ///
    /// [start]: #method.start
    pub fn start_with_tcp_params(config: &NodeConfig, role: Role, params: TcpParams)
        -> io::Result<Node>
    {
        let mut interfaces = Vec::with_capacity(config.interfaces.len());
        for iface_config in &config.interfaces {
            let mut iface = Interface::open(
                &iface_config.name, iface_config.cidr, iface_config.bind)?;
            for neighbor in &config.neighbors {
                if neighbor.ifname == iface_config.name {
                    iface.add_neighbor(neighbor.addr, neighbor.endpoint);
                }
            }
            interfaces.push(iface);
        }

        let ip = IpStack::new(interfaces);

        for route in &config.static_routes {
            let egress = ip.interfaces().iter()
                .find(|iface| iface.cidr().subnet().contains(route.next_hop))
                .ok_or_else(|| io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("static route via {} has no connected interface",
                            route.next_hop)))?;
            ip.table().install(Route::static_via(
                route.subnet, route.next_hop, egress.name()));
        }

        let test_protocol = config.test_protocol;
        ip.register_handler(test_protocol, |recv| {
            println!(
                "Received test packet: Src: {}, Dst: {}, TTL: {}, Data: {}",
                recv.src, recv.dst, recv.ttl,
                String::from_utf8_lossy(recv.payload));
        });

        let tcp = match role {
            Role::Host => {
                let tcp = TcpStack::with_params(Arc::clone(&ip), params);
                tcp.register();
                Some(tcp)
            }
            Role::Router => None,
        };

        let router = match config.routing {
            RoutingMode::Rip => {
                let router = Router::new(Arc::clone(&ip), RipConfig {
                    neighbors: config.rip_neighbors.clone(),
                    update_interval: config.rip_update_interval,
                    timeout: config.rip_timeout,
                });
                router.register();
                router.start();
                Some(router)
            }
            RoutingMode::None => None,
        };

        ip.spawn_receivers();
        info!("node up with {} interfaces", ip.interfaces().len());

        Ok(Node { ip, tcp, router, test_protocol })
    }

    /// The IP core of this node.
    pub fn ip(&self) -> &Arc<IpStack> {
        &self.ip
    }

    /// The transport core, absent on routers.
    pub fn tcp(&self) -> Option<&Arc<TcpStack>> {
        self.tcp.as_ref()
    }

    /// The distance-vector router, where configured.
    pub fn router(&self) -> Option<&Arc<Router>> {
        self.router.as_ref()
    }

    /// The protocol number test packets travel on.
    pub fn test_protocol(&self) -> vnet::wire::IpProtocol {
        self.test_protocol
    }
}
