//! The distance-vector router, rfc2453 in spirit.
//!
//! Carried as IP protocol 200 between explicitly configured routing
//! neighbors. Three periodic duties run against the forwarding table: the
//! full-table advertiser, the timeout scavenger, and (triggered by incoming
//! responses) partial updates for whatever just changed. All outgoing
//! advertisements apply split horizon with poisoned reverse.
use std::cmp;
use std::sync::{Arc, Weak};
use std::thread;

use log::{debug, trace};

use crate::layer::ip::{IpStack, Received, Route, RouteSource, RouteTable, DEFAULT_TTL};
use crate::time::{Duration, Instant};
use crate::wire::{IpProtocol, Ipv4Address, Ipv4Subnet, RipCommand, RipRepr, RouteAdvert,
                  RIP_INFINITY};

#[cfg(test)]
mod tests;

/// Tunables of one router, from the topology file.
#[derive(Debug, Clone)]
pub struct RipConfig {
    /// Peers that receive advertisements.
    pub neighbors: Vec<Ipv4Address>,

    /// Period of the full-table advertisement.
    pub update_interval: Duration,

    /// Age at which a learned route is scavenged.
    pub timeout: Duration,
}

impl Default for RipConfig {
    fn default() -> Self {
        RipConfig {
            neighbors: Vec::new(),
            update_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(12),
        }
    }
}

/// The router half of a node.
pub struct Router {
    me: Weak<Router>,
    ip: Arc<IpStack>,
    config: RipConfig,
}

impl Router {
    /// Create a router over the node's IP core.
    pub fn new(ip: Arc<IpStack>, config: RipConfig) -> Arc<Router> {
        Arc::new_cyclic(|me| Router { me: me.clone(), ip, config })
    }

    /// Install the protocol handler on the IP core.
    ///
    /// The handler holds only a weak reference, the IP core never keeps the
    /// router alive.
    pub fn register(&self) {
        let router = self.me.clone();
        self.ip.register_handler(IpProtocol::RIP, move |recv| {
            if let Some(router) = router.upgrade() {
                router.on_datagram(recv);
            }
        });
    }

    /// Ask every neighbor for its table and spawn the periodic duties.
    ///
    /// The threads run for as long as the router is referenced anywhere.
    pub fn start(&self) -> Vec<thread::JoinHandle<()>> {
        self.send_requests();

        let advertiser = spawn_duty(
            "rip-advertise",
            self.me.clone(),
            self.config.update_interval,
            Router::advertise_periodic);

        // Scan well below the timeout so an entry dies close to its due
        // time, not one full scavenger period later.
        let scan = cmp::min(self.config.timeout, Duration::from_secs(1));
        let scavenger = spawn_duty(
            "rip-scavenge", self.me.clone(), scan, Router::scavenge);

        vec![advertiser, scavenger]
    }

    /// The configured routing neighbors.
    pub fn neighbors(&self) -> &[Ipv4Address] {
        &self.config.neighbors
    }

    fn on_datagram(&self, recv: &Received<'_>) {
        let repr = match RipRepr::parse(recv.payload) {
            Ok(repr) => repr,
            Err(err) => {
                debug!("dropping routing message from {}: {}", recv.src, err);
                return;
            }
        };

        match repr.command {
            RipCommand::Request => {
                trace!("table request from {}", recv.src);
                let entries = response_entries(
                    &self.ip.table().snapshot(), &[], recv.src);
                self.send_response(recv.src, entries);
            }
            RipCommand::Response => self.process_response(recv.src, &repr.entries),
        }
    }

    fn process_response(&self, from: Ipv4Address, adverts: &[RouteAdvert]) {
        let ifname = match self.iface_towards(from) {
            Some(name) => name,
            None => {
                debug!("advertisement from unreachable neighbor {}", from);
                return;
            }
        };

        let outcome = apply_response(self.ip.table(), from, &ifname, adverts);
        if !outcome.is_empty() {
            self.trigger_update(&outcome);
        }
    }

    /// Immediately tell every neighbor about changed routes.
    fn trigger_update(&self, outcome: &ResponseOutcome) {
        for &neighbor in &self.config.neighbors {
            let entries = response_entries(
                &outcome.changed, &outcome.withdrawn, neighbor);
            self.send_response(neighbor, entries);
        }
    }

    /// One round of the full-table advertisement.
    fn advertise_periodic(&self) {
        let routes = self.ip.table().snapshot();
        for &neighbor in &self.config.neighbors {
            let entries = response_entries(&routes, &[], neighbor);
            self.send_response(neighbor, entries);
        }
    }

    /// One round of the timeout scavenger.
    fn scavenge(&self) {
        let expired = self.ip.table()
            .expire(self.config.timeout, Instant::now());
        if expired.is_empty() {
            return;
        }

        debug!("scavenged {} stale routes", expired.len());
        let withdrawn: Vec<_> = expired.into_iter().map(|route| route.subnet).collect();
        for &neighbor in &self.config.neighbors {
            let entries = response_entries(&[], &withdrawn, neighbor);
            self.send_response(neighbor, entries);
        }
    }

    fn send_requests(&self) {
        for &neighbor in &self.config.neighbors {
            let message = RipRepr::request().emit();
            if let Err(err) = self.ip.send(neighbor, IpProtocol::RIP, DEFAULT_TTL, &message) {
                debug!("request to {} failed: {}", neighbor, err);
            }
        }
    }

    fn send_response(&self, neighbor: Ipv4Address, entries: Vec<RouteAdvert>) {
        if entries.is_empty() {
            return;
        }

        let message = RipRepr::response(entries).emit();
        if let Err(err) = self.ip.send(neighbor, IpProtocol::RIP, DEFAULT_TTL, &message) {
            debug!("response to {} failed: {}", neighbor, err);
        }
    }

    /// The interface through which advertisements of `neighbor` route.
    fn iface_towards(&self, neighbor: Ipv4Address) -> Option<String> {
        self.ip.interfaces().iter()
            .find(|iface| {
                iface.has_neighbor(neighbor) || iface.cidr().subnet().contains(neighbor)
            })
            .map(|iface| iface.name().to_owned())
    }
}

/// Spawn a fixed-period duty that dies with the router.
fn spawn_duty(name: &str, router: Weak<Router>, period: Duration,
              duty: fn(&Router)) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || loop {
            thread::sleep(period);
            match router.upgrade() {
                Some(router) => duty(&router),
                None => break,
            }
        })
        .expect("spawning a routing duty thread")
}

/// What one processed response did to the table.
#[derive(Debug, Default)]
pub(crate) struct ResponseOutcome {
    /// Routes installed or updated, to advertise with their new metric.
    pub(crate) changed: Vec<Route>,

    /// Prefixes whose route was removed, to advertise as unreachable.
    pub(crate) withdrawn: Vec<Ipv4Subnet>,
}

impl ResponseOutcome {
    fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.withdrawn.is_empty()
    }
}

/// Fold one advertisement from neighbor `from` into the table.
pub(crate) fn apply_response(table: &RouteTable, from: Ipv4Address, ifname: &str,
                             adverts: &[RouteAdvert]) -> ResponseOutcome {
    let mut outcome = ResponseOutcome::default();

    for advert in adverts {
        let new_cost = cmp::min(advert.cost + 1, RIP_INFINITY);

        if new_cost == RIP_INFINITY {
            // Only the installed upstream can poison its own route, and
            // configured routes are not for a protocol to take away.
            let cur = match table.lookup_exact(advert.subnet) {
                Some(cur) => cur,
                None => continue,
            };
            if cur.source == RouteSource::Rip && cur.next_hop == from {
                table.remove(advert.subnet);
                outcome.withdrawn.push(advert.subnet);
            }
            continue;
        }

        // The table's replacement rule is exactly the acceptance rule:
        // better routes win, the same upstream refreshes uphill and down.
        let route = Route::learned(advert.subnet, from, ifname, new_cost as u8);
        if table.install(route.clone()) {
            outcome.changed.push(route);
        }
    }

    outcome
}

/// The entries of a response to `neighbor`: split horizon, poisoned reverse.
///
/// Routes through the addressed neighbor are advertised at infinity rather
/// than omitted; withdrawn prefixes are advertised at infinity to everyone.
pub(crate) fn response_entries(routes: &[Route], withdrawn: &[Ipv4Subnet],
                               neighbor: Ipv4Address) -> Vec<RouteAdvert> {
    let mut entries: Vec<_> = routes.iter()
        .map(|route| RouteAdvert {
            cost: if route.next_hop == neighbor {
                RIP_INFINITY
            } else {
                route.metric as u32
            },
            subnet: route.subnet,
        })
        .collect();

    entries.extend(withdrawn.iter().map(|&subnet| RouteAdvert {
        cost: RIP_INFINITY,
        subnet,
    }));

    entries
}
