//! The forwarding table, rfc1519 style prefixes with rfc2453 metrics.
use core::fmt;
use std::sync::Mutex;

use crate::time::{Duration, Instant};
use crate::wire::{Ipv4Address, Ipv4Subnet, RIP_INFINITY};

/// Who installed a route, deciding its lifetime and listing tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
    /// A connected subnet of a local interface. Metric 0, never expires.
    Local,

    /// Installed from the topology file. Metric 1, never expires.
    Static,

    /// Learned from a neighbor's advertisement. Metric 1..15, expires when
    /// not refreshed.
    Rip,
}

impl fmt::Display for RouteSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            RouteSource::Local => "L",
            RouteSource::Static => "S",
            RouteSource::Rip => "R",
        })
    }
}

/// A prefix of addresses together with the way to reach it.
#[derive(Debug, Clone)]
pub struct Route {
    /// The network routed through this route.
    pub subnet: Ipv4Subnet,

    /// Next hop for this network.
    ///
    /// For local routes this is the interface's own address, any matching
    /// destination is itself on-link.
    pub next_hop: Ipv4Address,

    /// Name of the interface the next hop sits behind.
    pub ifname: String,

    /// Cost of the route, `0..16`. The infinity value 16 is never stored.
    pub metric: u8,

    /// Who put the entry here.
    pub source: RouteSource,

    /// When the entry was installed or last refreshed.
    pub last_updated: Instant,
}

impl Route {
    /// A connected-subnet route through a local interface.
    pub fn local(subnet: Ipv4Subnet, addr: Ipv4Address, ifname: &str) -> Route {
        Route {
            subnet,
            next_hop: addr,
            ifname: ifname.to_owned(),
            metric: 0,
            source: RouteSource::Local,
            last_updated: Instant::now(),
        }
    }

    /// A route configured in the topology file.
    pub fn static_via(subnet: Ipv4Subnet, next_hop: Ipv4Address, ifname: &str) -> Route {
        Route {
            subnet,
            next_hop,
            ifname: ifname.to_owned(),
            metric: 1,
            source: RouteSource::Static,
            last_updated: Instant::now(),
        }
    }

    /// A route learned from an advertisement.
    pub fn learned(subnet: Ipv4Subnet, next_hop: Ipv4Address, ifname: &str, metric: u8)
        -> Route
    {
        debug_assert!(metric >= 1 && (metric as u32) < RIP_INFINITY);
        Route {
            subnet,
            next_hop,
            ifname: ifname.to_owned(),
            metric,
            source: RouteSource::Rip,
            last_updated: Instant::now(),
        }
    }
}

/// The forwarding table of one node.
///
/// All access takes the internal mutex; iteration for advertisement copies
/// the entries out under the lock.
#[derive(Debug, Default)]
pub struct RouteTable {
    entries: Mutex<Vec<Route>>,
}

impl RouteTable {
    /// Create an empty table.
    pub fn new() -> Self {
        RouteTable::default()
    }

    /// Install a route, honoring the replacement rule.
    ///
    /// If no route for the prefix exists, the entry is inserted. An existing
    /// entry is replaced only when the new one has strictly smaller metric,
    /// or when it comes from the same `(source, next_hop)` pair, which
    /// refreshes the entry and lets its metric drift upward. Returns whether
    /// the table changed.
    pub fn install(&self, route: Route) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter_mut().find(|cur| cur.subnet == route.subnet) {
            None => {
                entries.push(route);
                true
            }
            Some(cur) => {
                let refresh = cur.source == route.source && cur.next_hop == route.next_hop;
                if route.metric < cur.metric || refresh {
                    let changed = cur.metric != route.metric || cur.next_hop != route.next_hop;
                    *cur = route;
                    changed || !refresh
                } else {
                    false
                }
            }
        }
    }

    /// Remove the route for an exact prefix.
    pub fn remove(&self, subnet: Ipv4Subnet) -> Option<Route> {
        let mut entries = self.entries.lock().unwrap();
        let pos = entries.iter().position(|cur| cur.subnet == subnet)?;
        Some(entries.swap_remove(pos))
    }

    /// Find the route for an exact prefix.
    pub fn lookup_exact(&self, subnet: Ipv4Subnet) -> Option<Route> {
        let entries = self.entries.lock().unwrap();
        entries.iter().find(|cur| cur.subnet == subnet).cloned()
    }

    /// Find the route whose prefix contains `addr`.
    ///
    /// Among all matching entries the one with the greatest prefix length
    /// wins; among equal prefix lengths, the lowest metric.
    pub fn next_hop(&self, addr: Ipv4Address) -> Option<Route> {
        let entries = self.entries.lock().unwrap();

        let mut best_match: Option<&Route> = None;
        for route in entries.iter() {
            if !route.subnet.contains(addr) {
                continue;
            }

            let best = best_match.get_or_insert(route);
            let longer = route.subnet.prefix_len() > best.subnet.prefix_len();
            let cheaper_tie = route.subnet.prefix_len() == best.subnet.prefix_len()
                && route.metric < best.metric;
            if longer || cheaper_tie {
                *best = route;
            }
        }
        best_match.cloned()
    }

    /// Copy all entries out under the lock.
    pub fn snapshot(&self) -> Vec<Route> {
        self.entries.lock().unwrap().clone()
    }

    /// Remove advertised routes that have not been refreshed within
    /// `timeout`, returning what was dropped.
    pub fn expire(&self, timeout: Duration, now: Instant) -> Vec<Route> {
        let mut entries = self.entries.lock().unwrap();
        let mut expired = Vec::new();

        entries.retain(|route| {
            let stale = route.source == RouteSource::Rip
                && now - route.last_updated > timeout;
            if stale {
                expired.push(route.clone());
            }
            !stale
        });

        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(s: &str) -> Ipv4Subnet {
        s.parse().unwrap()
    }

    fn addr(s: &str) -> Ipv4Address {
        s.parse().unwrap()
    }

    #[test]
    fn install_prefers_smaller_metric() {
        let table = RouteTable::new();
        assert!(table.install(Route::learned(subnet("10.2.0.0/24"), addr("10.1.0.2"), "if0", 3)));

        // A worse route from elsewhere does not displace.
        assert!(!table.install(Route::learned(subnet("10.2.0.0/24"), addr("10.1.0.3"), "if0", 5)));
        assert_eq!(table.lookup_exact(subnet("10.2.0.0/24")).unwrap().metric, 3);

        // A strictly better one does.
        assert!(table.install(Route::learned(subnet("10.2.0.0/24"), addr("10.1.0.3"), "if0", 2)));
        assert_eq!(table.lookup_exact(subnet("10.2.0.0/24")).unwrap().next_hop, addr("10.1.0.3"));
    }

    #[test]
    fn same_upstream_refreshes_upward() {
        let table = RouteTable::new();
        table.install(Route::learned(subnet("10.2.0.0/24"), addr("10.1.0.2"), "if0", 2));

        // Same next hop may worsen the route, that is how it ages.
        assert!(table.install(Route::learned(subnet("10.2.0.0/24"), addr("10.1.0.2"), "if0", 7)));
        assert_eq!(table.lookup_exact(subnet("10.2.0.0/24")).unwrap().metric, 7);

        // An equal-cost refresh changes timestamps, not the table shape.
        assert!(!table.install(Route::learned(subnet("10.2.0.0/24"), addr("10.1.0.2"), "if0", 7)));
    }

    #[test]
    fn one_entry_per_prefix() {
        let table = RouteTable::new();
        table.install(Route::learned(subnet("10.2.0.0/24"), addr("10.1.0.2"), "if0", 2));
        table.install(Route::learned(subnet("10.2.0.0/24"), addr("10.1.0.3"), "if1", 1));
        table.install(Route::learned(subnet("10.2.0.0/16"), addr("10.1.0.4"), "if0", 4));
        assert_eq!(table.snapshot().len(), 2);
    }

    #[test]
    fn longest_prefix_wins() {
        let table = RouteTable::new();
        table.install(Route::static_via(subnet("0.0.0.0/0"), addr("10.0.0.9"), "if0"));
        table.install(Route::learned(subnet("10.2.0.0/16"), addr("10.1.0.2"), "if0", 1));
        table.install(Route::learned(subnet("10.2.3.0/24"), addr("10.1.0.3"), "if1", 9));

        // The /24 has a worse metric and still wins on prefix length.
        let best = table.next_hop(addr("10.2.3.7")).unwrap();
        assert_eq!(best.next_hop, addr("10.1.0.3"));

        let second = table.next_hop(addr("10.2.9.7")).unwrap();
        assert_eq!(second.next_hop, addr("10.1.0.2"));

        let fallback = table.next_hop(addr("192.168.0.1")).unwrap();
        assert_eq!(fallback.next_hop, addr("10.0.0.9"));
    }

    #[test]
    fn metric_breaks_prefix_ties() {
        let table = RouteTable::new();
        table.install(Route::learned(subnet("10.2.0.0/24"), addr("10.1.0.2"), "if0", 4));
        table.install(Route::learned(subnet("10.2.1.0/24"), addr("10.1.0.3"), "if1", 1));

        // Same prefix length, different prefixes, only one matches.
        assert_eq!(table.next_hop(addr("10.2.1.1")).unwrap().metric, 1);
    }

    #[test]
    fn expiry_only_hits_learned_routes() {
        let table = RouteTable::new();
        let t0 = Instant::from_secs(0);

        let mut local = Route::local(subnet("10.0.0.0/24"), addr("10.0.0.1"), "if0");
        local.last_updated = t0;
        let mut stat = Route::static_via(subnet("10.3.0.0/24"), addr("10.0.0.9"), "if0");
        stat.last_updated = t0;
        let mut learned = Route::learned(subnet("10.2.0.0/24"), addr("10.0.0.2"), "if0", 2);
        learned.last_updated = t0;

        table.install(local);
        table.install(stat);
        table.install(learned);

        let expired = table.expire(
            Duration::from_secs(12),
            Instant::from_secs(13));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].subnet, subnet("10.2.0.0/24"));
        assert_eq!(table.snapshot().len(), 2);
        assert!(table.next_hop(addr("10.2.0.1")).is_none());
    }
}
