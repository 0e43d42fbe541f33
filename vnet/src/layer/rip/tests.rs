use super::*;

fn subnet(s: &str) -> Ipv4Subnet {
    s.parse().unwrap()
}

fn addr(s: &str) -> Ipv4Address {
    s.parse().unwrap()
}

fn advert(cost: u32, s: &str) -> RouteAdvert {
    RouteAdvert { cost, subnet: subnet(s) }
}

#[test]
fn learning_increments_the_cost() {
    let table = RouteTable::new();
    let outcome = apply_response(
        &table, addr("10.1.0.2"), "if0",
        &[advert(0, "10.2.0.0/24"), advert(2, "10.3.0.0/24")]);

    assert_eq!(outcome.changed.len(), 2);
    assert!(outcome.withdrawn.is_empty());
    assert_eq!(table.lookup_exact(subnet("10.2.0.0/24")).unwrap().metric, 1);
    assert_eq!(table.lookup_exact(subnet("10.3.0.0/24")).unwrap().metric, 3);

    let installed = table.lookup_exact(subnet("10.2.0.0/24")).unwrap();
    assert_eq!(installed.next_hop, addr("10.1.0.2"));
    assert_eq!(installed.source, RouteSource::Rip);
    assert_eq!(installed.ifname, "if0");
}

#[test]
fn cost_saturates_at_infinity() {
    let table = RouteTable::new();
    // An advert of 15 becomes unreachable after the hop, nothing installs.
    let outcome = apply_response(
        &table, addr("10.1.0.2"), "if0", &[advert(15, "10.2.0.0/24")]);

    assert!(outcome.is_empty());
    assert!(table.lookup_exact(subnet("10.2.0.0/24")).is_none());
}

#[test]
fn better_routes_displace_worse_ones() {
    let table = RouteTable::new();
    apply_response(&table, addr("10.1.0.2"), "if0", &[advert(4, "10.2.0.0/24")]);

    // Worse offer from another neighbor changes nothing.
    let outcome = apply_response(
        &table, addr("10.1.0.3"), "if1", &[advert(6, "10.2.0.0/24")]);
    assert!(outcome.is_empty());
    assert_eq!(table.lookup_exact(subnet("10.2.0.0/24")).unwrap().next_hop, addr("10.1.0.2"));

    // A strictly better one switches upstreams.
    let outcome = apply_response(
        &table, addr("10.1.0.3"), "if1", &[advert(1, "10.2.0.0/24")]);
    assert_eq!(outcome.changed.len(), 1);
    let route = table.lookup_exact(subnet("10.2.0.0/24")).unwrap();
    assert_eq!(route.next_hop, addr("10.1.0.3"));
    assert_eq!(route.metric, 2);
}

#[test]
fn the_upstream_may_worsen_its_route() {
    let table = RouteTable::new();
    apply_response(&table, addr("10.1.0.2"), "if0", &[advert(1, "10.2.0.0/24")]);

    let outcome = apply_response(
        &table, addr("10.1.0.2"), "if0", &[advert(5, "10.2.0.0/24")]);
    assert_eq!(outcome.changed.len(), 1);
    assert_eq!(table.lookup_exact(subnet("10.2.0.0/24")).unwrap().metric, 6);

    // An identical refresh updates the timestamp without reporting change.
    let outcome = apply_response(
        &table, addr("10.1.0.2"), "if0", &[advert(5, "10.2.0.0/24")]);
    assert!(outcome.is_empty());
}

#[test]
fn only_the_upstream_can_poison() {
    let table = RouteTable::new();
    apply_response(&table, addr("10.1.0.2"), "if0", &[advert(1, "10.2.0.0/24")]);

    // Infinity from a bystander leaves the route alone.
    let outcome = apply_response(
        &table, addr("10.1.0.3"), "if1", &[advert(16, "10.2.0.0/24")]);
    assert!(outcome.is_empty());
    assert!(table.lookup_exact(subnet("10.2.0.0/24")).is_some());

    // Infinity from the installed upstream withdraws it.
    let outcome = apply_response(
        &table, addr("10.1.0.2"), "if0", &[advert(16, "10.2.0.0/24")]);
    assert_eq!(outcome.withdrawn, vec![subnet("10.2.0.0/24")]);
    assert!(table.lookup_exact(subnet("10.2.0.0/24")).is_none());
}

#[test]
fn configured_routes_resist_the_protocol() {
    let table = RouteTable::new();
    table.install(Route::static_via(subnet("10.2.0.0/24"), addr("10.1.0.2"), "if0"));
    table.install(Route::local(subnet("10.0.0.0/24"), addr("10.0.0.1"), "if1"));

    // Poison from the static next hop does not take the route away.
    let outcome = apply_response(
        &table, addr("10.1.0.2"), "if0", &[advert(16, "10.2.0.0/24")]);
    assert!(outcome.is_empty());
    assert_eq!(
        table.lookup_exact(subnet("10.2.0.0/24")).unwrap().source,
        RouteSource::Static);

    // Nor does a same-cost advertisement capture it for the protocol.
    apply_response(&table, addr("10.1.0.2"), "if0", &[advert(0, "10.2.0.0/24")]);
    assert_eq!(
        table.lookup_exact(subnet("10.2.0.0/24")).unwrap().source,
        RouteSource::Static);

    // The local subnet is likewise untouchable.
    apply_response(&table, addr("10.1.0.2"), "if0", &[advert(3, "10.0.0.0/24")]);
    assert_eq!(
        table.lookup_exact(subnet("10.0.0.0/24")).unwrap().source,
        RouteSource::Local);
}

#[test]
fn split_horizon_poisons_the_reverse_path() {
    let learned = Route::learned(subnet("10.2.0.0/24"), addr("10.1.0.2"), "if0", 2);
    let other = Route::learned(subnet("10.3.0.0/24"), addr("10.1.0.3"), "if1", 4);
    let routes = vec![learned, other];

    // Towards the upstream, its own route reads as unreachable.
    let entries = response_entries(&routes, &[], addr("10.1.0.2"));
    assert_eq!(entries, vec![
        advert(16, "10.2.0.0/24"),
        advert(4, "10.3.0.0/24"),
    ]);

    // Towards anyone else both carry their true cost.
    let entries = response_entries(&routes, &[], addr("10.9.9.9"));
    assert_eq!(entries, vec![
        advert(2, "10.2.0.0/24"),
        advert(4, "10.3.0.0/24"),
    ]);
}

#[test]
fn withdrawn_prefixes_read_unreachable_everywhere() {
    let entries = response_entries(&[], &[subnet("10.2.0.0/24")], addr("10.1.0.2"));
    assert_eq!(entries, vec![advert(16, "10.2.0.0/24")]);
}

#[test]
fn no_metric_sixteen_is_ever_installed() {
    let table = RouteTable::new();
    apply_response(&table, addr("10.1.0.2"), "if0", &[
        advert(15, "10.2.0.0/24"),
        advert(16, "10.3.0.0/24"),
        advert(14, "10.4.0.0/24"),
    ]);

    for route in table.snapshot() {
        assert!((route.metric as u32) < RIP_INFINITY);
    }
    assert_eq!(table.snapshot().len(), 1);
}
