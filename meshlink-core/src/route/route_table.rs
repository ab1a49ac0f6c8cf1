use std::collections::BTreeMap;

use crate::route::{AcceptPolicy, Distance, Route, RouteAdvert};

/// Distance-vector table of one node.
///
/// Always holds the local node at distance zero. Withdrawn routes stay in the
/// table at [`Distance::INFINITY`] until [`RouteTable::purge_unreachable`] so
/// the withdrawal can be advertised first.
#[derive(Clone, Debug)]
pub struct RouteTable {
    local: String,
    policy: AcceptPolicy,
    routes: BTreeMap<String, Route>,
}

impl RouteTable {
    pub fn new(local: impl Into<String>, policy: AcceptPolicy) -> RouteTable {
        let local = local.into();
        let mut routes = BTreeMap::new();
        routes.insert(
            local.clone(),
            Route {
                destination: local.clone(),
                distance: Distance::ZERO,
                next: local.clone(),
            },
        );
        Self {
            local,
            policy,
            routes,
        }
    }
    pub fn local(&self) -> &str {
        &self.local
    }
    pub fn policy(&self) -> AcceptPolicy {
        self.policy
    }
    /// Installs a one-hop route to a neighbour that just connected.
    pub fn add_direct(&mut self, neighbor: &str) -> bool {
        let route = Route {
            destination: neighbor.to_string(),
            distance: Distance::hops(1),
            next: neighbor.to_string(),
        };
        self.insert(route)
    }
    /// The table as advertised to `neighbor`: neither the local route nor the
    /// neighbour's own route is included.
    pub fn advertisement_for(&self, neighbor: &str) -> BTreeMap<String, RouteAdvert> {
        self.routes
            .values()
            .filter(|route| route.destination != self.local && route.destination != neighbor)
            .map(|route| {
                (
                    route.destination.clone(),
                    RouteAdvert {
                        distance: route.distance,
                        next: route.next.clone(),
                    },
                )
            })
            .collect()
    }
    /// Merges an advertisement received from neighbour `from`.
    ///
    /// `is_direct` tells whether a destination is a live neighbour; those
    /// routes are never replaced by advertised ones. Returns the destinations
    /// whose route changed.
    pub fn merge<F>(
        &mut self,
        from: &str,
        advert: &BTreeMap<String, RouteAdvert>,
        is_direct: F,
    ) -> Vec<String>
    where
        F: Fn(&str) -> bool,
    {
        let mut changed = Vec::new();
        for (destination, entry) in advert {
            if destination == &self.local || is_direct(destination) {
                continue;
            }
            // poisoned reverse: the neighbour reaches it through us
            let distance = if entry.next == self.local {
                Distance::INFINITY
            } else {
                entry.distance.next_hop()
            };
            let accept = match self.routes.get(destination) {
                None => distance.is_reachable(),
                Some(existing) if existing.next == from => {
                    existing.distance != distance
                        && match self.policy {
                            AcceptPolicy::TrustSameSource => true,
                            AcceptPolicy::StrictlyBetter => {
                                distance < existing.distance || !distance.is_reachable()
                            }
                        }
                }
                Some(existing) => distance < existing.distance,
            };
            if accept {
                log::debug!(
                    "route {} -> {destination}: distance={distance} next={from}",
                    self.local
                );
                self.routes.insert(
                    destination.clone(),
                    Route {
                        destination: destination.clone(),
                        distance,
                        next: from.to_string(),
                    },
                );
                changed.push(destination.clone());
            }
        }
        changed
    }
    /// Marks every route through `neighbor` unreachable.
    pub fn withdraw(&mut self, neighbor: &str) -> Vec<String> {
        let mut changed = Vec::new();
        for route in self.routes.values_mut() {
            if route.next == neighbor
                && route.destination != self.local
                && route.distance.is_reachable()
            {
                route.distance = Distance::INFINITY;
                changed.push(route.destination.clone());
            }
        }
        changed
    }
    pub fn find_next_hop(&self, destination: &str) -> Option<&str> {
        self.routes
            .get(destination)
            .filter(|route| route.is_reachable())
            .map(|route| route.next.as_str())
    }
    pub fn get(&self, destination: &str) -> Option<&Route> {
        self.routes.get(destination)
    }
    pub fn routes(&self) -> Vec<Route> {
        self.routes.values().cloned().collect()
    }
    /// Drops withdrawn routes; returns how many were removed.
    pub fn purge_unreachable(&mut self) -> usize {
        let before = self.routes.len();
        self.routes.retain(|_, route| route.is_reachable());
        before - self.routes.len()
    }
    fn insert(&mut self, route: Route) -> bool {
        if self.routes.get(&route.destination) == Some(&route) {
            return false;
        }
        self.routes.insert(route.destination.clone(), route);
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn advert(entries: &[(&str, u32, &str)]) -> BTreeMap<String, RouteAdvert> {
        entries
            .iter()
            .map(|(dest, distance, next)| {
                (
                    dest.to_string(),
                    RouteAdvert {
                        distance: Distance::from(*distance),
                        next: next.to_string(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn local_route_is_always_present() {
        let table = RouteTable::new("a", AcceptPolicy::default());
        assert_eq!(table.find_next_hop("a"), Some("a"));
        assert_eq!(table.get("a").unwrap().distance, Distance::ZERO);
        assert!(table.advertisement_for("b").is_empty());
    }

    #[test]
    fn chain_converges() {
        // a - b - c - d, adverts flow d -> c -> b -> a
        let names = ["a", "b", "c", "d"];
        let mut tables: Vec<RouteTable> = names
            .iter()
            .map(|n| RouteTable::new(*n, AcceptPolicy::default()))
            .collect();
        for i in 0..3 {
            tables[i].add_direct(names[i + 1]);
            tables[i + 1].add_direct(names[i]);
        }
        let neighbors = |i: usize| -> Vec<usize> {
            [i.checked_sub(1), Some(i + 1).filter(|n| *n < 4)]
                .into_iter()
                .flatten()
                .collect()
        };
        for _ in 0..3 {
            for i in (0..4).rev() {
                for n in neighbors(i) {
                    let adv = tables[i].advertisement_for(names[n]);
                    let direct: Vec<usize> = neighbors(n);
                    tables[n].merge(names[i], &adv, |d| {
                        direct.iter().any(|x| names[*x] == d)
                    });
                }
            }
        }
        let route = tables[0].get("d").unwrap();
        assert_eq!(route.distance, Distance::hops(3));
        assert_eq!(route.next, "b");
        assert_eq!(tables[3].find_next_hop("a"), Some("c"));
    }

    #[test]
    fn same_source_may_worsen() {
        let mut table = RouteTable::new("a", AcceptPolicy::TrustSameSource);
        table.add_direct("b");
        table.merge("b", &advert(&[("d", 2, "c")]), |d| d == "b");
        assert_eq!(table.get("d").unwrap().distance, Distance::hops(3));
        let changed = table.merge("b", &advert(&[("d", 5, "c")]), |d| d == "b");
        assert_eq!(changed, vec!["d".to_string()]);
        assert_eq!(table.get("d").unwrap().distance, Distance::hops(6));
    }

    #[test]
    fn strictly_better_keeps_route_but_honors_withdrawal() {
        let mut table = RouteTable::new("a", AcceptPolicy::StrictlyBetter);
        table.add_direct("b");
        table.merge("b", &advert(&[("d", 2, "c")]), |d| d == "b");
        assert!(table
            .merge("b", &advert(&[("d", 5, "c")]), |d| d == "b")
            .is_empty());
        assert_eq!(table.get("d").unwrap().distance, Distance::hops(3));
        table.merge("b", &advert(&[("d", u32::MAX, "c")]), |d| d == "b");
        assert_eq!(table.find_next_hop("d"), None);
    }

    #[test]
    fn other_source_must_be_strictly_better() {
        let mut table = RouteTable::new("a", AcceptPolicy::default());
        table.add_direct("b");
        table.add_direct("e");
        let direct = |d: &str| d == "b" || d == "e";
        table.merge("b", &advert(&[("d", 2, "c")]), direct);
        assert!(table.merge("e", &advert(&[("d", 2, "f")]), direct).is_empty());
        table.merge("e", &advert(&[("d", 1, "d")]), direct);
        assert_eq!(table.find_next_hop("d"), Some("e"));
    }

    #[test]
    fn direct_neighbor_ignores_adverts() {
        let mut table = RouteTable::new("a", AcceptPolicy::default());
        table.add_direct("b");
        table.add_direct("c");
        let changed = table.merge("b", &advert(&[("c", 0, "c")]), |d| d == "b" || d == "c");
        assert!(changed.is_empty());
        assert_eq!(table.find_next_hop("c"), Some("c"));
    }

    #[test]
    fn route_through_us_is_poisoned() {
        let mut table = RouteTable::new("a", AcceptPolicy::default());
        table.add_direct("b");
        assert!(table
            .merge("b", &advert(&[("x", 1, "a")]), |d| d == "b")
            .is_empty());
        assert!(table.get("x").is_none());
    }

    #[test]
    fn withdraw_then_purge() {
        let mut table = RouteTable::new("a", AcceptPolicy::default());
        table.add_direct("b");
        table.merge("b", &advert(&[("c", 1, "c"), ("d", 2, "c")]), |d| d == "b");
        let mut changed = table.withdraw("b");
        changed.sort();
        assert_eq!(changed, vec!["b", "c", "d"]);
        assert_eq!(table.find_next_hop("c"), None);
        assert!(!table.advertisement_for("e")["d"].distance.is_reachable());
        assert_eq!(table.purge_unreachable(), 3);
        assert_eq!(table.routes().len(), 1);
    }
}
