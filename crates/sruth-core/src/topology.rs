use std::collections::{BTreeMap, BTreeSet, HashMap};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::address::ServerAddress;
use crate::filter::Filter;

/// A bidirectional map {Filter ↔ Set<ServerAddress>}: the overlay's
/// routing hint, as returned by the tracker and cached by `TrackerProxy`.
/// Invariant (maintained by this type, not merely documented): every
/// server on one side appears on the other, except that removing a server
/// also garbage-collects any filter left with no servers.
#[derive(Clone, Default, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Topology {
    filter_to_servers: BTreeMap<Filter, BTreeSet<ServerAddress>>,
    server_to_filters: BTreeMap<ServerAddress, BTreeSet<Filter>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, server: ServerAddress, filter: Filter) {
        self.filter_to_servers
            .entry(filter.clone())
            .or_default()
            .insert(server.clone());
        self.server_to_filters.entry(server).or_default().insert(filter);
    }

    /// Removes a server entirely (tracker unregistration or connection
    /// error), garbage-collecting any filter this leaves with no servers.
    pub fn remove_server(&mut self, server: &ServerAddress) {
        let Some(filters) = self.server_to_filters.remove(server) else {
            return;
        };
        for filter in filters {
            if let Some(servers) = self.filter_to_servers.get_mut(&filter) {
                servers.remove(server);
                if servers.is_empty() {
                    self.filter_to_servers.remove(&filter);
                }
            }
        }
    }

    pub fn servers(&self) -> impl Iterator<Item = &ServerAddress> {
        self.server_to_filters.keys()
    }

    pub fn filters_for(&self, server: &ServerAddress) -> Option<&BTreeSet<Filter>> {
        self.server_to_filters.get(server)
    }

    pub fn servers_for(&self, filter: &Filter) -> Option<&BTreeSet<ServerAddress>> {
        self.filter_to_servers.get(filter)
    }

    pub fn is_empty(&self) -> bool {
        self.server_to_filters.is_empty()
    }

    /// The sub-topology whose every server can satisfy at least `f`.
    pub fn subset(&self, f: &Filter) -> Topology {
        let mut out = Topology::new();
        for (g, servers) in &self.filter_to_servers {
            if g.includes(f) {
                for server in servers {
                    out.register(server.clone(), g.clone());
                }
            }
        }
        out
    }

    /// Among servers with some filter including `f`, the one(s) whose
    /// narrowest such filter is smallest in [`Filter`]'s order (see
    /// §4.3); ties broken uniformly at random.
    pub fn get_best_server(&self, f: &Filter) -> Option<ServerAddress> {
        // filter_to_servers iterates ascending by Filter::cmp, i.e.
        // narrowest (most specific) filters first, so the first includer
        // seen for a given server is its narrowest one.
        let mut narrowest: HashMap<&ServerAddress, &Filter> = HashMap::new();
        for (g, servers) in &self.filter_to_servers {
            if !g.includes(f) {
                continue;
            }
            for server in servers {
                narrowest.entry(server).or_insert(g);
            }
        }
        let min_filter = narrowest.values().copied().min()?;
        let candidates: Vec<&ServerAddress> = narrowest
            .iter()
            .filter(|(_, g)| **g == min_filter)
            .map(|(server, _)| *server)
            .collect();
        let idx = rand::rng().random_range(0..candidates.len());
        Some(candidates[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> ServerAddress {
        ServerAddress::new(format!("10.0.0.{n}"), 9000)
    }

    #[test]
    fn best_server_is_deterministic_with_one_candidate() {
        let mut t = Topology::new();
        t.register(addr(1), Filter::parse("a"));
        t.register(addr(2), Filter::parse("a/b"));
        let best = t.get_best_server(&Filter::parse("a/b/c")).unwrap();
        assert_eq!(best, addr(2));
    }

    #[test]
    fn best_server_ties_break_among_narrowest_candidates() {
        let mut t = Topology::new();
        t.register(addr(1), Filter::parse("a"));
        t.register(addr(2), Filter::parse("a/b"));
        t.register(addr(3), Filter::parse("a/b"));
        for _ in 0..20 {
            let best = t.get_best_server(&Filter::parse("a/b/c")).unwrap();
            assert!(best == addr(2) || best == addr(3));
        }
    }

    #[test]
    fn best_server_result_lies_in_subset() {
        let mut t = Topology::new();
        t.register(addr(1), Filter::parse("a"));
        t.register(addr(2), Filter::parse("a/b"));
        let f = Filter::parse("a/b/c");
        let best = t.get_best_server(&f).unwrap();
        let sub = t.subset(&f);
        assert!(sub.servers().any(|s| s == &best));
    }

    #[test]
    fn no_includer_means_no_server() {
        let mut t = Topology::new();
        t.register(addr(1), Filter::parse("x"));
        assert!(t.get_best_server(&Filter::parse("y")).is_none());
    }

    #[test]
    fn copy_is_independent_of_mutation() {
        let mut t = Topology::new();
        t.register(addr(1), Filter::parse("a"));
        let snapshot = t.clone();
        t.remove_server(&addr(1));
        assert!(t.is_empty());
        assert!(!snapshot.is_empty());
    }

    #[test]
    fn remove_server_gcs_empty_filters() {
        let mut t = Topology::new();
        t.register(addr(1), Filter::parse("a"));
        t.remove_server(&addr(1));
        assert!(t.servers_for(&Filter::parse("a")).is_none());
        assert!(t.is_empty());
    }
}
