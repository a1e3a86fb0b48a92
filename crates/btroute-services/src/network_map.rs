//! Network map: every peer this node has heard of, who each one reaches,
//! and the services each one offers.
//!
//! Mutation is merge-only. Entries are never removed and neighbor sets only
//! grow, so applying the same observation twice is a no-op.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use btroute_core::{EntryReport, PeerId, ServiceDescriptor};

/// One known peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MapEntry {
    pub display_name: String,
    /// Seen by this node's own scan.
    pub direct: bool,
    /// Runs the control service.
    pub relay_capable: bool,
    pub neighbors: BTreeSet<PeerId>,
}

/// Point-in-time copy of the whole map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MapSnapshot {
    pub local: PeerId,
    pub entries: BTreeMap<PeerId, MapEntry>,
    pub services: BTreeMap<PeerId, Vec<ServiceDescriptor>>,
}

/// Loop-free projection of the map rooted at one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MapTree {
    pub peer: PeerId,
    pub name: String,
    pub direct: bool,
    pub relay_capable: bool,
    pub children: Vec<MapTree>,
}

impl MapTree {
    /// Every peer in the tree, root first, depth first.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut out = vec![self.peer];
        for child in &self.children {
            out.extend(child.peers());
        }
        out
    }
}

#[derive(Debug, Default)]
struct MapState {
    entries: BTreeMap<PeerId, MapEntry>,
    services: BTreeMap<PeerId, Vec<ServiceDescriptor>>,
}

impl MapState {
    fn add_services(&mut self, peer: PeerId, descriptors: &[ServiceDescriptor]) -> usize {
        let list = self.services.entry(peer).or_default();
        let mut added = 0;
        for descriptor in descriptors {
            if list.iter().any(|known| known.key() == descriptor.key()) {
                continue;
            }
            list.push(descriptor.clone());
            added += 1;
        }
        if list.is_empty() {
            self.services.remove(&peer);
        }
        added
    }
}

/// Shared handle, passed to every component of a node.
pub type SharedMap = Arc<NetworkMap>;

#[derive(Debug)]
pub struct NetworkMap {
    local: PeerId,
    state: Mutex<MapState>,
}

impl NetworkMap {
    /// A map holding only the local node's own entry.
    pub fn new(local: PeerId) -> Self {
        let mut state = MapState::default();
        state.entries.insert(
            local,
            MapEntry {
                relay_capable: true,
                ..MapEntry::default()
            },
        );
        Self {
            local,
            state: Mutex::new(state),
        }
    }

    pub fn shared(local: PeerId) -> SharedMap {
        Arc::new(Self::new(local))
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    fn state(&self) -> MutexGuard<'_, MapState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the result of this node's own scan.
    ///
    /// Each peer becomes direct, its relay flag is set from
    /// `relay_capable`, and it joins the local node's neighbors.
    pub fn merge_local(&self, peers: &HashMap<PeerId, String>, relay_capable: &HashSet<PeerId>) {
        let mut state = self.state();
        for (peer, name) in peers {
            if *peer == self.local {
                continue;
            }
            let entry = state.entries.entry(*peer).or_default();
            entry.direct = true;
            entry.relay_capable = relay_capable.contains(peer);
            if !name.is_empty() {
                entry.display_name = name.clone();
            }
        }
        let own = state.entries.entry(self.local).or_default();
        own.relay_capable = true;
        own.neighbors
            .extend(peers.keys().copied().filter(|peer| *peer != self.local));
    }

    /// Merge one entry reported by `observer`.
    ///
    /// The report's `direct` flag is the observer's view; it only decides
    /// whether an `observer -> peer` edge is recorded.
    pub fn merge_remote(&self, observer: PeerId, report: &EntryReport) {
        let mut state = self.state();
        let neighbors = report
            .neighbors
            .iter()
            .copied()
            .filter(|n| *n != report.peer);

        if report.peer == self.local {
            // Only the topology is news; this node knows its own flags.
            let own = state.entries.entry(self.local).or_default();
            own.neighbors.extend(neighbors.filter(|n| *n != self.local));
        } else {
            let entry = state.entries.entry(report.peer).or_default();
            entry.neighbors.extend(neighbors);
            entry.relay_capable = report.relay_capable;
            if !report.name.is_empty() {
                entry.display_name = report.name.clone();
            }
            state.add_services(report.peer, &report.services);
        }

        // The observer reaches what it reports as direct in one hop.
        if observer != report.peer && report.direct {
            let observed = state.entries.entry(observer).or_default();
            observed.relay_capable = true;
            observed.neighbors.insert(report.peer);
        }
    }

    pub fn mark_relay_capable(&self, peers: impl IntoIterator<Item = PeerId>) {
        let mut state = self.state();
        for peer in peers {
            state.entries.entry(peer).or_default().relay_capable = true;
        }
    }

    /// Returns how many descriptors were new.
    pub fn add_services(&self, peer: PeerId, descriptors: &[ServiceDescriptor]) -> usize {
        self.state().add_services(peer, descriptors)
    }

    pub fn get(&self, peer: &PeerId) -> Option<MapEntry> {
        self.state().entries.get(peer).cloned()
    }

    /// Services of one peer in discovery order.
    pub fn services(&self, peer: &PeerId) -> Vec<ServiceDescriptor> {
        self.state().services.get(peer).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().entries.is_empty()
    }

    pub fn snapshot(&self) -> MapSnapshot {
        let state = self.state();
        MapSnapshot {
            local: self.local,
            entries: state.entries.clone(),
            services: state.services.clone(),
        }
    }

    /// Every entry with its services, in PeerId order.
    pub fn report_entries(&self) -> Vec<EntryReport> {
        let state = self.state();
        state
            .entries
            .iter()
            .map(|(peer, entry)| EntryReport {
                peer: *peer,
                name: entry.display_name.clone(),
                direct: entry.direct,
                relay_capable: entry.relay_capable,
                neighbors: entry.neighbors.clone(),
                services: state.services.get(peer).cloned().unwrap_or_default(),
            })
            .collect()
    }

    /// Project the map as a tree rooted at `from`.
    ///
    /// Only relay-capable entries (and the local node) are expanded. A peer
    /// appears at most once in the whole tree.
    pub fn export_tree(&self, from: PeerId, excluding: &BTreeSet<PeerId>) -> MapTree {
        let state = self.state();
        let mut seen = excluding.clone();
        seen.insert(from);
        self.subtree(&state, from, &mut seen)
    }

    fn subtree(&self, state: &MapState, peer: PeerId, seen: &mut BTreeSet<PeerId>) -> MapTree {
        let entry = state.entries.get(&peer);
        let mut node = MapTree {
            peer,
            name: entry.map(|e| e.display_name.clone()).unwrap_or_default(),
            direct: entry.map(|e| e.direct).unwrap_or(false),
            relay_capable: entry.map(|e| e.relay_capable).unwrap_or(false),
            children: Vec::new(),
        };

        let expands = peer == self.local || node.relay_capable;
        let Some(entry) = entry.filter(|_| expands) else {
            return node;
        };

        // Claim every child before descending so siblings are not re-found
        // deeper in the tree.
        let children: Vec<PeerId> = entry
            .neighbors
            .iter()
            .copied()
            .filter(|n| seen.insert(*n))
            .collect();
        node.children = children
            .into_iter()
            .map(|child| self.subtree(state, child, seen))
            .collect();
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btroute_core::ProtocolKind;
    use uuid::Uuid;

    fn peer(n: u8) -> PeerId {
        PeerId::new([0xc0, 0, 0, 0, 0, n])
    }

    fn report(p: PeerId, name: &str, relay: bool, neighbors: &[PeerId]) -> EntryReport {
        EntryReport {
            peer: p,
            name: name.to_string(),
            direct: true,
            relay_capable: relay,
            neighbors: neighbors.iter().copied().collect(),
            services: Vec::new(),
        }
    }

    fn service(port: u16, name: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            kind: ProtocolKind::ConnectionOriented,
            port,
            name: name.to_string(),
            service_uuid: Uuid::from_u128(port as u128),
            service_classes: BTreeSet::new(),
        }
    }

    #[test]
    fn merges_are_idempotent() {
        let map = NetworkMap::new(peer(0));
        let scanned: HashMap<_, _> = [(peer(1), "one".to_string())].into_iter().collect();
        let relays: HashSet<_> = [peer(1)].into_iter().collect();
        let mut remote = report(peer(2), "two", true, &[peer(3), peer(1)]);
        remote.services.push(service(3, "chat"));

        map.merge_local(&scanned, &relays);
        map.merge_remote(peer(1), &remote);
        let once = map.snapshot();

        map.merge_local(&scanned, &relays);
        map.merge_remote(peer(1), &remote);
        assert_eq!(map.snapshot(), once);
    }

    #[test]
    fn neighbors_union_across_observers() {
        let map = NetworkMap::new(peer(0));
        map.merge_remote(peer(1), &report(peer(5), "five", true, &[peer(6), peer(7)]));
        map.merge_remote(peer(2), &report(peer(5), "five", true, &[peer(7), peer(8)]));

        let entry = map.get(&peer(5)).unwrap();
        assert_eq!(
            entry.neighbors,
            [peer(6), peer(7), peer(8)].into_iter().collect()
        );
        assert!(map.get(&peer(1)).unwrap().neighbors.contains(&peer(5)));
        assert!(map.get(&peer(2)).unwrap().neighbors.contains(&peer(5)));
    }

    #[test]
    fn remote_reports_never_mark_direct() {
        let map = NetworkMap::new(peer(0));
        map.merge_remote(peer(1), &report(peer(4), "four", false, &[]));
        assert!(!map.get(&peer(4)).unwrap().direct);

        let scanned: HashMap<_, _> = [(peer(4), String::new())].into_iter().collect();
        map.merge_local(&scanned, &HashSet::new());
        map.merge_remote(peer(1), &report(peer(4), "", false, &[]));
        let entry = map.get(&peer(4)).unwrap();
        assert!(entry.direct);
        assert_eq!(entry.display_name, "four");
    }

    #[test]
    fn self_edges_are_dropped() {
        let map = NetworkMap::new(peer(0));
        map.merge_remote(peer(1), &report(peer(1), "one", true, &[peer(1), peer(0)]));
        let entry = map.get(&peer(1)).unwrap();
        assert!(!entry.neighbors.contains(&peer(1)));
        assert!(entry.neighbors.contains(&peer(0)));

        map.merge_remote(peer(1), &report(peer(0), "me", false, &[peer(0), peer(9)]));
        let own = map.get(&peer(0)).unwrap();
        assert!(own.relay_capable);
        assert!(!own.neighbors.contains(&peer(0)));
        assert!(own.neighbors.contains(&peer(9)));
        assert_eq!(own.display_name, "");
    }

    #[test]
    fn services_dedup_by_kind_and_port() {
        let map = NetworkMap::new(peer(0));
        assert_eq!(
            map.add_services(peer(1), &[service(3, "a"), service(4, "b")]),
            2
        );
        assert_eq!(map.add_services(peer(1), &[service(3, "renamed")]), 0);
        let list = map.services(&peer(1));
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "a");
        assert!(map.services(&peer(2)).is_empty());
    }

    #[test]
    fn tree_visits_each_peer_once_on_a_cycle() {
        let local = peer(0);
        let map = NetworkMap::new(local);
        let scanned: HashMap<_, _> = [(peer(1), String::new()), (peer(2), String::new())]
            .into_iter()
            .collect();
        let relays: HashSet<_> = [peer(1), peer(2)].into_iter().collect();
        map.merge_local(&scanned, &relays);
        map.merge_remote(peer(1), &report(peer(1), "", true, &[local, peer(2), peer(3)]));
        map.merge_remote(peer(2), &report(peer(2), "", true, &[local, peer(1), peer(3)]));
        map.merge_remote(peer(3), &report(peer(3), "", true, &[peer(1), peer(2), peer(4)]));

        let tree = map.export_tree(local, &BTreeSet::new());
        let mut peers = tree.peers();
        let total = peers.len();
        peers.sort();
        peers.dedup();
        assert_eq!(peers.len(), total);
        assert_eq!(peers, vec![peer(0), peer(1), peer(2), peer(3), peer(4)]);

        let roots: Vec<_> = tree.children.iter().map(|c| c.peer).collect();
        assert_eq!(roots, vec![peer(1), peer(2)]);
    }

    #[test]
    fn relayed_entries_stay_reachable_from_their_observer() {
        // 0 - 1 - 2 - 3 - 4, as 1 would report it to 0.
        let local = peer(0);
        let map = NetworkMap::new(local);
        let scanned: HashMap<_, _> = [(peer(1), String::new())].into_iter().collect();
        map.merge_local(&scanned, &[peer(1)].into_iter().collect());

        let mut own = report(peer(1), "", true, &[local, peer(2)]);
        own.direct = false;
        let mut three = report(peer(3), "", true, &[peer(2), peer(4)]);
        three.direct = false;
        let mut four = report(peer(4), "", false, &[peer(3)]);
        four.direct = false;
        for entry in [own, report(peer(2), "", true, &[peer(1), peer(3)]), three, four] {
            map.merge_remote(peer(1), &entry);
        }

        // No shortcut from the observer to what it only relays.
        let observer = map.get(&peer(1)).unwrap();
        assert!(!observer.neighbors.contains(&peer(3)));
        assert!(!observer.neighbors.contains(&peer(4)));

        // The reported neighbor lists still lead from 1 to 4.
        let mut reached: BTreeSet<PeerId> = [peer(1)].into_iter().collect();
        let mut frontier = vec![peer(1)];
        while let Some(at) = frontier.pop() {
            for next in map.get(&at).map(|e| e.neighbors).unwrap_or_default() {
                if reached.insert(next) {
                    frontier.push(next);
                }
            }
        }
        assert!(reached.contains(&peer(4)));

        let tree = map.export_tree(local, &BTreeSet::new());
        let mut chain = Vec::new();
        let mut at = &tree;
        while let Some(child) = at.children.first() {
            chain.push(child.peer);
            at = child;
        }
        assert_eq!(chain, vec![peer(1), peer(2), peer(3), peer(4)]);
    }

    #[test]
    fn tree_does_not_expand_plain_peers() {
        let map = NetworkMap::new(peer(0));
        let scanned: HashMap<_, _> = [(peer(1), String::new())].into_iter().collect();
        map.merge_local(&scanned, &HashSet::new());
        map.merge_remote(peer(7), &report(peer(1), "", false, &[peer(2)]));
        // The observer edge made 7 relay-capable but 1 still is not.
        let tree = map.export_tree(peer(0), &BTreeSet::new());
        assert_eq!(tree.children.len(), 1);
        assert!(tree.children[0].children.is_empty());

        let excluded: BTreeSet<_> = [peer(1)].into_iter().collect();
        assert!(map.export_tree(peer(0), &excluded).children.is_empty());
    }
}
