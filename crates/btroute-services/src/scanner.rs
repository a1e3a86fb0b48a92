//! Single-hop visibility: which peers this node can reach right now.
//!
//! A device scan alone over-reports (inquiry caches keep departed devices),
//! so every candidate is probed with a short connection attempt before it
//! counts as direct.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::task::JoinSet;

use btroute_core::config::ScanConfig;
use btroute_core::wire::CONTROL_SERVICE_UUID;
use btroute_core::{ControlEndpoint, PeerId, ProtocolKind, VisitedSet};

use crate::link::SharedLink;
use crate::network_map::SharedMap;
use crate::single_flight::SingleFlight;

pub struct LocalScanner {
    link: SharedLink,
    map: SharedMap,
    config: ScanConfig,
    direct: Mutex<HashSet<PeerId>>,
    /// Control-service providers seen so far, with their control port.
    providers: Mutex<HashMap<PeerId, u16>>,
    flight: SingleFlight,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LocalScanner {
    pub fn new(link: SharedLink, map: SharedMap, config: ScanConfig) -> Self {
        Self {
            link,
            map,
            config,
            direct: Mutex::new(HashSet::new()),
            providers: Mutex::new(HashMap::new()),
            flight: SingleFlight::new(),
        }
    }

    /// Result of the most recent completed scan.
    pub fn direct_neighbors(&self) -> HashSet<PeerId> {
        lock(&self.direct).clone()
    }

    /// Control endpoints of every provider seen so far.
    pub fn known_providers(&self) -> Vec<ControlEndpoint> {
        lock(&self.providers)
            .iter()
            .map(|(peer, port)| ControlEndpoint::new(*peer, *port))
            .collect()
    }

    /// Scan, probe, and record survivors as direct.
    ///
    /// If a scan is already running this returns the last completed result
    /// immediately.
    pub async fn scan(&self) -> HashSet<PeerId> {
        let Some(_guard) = self.flight.try_begin() else {
            tracing::debug!("scan already running, returning last result");
            return self.direct_neighbors();
        };

        let candidates = match self.link.scan_nearby_devices().await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(error = %e, "device scan failed");
                return self.direct_neighbors();
            }
        };
        let local = self.link.local_address();
        tracing::debug!(candidates = candidates.len(), "device scan complete");

        let mut probes = JoinSet::new();
        for peer in candidates.into_iter().filter(|p| *p != local) {
            let link = self.link.clone();
            let config = self.config.clone();
            probes.spawn(async move {
                let reached = probe(&link, peer, &config).await;
                let name = if reached {
                    link.resolve_display_name(peer).await.unwrap_or_default()
                } else {
                    String::new()
                };
                (peer, reached, name)
            });
        }

        let mut survivors = HashMap::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((peer, true, name)) => {
                    survivors.insert(peer, name);
                }
                Ok((peer, false, _)) => {
                    tracing::debug!(peer = %peer, "probe failed, dropping candidate");
                }
                Err(e) => tracing::warn!(error = %e, "probe task failed"),
            }
        }

        let direct: HashSet<PeerId> = survivors.keys().copied().collect();
        {
            // Held across the merge so a concurrent provider lookup cannot
            // be overwritten by a stale relay flag.
            let providers = lock(&self.providers);
            let relays: HashSet<PeerId> = providers.keys().copied().collect();
            self.map.merge_local(&survivors, &relays);
        }
        *lock(&self.direct) = direct.clone();

        tracing::info!(direct = direct.len(), "local scan complete");
        direct
    }

    /// Nearby control-service providers not yet in `visited`.
    pub async fn find_control_providers(&self, visited: &VisitedSet) -> Vec<ControlEndpoint> {
        let records = match self.link.find_service_providers(CONTROL_SERVICE_UUID).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "control provider lookup failed");
                return Vec::new();
            }
        };
        let local = self.link.local_address();

        let mut found: HashMap<PeerId, u16> = HashMap::new();
        for record in records {
            if record.peer == local || record.service.kind != ProtocolKind::ConnectionOriented {
                continue;
            }
            found.entry(record.peer).or_insert(record.service.port);
        }

        {
            let mut providers = lock(&self.providers);
            providers.extend(found.iter().map(|(p, port)| (*p, *port)));
            self.map.mark_relay_capable(found.keys().copied());
        }

        let mut fresh: Vec<ControlEndpoint> = found
            .into_iter()
            .filter(|(peer, _)| !visited.contains(peer))
            .map(|(peer, port)| ControlEndpoint::new(peer, port))
            .collect();
        fresh.sort();
        tracing::debug!(providers = fresh.len(), "control providers found");
        fresh
    }

    /// Record the services each peer offers. Failures are skipped.
    pub async fn browse_services(&self, peers: impl IntoIterator<Item = PeerId>) {
        for peer in peers {
            match self.link.find_services(peer).await {
                Ok(services) => {
                    let added = self.map.add_services(peer, &services);
                    tracing::trace!(peer = %peer, added, "services browsed");
                }
                Err(e) => tracing::debug!(peer = %peer, error = %e, "service browse failed"),
            }
        }
    }
}

async fn probe(link: &SharedLink, peer: PeerId, config: &ScanConfig) -> bool {
    let attempt = link.connect(peer, config.probe_port, config.probe_kind);
    match tokio::time::timeout(config.probe_timeout(), attempt).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            tracing::trace!(peer = %peer, error = %e, "probe refused");
            false
        }
        Err(_) => {
            tracing::trace!(peer = %peer, "probe timed out");
            false
        }
    }
}
