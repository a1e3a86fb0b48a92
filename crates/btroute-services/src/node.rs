//! Node facade: one running btroute instance on one link adapter.
//!
//! Front-ends (the daemon, tests) talk to this type only.

use std::collections::{BTreeSet, HashSet};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;

use btroute_core::config::BtrouteConfig;
use btroute_core::wire::CONTROL_SERVICE_UUID;
use btroute_core::{ControlEndpoint, PeerId, ProtocolKind, ServiceDescriptor};

use crate::control::{ControlHandle, ControlListener};
use crate::link::SharedLink;
use crate::network_map::{MapSnapshot, MapTree, NetworkMap, SharedMap};
use crate::scanner::LocalScanner;
use crate::search::SearchCoordinator;
use crate::session::{new_session_table, SessionSummary};
use crate::shutdown::ShutdownSignal;
use crate::single_flight::SingleFlight;
use crate::tunnel::{TunnelError, TunnelHandle, TunnelRelay};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("link adapter unavailable: {0}")]
    AdapterUnavailable(#[source] io::Error),

    #[error("node is shut down")]
    Unavailable,

    #[error("{peer} has no service at index {index}")]
    UnknownService { peer: PeerId, index: usize },

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

/// Outcome of asking for an operation that runs at most once at a time.
#[derive(Debug)]
pub enum Trigger<T> {
    Started(JoinHandle<T>),
    AlreadyRunning,
}

impl<T> Trigger<T> {
    pub fn is_started(&self) -> bool {
        matches!(self, Trigger::Started(_))
    }

    /// Wait for the started operation. `None` if it was already running.
    pub async fn finished(self) -> Option<T> {
        match self {
            Trigger::Started(handle) => handle.await.ok(),
            Trigger::AlreadyRunning => None,
        }
    }
}

pub struct Node {
    link: SharedLink,
    config: BtrouteConfig,
    map: SharedMap,
    scanner: Arc<LocalScanner>,
    coordinator: Arc<SearchCoordinator>,
    control: Mutex<Option<ControlHandle>>,
    control_advert: ServiceDescriptor,
    tunnels: Mutex<Vec<ShutdownSignal>>,
    shutdown: ShutdownSignal,
    scan_flight: SingleFlight,
    discovery_flight: SingleFlight,
    search_flight: SingleFlight,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Node {
    /// Bind and advertise the control service, then start serving it.
    pub async fn initialize(link: SharedLink, config: BtrouteConfig) -> Result<Self, NodeError> {
        let listener = ControlListener::bind(&link, config.control.port)
            .await
            .map_err(NodeError::AdapterUnavailable)?;
        let local = link.local_address();
        let control = ControlEndpoint::new(local, listener.local_port());

        let control_advert = ServiceDescriptor {
            kind: ProtocolKind::ConnectionOriented,
            port: control.port,
            name: config.control.service_name.clone(),
            service_uuid: CONTROL_SERVICE_UUID,
            service_classes: [CONTROL_SERVICE_UUID].into_iter().collect(),
        };
        link.advertise(&control_advert)
            .await
            .map_err(NodeError::AdapterUnavailable)?;

        let shutdown = ShutdownSignal::new();
        let map = NetworkMap::shared(local);
        let scanner = Arc::new(LocalScanner::new(
            link.clone(),
            map.clone(),
            config.scan.clone(),
        ));
        let coordinator = Arc::new(SearchCoordinator::new(
            link.clone(),
            map.clone(),
            scanner.clone(),
            new_session_table(),
            control,
            config.search.clone(),
            shutdown.clone(),
        ));
        let handle = listener.spawn(coordinator.clone());

        tracing::info!(peer = %local, control = %control, "node initialized");
        Ok(Self {
            link,
            config,
            map,
            scanner,
            coordinator,
            control: Mutex::new(Some(handle)),
            control_advert,
            tunnels: Mutex::new(Vec::new()),
            shutdown,
            scan_flight: SingleFlight::new(),
            discovery_flight: SingleFlight::new(),
            search_flight: SingleFlight::new(),
        })
    }

    pub fn local_address(&self) -> PeerId {
        self.map.local()
    }

    pub fn control_endpoint(&self) -> ControlEndpoint {
        self.coordinator.control_endpoint()
    }

    pub fn coordinator(&self) -> &Arc<SearchCoordinator> {
        &self.coordinator
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_closed()
    }

    fn ensure_running(&self) -> Result<(), NodeError> {
        if self.shutdown.is_closed() {
            return Err(NodeError::Unavailable);
        }
        Ok(())
    }

    /// Scan for direct neighbors.
    pub fn start_local_scan(&self) -> Result<Trigger<HashSet<PeerId>>, NodeError> {
        self.ensure_running()?;
        let Some(guard) = self.scan_flight.try_begin() else {
            return Ok(Trigger::AlreadyRunning);
        };
        let scanner = self.scanner.clone();
        Ok(Trigger::Started(tokio::spawn(async move {
            let _guard = guard;
            let found = scanner.scan().await;
            scanner.browse_services(found.iter().copied()).await;
            found
        })))
    }

    /// Ask direct relays what they see.
    pub fn start_discovery(&self) -> Result<Trigger<SessionSummary>, NodeError> {
        self.ensure_running()?;
        let Some(guard) = self.discovery_flight.try_begin() else {
            return Ok(Trigger::AlreadyRunning);
        };
        let coordinator = self.coordinator.clone();
        Ok(Trigger::Started(tokio::spawn(async move {
            let _guard = guard;
            coordinator.run_local_discovery().await
        })))
    }

    /// Map everything reachable through any number of relays.
    pub fn start_search(&self) -> Result<Trigger<SessionSummary>, NodeError> {
        self.ensure_running()?;
        let Some(guard) = self.search_flight.try_begin() else {
            return Ok(Trigger::AlreadyRunning);
        };
        let coordinator = self.coordinator.clone();
        Ok(Trigger::Started(tokio::spawn(async move {
            let _guard = guard;
            coordinator.run_local_search().await
        })))
    }

    pub fn current_map(&self) -> MapSnapshot {
        self.map.snapshot()
    }

    /// The map as seen from this node.
    pub fn tree(&self) -> MapTree {
        self.map.export_tree(self.local_address(), &BTreeSet::new())
    }

    /// Relay the `index`-th known service of `peer` through this node.
    pub async fn start_tunnel(&self, peer: PeerId, index: usize) -> Result<TunnelHandle, NodeError> {
        self.ensure_running()?;
        let service = self
            .map
            .services(&peer)
            .into_iter()
            .nth(index)
            .ok_or(NodeError::UnknownService { peer, index })?;

        let relay = TunnelRelay::open(self.link.clone(), peer, service, &self.config.tunnel).await?;
        let handle = relay.spawn();
        let mut tunnels = lock(&self.tunnels);
        // A relay only stops once closed; closed ones need no tracking.
        tunnels.retain(|tunnel| !tunnel.is_closed());
        tunnels.push(handle.closer());
        Ok(handle)
    }

    /// Stop serving: close the control listener and every tunnel, cancel
    /// running sessions, and withdraw the control advertisement.
    pub async fn shutdown(&self) {
        if self.shutdown.is_closed() {
            return;
        }
        self.shutdown.close();
        tracing::info!(peer = %self.local_address(), "node shutting down");

        for tunnel in lock(&self.tunnels).drain(..) {
            tunnel.close();
        }
        let control = lock(&self.control).take();
        if let Some(control) = control {
            control.close();
            if let Err(e) = control.join().await {
                tracing::warn!(error = %e, "control listener ended with error");
            }
        }
        if let Err(e) = self.link.withdraw(&self.control_advert).await {
            tracing::warn!(error = %e, "failed to withdraw control advertisement");
        }
    }
}
