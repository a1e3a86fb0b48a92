//! In-process simulated radio.
//!
//! `SimAir` holds every simulated device, who can see whom, and what each
//! device advertises. `SimLink` is one device's view of that air and
//! implements `LinkLayer` with loopback TCP underneath, so streams behave
//! like real sockets (backlog, EOF, half-close).
//!
//! Visibility is symmetric. A device marked unresponsive still shows up in
//! scans (stale inquiry cache) but refuses every connection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

use btroute_core::{PeerId, ProtocolKind, ServiceDescriptor};

use crate::link::{LinkAcceptor, LinkLayer, LinkStream, ServiceRecord};

/// Service discovery channel. Always open on a responsive device.
pub const SDP_PORT: u16 = 1;

/// First dynamically allocated segment-oriented port.
const DYNAMIC_SEGMENT_PORT: u16 = 0x1001;

/// Highest connection-oriented channel number.
const MAX_CHANNEL: u16 = 30;

#[derive(Debug, Default)]
struct Device {
    name: String,
    responsive: bool,
    listeners: HashMap<(ProtocolKind, u16), SocketAddr>,
    adverts: Vec<ServiceDescriptor>,
}

#[derive(Debug, Default)]
struct AirState {
    devices: BTreeMap<PeerId, Device>,
    /// Unordered pairs, stored with the smaller PeerId first.
    links: HashSet<(PeerId, PeerId)>,
}

impl AirState {
    fn visible(&self, a: PeerId, b: PeerId) -> bool {
        a == b || self.links.contains(&ordered(a, b))
    }

    fn reachable(&self, from: PeerId, to: PeerId) -> bool {
        self.visible(from, to)
            && self
                .devices
                .get(&to)
                .map(|d| d.responsive)
                .unwrap_or(false)
    }
}

fn ordered(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn refused(peer: PeerId) -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionRefused,
        format!("{peer} is out of range or not responding"),
    )
}

/// The shared radio environment.
#[derive(Debug, Clone, Default)]
pub struct SimAir {
    state: Arc<Mutex<AirState>>,
}

impl SimAir {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, AirState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Power on a device and return its link.
    pub fn add_device(&self, peer: PeerId, name: &str) -> SimLink {
        self.state().devices.insert(
            peer,
            Device {
                name: name.to_string(),
                responsive: true,
                ..Device::default()
            },
        );
        self.link_for(peer)
    }

    /// A link handle for a device that already exists.
    pub fn link_for(&self, peer: PeerId) -> SimLink {
        SimLink {
            local: peer,
            air: self.clone(),
        }
    }

    /// Put two devices in range of each other.
    pub fn connect_peers(&self, a: PeerId, b: PeerId) {
        if a != b {
            self.state().links.insert(ordered(a, b));
        }
    }

    pub fn disconnect_peers(&self, a: PeerId, b: PeerId) {
        self.state().links.remove(&ordered(a, b));
    }

    /// An unresponsive device stays in scan results but refuses connections.
    pub fn set_responsive(&self, peer: PeerId, responsive: bool) {
        if let Some(device) = self.state().devices.get_mut(&peer) {
            device.responsive = responsive;
        }
    }

    pub fn devices(&self) -> Vec<PeerId> {
        self.state().devices.keys().copied().collect()
    }
}

/// One device's view of the air.
#[derive(Debug, Clone)]
pub struct SimLink {
    local: PeerId,
    air: SimAir,
}

impl SimLink {
    pub fn air(&self) -> &SimAir {
        &self.air
    }
}

#[async_trait]
impl LinkLayer for SimLink {
    fn local_address(&self) -> PeerId {
        self.local
    }

    async fn scan_nearby_devices(&self) -> io::Result<HashSet<PeerId>> {
        let state = self.air.state();
        Ok(state
            .devices
            .keys()
            .copied()
            .filter(|peer| *peer != self.local && state.visible(self.local, *peer))
            .collect())
    }

    async fn find_service_providers(&self, service_uuid: Uuid) -> io::Result<Vec<ServiceRecord>> {
        let state = self.air.state();
        let mut records = Vec::new();
        for (peer, device) in &state.devices {
            if *peer == self.local || !state.reachable(self.local, *peer) {
                continue;
            }
            for service in &device.adverts {
                if service.service_uuid == service_uuid
                    || service.service_classes.contains(&service_uuid)
                {
                    records.push(ServiceRecord {
                        peer: *peer,
                        service: service.clone(),
                    });
                }
            }
        }
        Ok(records)
    }

    async fn find_services(&self, peer: PeerId) -> io::Result<Vec<ServiceDescriptor>> {
        let state = self.air.state();
        if !state.reachable(self.local, peer) {
            return Err(refused(peer));
        }
        Ok(state
            .devices
            .get(&peer)
            .map(|d| d.adverts.clone())
            .unwrap_or_default())
    }

    async fn connect(&self, peer: PeerId, port: u16, kind: ProtocolKind) -> io::Result<LinkStream> {
        let addr = {
            let state = self.air.state();
            if !state.reachable(self.local, peer) {
                return Err(refused(peer));
            }
            if kind == ProtocolKind::SegmentOriented && port == SDP_PORT {
                // The discovery channel answers and hangs up.
                let (near, _far) = tokio::io::duplex(64);
                return Ok(Box::new(near));
            }
            state
                .devices
                .get(&peer)
                .and_then(|d| d.listeners.get(&(kind, port)).copied())
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        format!("nothing listening on {peer} {kind} port {port}"),
                    )
                })?
        };
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        tracing::trace!(%peer, port, %kind, "sim link connected");
        Ok(Box::new(stream))
    }

    async fn listen(&self, kind: ProtocolKind, port: u16) -> io::Result<Box<dyn LinkAcceptor>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let port = {
            let mut state = self.air.state();
            let device = state
                .devices
                .get_mut(&self.local)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "adapter not present"))?;
            let port = if port == 0 {
                allocate_port(device, kind)?
            } else {
                port
            };
            if port == SDP_PORT && kind == ProtocolKind::SegmentOriented
                || device.listeners.contains_key(&(kind, port))
            {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{kind} port {port} already bound"),
                ));
            }
            device.listeners.insert((kind, port), addr);
            port
        };

        Ok(Box::new(SimAcceptor {
            listener,
            local: self.local,
            kind,
            port,
            air: self.air.clone(),
        }))
    }

    async fn advertise(&self, service: &ServiceDescriptor) -> io::Result<()> {
        let mut state = self.air.state();
        let device = state
            .devices
            .get_mut(&self.local)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "adapter not present"))?;
        device.adverts.retain(|s| s.key() != service.key());
        device.adverts.push(service.clone());
        Ok(())
    }

    async fn withdraw(&self, service: &ServiceDescriptor) -> io::Result<()> {
        if let Some(device) = self.air.state().devices.get_mut(&self.local) {
            device.adverts.retain(|s| s.key() != service.key());
        }
        Ok(())
    }

    async fn resolve_display_name(&self, peer: PeerId) -> Option<String> {
        let state = self.air.state();
        if !state.reachable(self.local, peer) {
            return None;
        }
        state
            .devices
            .get(&peer)
            .map(|d| d.name.clone())
            .filter(|name| !name.is_empty())
    }
}

fn allocate_port(device: &Device, kind: ProtocolKind) -> io::Result<u16> {
    let taken = |port: u16| device.listeners.contains_key(&(kind, port));
    let found = match kind {
        ProtocolKind::ConnectionOriented => (1..=MAX_CHANNEL).find(|p| !taken(*p)),
        ProtocolKind::SegmentOriented => (DYNAMIC_SEGMENT_PORT..=u16::MAX)
            .step_by(2)
            .find(|p| !taken(*p)),
    };
    found.ok_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "no free port"))
}

struct SimAcceptor {
    listener: TcpListener,
    local: PeerId,
    kind: ProtocolKind,
    port: u16,
    air: SimAir,
}

#[async_trait]
impl LinkAcceptor for SimAcceptor {
    async fn accept(&mut self) -> io::Result<LinkStream> {
        let (stream, _) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}

impl Drop for SimAcceptor {
    fn drop(&mut self) {
        if let Some(device) = self.air.state().devices.get_mut(&self.local) {
            device.listeners.remove(&(self.kind, self.port));
        }
    }
}
