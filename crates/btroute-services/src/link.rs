//! Link-layer capabilities consumed by every runtime component.
//!
//! Device scan, service discovery, advertisement, and connection setup are
//! provided by the platform. Everything above this trait is transport
//! agnostic: the control protocol and tunnel relay only ever see
//! `LinkStream`s.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use btroute_core::{PeerId, ProtocolKind, ServiceDescriptor};

/// Any bidirectional byte stream a link can hand out.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// An established link-layer connection.
pub type LinkStream = Box<dyn AsyncStream>;

/// How every component holds the platform link.
pub type SharedLink = Arc<dyn LinkLayer>;

/// A service found by service discovery, with the peer that offers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub peer: PeerId,
    pub service: ServiceDescriptor,
}

/// A bound local endpoint waiting for inbound connections.
///
/// Dropping the acceptor releases the port.
#[async_trait]
pub trait LinkAcceptor: Send {
    /// Wait for the next inbound connection. Connections that arrive while
    /// nobody is accepting queue in the transport backlog.
    async fn accept(&mut self) -> io::Result<LinkStream>;

    fn local_port(&self) -> u16;
}

/// Platform link layer.
#[async_trait]
pub trait LinkLayer: Send + Sync + 'static {
    /// This adapter's own hardware address.
    fn local_address(&self) -> PeerId;

    /// Devices currently visible to a scan. May include stale results.
    async fn scan_nearby_devices(&self) -> io::Result<HashSet<PeerId>>;

    /// Nearby peers advertising a service with this UUID (as its own UUID or
    /// one of its classes).
    async fn find_service_providers(&self, service_uuid: Uuid) -> io::Result<Vec<ServiceRecord>>;

    /// Every service one peer advertises.
    async fn find_services(&self, peer: PeerId) -> io::Result<Vec<ServiceDescriptor>>;

    async fn connect(&self, peer: PeerId, port: u16, kind: ProtocolKind) -> io::Result<LinkStream>;

    /// Bind a local endpoint. Port 0 asks the link to allocate one.
    async fn listen(&self, kind: ProtocolKind, port: u16) -> io::Result<Box<dyn LinkAcceptor>>;

    /// Publish a service record for this adapter.
    async fn advertise(&self, service: &ServiceDescriptor) -> io::Result<()>;

    /// Remove a record previously published with `advertise`.
    async fn withdraw(&self, service: &ServiceDescriptor) -> io::Result<()>;

    /// Best effort; `None` when the name cannot be resolved.
    async fn resolve_display_name(&self, peer: PeerId) -> Option<String>;
}
