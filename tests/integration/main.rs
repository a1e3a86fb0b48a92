//! btroute integration test harness.
//!
//! Every test builds its own simulated neighbourhood (`SimAir`) and runs
//! real nodes on it, so tests never share state and need no privileges.
//!
//!   cargo test --test integration

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use btroute_core::config::BtrouteConfig;
use btroute_core::{PeerId, ProtocolKind, ServiceDescriptor};
use btroute_services::{LinkLayer, Node, SimAir, SimLink};

mod discovery;
mod search;
mod tunnel;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Bound on any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(10);

pub fn peer(n: u8) -> PeerId {
    PeerId::new([0x00, 0x1a, 0x7d, 0x00, 0x00, n])
}

/// Short timeouts so a broken test fails fast instead of hanging.
pub fn test_config() -> BtrouteConfig {
    let mut config = BtrouteConfig::default();
    config.search.timeout_ms = 5_000;
    config.search.connect_timeout_ms = 1_000;
    config.scan.probe_timeout_ms = 500;
    config
}

/// A simulated neighbourhood with a node on every relay device.
pub struct Mesh {
    pub air: SimAir,
    pub nodes: BTreeMap<PeerId, Node>,
}

impl Mesh {
    /// `relays` run nodes, `plain` are bare devices, `links` are pairs in
    /// radio range.
    pub async fn build(relays: &[u8], plain: &[u8], links: &[(u8, u8)]) -> Result<Self> {
        let air = SimAir::new();
        for n in relays.iter().chain(plain) {
            air.add_device(peer(*n), &format!("dev-{n}"));
        }
        for (a, b) in links {
            air.connect_peers(peer(*a), peer(*b));
        }

        let mut nodes = BTreeMap::new();
        for n in relays {
            let node = Node::initialize(Arc::new(air.link_for(peer(*n))), test_config())
                .await
                .with_context(|| format!("node {n} failed to start"))?;
            nodes.insert(peer(*n), node);
        }
        Ok(Self { air, nodes })
    }

    pub fn node(&self, n: u8) -> &Node {
        &self.nodes[&peer(n)]
    }

    pub fn link(&self, n: u8) -> SimLink {
        self.air.link_for(peer(n))
    }

    pub async fn shutdown(&self) {
        for node in self.nodes.values() {
            node.shutdown().await;
        }
    }
}

/// Host an echo service on a device and advertise it.
pub async fn host_echo(link: &SimLink, name: &str) -> Result<ServiceDescriptor> {
    let mut acceptor = link.listen(ProtocolKind::ConnectionOriented, 0).await?;
    let service = ServiceDescriptor {
        kind: ProtocolKind::ConnectionOriented,
        port: acceptor.local_port(),
        name: name.to_string(),
        service_uuid: Uuid::new_v4(),
        service_classes: Default::default(),
    };
    link.advertise(&service).await?;
    tokio::spawn(async move {
        while let Ok(stream) = acceptor.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = tokio::io::split(stream);
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    Ok(service)
}

/// Write `payload` to `(to, port)` and read the same number of bytes back.
pub async fn exchange(from: &SimLink, to: PeerId, port: u16, payload: &[u8]) -> Result<Vec<u8>> {
    let stream = from
        .connect(to, port, ProtocolKind::ConnectionOriented)
        .await?;
    let (mut reader, mut writer) = tokio::io::split(stream);
    let outgoing = payload.to_vec();
    let write = tokio::spawn(async move {
        writer.write_all(&outgoing).await?;
        Ok::<_, std::io::Error>(writer)
    });
    let mut back = vec![0u8; payload.len()];
    tokio::time::timeout(WAIT, reader.read_exact(&mut back))
        .await
        .context("echo timed out")??;
    write.await??;
    Ok(back)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_mesh_nodes_advertise_control() {
    let mesh = Mesh::build(&[1, 2], &[], &[(1, 2)]).await.unwrap();
    let providers = mesh
        .link(1)
        .find_service_providers(btroute_core::wire::CONTROL_SERVICE_UUID)
        .await
        .unwrap();
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0].peer, peer(2));
    assert_eq!(providers[0].service.port, mesh.node(2).control_endpoint().port);
    mesh.shutdown().await;
}
