//! btrouted: runs btroute nodes over a simulated radio neighbourhood.
//!
//! Usage: `btrouted <topology.toml>`

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use uuid::Uuid;

use btroute_core::config::BtrouteConfig;
use btroute_core::{PeerId, ServiceDescriptor};
use btroute_services::{LinkLayer, Node, SharedLink, SimAir, SimLink, Trigger};

mod topology;

use topology::{Operation, ServiceSpec, Topology};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = BtrouteConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = BtrouteConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        BtrouteConfig::default()
    });

    let path: PathBuf = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .context("usage: btrouted <topology.toml>")?;
    let topology = Topology::from_file(&path)?;
    tracing::info!(
        topology = %path.display(),
        peers = topology.peers.len(),
        links = topology.links.len(),
        "btrouted starting"
    );

    let air = SimAir::new();
    let mut links: HashMap<PeerId, SimLink> = HashMap::new();
    for device in &topology.peers {
        let link = air.add_device(device.address, &device.name);
        for service in &device.services {
            host_echo(&link, service)
                .await
                .with_context(|| format!("failed to host {} on {}", service.name, device.address))?;
        }
        links.insert(device.address, link);
    }
    for link in &topology.links {
        air.connect_peers(link.a, link.b);
    }

    let mut nodes: HashMap<PeerId, Node> = HashMap::new();
    for device in topology.peers.iter().filter(|p| p.relay) {
        let Some(link) = links.get(&device.address) else {
            continue;
        };
        let shared: SharedLink = Arc::new(link.clone());
        match Node::initialize(shared, config.clone()).await {
            Ok(node) => {
                nodes.insert(device.address, node);
            }
            Err(e) => tracing::warn!(peer = %device.address, error = %e, "node failed to start"),
        }
    }
    // Marked after start-up so nodes can still bind on them.
    for device in topology.peers.iter().filter(|p| p.unresponsive) {
        air.set_responsive(device.address, false);
    }

    let from = nodes
        .get(&topology.run.from)
        .with_context(|| format!("node {} is not running", topology.run.from))?;

    match topology.run.operation {
        Operation::Scan => {
            if let Some(found) = wait(from.start_local_scan()?).await {
                tracing::info!(direct = found.len(), "scan finished");
            }
        }
        Operation::Discover => {
            if let Some(summary) = wait(from.start_discovery()?).await {
                tracing::info!(forwarded = summary.forwarded, answered = summary.answered, "discovery finished");
            }
        }
        Operation::Search => {
            if let Some(summary) = wait(from.start_search()?).await {
                tracing::info!(
                    forwarded = summary.forwarded,
                    answered = summary.answered,
                    timed_out = summary.timed_out,
                    "search finished"
                );
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&from.tree())?);
    tracing::debug!(map = %serde_json::to_string(&from.current_map())?, "full map");

    let tunnel = match &topology.run.tunnel {
        Some(wanted) => {
            let handle = from.start_tunnel(wanted.peer, wanted.service).await?;
            tracing::info!(
                peer = %wanted.peer,
                service = wanted.service,
                port = handle.local_port(),
                "tunnel open"
            );
            Some(handle)
        }
        None => None,
    };

    if topology.run.linger {
        tracing::info!("serving until interrupted");
        tokio::signal::ctrl_c().await?;
    }

    if let Some(tunnel) = tunnel {
        tunnel.close();
        let served = tunnel.join().await?;
        tracing::info!(served, "tunnel closed");
    }
    for node in nodes.values() {
        node.shutdown().await;
    }
    tracing::info!("btrouted stopped");
    Ok(())
}

async fn wait<T>(trigger: Trigger<T>) -> Option<T> {
    if !trigger.is_started() {
        tracing::info!("operation already running");
    }
    trigger.finished().await
}

/// Advertise a service on a simulated device and answer it with an echo.
async fn host_echo(link: &SimLink, hosted: &ServiceSpec) -> Result<()> {
    let mut acceptor = link.listen(hosted.kind, 0).await?;
    let service = ServiceDescriptor {
        kind: hosted.kind,
        port: acceptor.local_port(),
        name: hosted.name.clone(),
        service_uuid: hosted.uuid.unwrap_or_else(Uuid::new_v4),
        service_classes: Default::default(),
    };
    link.advertise(&service).await?;
    tracing::debug!(peer = %link.local_address(), service = %service.name, port = service.port, "echo service hosted");

    tokio::spawn(async move {
        loop {
            match acceptor.accept().await {
                Ok(stream) => {
                    tokio::spawn(async move {
                        let (mut reader, mut writer) = tokio::io::split(stream);
                        if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
                            tracing::debug!(error = %e, "echo connection ended");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "echo accept failed");
                    return;
                }
            }
        }
    });
    Ok(())
}
