//! Simulated neighbourhood the daemon runs in: devices, who sees whom, and
//! what to do once everything is up.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use uuid::Uuid;

use btroute_core::{PeerId, ProtocolKind};

#[derive(Debug, Clone, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub peers: Vec<PeerSpec>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
    pub run: RunSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerSpec {
    pub address: PeerId,
    #[serde(default)]
    pub name: String,
    /// Runs a btroute node. Plain devices only answer scans.
    #[serde(default = "default_true")]
    pub relay: bool,
    /// Shows up in scans but refuses every connection.
    #[serde(default)]
    pub unresponsive: bool,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

/// An echo service hosted on a simulated device.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: ProtocolKind,
    pub uuid: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkSpec {
    pub a: PeerId,
    pub b: PeerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Scan,
    Discover,
    Search,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunSpec {
    pub from: PeerId,
    pub operation: Operation,
    pub tunnel: Option<TunnelSpec>,
    /// Keep every node up until interrupted.
    #[serde(default)]
    pub linger: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSpec {
    pub peer: PeerId,
    #[serde(default)]
    pub service: usize,
}

fn default_true() -> bool {
    true
}

fn default_kind() -> ProtocolKind {
    ProtocolKind::ConnectionOriented
}

impl Topology {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read topology {}", path.display()))?;
        let topology: Topology = toml::from_str(&text)
            .with_context(|| format!("failed to parse topology {}", path.display()))?;
        topology.validate()?;
        Ok(topology)
    }

    /// Every address a link or the run section names must be declared.
    pub fn validate(&self) -> Result<()> {
        let known = |peer: &PeerId| self.peers.iter().any(|p| p.address == *peer);
        for link in &self.links {
            if !known(&link.a) || !known(&link.b) {
                anyhow::bail!("link {} - {} names an undeclared peer", link.a, link.b);
            }
        }
        let from = self
            .peers
            .iter()
            .find(|p| p.address == self.run.from)
            .with_context(|| format!("run.from {} is not a declared peer", self.run.from))?;
        if !from.relay {
            anyhow::bail!("run.from {} does not run a node", from.address);
        }
        Ok(())
    }
}
