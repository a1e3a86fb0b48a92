//! Shared identity and descriptor types.
//!
//! Everything here is plain data: no I/O, no locking. The control wire
//! format in `wire.rs` and the runtime components in btroute-services both
//! speak these types.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Peer identity ─────────────────────────────────────────────────────────────

/// A peer's stable identity: its 48-bit wireless hardware address.
///
/// Displayed as `AA:BB:CC:DD:EE:FF`. Parsing accepts either case.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId([u8; 6]);

impl PeerId {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

impl FromStr for PeerId {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| AddressError::InvalidPeer(s.to_string()))?;
            if part.len() != 2 {
                return Err(AddressError::InvalidPeer(s.to_string()));
            }
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| AddressError::InvalidPeer(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(AddressError::InvalidPeer(s.to_string()));
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for PeerId {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeerId> for String {
    fn from(peer: PeerId) -> String {
        peer.to_string()
    }
}

/// Where a peer's control service listens. Wire form `peer/port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ControlEndpoint {
    pub peer: PeerId,
    pub port: u16,
}

impl ControlEndpoint {
    pub fn new(peer: PeerId, port: u16) -> Self {
        Self { peer, port }
    }
}

impl fmt::Display for ControlEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.peer, self.port)
    }
}

impl FromStr for ControlEndpoint {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (peer, port) = s
            .split_once('/')
            .ok_or_else(|| AddressError::InvalidEndpoint(s.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| AddressError::InvalidPort(port.to_string()))?;
        Ok(Self::new(peer.parse()?, port))
    }
}

// ── Services ──────────────────────────────────────────────────────────────────

/// Transport flavour of a service or connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProtocolKind {
    /// Stream-style channel (RFCOMM-like).
    #[serde(rename = "rfcomm")]
    ConnectionOriented,
    /// Sequenced-packet channel (L2CAP-like).
    #[serde(rename = "l2cap")]
    SegmentOriented,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::ConnectionOriented => "rfcomm",
            ProtocolKind::SegmentOriented => "l2cap",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolKind {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rfcomm" => Ok(ProtocolKind::ConnectionOriented),
            "l2cap" => Ok(ProtocolKind::SegmentOriented),
            other => Err(AddressError::UnknownProtocol(other.to_string())),
        }
    }
}

/// A service offered by a peer, as returned by service discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub kind: ProtocolKind,
    pub port: u16,
    pub name: String,
    pub service_uuid: Uuid,
    #[serde(default)]
    pub service_classes: BTreeSet<Uuid>,
}

impl ServiceDescriptor {
    /// Two descriptors with the same key on the same peer are the same service.
    pub fn key(&self) -> (ProtocolKind, u16) {
        (self.kind, self.port)
    }
}

// ── Map entries on the wire ───────────────────────────────────────────────────

/// One peer's map entry together with its services, as carried in a
/// `response` packet.
///
/// `direct` is the sender's point of view; receivers never copy it into their
/// own map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryReport {
    pub peer: PeerId,
    pub name: String,
    pub direct: bool,
    pub relay_capable: bool,
    pub neighbors: BTreeSet<PeerId>,
    pub services: Vec<ServiceDescriptor>,
}

// ── Search bookkeeping ────────────────────────────────────────────────────────

/// Correlates a forwarded request with the response that answers it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionToken(u64);

impl SessionToken {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0.to_be_bytes()))
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({self})")
    }
}

impl FromStr for SessionToken {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| AddressError::InvalidToken(s.to_string()))?;
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| AddressError::InvalidToken(s.to_string()))?;
        Ok(Self(u64::from_be_bytes(raw)))
    }
}

/// Anti-loop guard threaded through every hop of a search.
///
/// Keyed on PeerId; the control port rides along so the wire form can carry
/// full endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisitedSet {
    peers: BTreeMap<PeerId, u16>,
}

impl VisitedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the peer was already visited.
    pub fn insert(&mut self, endpoint: ControlEndpoint) -> bool {
        if self.peers.contains_key(&endpoint.peer) {
            return false;
        }
        self.peers.insert(endpoint.peer, endpoint.port);
        true
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.keys()
    }

    pub fn endpoints(&self) -> impl Iterator<Item = ControlEndpoint> + '_ {
        self.peers
            .iter()
            .map(|(peer, port)| ControlEndpoint::new(*peer, *port))
    }
}

impl FromIterator<ControlEndpoint> for VisitedSet {
    fn from_iter<I: IntoIterator<Item = ControlEndpoint>>(iter: I) -> Self {
        let mut set = VisitedSet::new();
        for endpoint in iter {
            set.insert(endpoint);
        }
        set
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("invalid peer address: {0:?}")]
    InvalidPeer(String),

    #[error("invalid control endpoint: {0:?}")]
    InvalidEndpoint(String),

    #[error("invalid port: {0:?}")]
    InvalidPort(String),

    #[error("unknown protocol kind: {0:?}")]
    UnknownProtocol(String),

    #[error("invalid session token: {0:?}")]
    InvalidToken(String),
}
