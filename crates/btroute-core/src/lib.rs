//! btroute-core: shared types, control wire format, and configuration.
//! All other btroute crates depend on this one.

pub mod config;
pub mod types;
pub mod wire;

pub use types::{
    ControlEndpoint, EntryReport, PeerId, ProtocolKind, ServiceDescriptor, SessionToken,
    VisitedSet,
};
pub use wire::{Packet, PacketReader, ReadError, Request, Response};
