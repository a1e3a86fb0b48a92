//! btroute-services is the runtime side of a btroute node: network map,
//! local scanning, multi-hop search, the control listener, tunnel relays,
//! and the link-layer capability they all sit on.

pub mod control;
pub mod link;
pub mod network_map;
pub mod node;
pub mod scanner;
pub mod search;
pub mod session;
pub mod shutdown;
pub mod sim;
pub mod single_flight;
pub mod tunnel;

pub use control::{ControlHandle, ControlListener};
pub use link::{LinkAcceptor, LinkLayer, LinkStream, ServiceRecord, SharedLink};
pub use network_map::{MapEntry, MapSnapshot, MapTree, NetworkMap, SharedMap};
pub use node::{Node, NodeError, Trigger};
pub use scanner::LocalScanner;
pub use search::SearchCoordinator;
pub use session::{new_session_table, SessionKind, SessionSummary, SessionTable};
pub use shutdown::ShutdownSignal;
pub use sim::{SimAir, SimLink};
pub use single_flight::SingleFlight;
pub use tunnel::{RelayStats, TunnelError, TunnelHandle, TunnelRelay};
