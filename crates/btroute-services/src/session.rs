//! Search session bookkeeping shared between the task running a session
//! and the control handlers delivering its responses.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

use btroute_core::{PeerId, SessionToken, VisitedSet};

/// Peers a session still waits on. Response handling removes the responder;
/// the session task waits for the set to drain.
pub type PendingSet = watch::Sender<HashSet<PeerId>>;

/// In-flight sessions by the token their forwarded requests carry.
pub type SessionTable = Arc<DashMap<SessionToken, PendingSet>>;

/// Create a new empty session table.
pub fn new_session_table() -> SessionTable {
    Arc::new(DashMap::new())
}

/// How far a session reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// One level: neighbors answer with what they see themselves.
    Discovery,
    /// Recursive: every reachable relay is asked in turn.
    Search,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    AwaitingResponses,
    Reporting,
    Done,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Scanning => "scanning",
            SessionState::AwaitingResponses => "awaiting-responses",
            SessionState::Reporting => "reporting",
            SessionState::Done => "done",
        };
        f.write_str(s)
    }
}

/// What a finished session did.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub token: SessionToken,
    pub kind: SessionKind,
    pub visited: VisitedSet,
    /// Neighbors a request was successfully sent to.
    pub forwarded: usize,
    /// Of those, how many answered before the session ended.
    pub answered: usize,
    pub timed_out: bool,
    pub cancelled: bool,
    /// Entries sent upward; `None` when there was no origin to answer or
    /// the answer could not be delivered.
    pub reported: Option<usize>,
}
