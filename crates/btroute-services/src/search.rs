//! Loop-safe multi-hop discovery and search.
//!
//! Every session scans locally, forwards a request to each relay-capable
//! neighbor not yet visited, waits for their answers, and (when it was
//! started by a remote request) sends exactly one response back to the
//! origin. The visited set travels with each request, so no peer is asked
//! twice within one traversal.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinSet;

use btroute_core::config::SearchConfig;
use btroute_core::wire::{encode_entry, MAX_FRAME_LEN};
use btroute_core::{
    ControlEndpoint, EntryReport, Packet, PeerId, ProtocolKind, Request, Response, SessionToken,
    VisitedSet,
};

use crate::link::SharedLink;
use crate::network_map::SharedMap;
use crate::scanner::LocalScanner;
use crate::session::{SessionKind, SessionState, SessionSummary, SessionTable};
use crate::shutdown::{closed, ShutdownSignal};

/// Who a remotely started session answers to.
#[derive(Debug, Clone, Copy)]
struct Origin {
    /// Token of the request being answered.
    token: SessionToken,
    endpoint: ControlEndpoint,
}

enum WaitOutcome {
    Drained,
    TimedOut,
    Cancelled,
}

pub struct SearchCoordinator {
    link: SharedLink,
    map: SharedMap,
    scanner: Arc<LocalScanner>,
    sessions: SessionTable,
    /// Per origin: the encoded form of every entry already reported to it.
    sent: DashMap<PeerId, HashMap<PeerId, String>>,
    control: ControlEndpoint,
    config: SearchConfig,
    shutdown: ShutdownSignal,
}

impl SearchCoordinator {
    pub fn new(
        link: SharedLink,
        map: SharedMap,
        scanner: Arc<LocalScanner>,
        sessions: SessionTable,
        control: ControlEndpoint,
        config: SearchConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            link,
            map,
            scanner,
            sessions,
            sent: DashMap::new(),
            control,
            config,
            shutdown,
        }
    }

    pub fn control_endpoint(&self) -> ControlEndpoint {
        self.control
    }

    pub fn map(&self) -> &SharedMap {
        &self.map
    }

    /// Multi-hop search started on this node.
    pub async fn run_local_search(&self) -> SessionSummary {
        self.run_session(SessionKind::Search, None, VisitedSet::new())
            .await
    }

    /// One-level discovery started on this node: neighbors are asked, but
    /// do not ask further.
    pub async fn run_local_discovery(&self) -> SessionSummary {
        self.run_session(SessionKind::Discovery, None, VisitedSet::new())
            .await
    }

    pub async fn handle_search(&self, request: Request) -> SessionSummary {
        let origin = Origin {
            token: request.token,
            endpoint: request.reply_to,
        };
        self.run_session(SessionKind::Search, Some(origin), request.visited)
            .await
    }

    pub async fn handle_discover(&self, request: Request) -> SessionSummary {
        let origin = Origin {
            token: request.token,
            endpoint: request.reply_to,
        };
        self.run_session(SessionKind::Discovery, Some(origin), request.visited)
            .await
    }

    /// Merge a neighbor's answer and tick it off its session.
    ///
    /// Answers for sessions that already ended are still merged.
    pub fn handle_response(&self, response: Response) {
        let responder = response.responder.peer;
        for entry in &response.entries {
            self.map.merge_remote(responder, entry);
        }
        self.map.mark_relay_capable([responder]);

        match self.sessions.get(&response.token) {
            Some(pending) => {
                if pending.send_if_modified(|p| p.remove(&responder)) {
                    tracing::debug!(
                        token = %response.token,
                        responder = %responder,
                        entries = response.entries.len(),
                        "response received"
                    );
                } else {
                    tracing::debug!(
                        token = %response.token,
                        responder = %responder,
                        "duplicate or unexpected responder, ignored"
                    );
                }
            }
            None => tracing::debug!(
                token = %response.token,
                responder = %responder,
                "response for finished session merged"
            ),
        }
    }

    /// Answers still pending for a running session.
    pub fn outstanding(&self, token: &SessionToken) -> Option<usize> {
        self.sessions.get(token).map(|p| p.borrow().len())
    }

    pub fn active_sessions(&self) -> Vec<SessionToken> {
        self.sessions.iter().map(|e| *e.key()).collect()
    }

    // ── Session lifecycle ─────────────────────────────────────────────────────

    async fn run_session(
        &self,
        kind: SessionKind,
        origin: Option<Origin>,
        mut visited: VisitedSet,
    ) -> SessionSummary {
        let token = SessionToken::random();
        let mut state = SessionState::Idle;
        visited.insert(self.control);
        tracing::info!(
            token = %token,
            kind = ?kind,
            origin = ?origin.map(|o| o.endpoint),
            visited = visited.len(),
            "session started"
        );

        advance(token, &mut state, SessionState::Scanning);
        let (direct, providers) = tokio::join!(
            self.scanner.scan(),
            self.scanner.find_control_providers(&visited)
        );
        self.scanner.browse_services(direct.iter().copied()).await;

        // A remote discovery is one level deep: it answers, never asks.
        let targets = if origin.is_none() || kind == SessionKind::Search {
            providers
        } else {
            Vec::new()
        };
        for target in &targets {
            visited.insert(*target);
        }

        let mut summary = SessionSummary {
            token,
            kind,
            visited: visited.clone(),
            forwarded: 0,
            answered: 0,
            timed_out: false,
            cancelled: false,
            reported: None,
        };

        advance(token, &mut state, SessionState::AwaitingResponses);
        if !targets.is_empty() {
            let request = Request {
                token,
                reply_to: self.control,
                visited,
            };
            let packet = match kind {
                SessionKind::Discovery => Packet::Discover(request),
                SessionKind::Search => Packet::Search(request),
            };
            match self.forward(token, &packet, &targets, &mut summary).await {
                WaitOutcome::Drained => {}
                WaitOutcome::TimedOut => summary.timed_out = true,
                WaitOutcome::Cancelled => summary.cancelled = true,
            }
        }

        if summary.cancelled {
            advance(token, &mut state, SessionState::Done);
            tracing::info!(token = %token, "session cancelled");
            return summary;
        }

        if let Some(origin) = origin {
            advance(token, &mut state, SessionState::Reporting);
            summary.reported = self.report(origin).await;
        }

        advance(token, &mut state, SessionState::Done);
        tracing::info!(
            token = %token,
            forwarded = summary.forwarded,
            answered = summary.answered,
            timed_out = summary.timed_out,
            "session finished"
        );
        summary
    }

    /// Send `packet` to every target and wait until each one that got it has
    /// answered.
    async fn forward(
        &self,
        token: SessionToken,
        packet: &Packet,
        targets: &[ControlEndpoint],
        summary: &mut SessionSummary,
    ) -> WaitOutcome {
        let frame = match packet.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(token = %token, error = %e, "failed to encode request");
                return WaitOutcome::Drained;
            }
        };

        // Registered before any send: an answer can beat the send task home.
        let (pending, mut rx) =
            watch::channel(targets.iter().map(|t| t.peer).collect::<HashSet<PeerId>>());
        self.sessions.insert(token, pending);

        let mut sends = JoinSet::new();
        for target in targets.iter().copied() {
            let link = self.link.clone();
            let frame = frame.clone();
            let connect_timeout = self.config.connect_timeout();
            let shutdown = self.shutdown.subscribe();
            sends.spawn(async move {
                let sent = deliver(&link, target, &frame, connect_timeout, shutdown).await;
                (target, sent)
            });
        }
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((target, Ok(()))) => {
                    summary.forwarded += 1;
                    tracing::debug!(
                        token = %token,
                        peer = %target.peer,
                        command = %packet.command(),
                        "request forwarded"
                    );
                }
                Ok((target, Err(e))) => {
                    tracing::warn!(token = %token, peer = %target.peer, error = %e, "forward failed");
                    self.clear_pending(token, target.peer);
                }
                Err(e) => tracing::warn!(token = %token, error = %e, "send task failed"),
            }
        }

        let mut shutdown = self.shutdown.subscribe();
        let outcome = tokio::select! {
            waited = tokio::time::timeout(self.config.timeout(), rx.wait_for(|p| p.is_empty())) => {
                match waited {
                    Ok(_) => WaitOutcome::Drained,
                    Err(_) => WaitOutcome::TimedOut,
                }
            }
            _ = closed(&mut shutdown) => WaitOutcome::Cancelled,
        };

        let left = rx.borrow().len();
        self.sessions.remove(&token);
        summary.answered = summary.forwarded.saturating_sub(left);
        if let WaitOutcome::TimedOut = outcome {
            tracing::warn!(
                token = %token,
                outstanding = left,
                "timed out waiting for responses, reporting what is known"
            );
        }
        outcome
    }

    fn clear_pending(&self, token: SessionToken, peer: PeerId) {
        if let Some(pending) = self.sessions.get(&token) {
            pending.send_if_modified(|p| p.remove(&peer));
        }
    }

    /// Send the origin every entry it has not already been told, as one
    /// `response`. Returns how many entries went out.
    async fn report(&self, origin: Origin) -> Option<usize> {
        let fresh: Vec<FreshEntry> = {
            let ledger = self.sent.entry(origin.endpoint.peer).or_default();
            self.map
                .report_entries()
                .into_iter()
                // The origin knows itself better than we do.
                .filter(|entry| entry.peer != origin.endpoint.peer)
                .filter_map(|entry| {
                    let text = encode_entry(&entry);
                    (ledger.get(&entry.peer) != Some(&text)).then(|| (entry.peer, text, entry))
                })
                .collect()
        };

        let (fresh, deferred) = fit_frame(origin.token, self.control, fresh);
        if deferred > 0 {
            tracing::warn!(
                origin = %origin.endpoint,
                sent = fresh.len(),
                deferred,
                "response exceeds one frame, deferring entries to the next report"
            );
        }

        let count = fresh.len();
        let response = Packet::Response(Response {
            token: origin.token,
            responder: self.control,
            entries: fresh.iter().map(|(_, _, entry)| entry.clone()).collect(),
        });
        let frame = match response.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(origin = %origin.endpoint, error = %e, "failed to encode response");
                return None;
            }
        };

        let sent = deliver(
            &self.link,
            origin.endpoint,
            &frame,
            self.config.connect_timeout(),
            self.shutdown.subscribe(),
        )
        .await;
        match sent {
            Ok(()) => {
                let mut ledger = self.sent.entry(origin.endpoint.peer).or_default();
                for (peer, text, _) in fresh {
                    ledger.insert(peer, text);
                }
                tracing::debug!(
                    token = %origin.token,
                    origin = %origin.endpoint,
                    entries = count,
                    "response sent"
                );
                Some(count)
            }
            Err(e) => {
                tracing::warn!(origin = %origin.endpoint, error = %e, "failed to send response");
                None
            }
        }
    }
}

/// An entry waiting to be reported, with its encoded form for the ledger.
type FreshEntry = (PeerId, String, EntryReport);

/// Keep as many entries as fit in one `response` frame, in order.
///
/// Returns the kept entries and how many were left out. Left-out entries
/// never reach the ledger, so the next report to the same origin carries
/// them.
fn fit_frame(
    token: SessionToken,
    responder: ControlEndpoint,
    fresh: Vec<FreshEntry>,
) -> (Vec<FreshEntry>, usize) {
    let header = Packet::Response(Response {
        token,
        responder,
        entries: Vec::new(),
    })
    .to_raw();
    let used = header.command.as_str().len()
        + header.fields.iter().map(|f| f.len() + 1).sum::<usize>();
    let mut budget = MAX_FRAME_LEN.saturating_sub(used);

    let mut deferred = 0;
    let kept = fresh
        .into_iter()
        .filter(|(_, text, _)| {
            // one field separator per entry
            let cost = text.len() + 1;
            if cost <= budget {
                budget -= cost;
                true
            } else {
                deferred += 1;
                false
            }
        })
        .collect();
    (kept, deferred)
}

fn advance(token: SessionToken, state: &mut SessionState, next: SessionState) {
    tracing::debug!(token = %token, from = %state, to = %next, "session state");
    *state = next;
}

/// One-shot control message: connect, write one frame, close.
async fn deliver(
    link: &SharedLink,
    to: ControlEndpoint,
    frame: &Bytes,
    connect_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let connect = tokio::time::timeout(
        connect_timeout,
        link.connect(to.peer, to.port, ProtocolKind::ConnectionOriented),
    );
    let mut stream = tokio::select! {
        connected = connect => connected
            .with_context(|| format!("connect to {to} timed out"))?
            .with_context(|| format!("connect to {to} failed"))?,
        _ = closed(&mut shutdown) => anyhow::bail!("shut down while connecting to {to}"),
    };
    stream
        .write_all(frame)
        .await
        .with_context(|| format!("write to {to} failed"))?;
    stream.shutdown().await.ok();
    Ok(())
}
