//! Inbound control connections.
//!
//! Accepts on the control port and gives each connection its own handler
//! task, which reads packets until the peer closes and dispatches them to
//! the search coordinator.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;

use btroute_core::{Packet, PacketReader, ProtocolKind, ReadError};

use crate::link::{LinkAcceptor, LinkStream, SharedLink};
use crate::search::SearchCoordinator;
use crate::shutdown::{closed, ShutdownSignal};

/// Pause after a failed accept so a broken acceptor does not spin.
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

static CONNECTION_IDS: AtomicU64 = AtomicU64::new(1);

pub struct ControlListener {
    acceptor: Box<dyn LinkAcceptor>,
    closing: ShutdownSignal,
}

impl ControlListener {
    /// Bind the control port. Port 0 lets the link pick one.
    pub async fn bind(link: &SharedLink, port: u16) -> io::Result<Self> {
        let acceptor = link.listen(ProtocolKind::ConnectionOriented, port).await?;
        tracing::info!(port = acceptor.local_port(), "control listener bound");
        Ok(Self {
            acceptor,
            closing: ShutdownSignal::new(),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.acceptor.local_port()
    }

    /// Run the accept loop on its own task.
    pub fn spawn(self, coordinator: Arc<SearchCoordinator>) -> ControlHandle {
        let port = self.local_port();
        let closing = self.closing.clone();
        let task = tokio::spawn(self.run(coordinator));
        ControlHandle {
            port,
            closing,
            task,
        }
    }

    /// Accept until closed. The port is released on return.
    pub async fn run(mut self, coordinator: Arc<SearchCoordinator>) -> Result<()> {
        let mut closing = self.closing.subscribe();
        loop {
            tokio::select! {
                _ = closed(&mut closing) => {
                    tracing::info!(port = self.acceptor.local_port(), "control listener closed");
                    return Ok(());
                }

                accepted = self.acceptor.accept() => {
                    match accepted {
                        Ok(stream) => {
                            let id = CONNECTION_IDS.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(conn = id, "control connection accepted");
                            tokio::spawn(serve_connection(id, stream, coordinator.clone()));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "control accept failed");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }
}

/// Read packets from one connection until it closes.
async fn serve_connection(id: u64, stream: LinkStream, coordinator: Arc<SearchCoordinator>) {
    let mut reader = PacketReader::new(stream);
    loop {
        match reader.read_packet().await {
            Ok(packet) => {
                tracing::debug!(conn = id, command = %packet.command(), token = %packet.token(), "control packet");
                dispatch(packet, &coordinator);
            }
            Err(ReadError::Malformed(e)) => {
                tracing::warn!(conn = id, error = %e, "dropping malformed control message");
            }
            Err(ReadError::Closed) => {
                tracing::trace!(conn = id, "control connection closed");
                return;
            }
            Err(e) => {
                tracing::debug!(conn = id, error = %e, "control connection failed");
                return;
            }
        }
    }
}

fn dispatch(packet: Packet, coordinator: &Arc<SearchCoordinator>) {
    match packet {
        Packet::Discover(request) => {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator.handle_discover(request).await;
            });
        }
        Packet::Search(request) => {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator.handle_search(request).await;
            });
        }
        Packet::Response(response) => coordinator.handle_response(response),
    }
}

/// A running control listener.
pub struct ControlHandle {
    port: u16,
    closing: ShutdownSignal,
    task: JoinHandle<Result<()>>,
}

impl ControlHandle {
    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Stop accepting. Connections already being served finish on their own.
    pub fn close(&self) {
        self.closing.close();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> Result<()> {
        self.task.await?
    }
}
