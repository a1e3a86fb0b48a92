//! Tunnel relay: re-publishes a service of a peer this node can reach so
//! peers that cannot reach it directly can use it through this node.
//!
//! One client at a time. Each accepted client gets a fresh outbound
//! connection to the target service and two pumps copy bytes between them
//! until either side stops.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use btroute_core::config::TunnelConfig;
use btroute_core::{PeerId, ServiceDescriptor};

use crate::control::ACCEPT_BACKOFF;
use crate::link::{LinkAcceptor, LinkStream, SharedLink};
use crate::shutdown::{closed, ShutdownSignal};

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to open local {kind} endpoint: {source}")]
    Listen {
        kind: btroute_core::ProtocolKind,
        source: io::Error,
    },

    #[error("failed to advertise relayed service: {0}")]
    Advertise(io::Error),
}

/// Bytes moved for one relayed client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    /// Client towards target.
    pub inbound: u64,
    /// Target towards client.
    pub outbound: u64,
}

pub struct TunnelRelay {
    link: SharedLink,
    target: PeerId,
    service: ServiceDescriptor,
    advert: ServiceDescriptor,
    acceptor: Box<dyn LinkAcceptor>,
    buffer_size: usize,
    closing: ShutdownSignal,
}

impl TunnelRelay {
    /// Bind a local endpoint of the service's kind and advertise it.
    pub async fn open(
        link: SharedLink,
        target: PeerId,
        service: ServiceDescriptor,
        config: &TunnelConfig,
    ) -> Result<Self, TunnelError> {
        let acceptor = link
            .listen(service.kind, 0)
            .await
            .map_err(|source| TunnelError::Listen {
                kind: service.kind,
                source,
            })?;
        let advert = ServiceDescriptor {
            kind: service.kind,
            port: acceptor.local_port(),
            name: format!("{} via {}", service.name, link.local_address()),
            service_uuid: service.service_uuid,
            service_classes: service.service_classes.clone(),
        };
        link.advertise(&advert)
            .await
            .map_err(TunnelError::Advertise)?;

        tracing::info!(
            target = %target,
            service = %service.name,
            port = advert.port,
            "tunnel relay open"
        );
        Ok(Self {
            link,
            target,
            service,
            advert,
            acceptor,
            buffer_size: config.buffer_size.max(1),
            closing: ShutdownSignal::new(),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.advert.port
    }

    /// The record clients find this relay under.
    pub fn advertisement(&self) -> &ServiceDescriptor {
        &self.advert
    }

    pub fn spawn(self) -> TunnelHandle {
        let port = self.local_port();
        let closing = self.closing.clone();
        let task = tokio::spawn(self.run());
        TunnelHandle {
            port,
            closing,
            task,
        }
    }

    /// Serve clients one after another until closed, then withdraw the
    /// advertisement. Returns how many clients were relayed.
    pub async fn run(mut self) -> Result<u64> {
        let mut closing = self.closing.subscribe();
        let mut served = 0u64;
        loop {
            let accepted = tokio::select! {
                _ = closed(&mut closing) => break,
                accepted = self.acceptor.accept() => accepted,
            };
            let client = match accepted {
                Ok(client) => client,
                Err(e) => {
                    tracing::warn!(error = %e, "tunnel accept failed");
                    tokio::select! {
                        _ = closed(&mut closing) => break,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                    }
                }
            };

            let connect = self
                .link
                .connect(self.target, self.service.port, self.service.kind);
            let outbound = tokio::select! {
                _ = closed(&mut closing) => break,
                connected = connect => match connected {
                    Ok(stream) => stream,
                    Err(e) => {
                        // Dropping the client closes it.
                        tracing::warn!(target = %self.target, error = %e, "tunnel target unreachable");
                        continue;
                    }
                },
            };

            tracing::debug!(target = %self.target, "tunnel client connected");
            let stats = relay(client, outbound, self.buffer_size, self.closing.subscribe()).await;
            served += 1;
            tracing::info!(
                target = %self.target,
                inbound = stats.inbound,
                outbound = stats.outbound,
                "tunnel client finished"
            );
        }

        if let Err(e) = self.link.withdraw(&self.advert).await {
            tracing::warn!(error = %e, "failed to withdraw tunnel advertisement");
        }
        tracing::info!(target = %self.target, served, "tunnel relay closed");
        Ok(served)
    }
}

/// Copy bytes both ways until either direction ends, then close both legs.
pub async fn relay(
    inbound: LinkStream,
    outbound: LinkStream,
    buffer_size: usize,
    mut closing: watch::Receiver<bool>,
) -> RelayStats {
    let (in_read, in_write) = tokio::io::split(inbound);
    let (out_read, out_write) = tokio::io::split(outbound);
    let up = Arc::new(AtomicU64::new(0));
    let down = Arc::new(AtomicU64::new(0));

    let mut forward = tokio::spawn(pump(in_read, out_write, up.clone(), buffer_size));
    let mut backward = tokio::spawn(pump(out_read, in_write, down.clone(), buffer_size));

    tokio::select! {
        ended = &mut forward => {
            log_pump_end("inbound", ended);
            backward.abort();
            let _ = backward.await;
        }
        ended = &mut backward => {
            log_pump_end("outbound", ended);
            forward.abort();
            let _ = forward.await;
        }
        _ = closed(&mut closing) => {
            forward.abort();
            backward.abort();
            let _ = forward.await;
            let _ = backward.await;
        }
    }

    RelayStats {
        inbound: up.load(Ordering::Relaxed),
        outbound: down.load(Ordering::Relaxed),
    }
}

fn log_pump_end(direction: &str, ended: Result<io::Result<()>, tokio::task::JoinError>) {
    match ended {
        Ok(Ok(())) => tracing::trace!(direction, "pump reached end of stream"),
        Ok(Err(e)) => tracing::warn!(direction, error = %e, "tunnel leg failed"),
        Err(e) => tracing::warn!(direction, error = %e, "pump task failed"),
    }
}

async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    counter: Arc<AtomicU64>,
    buffer_size: usize,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await.ok();
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// A running tunnel relay.
pub struct TunnelHandle {
    port: u16,
    closing: ShutdownSignal,
    task: JoinHandle<Result<u64>>,
}

impl TunnelHandle {
    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Stop accepting and cut the active client, if any.
    pub fn close(&self) {
        self.closing.close();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub(crate) fn closer(&self) -> ShutdownSignal {
        self.closing.clone()
    }

    /// Wait for the relay to stop. Returns how many clients it served.
    pub async fn join(self) -> Result<u64> {
        self.task.await?
    }
}
