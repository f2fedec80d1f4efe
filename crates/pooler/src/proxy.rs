//! Inbound connection proxying.
//!
//! One task per accepted public connection: ask the controller for a lease on
//! a READY worker, connect to that worker's endpoint, and splice bytes both
//! ways until either side closes. The controller is told when the lease ends
//! so the worker can go back to READY.

use std::io;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::bridge::transport::{ControlAddress, Stream};
use crate::pool::WorkerKey;

/// A worker handed to one inbound connection. The worker is BUSY until the
/// matching [`ProxyEvent::Finished`] is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub worker: WorkerKey,
    pub address: ControlAddress,
}

/// Messages from proxy tasks to the controller.
#[derive(Debug)]
pub enum ProxyEvent {
    /// Wait for a READY worker. Dropping the sender refuses the connection.
    Route(oneshot::Sender<Lease>),
    /// Proxied connection ended; release the worker.
    Finished(WorkerKey),
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no worker became ready within {0:?}")]
    RouteTimeout(Duration),
    #[error("route request refused")]
    Refused,
    #[error("controller is gone")]
    ControllerGone,
    #[error("failed to connect to worker {worker} at {address}: {source}")]
    Connect {
        worker: WorkerKey,
        address: ControlAddress,
        #[source]
        source: io::Error,
    },
    #[error("proxy i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Bytes moved by one proxied connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyStats {
    pub to_worker: u64,
    pub from_worker: u64,
}

/// Route `inbound` to a worker and splice until either side closes.
pub async fn proxy_connection<E>(
    mut inbound: Stream,
    events: mpsc::UnboundedSender<E>,
    route_timeout: Duration,
) -> Result<ProxyStats, ProxyError>
where
    E: From<ProxyEvent>,
{
    let lease = request_lease(&events, route_timeout).await?;
    tracing::trace!(worker = %lease.worker, address = %lease.address, "Proxying connection");

    let result = splice(&mut inbound, &lease).await;
    let _ = events.send(ProxyEvent::Finished(lease.worker).into());
    result
}

async fn request_lease<E>(
    events: &mpsc::UnboundedSender<E>,
    route_timeout: Duration,
) -> Result<Lease, ProxyError>
where
    E: From<ProxyEvent>,
{
    let (tx, mut rx) = oneshot::channel();
    events
        .send(ProxyEvent::Route(tx).into())
        .map_err(|_| ProxyError::ControllerGone)?;

    match tokio::time::timeout(route_timeout, &mut rx).await {
        Ok(Ok(lease)) => Ok(lease),
        Ok(Err(_)) => Err(ProxyError::Refused),
        Err(_) => {
            release_late_lease(rx, events);
            Err(ProxyError::RouteTimeout(route_timeout))
        }
    }
}

/// A lease may land between the timeout firing and the receiver closing;
/// hand it straight back so the worker does not stay BUSY.
fn release_late_lease<E>(mut rx: oneshot::Receiver<Lease>, events: &mpsc::UnboundedSender<E>)
where
    E: From<ProxyEvent>,
{
    rx.close();
    if let Ok(lease) = rx.try_recv() {
        tracing::debug!(worker = %lease.worker, "Releasing lease granted after route timeout");
        let _ = events.send(ProxyEvent::Finished(lease.worker).into());
    }
}

async fn splice(inbound: &mut Stream, lease: &Lease) -> Result<ProxyStats, ProxyError> {
    let mut upstream = Stream::connect(&lease.address)
        .await
        .map_err(|source| ProxyError::Connect {
            worker: lease.worker,
            address: lease.address.clone(),
            source,
        })?;

    let (to_worker, from_worker) = tokio::io::copy_bidirectional(inbound, &mut upstream).await?;
    Ok(ProxyStats {
        to_worker,
        from_worker,
    })
}
