//! Controller - owns the worker pool, the control endpoint and the public endpoint.
//!
//! The controller is one task running an event loop over:
//! - control connections (workers and operator clients)
//! - public connections, each proxied to a READY worker
//! - internal events from connection, proxy and process tasks
//! - fired restart timers
//!
//! Only this task touches the pool. Everything else reports back by message.
//!
//! Lifecycle: `Stopped → Starting → Running → Draining → Stopped`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::pending;
use std::io;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonLinesCodec;
use crate::bridge::protocol::{Command, Envelope, Reply, StatusReply, StopReply};
use crate::bridge::transport::{
    ControlAddress, Endpoints, Listener, Stream, TransportError, TransportKind,
};
use crate::config::{ConfigError, ControllerConfig};
use crate::pool::{ExpiryTimers, RestartStrategy, WorkerKey, WorkerPool, WorkerRecord};
use crate::proxy::{Lease, ProxyError, ProxyEvent, proxy_connection};
use crate::spawner::{ProcessExit, ProcessHandle, SpawnError, WorkerSpawnConfig};
use crate::version::POOLER_VERSION;

/// Capacity of the [`ControllerEvent`] broadcast.
const NOTIFY_CAPACITY: usize = 64;

/// First delay before replenishing again after a failed or aborted spawn.
const RESPAWN_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Ceiling for the doubling respawn delay.
const RESPAWN_BACKOFF_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    #[default]
    Stopped,
    /// Endpoints bound, initial workers spawning
    Starting,
    /// Accepting and supervising
    Running,
    /// Stop requested: endpoints closed, no replenishment
    Draining,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ControllerState::Stopped => "stopped",
            ControllerState::Starting => "starting",
            ControllerState::Running => "running",
            ControllerState::Draining => "draining",
        };
        f.write_str(s)
    }
}

/// Why a worker left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Sent `unregister`
    Unregistered,
    /// Control connection closed without `unregister`, or the process died
    Crashed,
    /// Restart timer fired
    Expired,
    /// Served its request budget
    MaxRequests,
    /// Controller stopped
    Shutdown,
}

/// Lifecycle notifications, see [`ControllerHandle::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    WorkerRegistered {
        pid: u32,
        port: u16,
    },
    WorkerRemoved {
        pid: u32,
        port: u16,
        reason: RemovalReason,
    },
    /// The pool reached its target size. Fires once per refill.
    PoolReady {
        ports: Vec<u16>,
    },
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to spawn worker on port {port}: {source}")]
    Spawn {
        port: u16,
        #[source]
        source: SpawnError,
    },
    #[error("no free worker port from {0} upwards")]
    PortsExhausted(u16),
    #[error("controller is not running")]
    NotRunning,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Identity of one accepted control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages into the controller task.
#[derive(Debug)]
enum Event {
    Command {
        connection: ConnectionId,
        command: Command,
        reply: Option<oneshot::Sender<Reply>>,
    },
    ConnectionClosed {
        connection: ConnectionId,
    },
    Proxy(ProxyEvent),
    ProcessExited(ProcessExit),
    /// Delayed retry of [`Controller::replenish`].
    Replenish,
    Stop,
    Status(oneshot::Sender<StatusReply>),
}

impl From<ProxyEvent> for Event {
    fn from(event: ProxyEvent) -> Self {
        Event::Proxy(event)
    }
}

/// Cloneable handle for stopping, querying and observing a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    events: mpsc::UnboundedSender<Event>,
    notifications: broadcast::Sender<ControllerEvent>,
}

impl ControllerHandle {
    /// Request a graceful stop. Returns once the request is queued.
    pub fn stop(&self) -> Result<(), ControllerError> {
        self.events
            .send(Event::Stop)
            .map_err(|_| ControllerError::NotRunning)
    }

    pub async fn status(&self) -> Result<StatusReply, ControllerError> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(Event::Status(tx))
            .map_err(|_| ControllerError::NotRunning)?;
        rx.await.map_err(|_| ControllerError::NotRunning)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.notifications.subscribe()
    }
}

pub struct Controller {
    config: ControllerConfig,
    endpoints: Endpoints,
    control: Option<Listener>,
    public: Option<Listener>,
    control_address: ControlAddress,
    public_address: ControlAddress,
    pool: WorkerPool<ExpiryTimers>,
    /// Live worker processes by pid, registered or not.
    processes: HashMap<u32, ProcessHandle>,
    /// Spawned pids that have not registered yet.
    spawning: HashSet<u32>,
    /// Control connection → pid it registered.
    connections: HashMap<ConnectionId, u32>,
    /// Inbound connections waiting for a READY worker, oldest first.
    pending: VecDeque<oneshot::Sender<Lease>>,
    state: ControllerState,
    awaiting_full_pool: bool,
    /// Connections routed since start.
    routed: u64,
    /// Workers currently leased to a proxied connection.
    active_leases: usize,
    /// Spawns that failed or exited unregistered since the last registration.
    respawn_failures: u32,
    respawn_scheduled: bool,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    expired_rx: mpsc::UnboundedReceiver<WorkerKey>,
    notifications: broadcast::Sender<ControllerEvent>,
}

impl Controller {
    /// Validate `config` and bind both endpoints. No workers are spawned yet.
    pub async fn bind(config: ControllerConfig) -> Result<Self, ControllerError> {
        config.validate()?;

        let endpoints = config.endpoints();
        let control = Listener::bind(&endpoints.controller()).await?;
        let public = Listener::bind(&ControlAddress::resolve(&config.host, config.port)?).await?;
        let control_address = control.local_address()?;
        let public_address = public.local_address()?;

        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let mut pool = WorkerPool::new(ExpiryTimers::new(expired_tx));
        pool.apply_strategy(config.restart_strategy);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(NOTIFY_CAPACITY);

        tracing::info!(
            control = %control_address,
            public = %public_address,
            workers = config.workers,
            strategy = config.restart_strategy.as_str(),
            "Controller bound"
        );

        Ok(Self {
            config,
            endpoints,
            control: Some(control),
            public: Some(public),
            control_address,
            public_address,
            pool,
            processes: HashMap::new(),
            spawning: HashSet::new(),
            connections: HashMap::new(),
            pending: VecDeque::new(),
            state: ControllerState::Stopped,
            awaiting_full_pool: false,
            routed: 0,
            active_leases: 0,
            respawn_failures: 0,
            respawn_scheduled: false,
            events_tx,
            events_rx,
            expired_rx,
            notifications,
        })
    }

    /// Bind and run until stopped.
    pub async fn start(config: ControllerConfig) -> Result<(), ControllerError> {
        Self::bind(config).await?.run().await
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            events: self.events_tx.clone(),
            notifications: self.notifications.clone(),
        }
    }

    pub fn control_address(&self) -> &ControlAddress {
        &self.control_address
    }

    pub fn public_address(&self) -> &ControlAddress {
        &self.public_address
    }

    /// Spawn the initial workers and run the event loop until the controller
    /// has drained and stopped.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        self.state = ControllerState::Starting;
        self.awaiting_full_pool = true;
        for _ in 0..self.config.workers {
            self.spawn_worker()?;
        }
        self.state = ControllerState::Running;
        tracing::info!(target_workers = self.config.workers, "Controller running");

        let mut drain_deadline: Option<Instant> = None;
        loop {
            if self.state == ControllerState::Draining {
                if self.drained() {
                    break;
                }
                if drain_deadline.is_none() {
                    drain_deadline = Some(Instant::now() + self.config.drain_timeout);
                }
            }

            tokio::select! {
                accepted = accept_on(self.control.as_ref()) => match accepted {
                    Ok(stream) => self.on_control_connection(stream),
                    Err(e) => tracing::warn!(error = %e, "Failed to accept control connection"),
                },
                accepted = accept_on(self.public.as_ref()) => match accepted {
                    Ok(stream) => self.on_inbound_connection(stream),
                    Err(e) => tracing::warn!(error = %e, "Failed to accept inbound connection"),
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                Some(key) = self.expired_rx.recv() => self.on_expired(key),
                _ = sleep_until(drain_deadline) => {
                    tracing::warn!(
                        active_leases = self.active_leases,
                        processes = self.processes.len(),
                        "Drain timed out"
                    );
                    break;
                }
            }
        }

        self.finish();
        Ok(())
    }

    fn on_control_connection(&mut self, stream: Stream) {
        let connection = ConnectionId::new();
        tracing::trace!(%connection, "Control connection accepted");
        tokio::spawn(serve_control_connection(
            connection,
            stream,
            self.events_tx.clone(),
        ));
    }

    fn on_inbound_connection(&mut self, stream: Stream) {
        let events = self.events_tx.clone();
        let route_timeout = self.config.route_timeout;
        tokio::spawn(async move {
            match proxy_connection(stream, events, route_timeout).await {
                Ok(stats) => tracing::trace!(
                    to_worker = stats.to_worker,
                    from_worker = stats.from_worker,
                    "Proxied connection closed"
                ),
                Err(ProxyError::ControllerGone) => {}
                Err(e) => tracing::warn!(error = %e, "Inbound connection dropped"),
            }
        });
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Command {
                connection,
                command,
                reply,
            } => self.dispatch(connection, command, reply),
            Event::ConnectionClosed { connection } => self.on_connection_closed(connection),
            Event::Proxy(ProxyEvent::Route(reply)) => self.route(reply),
            Event::Proxy(ProxyEvent::Finished(key)) => self.on_proxy_finished(key),
            Event::ProcessExited(exit) => self.on_process_exited(exit),
            Event::Replenish => {
                self.respawn_scheduled = false;
                self.replenish();
            }
            Event::Stop => self.begin_drain(),
            Event::Status(reply) => {
                let _ = reply.send(self.status_reply());
            }
        }
    }

    fn dispatch(
        &mut self,
        connection: ConnectionId,
        command: Command,
        reply: Option<oneshot::Sender<Reply>>,
    ) {
        tracing::debug!(%connection, cmd = %command.kind(), "Control command");
        match command {
            Command::Register { pid, port } => self.handle_register(connection, pid, port),
            Command::Unregister { pid } => self.handle_unregister(pid),
            Command::Status => respond(reply, Reply::Status(self.status_reply())),
            Command::Stop => {
                respond(reply, Reply::Stop(StopReply { stopping: true }));
                self.begin_drain();
            }
        }
    }

    fn handle_register(&mut self, connection: ConnectionId, pid: u32, port: u16) {
        if self.spawning.remove(&pid) {
            self.respawn_failures = 0;
        }

        let mut record = WorkerRecord::new(pid, port).with_ttl(self.config.ttl);
        if let Err(e) = record.register() {
            tracing::warn!(pid, port, error = %e, "Rejecting registration");
            return;
        }
        if let Err(e) = self.pool.add(record) {
            tracing::warn!(pid, port, error = %e, "Rejecting registration");
            return;
        }
        self.connections.insert(connection, pid);

        tracing::info!(pid, port, "Worker registered");
        self.notify(ControllerEvent::WorkerRegistered { pid, port });

        if self.awaiting_full_pool && self.pool.len() >= self.config.workers {
            self.awaiting_full_pool = false;
            let ports = self.pool.ports();
            let list = ports
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            tracing::info!("{} workers ({}) up and ready", ports.len(), list);
            self.notify(ControllerEvent::PoolReady { ports });
        }

        self.dispatch_pending();
    }

    fn handle_unregister(&mut self, pid: u32) {
        match self.pool.remove_by_pid(pid) {
            Some(record) => {
                self.forget_connection(pid);
                tracing::info!(pid, port = record.port(), "Worker unregistered");
                self.notify(ControllerEvent::WorkerRemoved {
                    pid,
                    port: record.port(),
                    reason: RemovalReason::Unregistered,
                });
            }
            None => tracing::debug!(pid, "Unregister for unknown worker"),
        }
        self.replenish();
    }

    fn on_connection_closed(&mut self, connection: ConnectionId) {
        let Some(pid) = self.connections.remove(&connection) else {
            return;
        };
        let Some(record) = self.pool.remove_by_pid(pid) else {
            return;
        };
        tracing::warn!(
            pid,
            port = record.port(),
            "Worker control connection closed without unregister"
        );
        self.terminate_process(pid);
        self.notify(ControllerEvent::WorkerRemoved {
            pid,
            port: record.port(),
            reason: RemovalReason::Crashed,
        });
        self.replenish();
    }

    fn on_expired(&mut self, key: WorkerKey) {
        if !self.pool.contains_key(key) {
            return;
        }
        tracing::info!(worker = %key, "Worker ttl expired, restarting");
        self.restart_worker(key, RemovalReason::Expired);
    }

    fn on_proxy_finished(&mut self, key: WorkerKey) {
        self.active_leases = self.active_leases.saturating_sub(1);

        let Some(record) = self.pool.get_key_mut(key) else {
            return;
        };
        if let Err(e) = record.release() {
            tracing::warn!(worker = %key, error = %e, "Failed to release worker");
            return;
        }

        let requests = record.requests();
        if self.pool.strategy() == RestartStrategy::Request && requests >= self.config.max_requests
        {
            tracing::info!(worker = %key, requests, "Worker reached max requests, restarting");
            self.restart_worker(key, RemovalReason::MaxRequests);
        } else {
            self.dispatch_pending();
        }
    }

    fn on_process_exited(&mut self, exit: ProcessExit) {
        let ProcessExit { pid, port, status } = exit;
        self.processes.remove(&pid);
        match &status {
            Ok(status) => tracing::info!(pid, port, %status, "Worker process exited"),
            Err(e) => tracing::warn!(pid, port, error = %e, "Failed to reap worker process"),
        }

        if self.spawning.remove(&pid) {
            tracing::warn!(pid, port, "Worker exited before registering");
            self.schedule_replenish();
        } else if let Some(record) = self.pool.remove_by_pid(pid) {
            self.forget_connection(pid);
            let reason = match self.state {
                ControllerState::Draining => RemovalReason::Shutdown,
                _ => RemovalReason::Crashed,
            };
            self.notify(ControllerEvent::WorkerRemoved {
                pid,
                port: record.port(),
                reason,
            });
            self.replenish();
        }
    }

    /// Take a worker out of rotation, stop its process and replace it.
    fn restart_worker(&mut self, key: WorkerKey, reason: RemovalReason) {
        if self.pool.remove(key.port).is_none() {
            return;
        }
        self.forget_connection(key.pid);
        self.terminate_process(key.pid);
        self.notify(ControllerEvent::WorkerRemoved {
            pid: key.pid,
            port: key.port,
            reason,
        });
        self.replenish();
    }

    /// Lease a READY worker to an inbound connection, or queue it.
    fn route(&mut self, reply: oneshot::Sender<Lease>) {
        if self.state != ControllerState::Running || reply.is_closed() {
            return;
        }
        if let Err(reply) = self.try_lease(reply) {
            if self.pending.len() >= self.config.max_pending {
                tracing::warn!(
                    max_pending = self.config.max_pending,
                    "Pending route queue full, refusing connection"
                );
                return;
            }
            tracing::trace!(pending = self.pending.len() + 1, "No ready worker, queueing connection");
            self.pending.push_back(reply);
        }
    }

    /// Hand queued connections to READY workers, oldest first.
    fn dispatch_pending(&mut self) {
        while let Some(reply) = self.pending.pop_front() {
            if reply.is_closed() {
                continue;
            }
            if let Err(reply) = self.try_lease(reply) {
                self.pending.push_front(reply);
                break;
            }
        }
    }

    /// Returns the sender back when no worker is READY.
    fn try_lease(&mut self, reply: oneshot::Sender<Lease>) -> Result<(), oneshot::Sender<Lease>> {
        let Some(record) = self.pool.find_ready_worker_mut() else {
            return Err(reply);
        };
        if record.acquire().is_err() {
            return Err(reply);
        }
        let worker = record.key();
        let lease = Lease {
            worker,
            address: self.endpoints.worker(worker.port),
        };

        if reply.send(lease).is_ok() {
            self.routed += 1;
            self.active_leases += 1;
            tracing::trace!(%worker, routed = self.routed, "Routed connection");
        } else if let Some(record) = self.pool.get_key_mut(worker) {
            // Waiter gave up between the check and the send.
            let _ = record.cancel_acquire();
        }
        Ok(())
    }

    /// Spawn workers until live + spawning reaches the target.
    fn replenish(&mut self) {
        if self.state != ControllerState::Running || self.respawn_scheduled {
            return;
        }
        let live = self.pool.len() + self.spawning.len();
        if live >= self.config.workers {
            return;
        }

        self.awaiting_full_pool = true;
        tracing::debug!(live, target = self.config.workers, "Replenishing pool");
        for _ in live..self.config.workers {
            if let Err(e) = self.spawn_worker() {
                tracing::error!(error = %e, "Failed to spawn worker");
                self.schedule_replenish();
                break;
            }
        }
    }

    /// Retry [`Self::replenish`] after a delay that doubles with each
    /// consecutive failure, up to [`RESPAWN_BACKOFF_MAX`].
    fn schedule_replenish(&mut self) {
        if self.state != ControllerState::Running || self.respawn_scheduled {
            return;
        }
        let delay = respawn_backoff(self.respawn_failures);
        self.respawn_failures = self.respawn_failures.saturating_add(1);
        self.respawn_scheduled = true;
        tracing::debug!(?delay, "Scheduling replenish");

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::Replenish);
        });
    }

    fn spawn_worker(&mut self) -> Result<u32, ControllerError> {
        let port = self.next_port()?;
        let spawn_config = WorkerSpawnConfig {
            port,
            controller: self.control_address.clone(),
            endpoint: self.endpoints.worker(port),
            app_env: self.config.app_env.clone(),
        };

        let spawn_error = |source: SpawnError| ControllerError::Spawn { port, source };
        let child = self.config.spawner.spawn(&spawn_config).map_err(spawn_error)?;
        let (handle, exit) =
            ProcessHandle::supervise(child, port, self.config.grace_period).map_err(spawn_error)?;

        let pid = handle.pid();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let _ = events.send(Event::ProcessExited(exit.await));
        });

        tracing::debug!(pid, port, "Spawned worker");
        self.spawning.insert(pid);
        self.processes.insert(pid, handle);
        Ok(pid)
    }

    /// Lowest port from the base that no registered worker or live process holds.
    fn next_port(&self) -> Result<u16, ControllerError> {
        let base = self.config.worker_base_port;
        (base..=u16::MAX)
            .find(|&port| self.port_is_free(port))
            .ok_or(ControllerError::PortsExhausted(base))
    }

    fn port_is_free(&self, port: u16) -> bool {
        if self.pool.contains_port(port) || self.processes.values().any(|p| p.port() == port) {
            return false;
        }
        match self.endpoints.kind() {
            TransportKind::Tcp => port != self.config.control_port && port != self.config.port,
            TransportKind::Unix => true,
        }
    }

    fn terminate_process(&mut self, pid: u32) {
        if let Some(handle) = self.processes.get_mut(&pid) {
            handle.terminate();
        }
    }

    fn forget_connection(&mut self, pid: u32) {
        self.connections.retain(|_, registered| *registered != pid);
    }

    fn begin_drain(&mut self) {
        if matches!(
            self.state,
            ControllerState::Draining | ControllerState::Stopped
        ) {
            return;
        }
        tracing::info!(
            active_leases = self.active_leases,
            pending = self.pending.len(),
            "Stopping: closing endpoints and draining connections"
        );
        self.state = ControllerState::Draining;
        self.control = None;
        self.public = None;
        self.pending.clear();
    }

    /// Once no connection holds a worker, terminate every process. Drained
    /// when none are left.
    fn drained(&mut self) -> bool {
        if self.active_leases > 0 {
            return false;
        }
        for handle in self.processes.values_mut() {
            handle.terminate();
        }
        self.processes.is_empty()
    }

    fn finish(&mut self) {
        for record in self.pool.clear() {
            self.notify(ControllerEvent::WorkerRemoved {
                pid: record.pid(),
                port: record.port(),
                reason: RemovalReason::Shutdown,
            });
        }
        self.spawning.clear();
        self.connections.clear();
        self.state = ControllerState::Stopped;
        tracing::info!(routed = self.routed, "Controller stopped");
        self.notify(ControllerEvent::Stopped);
    }

    fn status_reply(&self) -> StatusReply {
        StatusReply {
            active_workers: self.pool.len(),
            target_workers: self.config.workers,
            state: self.state.to_string(),
            routed_connections: self.routed,
            pending_connections: self.pending.iter().filter(|r| !r.is_closed()).count(),
            version: POOLER_VERSION.to_string(),
            workers: self.pool.iter().map(WorkerRecord::snapshot).collect(),
        }
    }

    fn notify(&self, event: ControllerEvent) {
        // No subscribers is fine.
        let _ = self.notifications.send(event);
    }
}

fn respond(reply: Option<oneshot::Sender<Reply>>, value: Reply) {
    if let Some(reply) = reply {
        let _ = reply.send(value);
    }
}

async fn accept_on(listener: Option<&Listener>) -> io::Result<Stream> {
    match listener {
        Some(listener) => listener.accept().await,
        None => pending().await,
    }
}

fn respawn_backoff(failures: u32) -> Duration {
    RESPAWN_BACKOFF_BASE
        .checked_mul(1u32.checked_shl(failures).unwrap_or(u32::MAX))
        .map_or(RESPAWN_BACKOFF_MAX, |delay| delay.min(RESPAWN_BACKOFF_MAX))
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Read commands from one control connection and forward them to the
/// controller. A malformed or unknown command closes only this connection.
/// Commands that expect a reply get exactly one reply line, then the
/// connection is closed.
async fn serve_control_connection(
    connection: ConnectionId,
    stream: Stream,
    events: mpsc::UnboundedSender<Event>,
) {
    let (read, write) = tokio::io::split(stream);
    let mut reader = FramedRead::new(read, JsonLinesCodec::<Envelope>::new());
    let mut writer = FramedWrite::new(write, JsonLinesCodec::<Reply>::new());

    while let Some(frame) = reader.next().await {
        let envelope = match frame {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(%connection, error = %e, "Malformed control message, closing connection");
                break;
            }
        };
        let command = match Command::try_from(envelope) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(%connection, error = %e, "Protocol error, closing connection");
                break;
            }
        };

        if !command.kind().expects_reply() {
            let event = Event::Command {
                connection,
                command,
                reply: None,
            };
            if events.send(event).is_err() {
                break;
            }
            continue;
        }

        let (tx, rx) = oneshot::channel();
        let event = Event::Command {
            connection,
            command,
            reply: Some(tx),
        };
        if events.send(event).is_err() {
            break;
        }
        if let Ok(reply) = rx.await
            && let Err(e) = writer.send(reply).await
        {
            tracing::debug!(%connection, error = %e, "Failed to write reply");
        }
        break;
    }

    let _ = writer.close().await;
    let _ = events.send(Event::ConnectionClosed { connection });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_displays_lowercase() {
        assert_eq!(ControllerState::Running.to_string(), "running");
        assert_eq!(
            serde_json::to_string(&ControllerState::Draining).unwrap(),
            "\"draining\""
        );
        assert_eq!(ControllerState::default(), ControllerState::Stopped);
    }

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn respawn_backoff_doubles_up_to_ceiling() {
        assert_eq!(respawn_backoff(0), Duration::from_millis(100));
        assert_eq!(respawn_backoff(1), Duration::from_millis(200));
        assert_eq!(respawn_backoff(3), Duration::from_millis(800));
        assert_eq!(respawn_backoff(6), RESPAWN_BACKOFF_MAX);
        assert_eq!(respawn_backoff(40), RESPAWN_BACKOFF_MAX);
    }

    fn test_config(dir: &tempfile::TempDir) -> ControllerConfig {
        ControllerConfig::new()
            .with_workers(1)
            .with_transport(TransportKind::Unix)
            .with_run_dir(dir.path())
            .with_public("127.0.0.1", 0)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bind_reports_actual_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::bind(test_config(&dir)).await.unwrap();

        assert_eq!(
            controller.control_address(),
            &ControlAddress::Unix(std::path::absolute(dir.path().join("controller.sock")).unwrap())
        );
        match controller.public_address() {
            ControlAddress::Tcp(addr) => assert_ne!(addr.port(), 0),
            other => panic!("expected tcp public address, got {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bind_fails_when_public_port_is_taken() {
        let dir = tempfile::tempdir().unwrap();
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = Controller::bind(test_config(&dir).with_public("127.0.0.1", port))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ControllerError::Transport(TransportError::Bind { .. })
        ));
    }

    #[tokio::test]
    async fn bind_rejects_invalid_config() {
        let err = Controller::bind(ControllerConfig::new().with_workers(0))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ControllerError::Config(ConfigError::NoWorkers)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn handle_fails_after_controller_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::bind(test_config(&dir)).await.unwrap();
        let handle = controller.handle();
        drop(controller);

        assert!(matches!(handle.stop(), Err(ControllerError::NotRunning)));
        let status = tokio::time::timeout(Duration::from_secs(5), handle.status())
            .await
            .unwrap();
        assert!(matches!(status, Err(ControllerError::NotRunning)));
    }
}
