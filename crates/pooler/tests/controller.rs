//! Controller behaviour driven through its real endpoints.
//!
//! Workers are `sleep` processes started by a recording spawner; the test
//! plays their part on the control channel and, where routing is exercised,
//! serves their endpoint with an in-process echo listener.

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command as ProcessCommand};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use pooler::bridge::transport::{Listener, Stream};
use pooler::{
    Client, ControlAddress, ControlLink, Controller, ControllerConfig, ControllerError,
    ControllerEvent, RemovalReason, SpawnError, StatusReply, TransportKind, WorkerSpawnConfig,
    WorkerSpawner, WorkerStatus,
};

const WAIT: Duration = Duration::from_secs(10);

/// Starts `sleep 30` for every worker and reports `(pid, port)`.
/// The 1-based call `fail_call`, if set, fails instead.
struct RecordingSpawner {
    spawned: mpsc::UnboundedSender<(u32, u16)>,
    calls: AtomicUsize,
    fail_call: Option<usize>,
}

impl WorkerSpawner for RecordingSpawner {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<Child, SpawnError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_call == Some(call) {
            return Err(SpawnError::Spawn(std::io::Error::other("spawn refused")));
        }
        let child = ProcessCommand::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id().ok_or(SpawnError::MissingPid)?;
        let _ = self.spawned.send((pid, config.port));
        Ok(child)
    }
}

struct Harness {
    control: ControlAddress,
    public: ControlAddress,
    handle: pooler::ControllerHandle,
    events: broadcast::Receiver<ControllerEvent>,
    spawned: mpsc::UnboundedReceiver<(u32, u16)>,
    run: JoinHandle<Result<(), ControllerError>>,
}

impl Harness {
    async fn start(dir: &Path, configure: impl FnOnce(ControllerConfig) -> ControllerConfig) -> Self {
        Self::start_failing(dir, None, configure).await
    }

    async fn start_failing(
        dir: &Path,
        fail_call: Option<usize>,
        configure: impl FnOnce(ControllerConfig) -> ControllerConfig,
    ) -> Self {
        let (tx, spawned) = mpsc::unbounded_channel();
        let config = ControllerConfig::new()
            .with_workers(2)
            .with_transport(TransportKind::Unix)
            .with_run_dir(dir)
            .with_public("127.0.0.1", 0)
            .with_grace_period(Duration::from_secs(2))
            .with_spawner(Arc::new(RecordingSpawner {
                spawned: tx,
                calls: AtomicUsize::new(0),
                fail_call,
            }));

        let controller = Controller::bind(configure(config)).await.unwrap();
        let control = controller.control_address().clone();
        let public = controller.public_address().clone();
        let handle = controller.handle();
        let events = handle.subscribe();
        let run = tokio::spawn(controller.run());

        Self {
            control,
            public,
            handle,
            events,
            spawned,
            run,
        }
    }

    async fn next_spawn(&mut self) -> (u32, u16) {
        tokio::time::timeout(WAIT, self.spawned.recv())
            .await
            .expect("timed out waiting for a spawn")
            .expect("spawner dropped")
    }

    async fn next_event(&mut self) -> ControllerEvent {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for a controller event")
            .expect("event stream closed")
    }

    async fn register(&mut self, pid: u32, port: u16) -> ControlLink {
        let mut link = ControlLink::connect(&self.control).await.unwrap();
        link.register(pid, port).await.unwrap();
        assert_eq!(
            self.next_event().await,
            ControllerEvent::WorkerRegistered { pid, port }
        );
        link
    }

    async fn status(&self) -> StatusReply {
        Client::new(self.control.clone()).status().await.unwrap()
    }

    /// Poll status until `check` holds.
    async fn wait_for_status(&self, check: impl Fn(&StatusReply) -> bool) -> StatusReply {
        tokio::time::timeout(WAIT, async {
            loop {
                let status = self.handle.status().await.unwrap();
                if check(&status) {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("status never reached the expected state")
    }

    async fn stop(mut self) {
        let reply = Client::new(self.control.clone()).stop().await.unwrap();
        assert!(reply.stopping);
        tokio::time::timeout(WAIT, self.run)
            .await
            .expect("controller did not stop")
            .unwrap()
            .unwrap();
        loop {
            match self.events.try_recv() {
                Ok(ControllerEvent::Stopped) => break,
                Ok(_) => continue,
                Err(e) => panic!("missing Stopped event: {e:?}"),
            }
        }
    }
}

/// Echo server on the worker endpoint for `port`.
async fn echo_worker(dir: &Path, port: u16) -> JoinHandle<()> {
    let address = ControlAddress::Unix(dir.join(format!("{port}.sock")));
    let listener = Listener::bind(&address).await.unwrap();
    tokio::spawn(async move {
        while let Ok(stream) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = tokio::io::split(stream);
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    })
}

async fn round_trip(public: &ControlAddress, payload: &[u8]) -> Vec<u8> {
    let ControlAddress::Tcp(addr) = public else {
        panic!("public endpoint should be tcp");
    };
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(payload).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut received = Vec::new();
    tokio::time::timeout(WAIT, stream.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    received
}

#[tokio::test]
async fn register_and_unregister_move_active_workers() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::start(dir.path(), |c| c).await;
    let (pid1, port1) = harness.next_spawn().await;
    let (pid2, port2) = harness.next_spawn().await;
    assert_eq!((port1, port2), (5501, 5502));

    let status = harness.status().await;
    assert_eq!(status.active_workers, 0);
    assert_eq!(status.target_workers, 2);
    assert_eq!(status.state, "running");

    let mut link1 = harness.register(pid1, port1).await;
    assert_eq!(harness.status().await.active_workers, 1);

    let _link2 = harness.register(pid2, port2).await;
    assert_eq!(
        harness.next_event().await,
        ControllerEvent::PoolReady {
            ports: vec![5501, 5502]
        }
    );
    let status = harness.status().await;
    assert_eq!(status.active_workers, 2);
    assert!(
        status
            .workers
            .iter()
            .all(|w| w.status == WorkerStatus::Ready)
    );

    link1.unregister(pid1).await.unwrap();
    assert_eq!(
        harness.next_event().await,
        ControllerEvent::WorkerRemoved {
            pid: pid1,
            port: port1,
            reason: RemovalReason::Unregistered
        }
    );
    assert_eq!(harness.status().await.active_workers, 1);

    // The pool is refilled; the unregistered process still holds its port.
    let (pid3, port3) = harness.next_spawn().await;
    assert_eq!(port3, 5503);
    let _link3 = harness.register(pid3, port3).await;
    assert!(matches!(
        harness.next_event().await,
        ControllerEvent::PoolReady { .. }
    ));

    harness.stop().await;
}

#[tokio::test]
async fn pool_ready_fires_once_per_fill() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::start(dir.path(), |c| c.with_workers(1)).await;
    let (pid, port) = harness.next_spawn().await;

    let _link = harness.register(pid, port).await;
    assert_eq!(
        harness.next_event().await,
        ControllerEvent::PoolReady { ports: vec![port] }
    );

    // Registering past the target does not announce readiness again.
    let _extra = harness.register(4_000_000, 6001).await;
    assert!(matches!(
        harness.events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    assert_eq!(harness.status().await.active_workers, 2);

    harness.stop().await;
}

#[tokio::test]
async fn duplicate_registration_is_not_counted() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::start(dir.path(), |c| c.with_workers(1)).await;
    let (pid, port) = harness.next_spawn().await;
    let _link = harness.register(pid, port).await;

    let mut duplicate = ControlLink::connect(&harness.control).await.unwrap();
    duplicate.register(pid + 1, port).await.unwrap();

    let status = harness
        .wait_for_status(|s| s.active_workers == 1)
        .await;
    assert_eq!(status.workers[0].pid, pid);

    harness.stop().await;
}

#[tokio::test]
async fn closed_control_connection_is_a_crash() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::start(dir.path(), |c| c.with_workers(1)).await;
    let (pid, port) = harness.next_spawn().await;

    let link = harness.register(pid, port).await;
    assert!(matches!(
        harness.next_event().await,
        ControllerEvent::PoolReady { .. }
    ));

    drop(link);
    assert_eq!(
        harness.next_event().await,
        ControllerEvent::WorkerRemoved {
            pid,
            port,
            reason: RemovalReason::Crashed
        }
    );

    let (replacement, _) = harness.next_spawn().await;
    assert_ne!(replacement, pid);
    harness
        .wait_for_status(|s| s.active_workers == 0 && s.state == "running")
        .await;

    harness.stop().await;
}

#[tokio::test]
async fn failed_respawn_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::start_failing(dir.path(), Some(2), |c| c.with_workers(1)).await;
    let (pid, port) = harness.next_spawn().await;

    let link = harness.register(pid, port).await;
    assert!(matches!(
        harness.next_event().await,
        ControllerEvent::PoolReady { .. }
    ));

    // The replacement's first spawn attempt fails; a later one must follow.
    drop(link);
    assert!(matches!(
        harness.next_event().await,
        ControllerEvent::WorkerRemoved {
            reason: RemovalReason::Crashed,
            ..
        }
    ));
    let (replacement, replacement_port) = harness.next_spawn().await;
    assert_ne!(replacement, pid);

    let _link = harness.register(replacement, replacement_port).await;
    harness
        .wait_for_status(|s| s.active_workers == 1 && s.target_workers == 1)
        .await;

    harness.stop().await;
}

#[tokio::test]
async fn unknown_command_closes_only_that_connection() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::start(dir.path(), |c| c.with_workers(1)).await;
    let (pid, port) = harness.next_spawn().await;
    let _link = harness.register(pid, port).await;

    let mut raw = Stream::connect(&harness.control).await.unwrap();
    raw.write_all(b"{\"cmd\":\"dance\"}\n").await.unwrap();
    let mut reply = Vec::new();
    tokio::time::timeout(WAIT, raw.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert!(reply.is_empty());

    assert_eq!(harness.status().await.active_workers, 1);
    harness.stop().await;
}

#[tokio::test]
async fn inbound_connection_is_proxied_to_ready_worker() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::start(dir.path(), |c| c.with_workers(1)).await;
    let (pid, port) = harness.next_spawn().await;
    let _echo = echo_worker(dir.path(), port).await;
    let _link = harness.register(pid, port).await;

    let received = round_trip(&harness.public, b"GET / HTTP/1.0\r\n\r\n").await;
    assert_eq!(received, b"GET / HTTP/1.0\r\n\r\n");

    let status = harness
        .wait_for_status(|s| s.workers.first().is_some_and(|w| w.status == WorkerStatus::Ready))
        .await;
    assert_eq!(status.routed_connections, 1);
    assert_eq!(status.workers[0].requests, 1);

    harness.stop().await;
}

#[tokio::test]
async fn waiting_connection_is_routed_once_a_worker_registers() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::start(dir.path(), |c| c.with_workers(1)).await;
    let (pid, port) = harness.next_spawn().await;
    let _echo = echo_worker(dir.path(), port).await;

    let public = harness.public.clone();
    let client = tokio::spawn(async move { round_trip(&public, b"queued").await });
    harness
        .wait_for_status(|s| s.pending_connections == 1)
        .await;

    let _link = harness.register(pid, port).await;
    let received = tokio::time::timeout(WAIT, client).await.unwrap().unwrap();
    assert_eq!(received, b"queued");

    harness.stop().await;
}

#[tokio::test]
async fn waiting_connection_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::start(dir.path(), |c| {
        c.with_workers(1)
            .with_route_timeout(Duration::from_millis(100))
    })
    .await;
    harness.next_spawn().await;

    let ControlAddress::Tcp(addr) = harness.public.clone() else {
        panic!("public endpoint should be tcp");
    };
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut received = Vec::new();
    let read = tokio::time::timeout(WAIT, stream.read_to_end(&mut received))
        .await
        .unwrap();
    assert!(read.is_err() || received.is_empty());

    let status = harness
        .wait_for_status(|s| s.pending_connections == 0)
        .await;
    assert_eq!(status.routed_connections, 0);

    harness.stop().await;
}

#[tokio::test]
async fn request_strategy_recycles_worker_at_max_requests() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::start(dir.path(), |c| {
        c.with_workers(1)
            .with_restart_strategy("request")
            .unwrap()
            .with_max_requests(2)
    })
    .await;
    let (pid, port) = harness.next_spawn().await;
    let _echo = echo_worker(dir.path(), port).await;
    let _link = harness.register(pid, port).await;
    assert!(matches!(
        harness.next_event().await,
        ControllerEvent::PoolReady { .. }
    ));

    assert_eq!(round_trip(&harness.public, b"one").await, b"one");
    assert_eq!(round_trip(&harness.public, b"two").await, b"two");

    assert_eq!(
        harness.next_event().await,
        ControllerEvent::WorkerRemoved {
            pid,
            port,
            reason: RemovalReason::MaxRequests
        }
    );
    let (replacement, _) = harness.next_spawn().await;
    assert_ne!(replacement, pid);

    harness.stop().await;
}

#[tokio::test]
async fn expire_strategy_restarts_worker_after_ttl() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::start(dir.path(), |c| {
        c.with_workers(1)
            .with_restart_strategy("expire")
            .unwrap()
            .with_ttl(Duration::from_secs(1))
    })
    .await;
    let (pid, port) = harness.next_spawn().await;
    let _link = harness.register(pid, port).await;
    assert!(matches!(
        harness.next_event().await,
        ControllerEvent::PoolReady { .. }
    ));

    // Jitter puts the restart within [1s, 6s].
    assert_eq!(
        harness.next_event().await,
        ControllerEvent::WorkerRemoved {
            pid,
            port,
            reason: RemovalReason::Expired
        }
    );
    harness.next_spawn().await;

    harness.stop().await;
}

#[tokio::test]
async fn stop_closes_endpoints_and_stops_controller() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::start(dir.path(), |c| c.with_workers(2)).await;
    let (pid, port) = harness.next_spawn().await;
    harness.next_spawn().await;
    let _link = harness.register(pid, port).await;

    let control = harness.control.clone();
    harness.stop().await;

    let ControlAddress::Unix(path) = &control else {
        panic!("control endpoint should be a unix socket");
    };
    assert!(!path.exists(), "control socket should be removed");
    assert!(Stream::connect(&control).await.is_err());
}
