//! Worker process spawning and supervision.
//!
//! The controller never shares memory with a worker: it spawns an independent
//! process from a command descriptor, keeps the pid and assigned port, and
//! waits for the worker's own `register` on the control channel. Each child is
//! owned by a wait task that reaps it and, on request, terminates it with
//! SIGTERM followed by SIGKILL after a grace period.

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::oneshot;

use crate::bridge::transport::ControlAddress;

/// Port the worker must serve proxied traffic on.
pub const ENV_WORKER_PORT: &str = "POOLER_WORKER_PORT";
/// Control endpoint to register with.
pub const ENV_CONTROLLER: &str = "POOLER_CONTROLLER";
/// Address the worker must listen on for proxied traffic.
pub const ENV_WORKER_ENDPOINT: &str = "POOLER_WORKER_ENDPOINT";
/// Application environment tag, only set when configured.
pub const ENV_APP_ENV: &str = "POOLER_APP_ENV";

#[derive(Debug, Clone)]
pub struct WorkerSpawnConfig {
    pub port: u16,
    pub controller: ControlAddress,
    pub endpoint: ControlAddress,
    pub app_env: Option<String>,
}

impl WorkerSpawnConfig {
    /// Environment a spawned worker reads its contract from.
    pub fn envs(&self) -> Vec<(&'static str, String)> {
        let mut envs = vec![
            (ENV_WORKER_PORT, self.port.to_string()),
            (ENV_CONTROLLER, self.controller.to_string()),
            (ENV_WORKER_ENDPOINT, self.endpoint.to_string()),
        ];
        if let Some(app_env) = &self.app_env {
            envs.push((ENV_APP_ENV, app_env.clone()));
        }
        envs
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawned process has no pid")]
    MissingPid,
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<Child, SpawnError>;
}

/// Spawns `program args...` with the worker environment set.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `<this executable> worker`, the built-in worker runtime.
    pub fn current_exe() -> Self {
        let program = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("pooler"));
        Self::new(program, vec!["worker".to_string()])
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<Child, SpawnError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .envs(config.envs())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

/// Reaped worker process.
#[derive(Debug)]
pub struct ProcessExit {
    pub pid: u32,
    pub port: u16,
    pub status: io::Result<ExitStatus>,
}

/// Controller-side handle to a spawned worker process.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    port: u16,
    terminate: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    /// Take ownership of `child` and build the future that reaps it.
    ///
    /// The returned future resolves once the process has exited, either on its
    /// own or after [`terminate`](Self::terminate). Dropping the handle does not
    /// stop the process.
    pub fn supervise(
        child: Child,
        port: u16,
        grace: Duration,
    ) -> Result<(Self, impl Future<Output = ProcessExit> + Send + 'static), SpawnError> {
        let pid = child.id().ok_or(SpawnError::MissingPid)?;
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let handle = Self {
            pid,
            port,
            terminate: Some(terminate_tx),
        };
        let exit = async move {
            let status = wait_for_exit(child, pid, grace, terminate_rx).await;
            ProcessExit { pid, port, status }
        };
        Ok((handle, exit))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Ask the process to stop. Only the first call has an effect.
    pub fn terminate(&mut self) {
        if let Some(tx) = self.terminate.take() {
            tracing::debug!(pid = self.pid, port = self.port, "Terminating worker process");
            let _ = tx.send(());
        }
    }

    pub fn is_terminating(&self) -> bool {
        self.terminate.is_none()
    }
}

async fn wait_for_exit(
    mut child: Child,
    pid: u32,
    grace: Duration,
    mut terminate_rx: oneshot::Receiver<()>,
) -> io::Result<ExitStatus> {
    tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut terminate_rx => terminate_gracefully(&mut child, pid, grace).await,
    }
}

async fn terminate_gracefully(
    child: &mut Child,
    pid: u32,
    grace: Duration,
) -> io::Result<ExitStatus> {
    request_stop(child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(pid, grace_secs = grace.as_secs_f64(), "Worker ignored SIGTERM, killing");
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn request_stop(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "Failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "Failed to kill worker process");
    }
}
