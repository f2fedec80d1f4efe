//! Controller configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::transport::{DEFAULT_CONTROL_PORT, DEFAULT_RUN_DIR, Endpoints, TransportKind};
use crate::pool::RestartStrategy;
use crate::spawner::{CommandSpawner, WorkerSpawner};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid restart strategy. Expected request or expire but {0} given")]
    InvalidRestartStrategy(String),
    #[error("worker count must be at least 1")]
    NoWorkers,
    #[error("the expire restart strategy requires a ttl")]
    MissingTtl,
    #[error("the request restart strategy requires max requests of at least 1")]
    MissingMaxRequests,
}

pub struct ControllerConfig {
    /// Number of workers the pool is kept at.
    pub workers: usize,
    /// Public endpoint accepting proxied traffic.
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    pub run_dir: PathBuf,
    /// Control endpoint port, only used by the TCP transport.
    pub control_port: u16,
    /// First port handed to spawned workers.
    pub worker_base_port: u16,
    pub restart_strategy: RestartStrategy,
    /// Worker lifetime under the `expire` strategy.
    pub ttl: Option<Duration>,
    /// Connections a worker serves before being recycled under `request`.
    pub max_requests: u64,
    /// How long an inbound connection may wait for a READY worker.
    pub route_timeout: Duration,
    /// Inbound connections allowed to wait at once; more are closed immediately.
    pub max_pending: usize,
    /// SIGTERM → SIGKILL delay when terminating a worker.
    pub grace_period: Duration,
    /// Upper bound for a stop to complete.
    pub drain_timeout: Duration,
    /// Environment tag passed to workers.
    pub app_env: Option<String>,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerConfig {
    pub fn new() -> Self {
        Self {
            workers: 8,
            host: "127.0.0.1".to_string(),
            port: 8080,
            transport: TransportKind::default(),
            run_dir: PathBuf::from(DEFAULT_RUN_DIR),
            control_port: DEFAULT_CONTROL_PORT,
            worker_base_port: 5501,
            restart_strategy: RestartStrategy::None,
            ttl: None,
            max_requests: 1000,
            route_timeout: Duration::from_secs(30),
            max_pending: 1024,
            grace_period: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(30),
            app_env: None,
            spawner: Arc::new(CommandSpawner::current_exe()),
        }
    }

    pub fn with_workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn with_public(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_run_dir(mut self, run_dir: impl Into<PathBuf>) -> Self {
        self.run_dir = run_dir.into();
        self
    }

    pub fn with_control_port(mut self, port: u16) -> Self {
        self.control_port = port;
        self
    }

    pub fn with_worker_base_port(mut self, port: u16) -> Self {
        self.worker_base_port = port;
        self
    }

    /// Set the restart strategy from its configuration value.
    pub fn with_restart_strategy(mut self, value: &str) -> Result<Self, ConfigError> {
        self.restart_strategy = value.parse()?;
        Ok(self)
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_max_requests(mut self, n: u64) -> Self {
        self.max_requests = n;
        self
    }

    pub fn with_route_timeout(mut self, timeout: Duration) -> Self {
        self.route_timeout = timeout;
        self
    }

    pub fn with_max_pending(mut self, n: usize) -> Self {
        self.max_pending = n;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_app_env(mut self, app_env: Option<String>) -> Self {
        self.app_env = app_env;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints::new(self.transport, &self.run_dir, self.control_port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        match self.restart_strategy {
            RestartStrategy::Expire if self.ttl.is_none() => Err(ConfigError::MissingTtl),
            RestartStrategy::Request if self.max_requests == 0 => {
                Err(ConfigError::MissingMaxRequests)
            }
            _ => Ok(()),
        }
    }
}
