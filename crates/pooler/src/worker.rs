//! Worker process runtime - the child side of the controller protocol.
//!
//! A worker listens on the endpoint the controller assigned it, registers
//! over the control channel, and serves proxied connections through a
//! [`ConnectionHandler`]. On SIGINT/SIGTERM, or when the controller goes
//! away, it sends `unregister`, stops accepting and drains in-flight
//! connections before returning.

use std::io;
use std::sync::Arc;

use futures::SinkExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinSet;
use tokio_util::codec::FramedWrite;

use crate::bridge::codec::JsonLinesCodec;
use crate::bridge::protocol::Command;
use crate::bridge::transport::{
    ControlAddress, Listener, Stream, TransportError, connect_with_retry,
};
use crate::shutdown::shutdown_signal;
use crate::spawner::{ENV_APP_ENV, ENV_CONTROLLER, ENV_WORKER_ENDPOINT, ENV_WORKER_PORT};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("{0} is not set")]
    MissingEnv(&'static str),
    #[error("invalid {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("control channel error: {0}")]
    Io(#[from] io::Error),
}

/// Serves one proxied connection.
#[async_trait::async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, stream: Stream) -> io::Result<()>;
}

/// Writes back every byte it reads until the peer closes its side.
pub struct EchoHandler;

#[async_trait::async_trait]
impl ConnectionHandler for EchoHandler {
    async fn handle(&self, stream: Stream) -> io::Result<()> {
        let (mut reader, mut writer) = tokio::io::split(stream);
        tokio::io::copy(&mut reader, &mut writer).await?;
        writer.shutdown().await
    }
}

/// What a spawned worker learns from its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub port: u16,
    pub controller: ControlAddress,
    pub endpoint: ControlAddress,
    pub app_env: Option<String>,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, WorkerError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, WorkerError> {
        let required = |name: &'static str| lookup(name).ok_or(WorkerError::MissingEnv(name));
        let invalid = |name: &'static str, value: String| WorkerError::InvalidEnv { name, value };

        let port = required(ENV_WORKER_PORT)?;
        let port = port
            .parse()
            .map_err(|_| invalid(ENV_WORKER_PORT, port.clone()))?;

        let controller = required(ENV_CONTROLLER)?;
        let controller = controller
            .parse()
            .map_err(|_| invalid(ENV_CONTROLLER, controller.clone()))?;

        let endpoint = required(ENV_WORKER_ENDPOINT)?;
        let endpoint = endpoint
            .parse()
            .map_err(|_| invalid(ENV_WORKER_ENDPOINT, endpoint.clone()))?;

        Ok(Self {
            port,
            controller,
            endpoint,
            app_env: lookup(ENV_APP_ENV),
        })
    }
}

/// A worker's control connection to the controller.
pub struct ControlLink {
    reader: ReadHalf<Stream>,
    writer: FramedWrite<WriteHalf<Stream>, JsonLinesCodec<Command>>,
}

impl ControlLink {
    pub async fn connect(address: &ControlAddress) -> Result<Self, WorkerError> {
        let stream = connect_with_retry(address).await?;
        let (reader, writer) = tokio::io::split(stream);
        Ok(Self {
            reader,
            writer: FramedWrite::new(writer, JsonLinesCodec::new()),
        })
    }

    pub async fn send(&mut self, command: Command) -> io::Result<()> {
        self.writer.send(command).await
    }

    pub async fn register(&mut self, pid: u32, port: u16) -> io::Result<()> {
        self.send(Command::Register { pid, port }).await
    }

    pub async fn unregister(&mut self, pid: u32) -> io::Result<()> {
        self.send(Command::Unregister { pid }).await
    }

    /// Resolves when the controller closes its side.
    pub async fn closed(&mut self) {
        let mut buf = [0u8; 256];
        loop {
            match self.reader.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }

    pub async fn close(mut self) -> io::Result<()> {
        self.writer.close().await
    }
}

/// Run a worker until signalled or disconnected from the controller.
pub async fn run_worker<H: ConnectionHandler>(
    handler: H,
    config: WorkerConfig,
) -> Result<(), WorkerError> {
    let handler = Arc::new(handler);
    let pid = std::process::id();

    let listener = Listener::bind(&config.endpoint).await?;
    let mut link = ControlLink::connect(&config.controller).await?;
    link.register(pid, config.port).await?;
    tracing::info!(
        pid,
        port = config.port,
        endpoint = %config.endpoint,
        app_env = config.app_env.as_deref().unwrap_or(""),
        "Worker registered"
    );

    let mut connections = JoinSet::new();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    let handler = Arc::clone(&handler);
                    connections.spawn(async move {
                        if let Err(e) = handler.handle(stream).await {
                            tracing::debug!(error = %e, "Connection handler failed");
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "Failed to accept connection"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = &mut shutdown => break,
            _ = link.closed() => {
                tracing::warn!("Controller connection lost");
                break;
            }
        }
    }

    drop(listener);
    if let Err(e) = link.unregister(pid).await {
        tracing::debug!(pid, error = %e, "Failed to send unregister");
    }
    let _ = link.close().await;

    let in_flight = connections.len();
    if in_flight > 0 {
        tracing::info!(in_flight, "Draining connections");
    }
    while connections.join_next().await.is_some() {}

    tracing::info!(pid, port = config.port, "Worker stopped");
    Ok(())
}
