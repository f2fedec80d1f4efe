//! pooler: supervises a pool of worker processes and proxies inbound
//! connections to them.

mod version;

pub mod bridge;
pub mod client;
pub mod config;
pub mod controller;
pub mod logging;
pub mod pool;
pub mod proxy;
pub mod shutdown;
pub mod spawner;
pub mod worker;

pub use bridge::protocol::{Command, CommandKind, ProtocolError, StatusReply, StopReply};
pub use bridge::transport::{ControlAddress, Endpoints, TransportKind};
pub use client::{Client, ClientError};
pub use config::{ConfigError, ControllerConfig};
pub use controller::{
    Controller, ControllerError, ControllerEvent, ControllerHandle, ControllerState, RemovalReason,
};
pub use pool::{RestartStrategy, WorkerPool, WorkerRecord, WorkerStatus};
pub use spawner::{CommandSpawner, SpawnError, WorkerSpawnConfig, WorkerSpawner};
pub use version::POOLER_VERSION;
pub use worker::{ConnectionHandler, ControlLink, EchoHandler, WorkerConfig, run_worker};
