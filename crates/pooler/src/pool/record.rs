//! WorkerRecord - one registered worker process.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bridge::protocol::WorkerSnapshot;

/// Availability of a worker.
///
/// Transitions: `CREATED → REGISTERED → READY ⇄ BUSY`, and any live state
/// `→ CLOSED`. `REGISTERED` is never skipped and `CLOSED` is final.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    /// Spawned, control connection not seen yet
    #[default]
    Created,
    /// Control connection seen, not yet idle
    Registered,
    /// Idle, eligible for routing
    Ready,
    /// Serving a proxied connection
    Busy,
    /// Removed or terminated
    Closed,
}

impl WorkerStatus {
    pub fn can_transition_to(self, next: WorkerStatus) -> bool {
        use WorkerStatus::*;
        matches!(
            (self, next),
            (Created, Registered)
                | (Registered, Ready)
                | (Ready, Busy)
                | (Busy, Ready)
                | (Created | Registered | Ready | Busy, Closed)
        )
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Created => "CREATED",
            WorkerStatus::Registered => "REGISTERED",
            WorkerStatus::Ready => "READY",
            WorkerStatus::Busy => "BUSY",
            WorkerStatus::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("worker {port}: invalid status transition {from} -> {to}")]
pub struct StatusError {
    pub port: u16,
    pub from: WorkerStatus,
    pub to: WorkerStatus,
}

/// Identity of a worker: its OS pid and the port it serves on.
///
/// Ports are reused after a worker goes away, so anything that outlives a
/// record (timers, proxied connections) carries both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerKey {
    pub pid: u32,
    pub port: u16,
}

impl std::fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pid, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pid: u32,
    port: u16,
    status: WorkerStatus,
    ttl: Option<Duration>,
    requests: u64,
    registered_at: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn new(pid: u32, port: u16) -> Self {
        Self {
            pid,
            port,
            status: WorkerStatus::Created,
            ttl: None,
            requests: 0,
            registered_at: Utc::now(),
        }
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn key(&self) -> WorkerKey {
        WorkerKey {
            pid: self.pid,
            port: self.port,
        }
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn requests(&self) -> u64 {
        self.requests
    }

    pub fn is_ready(&self) -> bool {
        self.status == WorkerStatus::Ready
    }

    pub fn transition(&mut self, next: WorkerStatus) -> Result<(), StatusError> {
        if !self.status.can_transition_to(next) {
            return Err(StatusError {
                port: self.port,
                from: self.status,
                to: next,
            });
        }
        tracing::trace!(pid = self.pid, port = self.port, from = %self.status, to = %next, "Worker status");
        self.status = next;
        Ok(())
    }

    /// Record the control connection: `CREATED → REGISTERED → READY`.
    pub fn register(&mut self) -> Result<(), StatusError> {
        self.transition(WorkerStatus::Registered)?;
        self.registered_at = Utc::now();
        self.transition(WorkerStatus::Ready)
    }

    /// Hand the worker a connection: `READY → BUSY`, counting the request.
    pub fn acquire(&mut self) -> Result<(), StatusError> {
        self.transition(WorkerStatus::Busy)?;
        self.requests += 1;
        Ok(())
    }

    /// Undo an [`acquire`](Self::acquire) whose connection never reached the worker.
    pub fn cancel_acquire(&mut self) -> Result<(), StatusError> {
        self.transition(WorkerStatus::Ready)?;
        self.requests = self.requests.saturating_sub(1);
        Ok(())
    }

    /// Proxied connection finished: `BUSY → READY`.
    pub fn release(&mut self) -> Result<(), StatusError> {
        self.transition(WorkerStatus::Ready)
    }

    pub fn close(&mut self) {
        self.status = WorkerStatus::Closed;
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            pid: self.pid,
            port: self.port,
            status: self.status,
            requests: self.requests,
            registered_at: self.registered_at.to_rfc3339(),
        }
    }
}
