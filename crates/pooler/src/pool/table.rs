//! Ordered worker table with restart-timer bookkeeping.
//!
//! Insertion order is selection order: [`WorkerPool::find_ready_worker`]
//! returns the first READY worker, nothing fancier.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use indexmap::IndexMap;

use super::record::{WorkerKey, WorkerRecord};
use super::timer::{RestartTimers, restart_delay};
use crate::config::ConfigError;

/// TTL used for `expire` when a record carries none.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// When workers are proactively recycled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestartStrategy {
    /// Workers live until they exit or crash.
    #[default]
    None,
    /// Recycled after serving a number of connections (counted by the controller).
    Request,
    /// Recycled when a TTL timer fires.
    Expire,
}

impl RestartStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            RestartStrategy::None => "none",
            RestartStrategy::Request => "request",
            RestartStrategy::Expire => "expire",
        }
    }
}

impl FromStr for RestartStrategy {
    type Err = ConfigError;

    /// Only the configurable strategies parse; `none` is the default, not a value.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "request" => Ok(RestartStrategy::Request),
            "expire" => Ok(RestartStrategy::Expire),
            other => Err(ConfigError::InvalidRestartStrategy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("port {port} is already served by worker {pid}")]
    PortTaken { port: u16, pid: u32 },
}

pub struct WorkerPool<T: RestartTimers> {
    workers: IndexMap<u16, WorkerRecord>,
    timers: HashMap<u16, T::Timer>,
    strategy: RestartStrategy,
    scheduler: T,
}

impl<T: RestartTimers> WorkerPool<T> {
    pub fn new(scheduler: T) -> Self {
        Self {
            workers: IndexMap::new(),
            timers: HashMap::new(),
            strategy: RestartStrategy::None,
            scheduler,
        }
    }

    pub fn strategy(&self) -> RestartStrategy {
        self.strategy
    }

    /// Parse and apply a restart strategy (`request` or `expire`).
    ///
    /// Fails immediately, naming the value, for anything else.
    pub fn set_restart_strategy(&mut self, value: &str) -> Result<(), ConfigError> {
        let strategy = value.parse()?;
        self.apply_strategy(strategy);
        Ok(())
    }

    /// Switch strategy, keeping "a timer exists iff expire and present" true for
    /// workers already in the pool.
    pub fn apply_strategy(&mut self, strategy: RestartStrategy) {
        if strategy == self.strategy {
            return;
        }
        self.strategy = strategy;

        if strategy == RestartStrategy::Expire {
            let keys: Vec<WorkerKey> = self.workers.values().map(WorkerRecord::key).collect();
            for key in keys {
                self.schedule(key);
            }
        } else {
            for (_, timer) in self.timers.drain() {
                self.scheduler.cancel_timer(timer);
            }
        }
    }

    fn schedule(&mut self, key: WorkerKey) {
        let ttl = self
            .workers
            .get(&key.port)
            .and_then(WorkerRecord::ttl)
            .unwrap_or(DEFAULT_TTL);
        let timer = self.scheduler.add_timer(restart_delay(ttl), key);
        if let Some(previous) = self.timers.insert(key.port, timer) {
            self.scheduler.cancel_timer(previous);
        }
    }

    /// Append a worker. Under `expire`, schedules its restart timer.
    pub fn add(&mut self, record: WorkerRecord) -> Result<(), PoolError> {
        if let Some(existing) = self.workers.get(&record.port()) {
            return Err(PoolError::PortTaken {
                port: record.port(),
                pid: existing.pid(),
            });
        }

        let key = record.key();
        self.workers.insert(key.port, record);

        if self.strategy == RestartStrategy::Expire {
            self.schedule(key);
        }
        Ok(())
    }

    /// Remove the worker on `port`, cancelling its timer if it has one.
    pub fn remove(&mut self, port: u16) -> Option<WorkerRecord> {
        let mut record = self.workers.shift_remove(&port)?;
        if let Some(timer) = self.timers.remove(&port) {
            self.scheduler.cancel_timer(timer);
        }
        record.close();
        Some(record)
    }

    pub fn remove_by_pid(&mut self, pid: u32) -> Option<WorkerRecord> {
        let port = self.find_by_pid(pid)?.port();
        self.remove(port)
    }

    /// First READY worker in insertion order.
    pub fn find_ready_worker(&self) -> Option<&WorkerRecord> {
        self.workers.values().find(|w| w.is_ready())
    }

    pub fn find_ready_worker_mut(&mut self) -> Option<&mut WorkerRecord> {
        self.workers.values_mut().find(|w| w.is_ready())
    }

    pub fn find_by_pid(&self, pid: u32) -> Option<&WorkerRecord> {
        self.workers.values().find(|w| w.pid() == pid)
    }

    /// Lookup that also checks the pid, so a reused port never matches a stale key.
    pub fn get_key_mut(&mut self, key: WorkerKey) -> Option<&mut WorkerRecord> {
        self.workers.get_mut(&key.port).filter(|w| w.pid() == key.pid)
    }

    pub fn contains_key(&self, key: WorkerKey) -> bool {
        self.workers.get(&key.port).is_some_and(|w| w.pid() == key.pid)
    }

    pub fn contains_port(&self, port: u16) -> bool {
        self.workers.contains_key(&port)
    }

    pub fn has_timer(&self, port: u16) -> bool {
        self.timers.contains_key(&port)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values()
    }

    pub fn ports(&self) -> Vec<u16> {
        self.workers.keys().copied().collect()
    }

    /// Remove every worker, cancelling all timers.
    pub fn clear(&mut self) -> Vec<WorkerRecord> {
        let ports = self.ports();
        ports.into_iter().filter_map(|port| self.remove(port)).collect()
    }

    pub fn timers(&self) -> &T {
        &self.scheduler
    }
}
