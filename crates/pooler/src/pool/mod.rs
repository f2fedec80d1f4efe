//! Worker pool: registered workers, their status, and restart timers.
//!
//! The pool is owned by the controller's event loop and only mutated there,
//! so it needs no locking. Status moves through a checked state machine:
//! - `CREATED → REGISTERED → READY` on registration
//! - `READY ⇄ BUSY` while routing connections
//! - any live state `→ CLOSED` on removal

mod record;
mod table;
mod timer;

pub use record::{StatusError, WorkerKey, WorkerRecord, WorkerStatus};
pub use table::{DEFAULT_TTL, PoolError, RestartStrategy, WorkerPool};
pub use timer::{ExpiryTimers, RestartTimers, restart_delay};
