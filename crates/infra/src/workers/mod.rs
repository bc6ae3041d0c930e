//! Worker roles: one thread per role instance, each pulling from its own
//! durable consumer group.
//!
//! Horizontal scaling is by adding consumers, not by sharding logic: every
//! handler is idempotent against the state store, so any instance may
//! process any delivery, including redelivered ones.

use std::sync::mpsc;
use std::thread;

use thiserror::Error;

use crate::store::StoreError;

pub mod coordinator;
pub mod export_worker;
pub mod source_worker;

pub use coordinator::{CoordinatorConfig, CoordinatorError, JobCoordinator};
pub use export_worker::{ExportWorker, ExportWorkerConfig};
pub use source_worker::{SourceWorker, SourceWorkerConfig};

/// Deliveries that keep failing are dropped after this many attempts so a
/// poison message cannot wedge a consumer group.
pub(crate) const MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// Worker-side failure. Store errors are transient from the worker's point
/// of view: the delivery is nak'd and retried.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("event publish failed: {0}")]
    Publish(String),
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(shutdown: mpsc::Sender<()>, join: thread::JoinHandle<()>) -> Self {
        Self {
            shutdown,
            join: Some(join),
        }
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
