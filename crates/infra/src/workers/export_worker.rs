//! Export worker — consumes delivery work items and runs the
//! duplicate-check-then-deliver protocol.
//!
//! Each (invoice, export) pair is an independent transaction: a failure
//! here never blocks sibling deliveries of the same invoice to other
//! exports.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use fakturenn_domain::{ExportHistory, ExportStatus};
use fakturenn_events::bus::{BusRecvError, BusSubscription, EventBus};
use fakturenn_events::message::{
    subjects, ExportCompleted, ExportExecute, ExportFailed, OrchestrationEvent,
};

use crate::collaborators::{Delivery, LedgerLookup, NoLedger};
use crate::exporters;
use crate::store::StateStore;

use super::{WorkerError, WorkerHandle, MAX_DELIVERY_ATTEMPTS};

/// Export worker configuration.
#[derive(Debug, Clone)]
pub struct ExportWorkerConfig {
    pub name: String,
    /// Durable consumer group shared by the export worker pool.
    pub group: String,
    /// Receive timeout per loop iteration.
    pub tick: Duration,
}

impl Default for ExportWorkerConfig {
    fn default() -> Self {
        Self {
            name: "export-worker".to_string(),
            group: "export-workers".to_string(),
            tick: Duration::from_millis(250),
        }
    }
}

impl ExportWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

pub struct ExportWorker<S, B, D, L> {
    store: S,
    bus: B,
    delivery: D,
    ledger: L,
}

impl<S, B, D> ExportWorker<S, B, D, NoLedger>
where
    S: StateStore,
    B: EventBus<OrchestrationEvent>,
    D: Delivery,
{
    /// Worker for destinations with no server-side duplicate lookup.
    pub fn without_ledger(store: S, bus: B, delivery: D) -> Self {
        Self::new(store, bus, delivery, NoLedger)
    }
}

impl<S, B, D, L> ExportWorker<S, B, D, L>
where
    S: StateStore,
    B: EventBus<OrchestrationEvent>,
    D: Delivery,
    L: LedgerLookup,
{
    pub fn new(store: S, bus: B, delivery: D, ledger: L) -> Self {
        Self {
            store,
            bus,
            delivery,
            ledger,
        }
    }

    fn publish(&self, event: OrchestrationEvent) -> Result<(), WorkerError> {
        let subject = event.subject();
        self.bus
            .publish(subject, event)
            .map_err(|e| WorkerError::Publish(format!("{subject}: {e:?}")))
    }

    /// Process one delivery work item, always leaving one history row.
    pub fn handle(&self, event: &ExportExecute) -> Result<(), WorkerError> {
        let now = Utc::now();

        let export = match self.store.export(event.export_id)? {
            Some(export) if export.active => export,
            _ => {
                // Still leaves an audit row so the job's delivery fan-in
                // stays exact.
                let error = format!("export {} not found or inactive", event.export_id);
                warn!(job_id = %event.job_id, export_id = %event.export_id, "{error}");
                self.store.record_history(ExportHistory::failed(
                    event.job_id,
                    event.export_id,
                    None,
                    None,
                    &event.invoice,
                    error.clone(),
                    now,
                ))?;
                return self.publish(
                    ExportFailed {
                        job_id: event.job_id,
                        export_id: event.export_id,
                        error,
                    }
                    .into(),
                );
            }
        };

        let outcome = exporters::execute(
            &self.store,
            &self.delivery,
            &self.ledger,
            event.job_id,
            &export,
            &event.invoice,
            now,
        )?;

        match outcome.status {
            ExportStatus::Success => self.publish(
                ExportCompleted {
                    job_id: event.job_id,
                    export_id: export.id,
                    external_reference: outcome.external_reference,
                    skipped: false,
                }
                .into(),
            ),
            ExportStatus::DuplicateSkipped => self.publish(
                ExportCompleted {
                    job_id: event.job_id,
                    export_id: export.id,
                    external_reference: outcome.external_reference,
                    skipped: true,
                }
                .into(),
            ),
            ExportStatus::Failed => self.publish(
                ExportFailed {
                    job_id: event.job_id,
                    export_id: export.id,
                    error: outcome
                        .error_message
                        .unwrap_or_else(|| "delivery failed".to_string()),
                }
                .into(),
            ),
        }
    }

    /// Spawn the consumer loop in a background thread.
    pub fn spawn(self, config: ExportWorkerConfig) -> WorkerHandle
    where
        S: 'static,
        B: 'static,
        D: 'static,
        L: 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let subscription = self.bus.subscribe(subjects::EXPORT_EXECUTE, &config.group);

        let name = config.name.clone();
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(self, config, subscription, shutdown_rx))
            .expect("failed to spawn export worker thread");

        WorkerHandle::new(shutdown_tx, join)
    }
}

fn worker_loop<S, B, D, L>(
    worker: ExportWorker<S, B, D, L>,
    config: ExportWorkerConfig,
    subscription: B::Subscription,
    shutdown_rx: mpsc::Receiver<()>,
) where
    S: StateStore,
    B: EventBus<OrchestrationEvent>,
    D: Delivery,
    L: LedgerLookup,
{
    info!(worker = %config.name, "export worker started");

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match subscription.recv_timeout(config.tick) {
            Ok(delivery) => {
                let event = match delivery.message() {
                    OrchestrationEvent::ExportExecute(e) => e.clone(),
                    other => {
                        warn!(worker = %config.name, subject = other.subject(), "unexpected event on export.execute");
                        delivery.ack();
                        continue;
                    }
                };
                match worker.handle(&event) {
                    Ok(()) => delivery.ack(),
                    Err(err) if delivery.attempt() >= MAX_DELIVERY_ATTEMPTS => {
                        warn!(
                            worker = %config.name,
                            job_id = %event.job_id,
                            export_id = %event.export_id,
                            attempt = delivery.attempt(),
                            error = %err,
                            "dropping delivery after repeated failures"
                        );
                        delivery.ack();
                    }
                    Err(err) => {
                        warn!(
                            worker = %config.name,
                            job_id = %event.job_id,
                            export_id = %event.export_id,
                            error = %err,
                            "export handler failed; delivery will be retried"
                        );
                        delivery.nak();
                    }
                }
            }
            Err(BusRecvError::Timeout) => continue,
            Err(BusRecvError::Closed) => break,
        }
    }

    info!(worker = %config.name, "export worker stopped");
}
