//! Source worker — consumes extraction work items, calls the extractor,
//! emits delivery work items.
//!
//! Holds no dedup state of its own: redelivery of the same `SourceExecute`
//! re-dispatches the same invoices, and export workers suppress the
//! duplicates.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use fakturenn_domain::plan_export_work;
use fakturenn_events::bus::{BusRecvError, BusSubscription, EventBus};
use fakturenn_events::message::{
    subjects, ExportExecute, OrchestrationEvent, SourceCompleted, SourceExecute, SourceFailed,
};

use crate::collaborators::Extractor;
use crate::store::StateStore;

use super::{WorkerError, WorkerHandle, MAX_DELIVERY_ATTEMPTS};

/// Source worker configuration.
#[derive(Debug, Clone)]
pub struct SourceWorkerConfig {
    pub name: String,
    /// Durable consumer group shared by the source worker pool.
    pub group: String,
    /// Receive timeout per loop iteration.
    pub tick: Duration,
}

impl Default for SourceWorkerConfig {
    fn default() -> Self {
        Self {
            name: "source-worker".to_string(),
            group: "source-workers".to_string(),
            tick: Duration::from_millis(250),
        }
    }
}

impl SourceWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

pub struct SourceWorker<S, B, X> {
    store: S,
    bus: B,
    extractor: X,
}

impl<S, B, X> SourceWorker<S, B, X>
where
    S: StateStore,
    B: EventBus<OrchestrationEvent>,
    X: Extractor,
{
    pub fn new(store: S, bus: B, extractor: X) -> Self {
        Self {
            store,
            bus,
            extractor,
        }
    }

    fn publish(&self, event: OrchestrationEvent) -> Result<(), WorkerError> {
        let subject = event.subject();
        self.bus
            .publish(subject, event)
            .map_err(|e| WorkerError::Publish(format!("{subject}: {e:?}")))
    }

    /// Process one extraction work item.
    ///
    /// Ends with exactly one completion signal: `SourceCompleted` carrying
    /// the invoice and export dispatch counts, or `SourceFailed` on an
    /// unrecoverable extraction error.
    pub fn handle(&self, event: &SourceExecute) -> Result<(), WorkerError> {
        let source = match self.store.source(event.source_id)? {
            Some(source) if source.active => source,
            _ => {
                warn!(
                    job_id = %event.job_id,
                    source_id = %event.source_id,
                    "source missing or inactive at execution time"
                );
                return self.publish(
                    SourceFailed {
                        job_id: event.job_id,
                        source_id: event.source_id,
                        error: format!("source {} not found or inactive", event.source_id),
                    }
                    .into(),
                );
            }
        };

        let mappings = self.store.mappings_for_source(source.id)?;
        let exports = self.store.active_exports(source.automation_id)?;

        match self
            .extractor
            .extract(&source.config, event.from_date, event.max_results)
        {
            Err(err) => {
                warn!(
                    job_id = %event.job_id,
                    source_id = %source.id,
                    error = %err,
                    "extraction failed"
                );
                self.publish(
                    SourceFailed {
                        job_id: event.job_id,
                        source_id: source.id,
                        error: err.to_string(),
                    }
                    .into(),
                )
            }
            Ok(mut invoices) => {
                invoices.truncate(event.max_results as usize);
                let invoice_count = invoices.len() as u32;

                let mut export_count = 0u32;
                for invoice in &invoices {
                    for item in
                        plan_export_work(event.job_id, &source, invoice, &mappings, &exports)
                    {
                        self.publish(OrchestrationEvent::from(ExportExecute::from(item)))?;
                        export_count += 1;
                    }
                }

                info!(
                    job_id = %event.job_id,
                    source_id = %source.id,
                    invoice_count,
                    export_count,
                    "source extraction dispatched"
                );
                self.publish(
                    SourceCompleted {
                        job_id: event.job_id,
                        source_id: source.id,
                        invoice_count,
                        export_count,
                    }
                    .into(),
                )
            }
        }
    }

    /// Spawn the consumer loop in a background thread.
    pub fn spawn(self, config: SourceWorkerConfig) -> WorkerHandle
    where
        S: 'static,
        B: 'static,
        X: 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let subscription = self.bus.subscribe(subjects::SOURCE_EXECUTE, &config.group);

        let name = config.name.clone();
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(self, config, subscription, shutdown_rx))
            .expect("failed to spawn source worker thread");

        WorkerHandle::new(shutdown_tx, join)
    }
}

fn worker_loop<S, B, X>(
    worker: SourceWorker<S, B, X>,
    config: SourceWorkerConfig,
    subscription: B::Subscription,
    shutdown_rx: mpsc::Receiver<()>,
) where
    S: StateStore,
    B: EventBus<OrchestrationEvent>,
    X: Extractor,
{
    info!(worker = %config.name, "source worker started");

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match subscription.recv_timeout(config.tick) {
            Ok(delivery) => {
                let event = match delivery.message() {
                    OrchestrationEvent::SourceExecute(e) => e.clone(),
                    other => {
                        warn!(worker = %config.name, subject = other.subject(), "unexpected event on source.execute");
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
                            attempt = delivery.attempt(),
                            error = %err,
                            "dropping work item after repeated failures"
                        );
                        delivery.ack();
                    }
                    Err(err) => {
                        warn!(
                            worker = %config.name,
                            job_id = %event.job_id,
                            error = %err,
                            "source handler failed; work item will be retried"
                        );
                        delivery.nak();
                    }
                }
            }
            Err(BusRecvError::Timeout) => continue,
            Err(BusRecvError::Closed) => break,
        }
    }

    info!(worker = %config.name, "source worker stopped");
}
