//! Job coordinator — owner of the job lifecycle state machine.
//!
//! One instance of logic per job, horizontally replicated: all coordination
//! between replicas goes through the state store's transactional writes,
//! never through in-process state. Trigger is idempotent under
//! crash-after-write because a periodic reconciliation pass re-publishes the
//! start event for any pending job older than a grace period.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use fakturenn_core::{AutomationId, JobId, SourceId};
use fakturenn_domain::{plan_source_work, JobStatus, SourceOutcome};
use fakturenn_events::bus::{BusRecvError, BusSubscription, EventBus};
use fakturenn_events::message::{
    subjects, JobCompleted, JobFailed, JobStarted, OrchestrationEvent, SourceExecute,
};

use crate::store::{StateStore, StoreError};

use super::{WorkerHandle, MAX_DELIVERY_ATTEMPTS};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("automation {0} not found")]
    UnknownAutomation(AutomationId),
    #[error("automation {0} is not active")]
    InactiveAutomation(AutomationId),
    #[error("job {0} not found")]
    UnknownJob(JobId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("event publish failed: {0}")]
    Publish(String),
}

/// Coordinator worker configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Thread name for logging.
    pub name: String,
    /// Durable consumer group shared by coordinator replicas.
    pub group: String,
    /// Per-subscription receive slice in the poll loop.
    pub poll_slice: Duration,
    /// How often the reconciliation and timeout scans run.
    pub scan_interval: Duration,
    /// Pending jobs older than this get their start event re-published.
    pub pending_grace: Duration,
    /// Running jobs with no event activity for this long are forced to
    /// failed.
    pub job_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            name: "job-coordinator".to_string(),
            group: "coordinator".to_string(),
            poll_slice: Duration::from_millis(50),
            scan_interval: Duration::from_secs(5),
            pending_grace: Duration::from_secs(30),
            job_timeout: Duration::from_secs(1800),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_pending_grace(mut self, grace: Duration) -> Self {
        self.pending_grace = grace;
        self
    }
}

/// The orchestrator: fans work out, fans completion signals in, decides
/// terminal status.
pub struct JobCoordinator<S, B> {
    store: S,
    bus: B,
}

impl<S, B> JobCoordinator<S, B>
where
    S: StateStore,
    B: EventBus<OrchestrationEvent>,
{
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    fn publish(&self, event: OrchestrationEvent) -> Result<(), CoordinatorError> {
        let subject = event.subject();
        self.bus
            .publish(subject, event)
            .map_err(|e| CoordinatorError::Publish(format!("{subject}: {e:?}")))
    }

    /// Turn a "run this automation" request into a pending job plus one
    /// `JobStarted` event.
    ///
    /// The job row is written first; if the publish then fails the job stays
    /// pending and `reconcile_pending` recovers it, so the trigger is
    /// idempotent under crash-after-write.
    pub fn trigger(
        &self,
        automation_id: AutomationId,
        from_date: Option<NaiveDate>,
        max_results: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<JobId, CoordinatorError> {
        let automation = self
            .store
            .automation(automation_id)?
            .ok_or(CoordinatorError::UnknownAutomation(automation_id))?;
        if !automation.active {
            return Err(CoordinatorError::InactiveAutomation(automation_id));
        }

        let effective_from = from_date.or_else(|| {
            automation
                .from_date_rule
                .map(|rule| rule.from_date(now.date_naive()))
        });

        let job = fakturenn_domain::Job::new(
            automation.tenant_id,
            automation_id,
            effective_from,
            max_results,
            now,
        );
        let job_id = job.id;
        self.store.insert_job(job)?;
        info!(job_id = %job_id, automation_id = %automation_id, "job triggered");

        let started = JobStarted {
            job_id,
            automation_id,
            tenant_id: automation.tenant_id,
            from_date: effective_from,
            max_results,
        };
        if let Err(err) = self.publish(started.into()) {
            warn!(
                job_id = %job_id,
                error = %err,
                "job start publish failed; reconciliation will retry"
            );
        }
        Ok(job_id)
    }

    /// Route one consumed event into the state machine.
    pub fn handle_event(
        &self,
        event: &OrchestrationEvent,
        now: DateTime<Utc>,
    ) -> Result<(), CoordinatorError> {
        match event {
            OrchestrationEvent::JobStarted(e) => self.handle_job_started(e, now),
            OrchestrationEvent::SourceCompleted(e) => self.handle_source_report(
                e.job_id,
                e.source_id,
                SourceOutcome::Succeeded {
                    invoice_count: e.invoice_count,
                    export_count: e.export_count,
                },
                now,
            ),
            OrchestrationEvent::SourceFailed(e) => self.handle_source_report(
                e.job_id,
                e.source_id,
                SourceOutcome::Failed {
                    error: e.error.clone(),
                },
                now,
            ),
            OrchestrationEvent::ExportCompleted(e) => self.try_finalize(e.job_id, now),
            OrchestrationEvent::ExportFailed(e) => self.try_finalize(e.job_id, now),
            // Work items and terminal announcements belong to other roles.
            other => {
                debug!(subject = other.subject(), "coordinator ignoring event");
                Ok(())
            }
        }
    }

    /// pending → running (or straight to completed when the automation has
    /// no active sources), then fan out one `SourceExecute` per source.
    fn handle_job_started(
        &self,
        event: &JobStarted,
        now: DateTime<Utc>,
    ) -> Result<(), CoordinatorError> {
        let job = self
            .store
            .job(event.job_id)?
            .ok_or(CoordinatorError::UnknownJob(event.job_id))?;
        if job.status != JobStatus::Pending {
            // Redelivered or already picked up by another replica.
            debug!(job_id = %job.id, status = job.status.as_str(), "start event is stale");
            return Ok(());
        }

        let sources = self.store.active_sources(job.automation_id)?;
        if sources.is_empty() {
            let mut transitioned = false;
            let updated = self.store.mutate_job(job.id, &mut |j| {
                if j.status == JobStatus::Pending {
                    j.mark_completed(now)?;
                    transitioned = true;
                }
                Ok(())
            })?;
            if transitioned {
                info!(job_id = %job.id, "job completed with zero active sources");
                self.publish(
                    JobCompleted {
                        job_id: updated.id,
                        automation_id: updated.automation_id,
                        stats: updated.stats,
                    }
                    .into(),
                )?;
            }
            return Ok(());
        }

        let work = plan_source_work(&job, &sources);
        let dispatched: Vec<SourceId> = work.iter().map(|w| w.source_id).collect();
        let mut transitioned = false;
        self.store.mutate_job(job.id, &mut |j| {
            if j.status == JobStatus::Pending {
                j.mark_running(dispatched.clone(), now)?;
                transitioned = true;
            }
            Ok(())
        })?;
        if !transitioned {
            return Ok(());
        }

        info!(job_id = %job.id, sources = work.len(), "job running, sources dispatched");
        for item in work {
            let event = OrchestrationEvent::from(SourceExecute::from(item));
            if let Err(err) = self.publish(event) {
                // The job will hit the timeout ceiling if this never lands.
                warn!(job_id = %job.id, error = %err, "source dispatch publish failed");
            }
        }
        Ok(())
    }

    /// running → running: merge one source's completion report, then check
    /// whether the job can be finalized.
    fn handle_source_report(
        &self,
        job_id: JobId,
        source_id: SourceId,
        outcome: SourceOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), CoordinatorError> {
        let mut merged = false;
        self.store.mutate_job(job_id, &mut |j| {
            merged = j.record_source_outcome(source_id, outcome.clone(), now)?;
            Ok(())
        })?;
        if merged {
            debug!(job_id = %job_id, source_id = %source_id, "source report merged");
        }
        self.try_finalize(job_id, now)
    }

    /// Refresh export counters from the history (the source of truth, so
    /// redelivered signals are no-ops) and finalize once every dispatched
    /// source has reported and every delivery has a recorded outcome.
    fn try_finalize(&self, job_id: JobId, now: DateTime<Utc>) -> Result<(), CoordinatorError> {
        let counts = self.store.history_counts(job_id)?;
        let mut transitioned_to: Option<JobStatus> = None;
        let updated = self.store.mutate_job(job_id, &mut |j| {
            j.merge_export_counts(counts.success, counts.duplicate_skipped, counts.failed);
            if j.status == JobStatus::Running {
                j.touch(now);
            }
            if j.ready_to_finalize() {
                match j.decide_outcome() {
                    JobStatus::Failed => {
                        j.mark_failed("all sources failed", now)?;
                        transitioned_to = Some(JobStatus::Failed);
                    }
                    _ => {
                        j.mark_completed(now)?;
                        transitioned_to = Some(JobStatus::Completed);
                    }
                }
            }
            Ok(())
        })?;

        match transitioned_to {
            Some(JobStatus::Completed) => {
                info!(job_id = %job_id, stats = ?updated.stats, "job completed");
                self.publish(
                    JobCompleted {
                        job_id,
                        automation_id: updated.automation_id,
                        stats: updated.stats,
                    }
                    .into(),
                )?;
            }
            Some(JobStatus::Failed) => {
                warn!(job_id = %job_id, stats = ?updated.stats, "job failed");
                self.publish(
                    JobFailed {
                        job_id,
                        automation_id: updated.automation_id,
                        error: updated
                            .error_message
                            .clone()
                            .unwrap_or_else(|| "all sources failed".to_string()),
                        stats: updated.stats,
                    }
                    .into(),
                )?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Re-publish `JobStarted` for pending jobs older than `grace`.
    ///
    /// Recovers jobs whose trigger crashed between the row write and the
    /// publish. Returns how many events were re-published.
    pub fn reconcile_pending(
        &self,
        grace: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, CoordinatorError> {
        let cutoff = now - chrono::Duration::from_std(grace).unwrap_or_default();
        let stale = self.store.pending_jobs_older_than(cutoff)?;
        let mut republished = 0;
        for job in stale {
            let event = JobStarted {
                job_id: job.id,
                automation_id: job.automation_id,
                tenant_id: job.tenant_id,
                from_date: job.from_date,
                max_results: job.max_results,
            };
            match self.publish(event.into()) {
                Ok(()) => republished += 1,
                Err(err) => warn!(job_id = %job.id, error = %err, "reconcile publish failed"),
            }
        }
        if republished > 0 {
            info!(count = republished, "re-published start events for stale pending jobs");
        }
        Ok(republished)
    }

    /// Force running jobs quiet for longer than `ceiling` to failed, exactly
    /// once each (the transition is terminal, so a later scan is a no-op).
    /// Bounds the cost of a wedged worker.
    pub fn force_timeouts(
        &self,
        ceiling: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, CoordinatorError> {
        let cutoff = now - chrono::Duration::from_std(ceiling).unwrap_or_default();
        let quiet = self.store.running_jobs_quiet_since(cutoff)?;
        let mut forced = 0;
        for job in quiet {
            let mut transitioned = false;
            let updated = self.store.mutate_job(job.id, &mut |j| {
                if j.status == JobStatus::Running {
                    j.mark_failed(
                        format!("job timed out after {}s without progress", ceiling.as_secs()),
                        now,
                    )?;
                    transitioned = true;
                }
                Ok(())
            })?;
            if transitioned {
                forced += 1;
                warn!(job_id = %job.id, "job forced to failed by timeout");
                if let Err(err) = self.publish(
                    JobFailed {
                        job_id: updated.id,
                        automation_id: updated.automation_id,
                        error: updated
                            .error_message
                            .clone()
                            .unwrap_or_else(|| "job timed out".to_string()),
                        stats: updated.stats,
                    }
                    .into(),
                ) {
                    warn!(job_id = %job.id, error = %err, "timeout publish failed");
                }
            }
        }
        Ok(forced)
    }

    /// Spawn the coordinator loop in a background thread.
    pub fn spawn(self, config: CoordinatorConfig) -> WorkerHandle
    where
        S: 'static,
        B: 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let subscriptions: Vec<B::Subscription> = [
            subjects::JOB_STARTED,
            subjects::SOURCE_COMPLETED,
            subjects::SOURCE_FAILED,
            subjects::EXPORT_COMPLETED,
            subjects::EXPORT_FAILED,
        ]
        .iter()
        .map(|subject| self.bus.subscribe(subject, &config.group))
        .collect();

        let name = config.name.clone();
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || coordinator_loop(self, config, subscriptions, shutdown_rx))
            .expect("failed to spawn job coordinator thread");

        WorkerHandle::new(shutdown_tx, join)
    }
}

fn coordinator_loop<S, B>(
    coordinator: JobCoordinator<S, B>,
    config: CoordinatorConfig,
    subscriptions: Vec<B::Subscription>,
    shutdown_rx: mpsc::Receiver<()>,
) where
    S: StateStore,
    B: EventBus<OrchestrationEvent>,
{
    info!(worker = %config.name, "job coordinator started");
    let mut last_scan: Option<Instant> = None;

    'outer: loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        for subscription in &subscriptions {
            match subscription.recv_timeout(config.poll_slice) {
                Ok(delivery) => {
                    let event = delivery.message().clone();
                    match coordinator.handle_event(&event, Utc::now()) {
                        Ok(()) => delivery.ack(),
                        Err(err) if delivery.attempt() >= MAX_DELIVERY_ATTEMPTS => {
                            warn!(
                                worker = %config.name,
                                subject = event.subject(),
                                attempt = delivery.attempt(),
                                error = %err,
                                "dropping event after repeated failures"
                            );
                            delivery.ack();
                        }
                        Err(err) => {
                            warn!(
                                worker = %config.name,
                                subject = event.subject(),
                                error = %err,
                                "coordinator handler failed; event will be retried"
                            );
                            delivery.nak();
                        }
                    }
                }
                Err(BusRecvError::Timeout) => continue,
                Err(BusRecvError::Closed) => break 'outer,
            }
        }

        let due = last_scan.map_or(true, |t| t.elapsed() >= config.scan_interval);
        if due {
            last_scan = Some(Instant::now());
            let now = Utc::now();
            if let Err(err) = coordinator.reconcile_pending(config.pending_grace, now) {
                warn!(worker = %config.name, error = %err, "pending reconciliation failed");
            }
            if let Err(err) = coordinator.force_timeouts(config.job_timeout, now) {
                warn!(worker = %config.name, error = %err, "timeout scan failed");
            }
        }
    }

    info!(worker = %config.name, "job coordinator stopped");
}
