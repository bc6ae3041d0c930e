use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use fakturenn_core::{AutomationId, DomainError, JobId, SourceId, TenantId};

/// Job execution status.
///
/// Transitions are monotone: pending → running → {completed, failed}, with a
/// direct pending → completed shortcut for runs with zero active sources.
/// There is no transition out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Accumulating run statistics. Counters only ever increase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobStats {
    pub sources_succeeded: u32,
    pub sources_failed: u32,
    pub invoices_discovered: u32,
    pub exported: u32,
    pub duplicate_skipped: u32,
    pub export_failed: u32,
}

impl JobStats {
    /// Deliveries with a recorded outcome, of any status.
    pub fn recorded_exports(&self) -> u32 {
        self.exported + self.duplicate_skipped + self.export_failed
    }
}

/// Final report of one dispatched source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SourceOutcome {
    Succeeded {
        invoice_count: u32,
        export_count: u32,
    },
    Failed {
        error: String,
    },
}

/// One execution run of an automation.
///
/// `from_date`/`max_results` are a snapshot taken at trigger time, so later
/// automation edits never affect an in-flight job. Jobs are never deleted;
/// they form the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub automation_id: AutomationId,
    pub status: JobStatus,
    pub from_date: Option<NaiveDate>,
    pub max_results: Option<u32>,
    /// Sources fanned out when the job went running.
    #[serde(default)]
    pub dispatched_sources: Vec<SourceId>,
    /// Per-source completion reports, merged idempotently by source id.
    #[serde(default)]
    pub source_outcomes: BTreeMap<SourceId, SourceOutcome>,
    #[serde(default)]
    pub stats: JobStats,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Last time any completion signal arrived; drives the timeout policy.
    pub last_event_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        tenant_id: TenantId,
        automation_id: AutomationId,
        from_date: Option<NaiveDate>,
        max_results: Option<u32>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            tenant_id,
            automation_id,
            status: JobStatus::Pending,
            from_date,
            max_results,
            dispatched_sources: Vec::new(),
            source_outcomes: BTreeMap::new(),
            stats: JobStats::default(),
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            last_event_at: now,
        }
    }

    /// pending → running, recording the fanned-out source set.
    pub fn mark_running(
        &mut self,
        dispatched: Vec<SourceId>,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if self.status != JobStatus::Pending {
            return Err(DomainError::invariant(format!(
                "cannot start job {} from status {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = JobStatus::Running;
        self.dispatched_sources = dispatched;
        self.started_at = Some(now);
        self.last_event_at = now;
        Ok(())
    }

    /// Merge one source's completion report.
    ///
    /// Returns `false` when the report was already merged or the job is
    /// terminal — a redelivered event is a no-op, not an error.
    pub fn record_source_outcome(
        &mut self,
        source_id: SourceId,
        outcome: SourceOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, DomainError> {
        if self.status.is_terminal() {
            return Ok(false);
        }
        if self.status != JobStatus::Running {
            return Err(DomainError::invariant(format!(
                "job {} received a source report while {}",
                self.id,
                self.status.as_str()
            )));
        }
        if !self.dispatched_sources.contains(&source_id) {
            return Err(DomainError::invariant(format!(
                "source {source_id} was not dispatched for job {}",
                self.id
            )));
        }
        if self.source_outcomes.contains_key(&source_id) {
            return Ok(false);
        }

        match &outcome {
            SourceOutcome::Succeeded { invoice_count, .. } => {
                self.stats.sources_succeeded += 1;
                self.stats.invoices_discovered += invoice_count;
            }
            SourceOutcome::Failed { .. } => {
                self.stats.sources_failed += 1;
            }
        }
        self.source_outcomes.insert(source_id, outcome);
        self.last_event_at = now;
        Ok(true)
    }

    /// Merge export counters observed from the export history. Counters are
    /// taken as maxima so redelivered signals can never decrease stats.
    pub fn merge_export_counts(&mut self, success: u32, duplicate_skipped: u32, failed: u32) {
        self.stats.exported = self.stats.exported.max(success);
        self.stats.duplicate_skipped = self.stats.duplicate_skipped.max(duplicate_skipped);
        self.stats.export_failed = self.stats.export_failed.max(failed);
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_event_at = now;
    }

    pub fn all_sources_reported(&self) -> bool {
        self.dispatched_sources
            .iter()
            .all(|id| self.source_outcomes.contains_key(id))
    }

    /// Deliveries dispatched by succeeded sources.
    pub fn expected_exports(&self) -> u32 {
        self.source_outcomes
            .values()
            .map(|o| match o {
                SourceOutcome::Succeeded { export_count, .. } => *export_count,
                SourceOutcome::Failed { .. } => 0,
            })
            .sum()
    }

    /// A running job can be finalized once every dispatched source has
    /// reported and every dispatched delivery has a recorded outcome.
    pub fn ready_to_finalize(&self) -> bool {
        self.status == JobStatus::Running
            && self.all_sources_reported()
            && self.stats.recorded_exports() >= self.expected_exports()
    }

    /// Failed only when every source failed and nothing was exported;
    /// partial success is still success.
    pub fn decide_outcome(&self) -> JobStatus {
        let all_failed = !self.source_outcomes.is_empty()
            && self
                .source_outcomes
                .values()
                .all(|o| matches!(o, SourceOutcome::Failed { .. }));
        if all_failed && self.stats.exported == 0 {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        }
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        if self.status.is_terminal() {
            return Err(DomainError::invariant(format!(
                "job {} is already {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        self.last_event_at = now;
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if self.status.is_terminal() {
            return Err(DomainError::invariant(format!(
                "job {} is already {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = JobStatus::Failed;
        self.error_message = Some(error.into());
        self.completed_at = Some(now);
        self.last_event_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(TenantId::new(), AutomationId::new(), None, None, Utc::now())
    }

    fn succeeded(invoices: u32, exports: u32) -> SourceOutcome {
        SourceOutcome::Succeeded {
            invoice_count: invoices,
            export_count: exports,
        }
    }

    #[test]
    fn lifecycle_happy_path() {
        let mut job = job();
        let source = SourceId::new();
        assert_eq!(job.status, JobStatus::Pending);

        job.mark_running(vec![source], Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());

        assert!(job
            .record_source_outcome(source, succeeded(2, 4), Utc::now())
            .unwrap());
        assert!(job.all_sources_reported());
        assert_eq!(job.expected_exports(), 4);
        assert!(!job.ready_to_finalize());

        job.merge_export_counts(3, 1, 0);
        assert!(job.ready_to_finalize());
        assert_eq!(job.decide_outcome(), JobStatus::Completed);

        job.mark_completed(Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn no_transition_out_of_terminal_state() {
        let mut job = job();
        job.mark_completed(Utc::now()).unwrap();
        assert!(job.mark_failed("late", Utc::now()).is_err());
        assert!(job.mark_running(vec![], Utc::now()).is_err());
        assert!(job.mark_completed(Utc::now()).is_err());
    }

    #[test]
    fn duplicate_source_report_is_a_no_op() {
        let mut job = job();
        let source = SourceId::new();
        job.mark_running(vec![source], Utc::now()).unwrap();

        assert!(job
            .record_source_outcome(source, succeeded(3, 3), Utc::now())
            .unwrap());
        assert!(!job
            .record_source_outcome(source, succeeded(3, 3), Utc::now())
            .unwrap());
        assert_eq!(job.stats.invoices_discovered, 3);
        assert_eq!(job.stats.sources_succeeded, 1);
    }

    #[test]
    fn undispatched_source_report_is_rejected() {
        let mut job = job();
        job.mark_running(vec![SourceId::new()], Utc::now()).unwrap();
        assert!(job
            .record_source_outcome(SourceId::new(), succeeded(1, 1), Utc::now())
            .is_err());
    }

    #[test]
    fn export_counts_never_decrease() {
        let mut job = job();
        job.merge_export_counts(5, 2, 1);
        job.merge_export_counts(3, 1, 0);
        assert_eq!(job.stats.exported, 5);
        assert_eq!(job.stats.duplicate_skipped, 2);
        assert_eq!(job.stats.export_failed, 1);
    }

    #[test]
    fn all_sources_failed_decides_failed() {
        let mut job = job();
        let a = SourceId::new();
        let b = SourceId::new();
        job.mark_running(vec![a, b], Utc::now()).unwrap();
        job.record_source_outcome(a, SourceOutcome::Failed { error: "boom".into() }, Utc::now())
            .unwrap();
        job.record_source_outcome(b, SourceOutcome::Failed { error: "boom".into() }, Utc::now())
            .unwrap();
        assert!(job.ready_to_finalize());
        assert_eq!(job.decide_outcome(), JobStatus::Failed);
    }

    #[test]
    fn partial_failure_decides_completed() {
        let mut job = job();
        let a = SourceId::new();
        let b = SourceId::new();
        job.mark_running(vec![a, b], Utc::now()).unwrap();
        job.record_source_outcome(a, SourceOutcome::Failed { error: "down".into() }, Utc::now())
            .unwrap();
        job.record_source_outcome(b, succeeded(1, 1), Utc::now()).unwrap();
        job.merge_export_counts(1, 0, 0);
        assert!(job.ready_to_finalize());
        assert_eq!(job.decide_outcome(), JobStatus::Completed);
    }

    #[test]
    fn source_report_after_terminal_is_ignored() {
        let mut job = job();
        let a = SourceId::new();
        job.mark_running(vec![a], Utc::now()).unwrap();
        job.mark_failed("timed out", Utc::now()).unwrap();
        assert!(!job
            .record_source_outcome(a, succeeded(1, 1), Utc::now())
            .unwrap());
    }
}
