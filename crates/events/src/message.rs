//! Event payloads exchanged over the bus — the orchestration core's wire
//! contract.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use fakturenn_core::{AutomationId, ExportId, JobId, SourceId, TenantId};
use fakturenn_domain::{ExportWorkItem, Invoice, JobStats, SourceWorkItem};

/// Subject names, one queue per event type.
pub mod subjects {
    pub const JOB_STARTED: &str = "job.started";
    pub const JOB_COMPLETED: &str = "job.completed";
    pub const JOB_FAILED: &str = "job.failed";
    pub const SOURCE_EXECUTE: &str = "source.execute";
    pub const SOURCE_COMPLETED: &str = "source.completed";
    pub const SOURCE_FAILED: &str = "source.failed";
    pub const EXPORT_EXECUTE: &str = "export.execute";
    pub const EXPORT_COMPLETED: &str = "export.completed";
    pub const EXPORT_FAILED: &str = "export.failed";
}

/// Published by the coordinator to itself after the pending job row is
/// written; re-published by the reconciliation pass for stale pending jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStarted {
    pub job_id: JobId,
    pub automation_id: AutomationId,
    pub tenant_id: TenantId,
    pub from_date: Option<NaiveDate>,
    pub max_results: Option<u32>,
}

/// Fan-out: one per active source of the triggered automation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceExecute {
    pub job_id: JobId,
    pub automation_id: AutomationId,
    pub tenant_id: TenantId,
    pub source_id: SourceId,
    pub from_date: Option<NaiveDate>,
    pub max_results: u32,
}

impl From<SourceWorkItem> for SourceExecute {
    fn from(item: SourceWorkItem) -> Self {
        Self {
            job_id: item.job_id,
            automation_id: item.automation_id,
            tenant_id: item.tenant_id,
            source_id: item.source_id,
            from_date: item.from_date,
            max_results: item.max_results,
        }
    }
}

/// Exactly one per consumed `SourceExecute` that extracted successfully.
///
/// `export_count` is the number of `ExportExecute` events this source
/// dispatched; the coordinator uses it to know when every delivery has a
/// recorded outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCompleted {
    pub job_id: JobId,
    pub source_id: SourceId,
    pub invoice_count: u32,
    pub export_count: u32,
}

/// Exactly one per consumed `SourceExecute` that hit an unrecoverable
/// extraction error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailed {
    pub job_id: JobId,
    pub source_id: SourceId,
    pub error: String,
}

/// One delivery of one invoice to one export, full invoice snapshot
/// included. Priority affects emission order only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportExecute {
    pub job_id: JobId,
    pub source_id: SourceId,
    pub export_id: ExportId,
    pub invoice: Invoice,
    pub priority: i32,
}

impl From<ExportWorkItem> for ExportExecute {
    fn from(item: ExportWorkItem) -> Self {
        Self {
            job_id: item.job_id,
            source_id: item.source_id,
            export_id: item.export_id,
            invoice: item.invoice,
            priority: item.priority,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportCompleted {
    pub job_id: JobId,
    pub export_id: ExportId,
    pub external_reference: Option<String>,
    /// True when the delivery was suppressed as a duplicate.
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportFailed {
    pub job_id: JobId,
    pub export_id: ExportId,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCompleted {
    pub job_id: JobId,
    pub automation_id: AutomationId,
    pub stats: JobStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailed {
    pub job_id: JobId,
    pub automation_id: AutomationId,
    pub error: String,
    pub stats: JobStats,
}

/// Tagged union of every orchestration event.
///
/// Consumers receive this from their subject's queue and match on the
/// variants they own, ignoring the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    JobStarted(JobStarted),
    SourceExecute(SourceExecute),
    SourceCompleted(SourceCompleted),
    SourceFailed(SourceFailed),
    ExportExecute(ExportExecute),
    ExportCompleted(ExportCompleted),
    ExportFailed(ExportFailed),
    JobCompleted(JobCompleted),
    JobFailed(JobFailed),
}

impl OrchestrationEvent {
    /// Subject this event is published on.
    pub fn subject(&self) -> &'static str {
        match self {
            OrchestrationEvent::JobStarted(_) => subjects::JOB_STARTED,
            OrchestrationEvent::SourceExecute(_) => subjects::SOURCE_EXECUTE,
            OrchestrationEvent::SourceCompleted(_) => subjects::SOURCE_COMPLETED,
            OrchestrationEvent::SourceFailed(_) => subjects::SOURCE_FAILED,
            OrchestrationEvent::ExportExecute(_) => subjects::EXPORT_EXECUTE,
            OrchestrationEvent::ExportCompleted(_) => subjects::EXPORT_COMPLETED,
            OrchestrationEvent::ExportFailed(_) => subjects::EXPORT_FAILED,
            OrchestrationEvent::JobCompleted(_) => subjects::JOB_COMPLETED,
            OrchestrationEvent::JobFailed(_) => subjects::JOB_FAILED,
        }
    }

    pub fn job_id(&self) -> JobId {
        match self {
            OrchestrationEvent::JobStarted(e) => e.job_id,
            OrchestrationEvent::SourceExecute(e) => e.job_id,
            OrchestrationEvent::SourceCompleted(e) => e.job_id,
            OrchestrationEvent::SourceFailed(e) => e.job_id,
            OrchestrationEvent::ExportExecute(e) => e.job_id,
            OrchestrationEvent::ExportCompleted(e) => e.job_id,
            OrchestrationEvent::ExportFailed(e) => e.job_id,
            OrchestrationEvent::JobCompleted(e) => e.job_id,
            OrchestrationEvent::JobFailed(e) => e.job_id,
        }
    }
}

impl From<JobStarted> for OrchestrationEvent {
    fn from(e: JobStarted) -> Self {
        Self::JobStarted(e)
    }
}

impl From<SourceExecute> for OrchestrationEvent {
    fn from(e: SourceExecute) -> Self {
        Self::SourceExecute(e)
    }
}

impl From<SourceCompleted> for OrchestrationEvent {
    fn from(e: SourceCompleted) -> Self {
        Self::SourceCompleted(e)
    }
}

impl From<SourceFailed> for OrchestrationEvent {
    fn from(e: SourceFailed) -> Self {
        Self::SourceFailed(e)
    }
}

impl From<ExportExecute> for OrchestrationEvent {
    fn from(e: ExportExecute) -> Self {
        Self::ExportExecute(e)
    }
}

impl From<ExportCompleted> for OrchestrationEvent {
    fn from(e: ExportCompleted) -> Self {
        Self::ExportCompleted(e)
    }
}

impl From<ExportFailed> for OrchestrationEvent {
    fn from(e: ExportFailed) -> Self {
        Self::ExportFailed(e)
    }
}

impl From<JobCompleted> for OrchestrationEvent {
    fn from(e: JobCompleted) -> Self {
        Self::JobCompleted(e)
    }
}

impl From<JobFailed> for OrchestrationEvent {
    fn from(e: JobFailed) -> Self {
        Self::JobFailed(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_round_trip_through_json() {
        let event = OrchestrationEvent::SourceCompleted(SourceCompleted {
            job_id: JobId::new(),
            source_id: SourceId::new(),
            invoice_count: 3,
            export_count: 6,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"source_completed\""));
        let back: OrchestrationEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn subject_matches_variant() {
        let event = OrchestrationEvent::JobFailed(JobFailed {
            job_id: JobId::new(),
            automation_id: AutomationId::new(),
            error: "all sources failed".into(),
            stats: JobStats::default(),
        });
        assert_eq!(event.subject(), subjects::JOB_FAILED);
    }
}
