//! Job state store — the single source of truth for job lifecycle state and
//! for "has this export already happened".

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use fakturenn_core::{AutomationId, DomainError, ExportId, JobId, SourceId};
use fakturenn_domain::{
    Automation, DuplicateKey, Export, ExportHistory, Job, Mapping, Source,
};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryStateStore;
pub use postgres::PgStateStore;

/// Store operation error.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result of the atomic conditional success insert.
#[derive(Debug, Clone)]
pub enum SuccessInsert {
    Inserted,
    /// A success row for this (export, duplicate key) already exists; the
    /// insert was not performed.
    AlreadyRecorded(ExportHistory),
}

/// Per-status export history counts for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryCounts {
    pub success: u32,
    pub failed: u32,
    pub duplicate_skipped: u32,
}

impl HistoryCounts {
    pub fn total(&self) -> u32 {
        self.success + self.failed + self.duplicate_skipped
    }
}

/// Transactional persistence for automations, jobs and export history.
///
/// All cross-worker coordination goes through this store: `mutate_job` is a
/// transactional read-modify-write, and `try_record_success` performs the
/// duplicate-key check and the insert atomically, closing the race where two
/// redelivered copies of the same delivery both pass the check before either
/// commits.
pub trait StateStore: Send + Sync {
    fn automation(&self, id: AutomationId) -> Result<Option<Automation>, StoreError>;

    fn active_sources(&self, automation_id: AutomationId) -> Result<Vec<Source>, StoreError>;

    fn source(&self, id: SourceId) -> Result<Option<Source>, StoreError>;

    fn active_exports(&self, automation_id: AutomationId) -> Result<Vec<Export>, StoreError>;

    fn export(&self, id: ExportId) -> Result<Option<Export>, StoreError>;

    fn mappings_for_source(&self, source_id: SourceId) -> Result<Vec<Mapping>, StoreError>;

    fn insert_job(&self, job: Job) -> Result<(), StoreError>;

    fn job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Apply `f` to the job under the store's transaction; changes are
    /// persisted only when `f` succeeds. Returns the updated job.
    fn mutate_job(
        &self,
        id: JobId,
        f: &mut dyn FnMut(&mut Job) -> Result<(), DomainError>,
    ) -> Result<Job, StoreError>;

    /// Pending jobs created at or before `cutoff` (reconciliation scan).
    fn pending_jobs_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    /// Running jobs with no event activity since `cutoff` (timeout scan).
    fn running_jobs_quiet_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    /// Append a non-success history row (failed / duplicate_skipped).
    fn record_history(&self, row: ExportHistory) -> Result<(), StoreError>;

    /// Atomically insert a success row unless one already exists for the
    /// same (export, duplicate key).
    fn try_record_success(&self, row: ExportHistory) -> Result<SuccessInsert, StoreError>;

    fn find_success(
        &self,
        export_id: ExportId,
        key: &DuplicateKey,
    ) -> Result<Option<ExportHistory>, StoreError>;

    fn history_for_job(&self, job_id: JobId) -> Result<Vec<ExportHistory>, StoreError>;

    fn history_counts(&self, job_id: JobId) -> Result<HistoryCounts, StoreError>;
}

impl<S> StateStore for Arc<S>
where
    S: StateStore + ?Sized,
{
    fn automation(&self, id: AutomationId) -> Result<Option<Automation>, StoreError> {
        (**self).automation(id)
    }

    fn active_sources(&self, automation_id: AutomationId) -> Result<Vec<Source>, StoreError> {
        (**self).active_sources(automation_id)
    }

    fn source(&self, id: SourceId) -> Result<Option<Source>, StoreError> {
        (**self).source(id)
    }

    fn active_exports(&self, automation_id: AutomationId) -> Result<Vec<Export>, StoreError> {
        (**self).active_exports(automation_id)
    }

    fn export(&self, id: ExportId) -> Result<Option<Export>, StoreError> {
        (**self).export(id)
    }

    fn mappings_for_source(&self, source_id: SourceId) -> Result<Vec<Mapping>, StoreError> {
        (**self).mappings_for_source(source_id)
    }

    fn insert_job(&self, job: Job) -> Result<(), StoreError> {
        (**self).insert_job(job)
    }

    fn job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).job(id)
    }

    fn mutate_job(
        &self,
        id: JobId,
        f: &mut dyn FnMut(&mut Job) -> Result<(), DomainError>,
    ) -> Result<Job, StoreError> {
        (**self).mutate_job(id, f)
    }

    fn pending_jobs_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        (**self).pending_jobs_older_than(cutoff)
    }

    fn running_jobs_quiet_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        (**self).running_jobs_quiet_since(cutoff)
    }

    fn record_history(&self, row: ExportHistory) -> Result<(), StoreError> {
        (**self).record_history(row)
    }

    fn try_record_success(&self, row: ExportHistory) -> Result<SuccessInsert, StoreError> {
        (**self).try_record_success(row)
    }

    fn find_success(
        &self,
        export_id: ExportId,
        key: &DuplicateKey,
    ) -> Result<Option<ExportHistory>, StoreError> {
        (**self).find_success(export_id, key)
    }

    fn history_for_job(&self, job_id: JobId) -> Result<Vec<ExportHistory>, StoreError> {
        (**self).history_for_job(job_id)
    }

    fn history_counts(&self, job_id: JobId) -> Result<HistoryCounts, StoreError> {
        (**self).history_counts(job_id)
    }
}
