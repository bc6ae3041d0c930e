//! In-memory state store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use fakturenn_core::{AutomationId, DomainError, ExportId, JobId, MappingId, SourceId};
use fakturenn_domain::{
    Automation, DuplicateKey, Export, ExportHistory, ExportStatus, Job, JobStatus, Mapping, Source,
};

use super::{HistoryCounts, StateStore, StoreError, SuccessInsert};

/// In-memory implementation of the job state store.
///
/// A single `RwLock` write section covers the duplicate-key check and the
/// insert in `try_record_success`, which is what makes the conditional
/// insert atomic here.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    automations: RwLock<HashMap<AutomationId, Automation>>,
    sources: RwLock<HashMap<SourceId, Source>>,
    exports: RwLock<HashMap<ExportId, Export>>,
    mappings: RwLock<HashMap<MappingId, Mapping>>,
    jobs: RwLock<HashMap<JobId, Job>>,
    history: RwLock<Vec<ExportHistory>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    // Seeding is the CRUD layer's job in production; these exist for that
    // layer and for tests.

    pub fn insert_automation(&self, automation: Automation) {
        self.automations
            .write()
            .unwrap()
            .insert(automation.id, automation);
    }

    pub fn insert_source(&self, source: Source) {
        self.sources.write().unwrap().insert(source.id, source);
    }

    pub fn insert_export(&self, export: Export) {
        self.exports.write().unwrap().insert(export.id, export);
    }

    pub fn insert_mapping(&self, mapping: Mapping) {
        self.mappings.write().unwrap().insert(mapping.id, mapping);
    }
}

impl StateStore for InMemoryStateStore {
    fn automation(&self, id: AutomationId) -> Result<Option<Automation>, StoreError> {
        Ok(self.automations.read().unwrap().get(&id).cloned())
    }

    fn active_sources(&self, automation_id: AutomationId) -> Result<Vec<Source>, StoreError> {
        let mut sources: Vec<Source> = self
            .sources
            .read()
            .unwrap()
            .values()
            .filter(|s| s.automation_id == automation_id && s.active)
            .cloned()
            .collect();
        sources.sort_by_key(|s| s.id);
        Ok(sources)
    }

    fn source(&self, id: SourceId) -> Result<Option<Source>, StoreError> {
        Ok(self.sources.read().unwrap().get(&id).cloned())
    }

    fn active_exports(&self, automation_id: AutomationId) -> Result<Vec<Export>, StoreError> {
        let mut exports: Vec<Export> = self
            .exports
            .read()
            .unwrap()
            .values()
            .filter(|e| e.automation_id == automation_id && e.active)
            .cloned()
            .collect();
        exports.sort_by_key(|e| e.id);
        Ok(exports)
    }

    fn export(&self, id: ExportId) -> Result<Option<Export>, StoreError> {
        Ok(self.exports.read().unwrap().get(&id).cloned())
    }

    fn mappings_for_source(&self, source_id: SourceId) -> Result<Vec<Mapping>, StoreError> {
        let mut mappings: Vec<Mapping> = self
            .mappings
            .read()
            .unwrap()
            .values()
            .filter(|m| m.source_id == source_id)
            .cloned()
            .collect();
        mappings.sort_by_key(|m| (m.priority, m.export_id));
        Ok(mappings)
    }

    fn insert_job(&self, job: Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job {} already exists", job.id)));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    fn job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().unwrap().get(&id).cloned())
    }

    fn mutate_job(
        &self,
        id: JobId,
        f: &mut dyn FnMut(&mut Job) -> Result<(), DomainError>,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let stored = jobs
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;

        // Work on a copy so a failing mutation leaves the row untouched.
        let mut job = stored.clone();
        f(&mut job)?;
        jobs.insert(id, job.clone());
        Ok(job)
    }

    fn pending_jobs_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .unwrap()
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.created_at <= cutoff)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    fn running_jobs_quiet_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .unwrap()
            .values()
            .filter(|j| j.status == JobStatus::Running && j.last_event_at <= cutoff)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.last_event_at);
        Ok(jobs)
    }

    fn record_history(&self, row: ExportHistory) -> Result<(), StoreError> {
        self.history.write().unwrap().push(row);
        Ok(())
    }

    fn try_record_success(&self, row: ExportHistory) -> Result<SuccessInsert, StoreError> {
        if row.status != ExportStatus::Success {
            return Err(StoreError::Conflict(
                "try_record_success requires a success row".into(),
            ));
        }
        let key = row.duplicate_key.clone().ok_or_else(|| {
            StoreError::Conflict("success rows must carry a duplicate key".into())
        })?;

        let mut history = self.history.write().unwrap();
        if let Some(existing) = history
            .iter()
            .find(|h| {
                h.export_id == row.export_id
                    && h.status == ExportStatus::Success
                    && h.duplicate_key.as_ref() == Some(&key)
            })
            .cloned()
        {
            return Ok(SuccessInsert::AlreadyRecorded(existing));
        }
        history.push(row);
        Ok(SuccessInsert::Inserted)
    }

    fn find_success(
        &self,
        export_id: ExportId,
        key: &DuplicateKey,
    ) -> Result<Option<ExportHistory>, StoreError> {
        Ok(self
            .history
            .read()
            .unwrap()
            .iter()
            .find(|h| {
                h.export_id == export_id
                    && h.status == ExportStatus::Success
                    && h.duplicate_key.as_ref() == Some(key)
            })
            .cloned())
    }

    fn history_for_job(&self, job_id: JobId) -> Result<Vec<ExportHistory>, StoreError> {
        let mut rows: Vec<ExportHistory> = self
            .history
            .read()
            .unwrap()
            .iter()
            .filter(|h| h.job_id == job_id)
            .cloned()
            .collect();
        rows.sort_by_key(|h| h.exported_at);
        Ok(rows)
    }

    fn history_counts(&self, job_id: JobId) -> Result<HistoryCounts, StoreError> {
        let history = self.history.read().unwrap();
        let mut counts = HistoryCounts::default();
        for row in history.iter().filter(|h| h.job_id == job_id) {
            match row.status {
                ExportStatus::Success => counts.success += 1,
                ExportStatus::Failed => counts.failed += 1,
                ExportStatus::DuplicateSkipped => counts.duplicate_skipped += 1,
            }
        }
        Ok(counts)
    }
}
