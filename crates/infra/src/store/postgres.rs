//! Postgres-backed state store.
//!
//! ## Concurrency
//!
//! `mutate_job` runs the read-modify-write under a `SELECT .. FOR UPDATE`
//! transaction, and `try_record_success` relies on the partial unique index
//! `uq_export_history_success (export_id, duplicate_key) WHERE status =
//! 'success'` (see `migrations/0001_init.sql`): the duplicate-key check and
//! the insert are a single `INSERT .. ON CONFLICT DO NOTHING`, so two
//! concurrent copies of the same delivery can never both record success.
//!
//! ## Thread safety
//!
//! Uses the SQLx connection pool (`Send + Sync`). The `StateStore` trait is
//! synchronous; Postgres operations require async, so the trait impl runs the
//! async inherent methods via `tokio::runtime::Handle` — callers must be
//! inside a tokio runtime context.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use fakturenn_core::{AutomationId, DomainError, ExportId, JobId, SourceId};
use fakturenn_domain::{
    Automation, DuplicateKey, Export, ExportHistory, ExportKind, ExportStatus, Job, JobStatus,
    Mapping, Source,
};

use super::{HistoryCounts, StateStore, StoreError, SuccessInsert};

#[derive(Debug, Clone)]
pub struct PgStateStore {
    pool: Arc<PgPool>,
}

fn map_sqlx_error(operation: &str, error: sqlx::Error) -> StoreError {
    StoreError::Storage(format!("{operation}: {error}"))
}

fn get_column<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Storage(format!("column {column}: {e}")))
}

fn json_column<T: DeserializeOwned>(row: &PgRow, column: &str) -> Result<T, StoreError> {
    let value: JsonValue = get_column(row, column)?;
    serde_json::from_value(value)
        .map_err(|e| StoreError::Serialization(format!("column {column}: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<JsonValue, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(format!("{what}: {e}")))
}

fn status_from_str(status: &str) -> Result<JobStatus, StoreError> {
    match status {
        "pending" => Ok(JobStatus::Pending),
        "running" => Ok(JobStatus::Running),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        other => Err(StoreError::Serialization(format!(
            "unknown job status '{other}'"
        ))),
    }
}

fn export_status_from_str(status: &str) -> Result<ExportStatus, StoreError> {
    match status {
        "success" => Ok(ExportStatus::Success),
        "failed" => Ok(ExportStatus::Failed),
        "duplicate_skipped" => Ok(ExportStatus::DuplicateSkipped),
        other => Err(StoreError::Serialization(format!(
            "unknown export status '{other}'"
        ))),
    }
}

fn automation_from_row(row: &PgRow) -> Result<Automation, StoreError> {
    let from_date_rule: Option<String> = get_column(row, "from_date_rule")?;
    Ok(Automation {
        id: AutomationId::from_uuid(get_column(row, "id")?),
        tenant_id: fakturenn_core::TenantId::from_uuid(get_column(row, "tenant_id")?),
        name: get_column(row, "name")?,
        description: get_column(row, "description")?,
        schedule: get_column(row, "schedule")?,
        from_date_rule: from_date_rule
            .map(|r| r.parse().map_err(StoreError::Domain))
            .transpose()?,
        active: get_column(row, "active")?,
        created_at: get_column(row, "created_at")?,
        updated_at: get_column(row, "updated_at")?,
    })
}

fn source_from_row(row: &PgRow) -> Result<Source, StoreError> {
    let max_results: i32 = get_column(row, "max_results")?;
    Ok(Source {
        id: SourceId::from_uuid(get_column(row, "id")?),
        automation_id: AutomationId::from_uuid(get_column(row, "automation_id")?),
        name: get_column(row, "name")?,
        config: json_column(row, "config")?,
        max_results: max_results.max(0) as u32,
        active: get_column(row, "active")?,
        created_at: get_column(row, "created_at")?,
        updated_at: get_column(row, "updated_at")?,
    })
}

fn export_from_row(row: &PgRow) -> Result<Export, StoreError> {
    Ok(Export {
        id: ExportId::from_uuid(get_column(row, "id")?),
        automation_id: AutomationId::from_uuid(get_column(row, "automation_id")?),
        name: get_column(row, "name")?,
        config: json_column(row, "config")?,
        active: get_column(row, "active")?,
        created_at: get_column(row, "created_at")?,
        updated_at: get_column(row, "updated_at")?,
    })
}

fn mapping_from_row(row: &PgRow) -> Result<Mapping, StoreError> {
    let conditions: Option<JsonValue> = get_column(row, "conditions")?;
    Ok(Mapping {
        id: fakturenn_core::MappingId::from_uuid(get_column(row, "id")?),
        source_id: SourceId::from_uuid(get_column(row, "source_id")?),
        export_id: ExportId::from_uuid(get_column(row, "export_id")?),
        priority: get_column(row, "priority")?,
        conditions: conditions
            .map(|c| {
                serde_json::from_value(c)
                    .map_err(|e| StoreError::Serialization(format!("mapping conditions: {e}")))
            })
            .transpose()?,
        created_at: get_column(row, "created_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let status: String = get_column(row, "status")?;
    let max_results: Option<i32> = get_column(row, "max_results")?;
    Ok(Job {
        id: JobId::from_uuid(get_column(row, "id")?),
        tenant_id: fakturenn_core::TenantId::from_uuid(get_column(row, "tenant_id")?),
        automation_id: AutomationId::from_uuid(get_column(row, "automation_id")?),
        status: status_from_str(&status)?,
        from_date: get_column(row, "from_date")?,
        max_results: max_results.map(|v| v.max(0) as u32),
        dispatched_sources: json_column(row, "dispatched_sources")?,
        source_outcomes: json_column(row, "source_outcomes")?,
        stats: json_column(row, "stats")?,
        error_message: get_column(row, "error_message")?,
        created_at: get_column(row, "created_at")?,
        started_at: get_column(row, "started_at")?,
        completed_at: get_column(row, "completed_at")?,
        last_event_at: get_column(row, "last_event_at")?,
    })
}

fn export_kind_from_str(kind: &str) -> Result<ExportKind, StoreError> {
    match kind {
        "Accounting" => Ok(ExportKind::Accounting),
        "LocalStorage" => Ok(ExportKind::LocalStorage),
        "CloudDrive" => Ok(ExportKind::CloudDrive),
        other => Err(StoreError::Serialization(format!(
            "unknown export kind '{other}'"
        ))),
    }
}

fn history_from_row(row: &PgRow) -> Result<ExportHistory, StoreError> {
    let export_kind: Option<String> = get_column(row, "export_kind")?;
    let status: String = get_column(row, "status")?;
    let duplicate_key: Option<String> = get_column(row, "duplicate_key")?;
    Ok(ExportHistory {
        id: get_column(row, "id")?,
        job_id: JobId::from_uuid(get_column(row, "job_id")?),
        export_id: ExportId::from_uuid(get_column(row, "export_id")?),
        export_kind: export_kind
            .map(|k| export_kind_from_str(&k))
            .transpose()?,
        status: export_status_from_str(&status)?,
        duplicate_key: duplicate_key.map(DuplicateKey::new),
        external_reference: get_column(row, "external_reference")?,
        error_message: get_column(row, "error_message")?,
        context: json_column(row, "context")?,
        exported_at: get_column(row, "exported_at")?,
    })
}

const JOB_COLUMNS: &str = "id, tenant_id, automation_id, status, from_date, max_results, \
     dispatched_sources, source_outcomes, stats, error_message, created_at, started_at, \
     completed_at, last_event_at";

const HISTORY_COLUMNS: &str = "id, job_id, export_id, export_kind, status, duplicate_key, \
     external_reference, error_message, context, exported_at";

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub async fn automation(&self, id: AutomationId) -> Result<Option<Automation>, StoreError> {
        let row = sqlx::query(
            "SELECT id, tenant_id, name, description, schedule, from_date_rule, active, \
             created_at, updated_at FROM automations WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("automation", e))?;
        row.as_ref().map(automation_from_row).transpose()
    }

    pub async fn active_sources(
        &self,
        automation_id: AutomationId,
    ) -> Result<Vec<Source>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, automation_id, name, config, max_results, active, created_at, updated_at \
             FROM sources WHERE automation_id = $1 AND active ORDER BY id",
        )
        .bind(automation_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("active_sources", e))?;
        rows.iter().map(source_from_row).collect()
    }

    pub async fn source(&self, id: SourceId) -> Result<Option<Source>, StoreError> {
        let row = sqlx::query(
            "SELECT id, automation_id, name, config, max_results, active, created_at, updated_at \
             FROM sources WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("source", e))?;
        row.as_ref().map(source_from_row).transpose()
    }

    pub async fn active_exports(
        &self,
        automation_id: AutomationId,
    ) -> Result<Vec<Export>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, automation_id, name, config, active, created_at, updated_at \
             FROM exports WHERE automation_id = $1 AND active ORDER BY id",
        )
        .bind(automation_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("active_exports", e))?;
        rows.iter().map(export_from_row).collect()
    }

    pub async fn export(&self, id: ExportId) -> Result<Option<Export>, StoreError> {
        let row = sqlx::query(
            "SELECT id, automation_id, name, config, active, created_at, updated_at \
             FROM exports WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("export", e))?;
        row.as_ref().map(export_from_row).transpose()
    }

    pub async fn mappings_for_source(
        &self,
        source_id: SourceId,
    ) -> Result<Vec<Mapping>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, source_id, export_id, priority, conditions, created_at \
             FROM mappings WHERE source_id = $1 ORDER BY priority, export_id",
        )
        .bind(source_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mappings_for_source", e))?;
        rows.iter().map(mapping_from_row).collect()
    }

    pub async fn insert_job(&self, job: Job) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO jobs (id, tenant_id, automation_id, status, from_date, max_results, \
             dispatched_sources, source_outcomes, stats, error_message, created_at, started_at, \
             completed_at, last_event_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(job.id.as_uuid())
        .bind(job.tenant_id.as_uuid())
        .bind(job.automation_id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.from_date)
        .bind(job.max_results.map(|v| v as i32))
        .bind(to_json(&job.dispatched_sources, "dispatched_sources")?)
        .bind(to_json(&job.source_outcomes, "source_outcomes")?)
        .bind(to_json(&job.stats, "stats")?)
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.last_event_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;
        Ok(())
    }

    pub async fn job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn mutate_job(
        &self,
        id: JobId,
        f: &mut dyn FnMut(&mut Job) -> Result<(), DomainError>,
    ) -> Result<Job, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("mutate_job begin", e))?;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mutate_job select", e))?
        .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;

        let mut job = job_from_row(&row)?;
        f(&mut job)?;

        sqlx::query(
            "UPDATE jobs SET status = $2, dispatched_sources = $3, source_outcomes = $4, \
             stats = $5, error_message = $6, started_at = $7, completed_at = $8, \
             last_event_at = $9 WHERE id = $1",
        )
        .bind(job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(to_json(&job.dispatched_sources, "dispatched_sources")?)
        .bind(to_json(&job.source_outcomes, "source_outcomes")?)
        .bind(to_json(&job.stats, "stats")?)
        .bind(&job.error_message)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.last_event_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mutate_job update", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("mutate_job commit", e))?;
        Ok(job)
    }

    pub async fn pending_jobs_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'pending' AND created_at <= $1 \
             ORDER BY created_at"
        ))
        .bind(cutoff)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("pending_jobs_older_than", e))?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn running_jobs_quiet_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'running' AND last_event_at <= $1 \
             ORDER BY last_event_at"
        ))
        .bind(cutoff)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("running_jobs_quiet_since", e))?;
        rows.iter().map(job_from_row).collect()
    }

    async fn insert_history(
        &self,
        row: &ExportHistory,
        on_conflict: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(&format!(
            "INSERT INTO export_history (id, job_id, export_id, export_kind, status, \
             duplicate_key, external_reference, error_message, context, exported_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10){on_conflict}"
        ))
        .bind(row.id)
        .bind(row.job_id.as_uuid())
        .bind(row.export_id.as_uuid())
        .bind(row.export_kind.map(|k| k.to_string()))
        .bind(row.status.as_str())
        .bind(row.duplicate_key.as_ref().map(|k| k.as_str().to_string()))
        .bind(&row.external_reference)
        .bind(&row.error_message)
        .bind(to_json(&row.context, "context")?)
        .bind(row.exported_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_history", e))?;
        Ok(result.rows_affected())
    }

    pub async fn record_history(&self, row: ExportHistory) -> Result<(), StoreError> {
        self.insert_history(&row, "").await?;
        Ok(())
    }

    pub async fn try_record_success(
        &self,
        row: ExportHistory,
    ) -> Result<SuccessInsert, StoreError> {
        if row.status != ExportStatus::Success {
            return Err(StoreError::Conflict(
                "try_record_success requires a success row".into(),
            ));
        }
        let key = row.duplicate_key.clone().ok_or_else(|| {
            StoreError::Conflict("success rows must carry a duplicate key".into())
        })?;

        let inserted = self
            .insert_history(
                &row,
                " ON CONFLICT (export_id, duplicate_key) WHERE status = 'success' DO NOTHING",
            )
            .await?;
        if inserted == 1 {
            return Ok(SuccessInsert::Inserted);
        }

        let existing = self
            .find_success(row.export_id, &key)
            .await?
            .ok_or_else(|| {
                StoreError::Storage("conditional insert conflicted but no success row found".into())
            })?;
        Ok(SuccessInsert::AlreadyRecorded(existing))
    }

    pub async fn find_success(
        &self,
        export_id: ExportId,
        key: &DuplicateKey,
    ) -> Result<Option<ExportHistory>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM export_history \
             WHERE export_id = $1 AND duplicate_key = $2 AND status = 'success' LIMIT 1"
        ))
        .bind(export_id.as_uuid())
        .bind(key.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_success", e))?;
        row.as_ref().map(history_from_row).transpose()
    }

    pub async fn history_for_job(&self, job_id: JobId) -> Result<Vec<ExportHistory>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM export_history WHERE job_id = $1 ORDER BY exported_at"
        ))
        .bind(job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("history_for_job", e))?;
        rows.iter().map(history_from_row).collect()
    }

    pub async fn history_counts(&self, job_id: JobId) -> Result<HistoryCounts, StoreError> {
        let row = sqlx::query(
            "SELECT \
             COUNT(*) FILTER (WHERE status = 'success') AS success, \
             COUNT(*) FILTER (WHERE status = 'failed') AS failed, \
             COUNT(*) FILTER (WHERE status = 'duplicate_skipped') AS duplicate_skipped \
             FROM export_history WHERE job_id = $1",
        )
        .bind(job_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("history_counts", e))?;

        let success: i64 = get_column(&row, "success")?;
        let failed: i64 = get_column(&row, "failed")?;
        let duplicate_skipped: i64 = get_column(&row, "duplicate_skipped")?;
        Ok(HistoryCounts {
            success: success.max(0) as u32,
            failed: failed.max(0) as u32,
            duplicate_skipped: duplicate_skipped.max(0) as u32,
        })
    }

    fn blocking<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        // The StateStore trait is synchronous, but Postgres operations
        // require async. tokio::runtime::Handle bridges the two when called
        // from within a tokio runtime context.
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            StoreError::Storage(
                "PgStateStore requires an async runtime (tokio). Ensure you're calling from \
                 within a tokio runtime context."
                    .to_string(),
            )
        })?;
        handle.block_on(fut)
    }
}

impl StateStore for PgStateStore {
    fn automation(&self, id: AutomationId) -> Result<Option<Automation>, StoreError> {
        self.blocking(self.automation(id))
    }

    fn active_sources(&self, automation_id: AutomationId) -> Result<Vec<Source>, StoreError> {
        self.blocking(self.active_sources(automation_id))
    }

    fn source(&self, id: SourceId) -> Result<Option<Source>, StoreError> {
        self.blocking(self.source(id))
    }

    fn active_exports(&self, automation_id: AutomationId) -> Result<Vec<Export>, StoreError> {
        self.blocking(self.active_exports(automation_id))
    }

    fn export(&self, id: ExportId) -> Result<Option<Export>, StoreError> {
        self.blocking(self.export(id))
    }

    fn mappings_for_source(&self, source_id: SourceId) -> Result<Vec<Mapping>, StoreError> {
        self.blocking(self.mappings_for_source(source_id))
    }

    fn insert_job(&self, job: Job) -> Result<(), StoreError> {
        self.blocking(self.insert_job(job))
    }

    fn job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.blocking(self.job(id))
    }

    fn mutate_job(
        &self,
        id: JobId,
        f: &mut dyn FnMut(&mut Job) -> Result<(), DomainError>,
    ) -> Result<Job, StoreError> {
        self.blocking(self.mutate_job(id, f))
    }

    fn pending_jobs_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        self.blocking(self.pending_jobs_older_than(cutoff))
    }

    fn running_jobs_quiet_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        self.blocking(self.running_jobs_quiet_since(cutoff))
    }

    fn record_history(&self, row: ExportHistory) -> Result<(), StoreError> {
        self.blocking(self.record_history(row))
    }

    fn try_record_success(&self, row: ExportHistory) -> Result<SuccessInsert, StoreError> {
        self.blocking(self.try_record_success(row))
    }

    fn find_success(
        &self,
        export_id: ExportId,
        key: &DuplicateKey,
    ) -> Result<Option<ExportHistory>, StoreError> {
        self.blocking(self.find_success(export_id, key))
    }

    fn history_for_job(&self, job_id: JobId) -> Result<Vec<ExportHistory>, StoreError> {
        self.blocking(self.history_for_job(job_id))
    }

    fn history_counts(&self, job_id: JobId) -> Result<HistoryCounts, StoreError> {
        self.blocking(self.history_counts(job_id))
    }
}
