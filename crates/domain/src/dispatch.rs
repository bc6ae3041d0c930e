//! Pure dispatch planning.
//!
//! Both units are total functions over already-loaded state: the coordinator
//! and the source workers call them, the bus carries their output. Keeping
//! them pure keeps the fan-out logic independently testable.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use fakturenn_core::{AutomationId, ExportId, JobId, SourceId, TenantId};

use crate::export::Export;
use crate::invoice::Invoice;
use crate::job::Job;
use crate::mapping::Mapping;
use crate::source::Source;

/// One extraction work item, bounded by the job snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceWorkItem {
    pub job_id: JobId,
    pub automation_id: AutomationId,
    pub tenant_id: TenantId,
    pub source_id: SourceId,
    pub from_date: Option<NaiveDate>,
    pub max_results: u32,
}

/// Map a job's active sources to a bounded set of extraction work items.
///
/// The job's `max_results` snapshot, when present, overrides each source's
/// own cap for this run.
pub fn plan_source_work(job: &Job, sources: &[Source]) -> Vec<SourceWorkItem> {
    sources
        .iter()
        .filter(|s| s.active && s.automation_id == job.automation_id)
        .map(|s| SourceWorkItem {
            job_id: job.id,
            automation_id: job.automation_id,
            tenant_id: job.tenant_id,
            source_id: s.id,
            from_date: job.from_date,
            max_results: job.max_results.unwrap_or(s.max_results),
        })
        .collect()
}

/// One delivery work item carrying the full invoice snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportWorkItem {
    pub job_id: JobId,
    pub source_id: SourceId,
    pub export_id: ExportId,
    pub invoice: Invoice,
    pub priority: i32,
}

/// Map one extracted invoice to delivery work items via the source's
/// mappings.
///
/// A mapping contributes a work item only when it targets an active export
/// and its filter conditions pass against the invoice. Items are ordered by
/// (priority, export id) so emission order is deterministic; completion
/// order is not guaranteed.
pub fn plan_export_work(
    job_id: JobId,
    source: &Source,
    invoice: &Invoice,
    mappings: &[Mapping],
    exports: &[Export],
) -> Vec<ExportWorkItem> {
    let mut items: Vec<ExportWorkItem> = mappings
        .iter()
        .filter(|m| m.source_id == source.id)
        .filter(|m| m.passes(invoice))
        .filter(|m| exports.iter().any(|e| e.id == m.export_id && e.active))
        .map(|m| ExportWorkItem {
            job_id,
            source_id: source.id,
            export_id: m.export_id,
            invoice: invoice.clone(),
            priority: m.priority,
        })
        .collect();

    items.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.export_id.cmp(&b.export_id))
    });
    items
}
