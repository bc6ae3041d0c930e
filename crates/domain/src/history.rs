use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fakturenn_core::{ExportId, JobId};

use crate::export::ExportKind;
use crate::invoice::Invoice;

/// Deterministic identity of one (invoice, export) delivery.
///
/// Derived from the invoice's natural identity per export kind (rendered
/// accounting label + date, or rendered destination path) and independent of
/// delivery attempt count. This is the anchor for duplicate suppression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DuplicateKey(String);

impl DuplicateKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for DuplicateKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of an attempted delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    Success,
    Failed,
    DuplicateSkipped,
}

impl ExportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportStatus::Success => "success",
            ExportStatus::Failed => "failed",
            ExportStatus::DuplicateSkipped => "duplicate_skipped",
        }
    }
}

/// Invoice snapshot carried on a history row, so the audit trail is
/// self-describing without the transient invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryContext {
    pub invoice_id: String,
    pub date: NaiveDate,
    pub amount: Option<f64>,
    pub source: String,
}

impl From<&Invoice> for HistoryContext {
    fn from(invoice: &Invoice) -> Self {
        Self {
            invoice_id: invoice.invoice_id.clone(),
            date: invoice.date,
            amount: invoice.amount,
            source: invoice.source_name.clone(),
        }
    }
}

/// One row per attempted (invoice, export) delivery.
///
/// Rows are append-only; their existence, not worker memory, decides whether
/// an export already happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportHistory {
    pub id: Uuid,
    pub job_id: JobId,
    pub export_id: ExportId,
    /// None when the export definition disappeared between dispatch and
    /// delivery.
    pub export_kind: Option<ExportKind>,
    pub status: ExportStatus,
    /// None only for deliveries that failed before a key could be derived.
    pub duplicate_key: Option<DuplicateKey>,
    /// Reference returned by the destination on success (transaction id,
    /// stored file path, drive file id).
    pub external_reference: Option<String>,
    pub error_message: Option<String>,
    pub context: HistoryContext,
    pub exported_at: DateTime<Utc>,
}

impl ExportHistory {
    pub fn success(
        job_id: JobId,
        export_id: ExportId,
        export_kind: Option<ExportKind>,
        duplicate_key: DuplicateKey,
        invoice: &Invoice,
        external_reference: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id,
            export_id,
            export_kind,
            status: ExportStatus::Success,
            duplicate_key: Some(duplicate_key),
            external_reference: Some(external_reference.into()),
            error_message: None,
            context: HistoryContext::from(invoice),
            exported_at: now,
        }
    }

    pub fn failed(
        job_id: JobId,
        export_id: ExportId,
        export_kind: Option<ExportKind>,
        duplicate_key: Option<DuplicateKey>,
        invoice: &Invoice,
        error_message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id,
            export_id,
            export_kind,
            status: ExportStatus::Failed,
            duplicate_key,
            external_reference: None,
            error_message: Some(error_message.into()),
            context: HistoryContext::from(invoice),
            exported_at: now,
        }
    }

    pub fn duplicate_skipped(
        job_id: JobId,
        export_id: ExportId,
        export_kind: Option<ExportKind>,
        duplicate_key: DuplicateKey,
        invoice: &Invoice,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id,
            export_id,
            export_kind,
            status: ExportStatus::DuplicateSkipped,
            duplicate_key: Some(duplicate_key),
            external_reference: None,
            error_message: Some("duplicate entry already exists".into()),
            context: HistoryContext::from(invoice),
            exported_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(ExportStatus::DuplicateSkipped).unwrap(),
            "duplicate_skipped"
        );
        assert_eq!(ExportStatus::DuplicateSkipped.as_str(), "duplicate_skipped");
    }
}
