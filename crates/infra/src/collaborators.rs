//! Collaborator seams consumed by the worker roles.
//!
//! Extraction and delivery mechanics (browser automation, mailbox search,
//! accounting APIs, filesystem/cloud writes) live outside the orchestration
//! core; the workers only depend on these traits.

use chrono::NaiveDate;
use thiserror::Error;

use fakturenn_domain::{DuplicateKey, ExportConfig, Invoice, SourceConfig};

/// Extraction failure. Recorded as a source failure on the job; never aborts
/// sibling sources.
#[derive(Debug, Clone, Error)]
pub enum ExtractionError {
    #[error("source unreachable: {0}")]
    Unreachable(String),
    #[error("authentication expired: {0}")]
    AuthExpired(String),
    #[error("document parse failure: {0}")]
    Parse(String),
    #[error("extraction failed: {0}")]
    Other(String),
}

/// Delivery failure. Local to one (invoice, export) pair; never blocks
/// sibling deliveries.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    #[error("destination unreachable: {0}")]
    Unreachable(String),
    #[error("destination rejected the document: {0}")]
    Rejected(String),
    #[error("delivery failed: {0}")]
    Other(String),
}

/// Pulls invoices out of one source.
pub trait Extractor: Send + Sync {
    fn extract(
        &self,
        config: &SourceConfig,
        from_date: Option<NaiveDate>,
        max_results: u32,
    ) -> Result<Vec<Invoice>, ExtractionError>;
}

/// Pushes one invoice into one destination, returning the destination's
/// reference (transaction id, stored path, drive file id).
pub trait Delivery: Send + Sync {
    fn deliver(&self, config: &ExportConfig, invoice: &Invoice) -> Result<String, DeliveryError>;
}

/// Server-side duplicate lookup, for destinations that expose their own
/// ledger (accounting journals).
pub trait LedgerLookup: Send + Sync {
    fn find(
        &self,
        config: &ExportConfig,
        key: &DuplicateKey,
    ) -> Result<Option<String>, DeliveryError>;
}

/// For destinations with no server-side ledger; the export history is then
/// the only duplicate authority.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLedger;

impl LedgerLookup for NoLedger {
    fn find(
        &self,
        _config: &ExportConfig,
        _key: &DuplicateKey,
    ) -> Result<Option<String>, DeliveryError> {
        Ok(None)
    }
}
