use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Universal, source-agnostic representation of one billing document.
///
/// Invoices are **transient**: constructed per extraction, carried through
/// events, never independently persisted. The persisted trace of an invoice
/// is its export history rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    /// Source-assigned identifier (e.g. a provider invoice number).
    pub invoice_id: String,
    /// Invoice date.
    pub date: NaiveDate,
    /// Parsed amount in EUR, when the source could extract one.
    pub amount: Option<f64>,
    /// Document payload reference (downloaded file path or download URL).
    pub document: Option<String>,
    /// Logical source name (e.g. "Free", "FreeMobile").
    pub source_name: String,
    /// Free-form fields extracted alongside the document.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl Invoice {
    pub fn new(
        invoice_id: impl Into<String>,
        date: NaiveDate,
        source_name: impl Into<String>,
    ) -> Self {
        Self {
            invoice_id: invoice_id.into(),
            date,
            amount: None,
            document: None,
            source_name: source_name.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_amount(mut self, amount: f64) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_document(mut self, document: impl Into<String>) -> Self {
        self.document = Some(document.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// File name portion of the document reference, when present.
    pub fn document_filename(&self) -> Option<&str> {
        self.document
            .as_deref()
            .map(|d| d.rsplit(['/', '\\']).next().unwrap_or(d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn document_filename_strips_directories() {
        let inv = Invoice::new("INV-001", date(2025, 1, 15), "Free")
            .with_document("/var/tmp/free/2025/facture.pdf");
        assert_eq!(inv.document_filename(), Some("facture.pdf"));
    }

    #[test]
    fn document_filename_absent_without_document() {
        let inv = Invoice::new("INV-001", date(2025, 1, 15), "Free");
        assert_eq!(inv.document_filename(), None);
    }
}
