use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fakturenn_core::{AutomationId, DomainError, ExportId};

use crate::history::DuplicateKey;
use crate::invoice::Invoice;
use crate::path_template::{render_template, TemplateContext};

/// Export kind discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExportKind {
    Accounting,
    LocalStorage,
    CloudDrive,
}

impl core::fmt::Display for ExportKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            ExportKind::Accounting => "Accounting",
            ExportKind::LocalStorage => "LocalStorage",
            ExportKind::CloudDrive => "CloudDrive",
        };
        f.write_str(name)
    }
}

/// Accounting entry kind for ledger-style destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    Expense,
    Revenue,
    Transfer,
    Advanced,
}

/// Configuration for ledger-style accounting destinations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountingConfig {
    /// Transaction label template (e.g. `"Facture {invoice_id}"`).
    pub label_template: String,
    pub entry_kind: EntryKind,
    /// Debit account code.
    pub debit: String,
    /// Credit account code.
    pub credit: String,
}

/// Configuration for filesystem destinations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalStorageConfig {
    pub base_path: String,
    pub path_template: String,
    #[serde(default = "default_true")]
    pub create_directories: bool,
}

/// Configuration for cloud drive destinations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudDriveConfig {
    pub folder_id: String,
    pub path_template: String,
}

fn default_true() -> bool {
    true
}

/// Per-variant delivery configuration.
///
/// A closed sum type, same rationale as [`crate::source::SourceConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "configuration")]
pub enum ExportConfig {
    Accounting(AccountingConfig),
    LocalStorage(LocalStorageConfig),
    CloudDrive(CloudDriveConfig),
}

impl ExportConfig {
    pub fn kind(&self) -> ExportKind {
        match self {
            ExportConfig::Accounting(_) => ExportKind::Accounting,
            ExportConfig::LocalStorage(_) => ExportKind::LocalStorage,
            ExportConfig::CloudDrive(_) => ExportKind::CloudDrive,
        }
    }

    /// Derive the duplicate key for delivering `invoice` to this destination.
    ///
    /// Accounting: rendered label + transaction date (the destination ledger
    /// matches on exactly these two). Storage kinds: the rendered destination
    /// path. Template failures surface here, before any destination write.
    ///
    /// Known limitation: two distinct invoices sharing label and date collide
    /// on the accounting key.
    pub fn duplicate_key(&self, invoice: &Invoice) -> Result<DuplicateKey, DomainError> {
        let context = TemplateContext::from_invoice(invoice);
        let key = match self {
            ExportConfig::Accounting(config) => {
                let label = render_template(&config.label_template, &context)?;
                format!("{label}|{}", invoice.date.format("%Y-%m-%d"))
            }
            ExportConfig::LocalStorage(config) => {
                let relative = render_template(&config.path_template, &context)?;
                format!("{}/{relative}", config.base_path.trim_end_matches('/'))
            }
            ExportConfig::CloudDrive(config) => {
                let relative = render_template(&config.path_template, &context)?;
                format!("{}/{relative}", config.folder_id)
            }
        };
        Ok(DuplicateKey::new(key))
    }
}

/// An export destination attached to an automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Export {
    pub id: ExportId,
    pub automation_id: AutomationId,
    pub name: String,
    pub config: ExportConfig,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Export {
    pub fn new(
        automation_id: AutomationId,
        name: impl Into<String>,
        config: ExportConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ExportId::new(),
            automation_id,
            name: name.into(),
            config,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn deactivated(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn kind(&self) -> ExportKind {
        self.config.kind()
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn invoice() -> Invoice {
        Invoice::new(
            "INV-001",
            NaiveDate::from_ymd_opt(2025, 10, 29).unwrap(),
            "Free",
        )
        .with_amount(19.99)
        .with_document("/tmp/facture.pdf")
    }

    fn accounting() -> ExportConfig {
        ExportConfig::Accounting(AccountingConfig {
            label_template: "Facture {source} {invoice_id}".into(),
            entry_kind: EntryKind::Expense,
            debit: "606".into(),
            credit: "512".into(),
        })
    }

    #[test]
    fn accounting_key_is_label_plus_date() {
        let key = accounting().duplicate_key(&invoice()).unwrap();
        assert_eq!(key.as_str(), "Facture Free INV-001|2025-10-29");
    }

    #[test]
    fn storage_key_is_destination_path() {
        let config = ExportConfig::LocalStorage(LocalStorageConfig {
            base_path: "/srv/factures/".into(),
            path_template: "{year}/{month}/{source}_{invoice_id}.pdf".into(),
            create_directories: true,
        });
        let key = config.duplicate_key(&invoice()).unwrap();
        assert_eq!(key.as_str(), "/srv/factures/2025/10/Free_INV-001.pdf");
    }

    #[test]
    fn duplicate_key_is_attempt_independent() {
        let config = accounting();
        let first = config.duplicate_key(&invoice()).unwrap();
        let second = config.duplicate_key(&invoice()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn bad_template_fails_key_derivation() {
        let config = ExportConfig::CloudDrive(CloudDriveConfig {
            folder_id: "drive-folder".into(),
            path_template: "{year}/{unknown_var}.pdf".into(),
        });
        assert!(config.duplicate_key(&invoice()).is_err());
    }

    #[test]
    fn config_serializes_with_type_and_configuration() {
        let json = serde_json::to_value(accounting()).unwrap();
        assert_eq!(json["type"], "Accounting");
        assert_eq!(json["configuration"]["entry_kind"], "EXPENSE");
    }
}
