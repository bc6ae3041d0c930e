//! Duplicate-check-then-deliver protocol.
//!
//! The protocol, in order: derive the duplicate key (fail fast on template
//! errors, before any side effect), look for an existing success — the
//! destination's own ledger first for accounting exports, the export history
//! otherwise — deliver, then record the success row through the store's
//! atomic conditional insert. Losing that insert to a concurrent copy of the
//! same delivery downgrades the result to `duplicate_skipped`; two success
//! rows for one (export, duplicate key) cannot exist.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use fakturenn_core::JobId;
use fakturenn_domain::{Export, ExportConfig, ExportHistory, ExportStatus, Invoice};

use crate::collaborators::{Delivery, LedgerLookup};
use crate::store::{StateStore, StoreError, SuccessInsert};

/// Result of one delivery attempt, mirrored into the export history.
#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub status: ExportStatus,
    pub external_reference: Option<String>,
    pub error_message: Option<String>,
}

impl ExportOutcome {
    fn success(reference: String) -> Self {
        Self {
            status: ExportStatus::Success,
            external_reference: Some(reference),
            error_message: None,
        }
    }

    fn skipped() -> Self {
        Self {
            status: ExportStatus::DuplicateSkipped,
            external_reference: None,
            error_message: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            status: ExportStatus::Failed,
            external_reference: None,
            error_message: Some(error),
        }
    }
}

/// Execute one (invoice, export) delivery.
///
/// Every call leaves exactly one history row, whatever the outcome; the
/// returned error covers store failures only (retried via redelivery).
pub fn execute<S, D, L>(
    store: &S,
    delivery: &D,
    ledger: &L,
    job_id: JobId,
    export: &Export,
    invoice: &Invoice,
    now: DateTime<Utc>,
) -> Result<ExportOutcome, StoreError>
where
    S: StateStore,
    D: Delivery,
    L: LedgerLookup,
{
    let kind = export.config.kind();

    let key = match export.config.duplicate_key(invoice) {
        Ok(key) => key,
        Err(err) => {
            // Fatal configuration error: no side effect was attempted, the
            // failure is scoped to this one mapping.
            warn!(
                job_id = %job_id,
                export_id = %export.id,
                error = %err,
                "export configuration rejected before delivery"
            );
            store.record_history(ExportHistory::failed(
                job_id,
                export.id,
                Some(kind),
                None,
                invoice,
                err.to_string(),
                now,
            ))?;
            return Ok(ExportOutcome::failed(err.to_string()));
        }
    };

    let mut already_exported = false;
    if matches!(export.config, ExportConfig::Accounting(_)) {
        match ledger.find(&export.config, &key) {
            Ok(Some(reference)) => {
                debug!(export_id = %export.id, reference = %reference, "duplicate found in destination ledger");
                already_exported = true;
            }
            Ok(None) => {}
            // A failed lookup must not block the delivery; the history check
            // and the conditional insert still guard against duplicates.
            Err(err) => warn!(export_id = %export.id, error = %err, "ledger duplicate lookup failed"),
        }
    }
    if !already_exported && store.find_success(export.id, &key)?.is_some() {
        already_exported = true;
    }

    if already_exported {
        info!(
            job_id = %job_id,
            export_id = %export.id,
            duplicate_key = %key,
            "export skipped (duplicate)"
        );
        store.record_history(ExportHistory::duplicate_skipped(
            job_id,
            export.id,
            Some(kind),
            key,
            invoice,
            now,
        ))?;
        return Ok(ExportOutcome::skipped());
    }

    match delivery.deliver(&export.config, invoice) {
        Ok(reference) => {
            let row = ExportHistory::success(
                job_id,
                export.id,
                Some(kind),
                key.clone(),
                invoice,
                reference.clone(),
                now,
            );
            match store.try_record_success(row)? {
                SuccessInsert::Inserted => {
                    info!(
                        job_id = %job_id,
                        export_id = %export.id,
                        reference = %reference,
                        "export completed"
                    );
                    Ok(ExportOutcome::success(reference))
                }
                SuccessInsert::AlreadyRecorded(_) => {
                    // A concurrent copy of this delivery won the insert race.
                    info!(
                        job_id = %job_id,
                        export_id = %export.id,
                        duplicate_key = %key,
                        "export raced a concurrent duplicate; recorded as skipped"
                    );
                    store.record_history(ExportHistory::duplicate_skipped(
                        job_id,
                        export.id,
                        Some(kind),
                        key,
                        invoice,
                        now,
                    ))?;
                    Ok(ExportOutcome::skipped())
                }
            }
        }
        Err(err) => {
            warn!(
                job_id = %job_id,
                export_id = %export.id,
                error = %err,
                "export delivery failed"
            );
            store.record_history(ExportHistory::failed(
                job_id,
                export.id,
                Some(kind),
                Some(key),
                invoice,
                err.to_string(),
                now,
            ))?;
            Ok(ExportOutcome::failed(err.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use fakturenn_core::AutomationId;
    use fakturenn_domain::{AccountingConfig, DuplicateKey, EntryKind, LocalStorageConfig};

    use crate::collaborators::{DeliveryError, NoLedger};
    use crate::store::InMemoryStateStore;

    use super::*;

    struct StaticDelivery {
        result: Result<String, DeliveryError>,
    }

    impl Delivery for StaticDelivery {
        fn deliver(&self, _: &ExportConfig, _: &Invoice) -> Result<String, DeliveryError> {
            self.result.clone()
        }
    }

    struct StaticLedger {
        reference: Option<String>,
    }

    impl LedgerLookup for StaticLedger {
        fn find(
            &self,
            _: &ExportConfig,
            _: &DuplicateKey,
        ) -> Result<Option<String>, DeliveryError> {
            Ok(self.reference.clone())
        }
    }

    fn invoice() -> Invoice {
        Invoice::new(
            "INV-001",
            NaiveDate::from_ymd_opt(2025, 10, 29).unwrap(),
            "Free",
        )
        .with_amount(19.99)
    }

    fn storage_export() -> Export {
        Export::new(
            AutomationId::new(),
            "archive",
            ExportConfig::LocalStorage(LocalStorageConfig {
                base_path: "/srv/factures".into(),
                path_template: "{year}/{invoice_id}.pdf".into(),
                create_directories: true,
            }),
        )
    }

    fn accounting_export() -> Export {
        Export::new(
            AutomationId::new(),
            "ledger",
            ExportConfig::Accounting(AccountingConfig {
                label_template: "Facture {invoice_id}".into(),
                entry_kind: EntryKind::Expense,
                debit: "606".into(),
                credit: "512".into(),
            }),
        )
    }

    #[test]
    fn success_then_duplicate_skip_on_rerun() {
        let store = InMemoryStateStore::new();
        let export = storage_export();
        let delivery = StaticDelivery {
            result: Ok("stored-path".into()),
        };

        let first = execute(
            &store,
            &delivery,
            &NoLedger,
            JobId::new(),
            &export,
            &invoice(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(first.status, ExportStatus::Success);
        assert_eq!(first.external_reference.as_deref(), Some("stored-path"));

        let second = execute(
            &store,
            &delivery,
            &NoLedger,
            JobId::new(),
            &export,
            &invoice(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(second.status, ExportStatus::DuplicateSkipped);
    }

    #[test]
    fn destination_ledger_duplicate_wins_over_history() {
        let store = InMemoryStateStore::new();
        let export = accounting_export();
        let delivery = StaticDelivery {
            result: Ok("txn-9".into()),
        };
        let ledger = StaticLedger {
            reference: Some("txn-1".into()),
        };

        let outcome = execute(
            &store,
            &delivery,
            &ledger,
            JobId::new(),
            &export,
            &invoice(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(outcome.status, ExportStatus::DuplicateSkipped);
    }

    #[test]
    fn delivery_failure_records_failed_row() {
        let store = InMemoryStateStore::new();
        let export = storage_export();
        let delivery = StaticDelivery {
            result: Err(DeliveryError::Unreachable("destination down".into())),
        };
        let job_id = JobId::new();

        let outcome = execute(
            &store,
            &delivery,
            &NoLedger,
            job_id,
            &export,
            &invoice(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(outcome.status, ExportStatus::Failed);

        let rows = store.history_for_job(job_id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ExportStatus::Failed);
        assert!(rows[0].error_message.as_deref().unwrap().contains("unreachable"));
    }

    #[test]
    fn template_error_fails_before_delivery() {
        let store = InMemoryStateStore::new();
        let export = Export::new(
            AutomationId::new(),
            "broken",
            ExportConfig::LocalStorage(LocalStorageConfig {
                base_path: "/srv".into(),
                path_template: "{bogus}.pdf".into(),
                create_directories: true,
            }),
        );
        // A panicking delivery proves no destination call happens.
        struct PanickingDelivery;
        impl Delivery for PanickingDelivery {
            fn deliver(&self, _: &ExportConfig, _: &Invoice) -> Result<String, DeliveryError> {
                panic!("delivery must not be attempted");
            }
        }
        let job_id = JobId::new();

        let outcome = execute(
            &store,
            &PanickingDelivery,
            &NoLedger,
            job_id,
            &export,
            &invoice(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(outcome.status, ExportStatus::Failed);
        assert_eq!(store.history_for_job(job_id).unwrap().len(), 1);
    }
}
