//! Black-box orchestration tests over the in-memory store and bus.
//!
//! Most tests drive the protocol deterministically: deliveries are pulled
//! off the durable subscriptions and dispatched to the worker handlers until
//! the system is quiescent. One end-to-end test runs the real spawned
//! worker threads.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{NaiveDate, Utc};

use fakturenn_core::TenantId;
use fakturenn_domain::{
    Automation, Export, ExportConfig, ExportStatus, Invoice, JobStatus, LocalStorageConfig,
    Mapping, Source, SourceConfig, SourceKind,
};
use fakturenn_events::bus::{BusSubscription, EventBus};
use fakturenn_events::message::{subjects, ExportExecute, OrchestrationEvent};
use fakturenn_events::{InMemoryEventBus, InMemorySubscription};
use fakturenn_infra::collaborators::{
    Delivery, DeliveryError, ExtractionError, Extractor, NoLedger,
};
use fakturenn_infra::store::{InMemoryStateStore, StateStore};
use fakturenn_infra::workers::{
    CoordinatorConfig, ExportWorker, ExportWorkerConfig, JobCoordinator, SourceWorker,
    SourceWorkerConfig,
};

type Store = Arc<InMemoryStateStore>;
type Bus = Arc<InMemoryEventBus<OrchestrationEvent>>;

const SHORT: Duration = Duration::from_millis(10);

#[derive(Clone, Default)]
struct ScriptedExtractor {
    failing_kinds: Vec<SourceKind>,
    invoices: Vec<Invoice>,
}

impl Extractor for ScriptedExtractor {
    fn extract(
        &self,
        config: &SourceConfig,
        _from_date: Option<NaiveDate>,
        max_results: u32,
    ) -> Result<Vec<Invoice>, ExtractionError> {
        if self.failing_kinds.contains(&config.kind()) {
            return Err(ExtractionError::Unreachable("provider down".into()));
        }
        let mut invoices = self.invoices.clone();
        invoices.truncate(max_results as usize);
        Ok(invoices)
    }
}

#[derive(Clone)]
struct RecordingDelivery {
    delivered: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

impl Delivery for RecordingDelivery {
    fn deliver(&self, _: &ExportConfig, invoice: &Invoice) -> Result<String, DeliveryError> {
        if self.fail {
            return Err(DeliveryError::Unreachable("destination down".into()));
        }
        let reference = format!("ref-{}", invoice.invoice_id);
        self.delivered.lock().unwrap().push(reference.clone());
        Ok(reference)
    }
}

struct Harness {
    store: Store,
    bus: Bus,
    coordinator: JobCoordinator<Store, Bus>,
    source_worker: SourceWorker<Store, Bus, ScriptedExtractor>,
    export_worker: ExportWorker<Store, Bus, RecordingDelivery, NoLedger>,
    delivered: Arc<Mutex<Vec<String>>>,
    coordinator_subs: Vec<InMemorySubscription<OrchestrationEvent>>,
    source_sub: InMemorySubscription<OrchestrationEvent>,
    export_sub: InMemorySubscription<OrchestrationEvent>,
}

fn harness(extractor: ScriptedExtractor, failing_delivery: bool) -> Harness {
    fakturenn_observability::init();
    let store = InMemoryStateStore::arc();
    let bus: Bus = Arc::new(InMemoryEventBus::new());

    let coordinator_subs = [
        subjects::JOB_STARTED,
        subjects::SOURCE_COMPLETED,
        subjects::SOURCE_FAILED,
        subjects::EXPORT_COMPLETED,
        subjects::EXPORT_FAILED,
    ]
    .iter()
    .map(|subject| bus.subscribe(subject, "coordinator"))
    .collect();
    let source_sub = bus.subscribe(subjects::SOURCE_EXECUTE, "source-workers");
    let export_sub = bus.subscribe(subjects::EXPORT_EXECUTE, "export-workers");

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let delivery = RecordingDelivery {
        delivered: Arc::clone(&delivered),
        fail: failing_delivery,
    };

    Harness {
        coordinator: JobCoordinator::new(Arc::clone(&store), Arc::clone(&bus)),
        source_worker: SourceWorker::new(Arc::clone(&store), Arc::clone(&bus), extractor),
        export_worker: ExportWorker::without_ledger(
            Arc::clone(&store),
            Arc::clone(&bus),
            delivery,
        ),
        store,
        bus,
        delivered,
        coordinator_subs,
        source_sub,
        export_sub,
    }
}

/// Dispatch queued deliveries to the worker handlers until quiescent.
fn pump(h: &Harness) {
    loop {
        let mut progressed = false;

        for sub in &h.coordinator_subs {
            while let Ok(delivery) = sub.recv_timeout(SHORT) {
                let event = delivery.message().clone();
                h.coordinator.handle_event(&event, Utc::now()).unwrap();
                delivery.ack();
                progressed = true;
            }
        }
        while let Ok(delivery) = h.source_sub.recv_timeout(SHORT) {
            if let OrchestrationEvent::SourceExecute(event) = delivery.message().clone() {
                h.source_worker.handle(&event).unwrap();
            }
            delivery.ack();
            progressed = true;
        }
        while let Ok(delivery) = h.export_sub.recv_timeout(SHORT) {
            if let OrchestrationEvent::ExportExecute(event) = delivery.message().clone() {
                h.export_worker.handle(&event).unwrap();
            }
            delivery.ack();
            progressed = true;
        }

        if !progressed {
            break;
        }
    }
}

/// Dispatch coordinator-side deliveries only (sources never run).
fn pump_coordinator_only(h: &Harness) {
    loop {
        let mut progressed = false;
        for sub in &h.coordinator_subs {
            while let Ok(delivery) = sub.recv_timeout(SHORT) {
                let event = delivery.message().clone();
                h.coordinator.handle_event(&event, Utc::now()).unwrap();
                delivery.ack();
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
}

fn seed_automation(store: &InMemoryStateStore) -> Automation {
    let automation = Automation::new(TenantId::new(), "facture-sync");
    store.insert_automation(automation.clone());
    automation
}

fn seed_free_source(store: &InMemoryStateStore, automation: &Automation) -> Source {
    let source = Source::new(
        automation.id,
        "Free",
        SourceConfig::FreeInvoice {
            extraction_params: serde_json::Value::Null,
        },
    );
    store.insert_source(source.clone());
    source
}

fn seed_gmail_source(store: &InMemoryStateStore, automation: &Automation) -> Source {
    let source = Source::new(
        automation.id,
        "Gmail",
        SourceConfig::Gmail {
            sender_from: Some("billing@provider.example".into()),
            subject_contains: None,
            extraction_params: serde_json::Value::Null,
        },
    );
    store.insert_source(source.clone());
    source
}

fn seed_storage_export(
    store: &InMemoryStateStore,
    automation: &Automation,
    base_path: &str,
) -> Export {
    let export = Export::new(
        automation.id,
        format!("archive-{base_path}"),
        ExportConfig::LocalStorage(LocalStorageConfig {
            base_path: base_path.into(),
            path_template: "{year}/{month}/{source}_{invoice_id}.pdf".into(),
            create_directories: true,
        }),
    );
    store.insert_export(export.clone());
    export
}

fn seed_mapping(store: &InMemoryStateStore, source: &Source, export: &Export, priority: i32) {
    store.insert_mapping(Mapping::new(source.id, export.id).with_priority(priority));
}

fn sample_invoices(n: u32) -> Vec<Invoice> {
    (1..=n)
        .map(|i| {
            Invoice::new(
                format!("INV-{i:03}"),
                NaiveDate::from_ymd_opt(2025, 10, 29).unwrap(),
                "Free",
            )
            .with_amount(19.99)
            .with_document(format!("/tmp/facture_{i}.pdf"))
        })
        .collect()
}

#[test]
fn full_run_completes_and_stats_reconcile() {
    let h = harness(
        ScriptedExtractor {
            invoices: sample_invoices(2),
            ..Default::default()
        },
        false,
    );
    let automation = seed_automation(&h.store);
    let source = seed_free_source(&h.store, &automation);
    let export_a = seed_storage_export(&h.store, &automation, "/srv/a");
    let export_b = seed_storage_export(&h.store, &automation, "/srv/b");
    seed_mapping(&h.store, &source, &export_a, 1);
    seed_mapping(&h.store, &source, &export_b, 2);

    let job_id = h
        .coordinator
        .trigger(automation.id, None, None, Utc::now())
        .unwrap();
    pump(&h);

    let job = h.store.job(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.completed_at.is_some());
    assert_eq!(job.stats.sources_succeeded, 1);
    assert_eq!(job.stats.invoices_discovered, 2);
    assert_eq!(job.stats.exported, 4);
    assert_eq!(job.stats.export_failed, 0);

    // Reconciliation invariant: stats equal the audit trail.
    let rows = h.store.history_for_job(job_id).unwrap();
    assert_eq!(
        job.stats.exported + job.stats.duplicate_skipped + job.stats.export_failed,
        rows.len() as u32
    );
    assert_eq!(h.delivered.lock().unwrap().len(), 4);
}

#[test]
fn idempotent_rerun_skips_already_delivered_exports() {
    let h = harness(
        ScriptedExtractor {
            invoices: sample_invoices(2),
            ..Default::default()
        },
        false,
    );
    let automation = seed_automation(&h.store);
    let source = seed_free_source(&h.store, &automation);
    let export = seed_storage_export(&h.store, &automation, "/srv/a");
    seed_mapping(&h.store, &source, &export, 1);

    let from = NaiveDate::from_ymd_opt(2025, 10, 1);

    let first = h
        .coordinator
        .trigger(automation.id, from, None, Utc::now())
        .unwrap();
    pump(&h);
    assert_eq!(h.delivered.lock().unwrap().len(), 2);

    let second = h
        .coordinator
        .trigger(automation.id, from, None, Utc::now())
        .unwrap();
    pump(&h);

    // No new external side effect on the re-run.
    assert_eq!(h.delivered.lock().unwrap().len(), 2);

    let second_job = h.store.job(second).unwrap().unwrap();
    assert_eq!(second_job.status, JobStatus::Completed);
    assert_eq!(second_job.stats.exported, 0);
    assert_eq!(second_job.stats.duplicate_skipped, 2);

    let rows = h.store.history_for_job(second).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows
        .iter()
        .all(|r| r.status == ExportStatus::DuplicateSkipped));

    let first_job = h.store.job(first).unwrap().unwrap();
    assert_eq!(first_job.stats.exported, 2);
}

#[test]
fn partial_source_failure_still_completes() {
    let h = harness(
        ScriptedExtractor {
            failing_kinds: vec![SourceKind::Gmail],
            invoices: sample_invoices(1),
        },
        false,
    );
    let automation = seed_automation(&h.store);
    let free = seed_free_source(&h.store, &automation);
    let gmail = seed_gmail_source(&h.store, &automation);
    let export = seed_storage_export(&h.store, &automation, "/srv/a");
    seed_mapping(&h.store, &free, &export, 1);
    seed_mapping(&h.store, &gmail, &export, 1);

    let job_id = h
        .coordinator
        .trigger(automation.id, None, None, Utc::now())
        .unwrap();
    pump(&h);

    let job = h.store.job(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.stats.sources_succeeded, 1);
    assert_eq!(job.stats.sources_failed, 1);
    assert_eq!(job.stats.exported, 1);
}

#[test]
fn all_sources_failed_fails_the_job() {
    let h = harness(
        ScriptedExtractor {
            failing_kinds: vec![SourceKind::FreeInvoice, SourceKind::Gmail],
            ..Default::default()
        },
        false,
    );
    let automation = seed_automation(&h.store);
    let free = seed_free_source(&h.store, &automation);
    let gmail = seed_gmail_source(&h.store, &automation);
    let export = seed_storage_export(&h.store, &automation, "/srv/a");
    seed_mapping(&h.store, &free, &export, 1);
    seed_mapping(&h.store, &gmail, &export, 1);

    let job_id = h
        .coordinator
        .trigger(automation.id, None, None, Utc::now())
        .unwrap();
    pump(&h);

    let job = h.store.job(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.stats.sources_failed, 2);
    assert_eq!(job.stats.exported, 0);
    assert!(job.error_message.is_some());
}

#[test]
fn failed_deliveries_reconcile_and_do_not_fail_the_job() {
    let h = harness(
        ScriptedExtractor {
            invoices: sample_invoices(2),
            ..Default::default()
        },
        true,
    );
    let automation = seed_automation(&h.store);
    let source = seed_free_source(&h.store, &automation);
    let export = seed_storage_export(&h.store, &automation, "/srv/a");
    seed_mapping(&h.store, &source, &export, 1);

    let job_id = h
        .coordinator
        .trigger(automation.id, None, None, Utc::now())
        .unwrap();
    pump(&h);

    let job = h.store.job(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.stats.exported, 0);
    assert_eq!(job.stats.export_failed, 2);

    let rows = h.store.history_for_job(job_id).unwrap();
    assert_eq!(
        job.stats.exported + job.stats.duplicate_skipped + job.stats.export_failed,
        rows.len() as u32
    );
    assert!(h.delivered.lock().unwrap().is_empty());
}

#[test]
fn concurrent_redelivery_never_yields_two_success_rows() {
    let h = harness(ScriptedExtractor::default(), false);
    let automation = seed_automation(&h.store);
    let source = seed_free_source(&h.store, &automation);
    let export = seed_storage_export(&h.store, &automation, "/srv/a");
    seed_mapping(&h.store, &source, &export, 1);

    let job = fakturenn_domain::Job::new(automation.tenant_id, automation.id, None, None, Utc::now());
    let job_id = job.id;
    h.store.insert_job(job).unwrap();

    let event = ExportExecute {
        job_id,
        source_id: source.id,
        export_id: export.id,
        invoice: sample_invoices(1).remove(0),
        priority: 1,
    };

    std::thread::scope(|scope| {
        let first = scope.spawn(|| h.export_worker.handle(&event).unwrap());
        let second = scope.spawn(|| h.export_worker.handle(&event).unwrap());
        first.join().unwrap();
        second.join().unwrap();
    });

    let rows = h.store.history_for_job(job_id).unwrap();
    assert_eq!(rows.len(), 2);
    let successes = rows
        .iter()
        .filter(|r| r.status == ExportStatus::Success)
        .count();
    let skipped = rows
        .iter()
        .filter(|r| r.status == ExportStatus::DuplicateSkipped)
        .count();
    assert_eq!(successes, 1);
    assert_eq!(skipped, 1);
}

#[test]
fn wedged_source_forces_timeout_exactly_once() {
    let h = harness(
        ScriptedExtractor {
            invoices: sample_invoices(1),
            ..Default::default()
        },
        false,
    );
    let automation = seed_automation(&h.store);
    let source = seed_free_source(&h.store, &automation);
    let export = seed_storage_export(&h.store, &automation, "/srv/a");
    seed_mapping(&h.store, &source, &export, 1);

    let job_id = h
        .coordinator
        .trigger(automation.id, None, None, Utc::now())
        .unwrap();
    // The source worker never runs; the job stays running.
    pump_coordinator_only(&h);
    assert_eq!(
        h.store.job(job_id).unwrap().unwrap().status,
        JobStatus::Running
    );

    let ceiling = Duration::from_secs(1800);
    let later = Utc::now() + chrono::Duration::minutes(31);
    assert_eq!(h.coordinator.force_timeouts(ceiling, later).unwrap(), 1);
    assert_eq!(h.coordinator.force_timeouts(ceiling, later).unwrap(), 0);

    let job = h.store.job(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.as_deref().unwrap().contains("timed out"));

    // A straggling source report after the forced failure stays a no-op.
    pump(&h);
    assert_eq!(h.store.job(job_id).unwrap().unwrap().status, JobStatus::Failed);
}

#[test]
fn reconciliation_recovers_a_stale_pending_job() {
    let h = harness(
        ScriptedExtractor {
            invoices: sample_invoices(1),
            ..Default::default()
        },
        false,
    );
    let automation = seed_automation(&h.store);
    let source = seed_free_source(&h.store, &automation);
    let export = seed_storage_export(&h.store, &automation, "/srv/a");
    seed_mapping(&h.store, &source, &export, 1);

    // Crash-after-write: the row exists, the start event was never
    // published.
    let created = Utc::now() - chrono::Duration::minutes(5);
    let job = fakturenn_domain::Job::new(automation.tenant_id, automation.id, None, None, created);
    let job_id = job.id;
    h.store.insert_job(job).unwrap();

    let republished = h
        .coordinator
        .reconcile_pending(Duration::from_secs(30), Utc::now())
        .unwrap();
    assert_eq!(republished, 1);

    pump(&h);
    let job = h.store.job(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.stats.exported, 1);
}

#[test]
fn zero_active_sources_completes_with_zero_stats() {
    let h = harness(ScriptedExtractor::default(), false);
    let automation = seed_automation(&h.store);

    let job_id = h
        .coordinator
        .trigger(automation.id, None, None, Utc::now())
        .unwrap();
    pump(&h);

    let job = h.store.job(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.stats, Default::default());
    assert!(h.store.history_for_job(job_id).unwrap().is_empty());
}

#[test]
fn trigger_rejects_missing_or_inactive_automation() {
    let h = harness(ScriptedExtractor::default(), false);
    assert!(h
        .coordinator
        .trigger(fakturenn_core::AutomationId::new(), None, None, Utc::now())
        .is_err());

    let inactive = Automation::new(TenantId::new(), "dormant").deactivated();
    h.store.insert_automation(inactive.clone());
    assert!(h
        .coordinator
        .trigger(inactive.id, None, None, Utc::now())
        .is_err());
}

#[test]
fn spawned_workers_run_a_job_end_to_end() {
    fakturenn_observability::init();
    let store = InMemoryStateStore::arc();
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let delivered = Arc::new(Mutex::new(Vec::new()));

    let automation = seed_automation(&store);
    let source = seed_free_source(&store, &automation);
    let export = seed_storage_export(&store, &automation, "/srv/a");
    seed_mapping(&store, &source, &export, 1);

    let coordinator_handle = JobCoordinator::new(Arc::clone(&store), Arc::clone(&bus))
        .spawn(CoordinatorConfig::default());
    let source_handle = SourceWorker::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        ScriptedExtractor {
            invoices: sample_invoices(2),
            ..Default::default()
        },
    )
    .spawn(SourceWorkerConfig::default());
    let export_handle = ExportWorker::without_ledger(
        Arc::clone(&store),
        Arc::clone(&bus),
        RecordingDelivery {
            delivered: Arc::clone(&delivered),
            fail: false,
        },
    )
    .spawn(ExportWorkerConfig::default());

    // A second coordinator replica triggers; the spawned one orchestrates.
    let trigger_side = JobCoordinator::new(Arc::clone(&store), Arc::clone(&bus));
    let job_id = trigger_side
        .trigger(automation.id, None, None, Utc::now())
        .unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = store.job(job_id).unwrap().unwrap();
        if job.status.is_terminal() {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "job did not finish in time"
        );
        std::thread::sleep(Duration::from_millis(20));
    }

    coordinator_handle.shutdown();
    source_handle.shutdown();
    export_handle.shutdown();

    let job = store.job(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.stats.exported, 2);
    assert_eq!(delivered.lock().unwrap().len(), 2);
}
