//! Infrastructure layer: job state store, worker roles, collaborator seams.

pub mod collaborators;
pub mod event_bus;
pub mod exporters;
pub mod store;
pub mod token_cache;
pub mod workers;

pub use collaborators::{Delivery, DeliveryError, ExtractionError, Extractor, LedgerLookup, NoLedger};
pub use exporters::{execute as execute_export, ExportOutcome};
pub use store::{HistoryCounts, InMemoryStateStore, PgStateStore, StateStore, StoreError, SuccessInsert};
pub use token_cache::{Token, TokenCache, TokenSource};
pub use workers::{
    CoordinatorConfig, ExportWorker, ExportWorkerConfig, JobCoordinator, SourceWorker,
    SourceWorkerConfig, WorkerError, WorkerHandle,
};
