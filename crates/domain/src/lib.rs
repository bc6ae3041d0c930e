//! `fakturenn-domain` — the invoice-automation data model.
//!
//! Automations bind extraction **sources** to delivery **exports** through
//! prioritized, conditionally-filtered **mappings**. A triggered run is a
//! **job**; its audit trail is the **export history**. Invoices are the
//! transient normalized representation flowing between the two sides.

pub mod automation;
pub mod dispatch;
pub mod export;
pub mod history;
pub mod invoice;
pub mod job;
pub mod mapping;
pub mod path_template;
pub mod source;

pub use automation::{Automation, FromDateRule};
pub use dispatch::{plan_export_work, plan_source_work, ExportWorkItem, SourceWorkItem};
pub use export::{
    AccountingConfig, CloudDriveConfig, EntryKind, Export, ExportConfig, ExportKind,
    LocalStorageConfig,
};
pub use history::{DuplicateKey, ExportHistory, ExportStatus, HistoryContext};
pub use invoice::Invoice;
pub use job::{Job, JobStats, JobStatus, SourceOutcome};
pub use mapping::{FilterConditions, Mapping};
pub use source::{Source, SourceConfig, SourceKind};
