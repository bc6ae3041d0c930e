//! `fakturenn-events` — orchestration wire contract and event bus.
//!
//! All cross-component communication happens through immutable event
//! payloads on the bus; no worker calls another directly.

pub mod bus;
pub mod in_memory_bus;
pub mod message;

pub use bus::{AckDisposition, BusRecvError, BusSubscription, Delivery, EventBus};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus, InMemorySubscription};
pub use message::{
    subjects, ExportCompleted, ExportExecute, ExportFailed, JobCompleted, JobFailed, JobStarted,
    OrchestrationEvent, SourceCompleted, SourceExecute, SourceFailed,
};
