//! Traffic records core.
//!
//! Domain records, the error taxonomy, port traits for the primary store,
//! secondary index, message bus and idempotency ledger, plus the engines that
//! work through them: the idempotency gate, the cache-aside synchronizer, the
//! post-commit unit of work and the lifecycle state machines.
//!
//! No database or HTTP dependencies live here; adapters implement
//! [`ports`] in their own crates, and [`memory`] provides in-process ones.

pub mod cache_aside;
pub mod document;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod ports;
pub mod publisher;
pub mod records;
pub mod registry;
pub mod service;
pub mod transaction;
pub mod types;
pub mod workflow;

pub use cache_aside::CacheAsideRepository;
pub use document::{from_document, to_document, SearchDocument};
pub use error::{Disposition, TrafficError};
pub use ledger::IdempotencyLedger;
pub use ports::Result;
pub use publisher::ChangePublisher;
pub use registry::ActionRegistry;
pub use service::{AvailableEvents, CommandOutcome, RecordService};
pub use types::{ChangeAction, EntityKind, Page, PageRequest, RecordQuery};
