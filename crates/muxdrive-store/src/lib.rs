//! Persistent JSON document store
//!
//! Every piece of durable state is one JSON file in the application data
//! directory (spec'd names: `tenants.json`, `groups.json`, `tasks.json`,
//! `transfers.json`, `sync_logs.json`, `resource_index.json`,
//! `config.json`, `snapshots/<task_id>.json`). Each file is guarded by its
//! own read-write lock; writes go to a temp file and are renamed into
//! place. A file that fails to parse is quarantined: reads and mutations
//! return `PersistenceCorrupt` until the operator repairs it.
//!
//! There are no cross-file transactions. Components that touch several
//! documents take them in the fixed global order
//! `config < tenants < groups < tasks < snapshots < transfers < logs`.

pub mod document;
pub mod repository;
pub mod snapshots;

pub use document::JsonDocument;
pub use repository::{Store, TENANTS_FILE};
pub use snapshots::SnapshotStore;
