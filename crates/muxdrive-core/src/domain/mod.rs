//! Domain entities
//!
//! Records persisted by the document store and exchanged between the
//! router, transfer engine, scheduler, sync runner, and gateway.

pub mod api_log;
pub mod group;
pub mod ids;
pub mod snapshot;
pub mod sync_task;
pub mod tenant;
pub mod transfer;

pub use api_log::{ApiLogEntry, ApiLogStatus};
pub use group::Group;
pub use ids::{GroupId, TaskId, TenantId, TransferId};
pub use snapshot::{SnapshotEntry, SyncSnapshot};
pub use sync_task::{
    ConflictPolicy, DetectionMode, SyncDirection, SyncLogEntry, SyncTask, TaskStatus,
};
pub use tenant::{Platform, Tenant, TenantPermission};
pub use transfer::{
    ResumePayload, Transfer, TransferDirection, TransferKind, TransferStatus,
};
