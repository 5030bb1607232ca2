//! Scheduled folder synchronization
//!
//! Given a task, the runner enumerates the remote folder and the local
//! directory, diffs both against the task's last committed snapshot,
//! resolves conflicts by policy, executes the resulting actions through
//! the transfer engine, and commits a fresh snapshot only when every
//! action succeeded.

pub mod diff;
pub mod filter;
pub mod runner;
pub mod scan;

pub use diff::{ChangeSummary, SyncAction, SyncPlan};
pub use filter::PathFilter;
pub use runner::SyncRunner;
