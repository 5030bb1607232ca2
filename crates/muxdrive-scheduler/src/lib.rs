//! Scheduled sync dispatch
//!
//! [`cron`] implements the 5-field cron grammar and next-occurrence
//! computation; [`ticker`] wakes every 30 seconds (or at the next due
//! time, whichever is sooner) and hands due tasks to a
//! [`TaskDispatcher`].

pub mod cron;
pub mod ticker;

pub use cron::CronExpr;
pub use ticker::{Scheduler, TaskDispatcher};
