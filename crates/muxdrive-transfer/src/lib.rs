//! Resumable transfer engine
//!
//! Transfers are durable records reconstructed from disk on startup.
//! Uploads stream fixed-size blocks with per-block retry and a persisted
//! `next_seq` checkpoint; downloads append to a `.part` temp file and
//! resume from its length. Pause takes effect between blocks; cancel and
//! tenant removal fail the record; restart clones a failed record into a
//! fresh pending one. Every persisted mutation publishes an event carrying
//! the full record.

pub mod control;
pub mod engine;
pub mod events;
pub mod retry;

pub use control::{ControlGate, TransferControl};
pub use engine::TransferEngine;
pub use events::TransferEvent;
pub use retry::{with_retry, RetryPolicy};
