//! HTTP drive backend
//!
//! Implements [`muxdrive_core::ports::DriveBackend`] against the
//! open-platform drive HTTP API: chunked uploads via
//! `upload_prepare` / `upload_part` / `upload_finish`, ranged downloads,
//! folder CRUD, and batch metadata enrichment. Tenant access tokens are
//! cached in memory and refreshed inside a 30-minute expiry window.

pub mod backend;
pub mod client;
pub mod protocol;

pub use client::HttpDriveBackend;
