//! MuxDrive core - domain model and port definitions
//!
//! This crate contains the entities shared by every engine subsystem:
//! - Domain records (Tenant, Group, SyncTask, Transfer, snapshots, logs)
//! - The [`errors::EngineError`] taxonomy
//! - Typed configuration documents
//! - The [`ports::DriveBackend`] capability consumed by the router,
//!   transfer engine, and sync runner

pub mod checksum;
pub mod config;
pub mod domain;
pub mod errors;
pub mod ports;

pub use errors::{EngineError, EngineResult};
