//! Local authenticated API gateway
//!
//! A plain HTTP/1.1 server exposing every engine operation as
//! `POST /command/<name>` with an `X-API-Key` header. Keys resolve to the
//! admin scope or one group's scope; every dispatch is timed, sanitized,
//! and appended to the audit log.

pub mod commands;
pub mod sanitize;
pub mod server;

pub use commands::CommandContext;
pub use server::{ensure_admin_key, GatewayService};
