//! Tenant federation and routing
//!
//! The [`TenantRegistry`] owns tenant and group CRUD, resolves API keys to
//! access scopes, picks write targets by order/permission/capacity, and
//! serves the aggregated multi-tenant root listing. All remote namespace
//! operations that need client-side name uniqueness (`create_folder`,
//! `move`, `copy`, `rename`) go through here.

pub mod namespace;
pub mod registry;
pub mod scope;

pub use namespace::NamespaceService;
pub use registry::{AggregatedRoot, TenantRegistry, WRITE_HEADROOM_BYTES};
pub use scope::AccessScope;
