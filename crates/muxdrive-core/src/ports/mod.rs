//! Port definitions (traits for adapters)

pub mod drive_backend;

pub use drive_backend::{
    DriveBackend, EntryKind, EntryMetadata, QuotaUsage, RemoteEntry, RootListing, UploadSession,
};
