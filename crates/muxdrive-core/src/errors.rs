//! Engine error taxonomy
//!
//! Every subsystem reports failures through [`EngineError`]. The variants
//! carry stable kind identifiers (see [`EngineError::kind`]) that the
//! gateway maps onto HTTP status codes and that the audit log records.

use std::fmt;

use thiserror::Error;

/// Convenience alias used across the engine crates.
pub type EngineResult<T> = Result<T, EngineError>;

/// Why no tenant could be selected as a write target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableDenial {
    /// Every candidate tenant is inactive or read-only.
    Permission,
    /// Writable tenants exist but none has free capacity.
    Capacity,
}

impl fmt::Display for WritableDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WritableDenial::Permission => write!(f, "permission"),
            WritableDenial::Capacity => write!(f, "capacity"),
        }
    }
}

/// Unified error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Request carried no `X-API-Key` header.
    #[error("missing API key")]
    AuthMissing,

    /// The presented key matches neither the admin key nor any group key.
    #[error("invalid API key")]
    AuthInvalid,

    /// The key is valid but the target is outside its group scope.
    #[error("access denied: {0}")]
    ScopeDenied(String),

    /// A referenced entity or token does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A live entry with the same name already exists in the parent folder.
    #[error("duplicate name: {0}")]
    DuplicateName(String),

    /// No tenant in scope can accept the write.
    #[error("no writable tenant ({reason})")]
    NoWritableTenant { reason: WritableDenial },

    /// Request payload failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A schedule string does not parse under the 5-field cron grammar.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Transient upstream failure (network, 5xx). Retryable.
    #[error("upstream transient error: {0}")]
    UpstreamTransient(String),

    /// Definitive upstream rejection (4xx other than 429). Not retryable.
    #[error("upstream rejected request: {0}")]
    UpstreamPermanent(String),

    /// Upstream throttled the request (429). Retryable after backoff.
    #[error("upstream rate limited: {0}")]
    UpstreamRateLimited(String),

    /// A network call exceeded its deadline. Retryable.
    #[error("upstream timeout: {0}")]
    Timeout(String),

    /// Local filesystem failure.
    #[error("local io error: {0}")]
    LocalIo(String),

    /// A persisted document failed to parse, or remote state is
    /// undiagnosable (e.g. duplicate live names in one folder).
    #[error("persistent state corrupt: {0}")]
    PersistenceCorrupt(String),

    /// The operation was cancelled by the user.
    #[error("cancelled")]
    Cancelled,

    /// The entity is in a state that forbids the operation.
    #[error("state conflict: {0}")]
    Conflict(String),
}

impl EngineError {
    /// Stable machine-readable identifier for this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::AuthMissing => "AuthMissing",
            EngineError::AuthInvalid => "AuthInvalid",
            EngineError::ScopeDenied(_) => "ScopeDenied",
            EngineError::NotFound(_) => "NotFound",
            EngineError::DuplicateName(_) => "DuplicateName",
            EngineError::NoWritableTenant { .. } => "NoWritableTenant",
            EngineError::InvalidArgument(_) => "InvalidArgument",
            EngineError::InvalidCron(_) => "InvalidCron",
            EngineError::UpstreamTransient(_) => "UpstreamTransient",
            EngineError::UpstreamPermanent(_) => "UpstreamPermanent",
            EngineError::UpstreamRateLimited(_) => "UpstreamRateLimited",
            EngineError::Timeout(_) => "Timeout",
            EngineError::LocalIo(_) => "LocalIo",
            EngineError::PersistenceCorrupt(_) => "PersistenceCorrupt",
            EngineError::Cancelled => "Cancelled",
            EngineError::Conflict(_) => "Conflict",
        }
    }

    /// Whether the failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::UpstreamTransient(_)
                | EngineError::UpstreamRateLimited(_)
                | EngineError::Timeout(_)
        )
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::LocalIo(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::PersistenceCorrupt(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_stable() {
        assert_eq!(EngineError::AuthMissing.kind(), "AuthMissing");
        assert_eq!(
            EngineError::NoWritableTenant {
                reason: WritableDenial::Capacity
            }
            .kind(),
            "NoWritableTenant"
        );
        assert_eq!(EngineError::Cancelled.kind(), "Cancelled");
    }

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::UpstreamTransient("502".into()).is_transient());
        assert!(EngineError::UpstreamRateLimited("429".into()).is_transient());
        assert!(EngineError::Timeout("deadline".into()).is_transient());
        assert!(!EngineError::UpstreamPermanent("403".into()).is_transient());
        assert!(!EngineError::DuplicateName("a.txt".into()).is_transient());
    }

    #[test]
    fn test_writable_denial_display() {
        let err = EngineError::NoWritableTenant {
            reason: WritableDenial::Permission,
        };
        assert_eq!(err.to_string(), "no writable tenant (permission)");
    }

    #[test]
    fn test_io_error_maps_to_local_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: EngineError = io.into();
        assert_eq!(err.kind(), "LocalIo");
    }
}
