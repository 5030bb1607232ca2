//! API audit log entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiLogStatus {
    Success,
    Error,
}

/// One audited gateway dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// `admin` or `group:<id>`.
    pub scope: String,
    pub command: String,
    pub status: ApiLogStatus,
    pub duration_ms: u64,
    #[serde(default)]
    pub message: Option<String>,
    /// Sanitized request payload and response preview.
    #[serde(default)]
    pub meta: Option<Value>,
}

impl ApiLogEntry {
    pub fn new(scope: String, command: String, status: ApiLogStatus, duration_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            scope,
            command,
            status,
            duration_ms,
            message: None,
            meta: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let entry = ApiLogEntry::new("admin".into(), "list_tenants".into(), ApiLogStatus::Success, 12)
            .with_message("OK")
            .with_meta(serde_json::json!({"request": null}));
        assert_eq!(entry.command, "list_tenants");
        assert_eq!(entry.message.as_deref(), Some("OK"));
        assert!(entry.meta.is_some());
    }

    #[test]
    fn test_status_serde() {
        assert_eq!(
            serde_json::to_string(&ApiLogStatus::Error).unwrap(),
            "\"error\""
        );
    }
}
