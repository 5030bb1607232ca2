//! Wire types for the drive API

use chrono::{DateTime, Utc};
use serde::Deserialize;

use muxdrive_core::ports::{EntryKind, RemoteEntry};
use muxdrive_core::{EngineError, EngineResult};

/// Standard response envelope: `code` 0 means success, anything else is a
/// definitive rejection carrying `msg`.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: serde::Deserialize<'de>"))]
pub struct ApiEnvelope<T> {
    pub code: i64,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    pub fn into_data(self, context: &str) -> EngineResult<T> {
        if self.code != 0 {
            return Err(EngineError::UpstreamPermanent(format!(
                "{context}: code {} ({})",
                self.code,
                self.msg.unwrap_or_default()
            )));
        }
        self.data.ok_or_else(|| {
            EngineError::UpstreamPermanent(format!("{context}: response carried no data"))
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub code: i64,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub tenant_access_token: Option<String>,
    /// Seconds of validity.
    #[serde(default)]
    pub expire: i64,
}

#[derive(Debug, Deserialize)]
pub struct RootMeta {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct FileListData {
    #[serde(default)]
    pub files: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
pub struct RawEntry {
    pub token: String,
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    #[serde(default)]
    pub parent_token: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified_time: Option<String>,
}

impl RawEntry {
    pub fn into_remote(self) -> RemoteEntry {
        let kind = match self.entry_type.as_str() {
            "folder" => EntryKind::Folder,
            "file" => EntryKind::File,
            "doc" => EntryKind::Doc,
            "sheet" => EntryKind::Sheet,
            _ => EntryKind::Other,
        };
        RemoteEntry {
            token: self.token,
            name: self.name,
            kind,
            parent_token: self.parent_token,
            size: self.size,
            mtime: self.modified_time.as_deref().and_then(parse_timestamp),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateFolderData {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct CopyData {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadPrepareData {
    pub upload_id: String,
    pub block_size: u64,
}

#[derive(Debug, Deserialize)]
pub struct UploadFinishData {
    pub file_token: String,
}

#[derive(Debug, Deserialize)]
pub struct QuotaData {
    #[serde(default)]
    pub used: u64,
    #[serde(default)]
    pub total: u64,
}

#[derive(Debug, Deserialize)]
pub struct MetaBatchData {
    #[serde(default)]
    pub metas: Vec<DocMeta>,
}

#[derive(Debug, Deserialize)]
pub struct DocMeta {
    pub doc_token: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub latest_modify_time: Option<String>,
    #[serde(default)]
    pub create_time: Option<String>,
}

/// Accepts RFC 3339 strings or integer epoch seconds, both of which
/// appear in the wild.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    text.parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_ok() {
        let env: ApiEnvelope<RootMeta> =
            serde_json::from_str(r#"{"code":0,"data":{"token":"root_1"}}"#).unwrap();
        assert_eq!(env.into_data("meta").unwrap().token, "root_1");
    }

    #[test]
    fn test_envelope_error_code() {
        let env: ApiEnvelope<RootMeta> =
            serde_json::from_str(r#"{"code":99991663,"msg":"app not enabled"}"#).unwrap();
        let err = env.into_data("meta").unwrap_err();
        assert!(err.to_string().contains("app not enabled"));
    }

    #[test]
    fn test_envelope_missing_data() {
        let env: ApiEnvelope<RootMeta> = serde_json::from_str(r#"{"code":0}"#).unwrap();
        assert!(env.into_data("meta").is_err());
    }

    #[test]
    fn test_raw_entry_kind_mapping() {
        let raw = RawEntry {
            token: "t".into(),
            name: "n".into(),
            entry_type: "folder".into(),
            parent_token: None,
            size: None,
            modified_time: None,
        };
        assert!(raw.into_remote().kind.is_folder());

        let raw = RawEntry {
            token: "t".into(),
            name: "n".into(),
            entry_type: "bitable".into(),
            parent_token: None,
            size: Some(5),
            modified_time: Some("1714000000".into()),
        };
        let entry = raw.into_remote();
        assert_eq!(entry.kind, EntryKind::Other);
        assert!(entry.mtime.is_some());
    }

    #[test]
    fn test_parse_timestamp_variants() {
        assert!(parse_timestamp("2025-06-15T10:30:00Z").is_some());
        assert!(parse_timestamp("1714000000").is_some());
        assert!(parse_timestamp("not a time").is_none());
    }
}
