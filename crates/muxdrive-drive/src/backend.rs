//! `DriveBackend` implementation over the HTTP client

use reqwest::multipart;
use tracing::debug;

use muxdrive_core::checksum::adler32;
use muxdrive_core::domain::Tenant;
use muxdrive_core::ports::{
    DriveBackend, EntryKind, EntryMetadata, QuotaUsage, RemoteEntry, RootListing, UploadSession,
};
use muxdrive_core::{EngineError, EngineResult};

use crate::client::{check_status, map_transport_error, HttpDriveBackend};
use crate::protocol::{
    parse_timestamp, ApiEnvelope, CopyData, CreateFolderData, FileListData, MetaBatchData,
    QuotaData, RootMeta, UploadFinishData, UploadPrepareData,
};

/// Metadata batch queries carry at most this many tokens.
const META_BATCH_LIMIT: usize = 200;

impl HttpDriveBackend {
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        tenant: &Tenant,
        context: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> EngineResult<T> {
        let token = self.access_token(tenant).await?;
        let url = self.url_for(tenant, path, query)?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(map_transport_error)?;
        let response = check_status(context, response).await?;
        response
            .json::<ApiEnvelope<T>>()
            .await
            .map_err(|e| EngineError::UpstreamPermanent(format!("{context}: {e}")))?
            .into_data(context)
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        tenant: &Tenant,
        context: &str,
        path: &str,
        body: serde_json::Value,
    ) -> EngineResult<T> {
        let token = self.access_token(tenant).await?;
        let url = self.url_for(tenant, path, &[])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;
        let response = check_status(context, response).await?;
        response
            .json::<ApiEnvelope<T>>()
            .await
            .map_err(|e| EngineError::UpstreamPermanent(format!("{context}: {e}")))?
            .into_data(context)
    }

    /// Fills sizes and mtimes the plain listing left out, 200 docs per
    /// batch query.
    async fn enrich_entries(
        &self,
        tenant: &Tenant,
        entries: &mut [RemoteEntry],
    ) -> EngineResult<()> {
        let mut index = 0;
        while index < entries.len() {
            let end = (index + META_BATCH_LIMIT).min(entries.len());
            let docs: Vec<serde_json::Value> = entries[index..end]
                .iter()
                .filter(|e| !e.kind.is_folder())
                .map(|e| {
                    serde_json::json!({
                        "doc_token": e.token,
                        "doc_type": e.kind.as_str(),
                    })
                })
                .collect();
            if !docs.is_empty() {
                let data: MetaBatchData = self
                    .post_json(
                        tenant,
                        "metas_batch_query",
                        "/open-apis/drive/v1/metas/batch_query",
                        serde_json::json!({ "request_docs": docs }),
                    )
                    .await?;
                for meta in data.metas {
                    if let Some(entry) = entries[index..end]
                        .iter_mut()
                        .find(|e| e.token == meta.doc_token)
                    {
                        if entry.size.is_none() {
                            entry.size = meta.size;
                        }
                        if entry.mtime.is_none() {
                            entry.mtime = meta
                                .latest_modify_time
                                .or(meta.create_time)
                                .as_deref()
                                .and_then(parse_timestamp);
                        }
                    }
                }
            }
            index = end;
        }
        Ok(())
    }

    async fn fetch_folder(
        &self,
        tenant: &Tenant,
        folder_token: &str,
    ) -> EngineResult<Vec<RemoteEntry>> {
        let data: FileListData = self
            .get_json(
                tenant,
                "list_files",
                "/open-apis/drive/v1/files",
                &[("folder_token", folder_token.to_string())],
            )
            .await?;
        let mut entries: Vec<RemoteEntry> =
            data.files.into_iter().map(|raw| raw.into_remote()).collect();
        self.enrich_entries(tenant, &mut entries).await?;
        Ok(entries)
    }
}

#[async_trait::async_trait]
impl DriveBackend for HttpDriveBackend {
    async fn list_root(&self, tenant: &Tenant) -> EngineResult<RootListing> {
        let meta: RootMeta = self
            .get_json(
                tenant,
                "root_folder_meta",
                "/open-apis/drive/explorer/v2/root_folder/meta",
                &[],
            )
            .await?;
        let entries = self.fetch_folder(tenant, &meta.token).await?;
        Ok(RootListing {
            root_token: meta.token,
            entries,
        })
    }

    async fn list_folder(
        &self,
        tenant: &Tenant,
        folder_token: &str,
    ) -> EngineResult<Vec<RemoteEntry>> {
        self.fetch_folder(tenant, folder_token).await
    }

    async fn metadata(&self, tenant: &Tenant, token: &str) -> EngineResult<EntryMetadata> {
        let data: MetaBatchData = self
            .post_json(
                tenant,
                "metas_batch_query",
                "/open-apis/drive/v1/metas/batch_query",
                serde_json::json!({
                    "request_docs": [{ "doc_token": token, "doc_type": "file" }],
                }),
            )
            .await?;
        let meta = data
            .metas
            .into_iter()
            .find(|m| m.doc_token == token)
            .ok_or_else(|| EngineError::NotFound(format!("no metadata for token {token}")))?;
        Ok(EntryMetadata {
            size: meta.size,
            mtime: meta
                .latest_modify_time
                .or(meta.create_time)
                .as_deref()
                .and_then(parse_timestamp),
            checksum: meta.checksum,
        })
    }

    async fn create_folder(
        &self,
        tenant: &Tenant,
        parent_token: &str,
        name: &str,
    ) -> EngineResult<String> {
        let data: CreateFolderData = self
            .post_json(
                tenant,
                "create_folder",
                "/open-apis/drive/v1/files/create_folder",
                serde_json::json!({ "name": name, "folder_token": parent_token }),
            )
            .await?;
        Ok(data.token)
    }

    async fn move_entry(&self, tenant: &Tenant, token: &str, new_parent: &str) -> EngineResult<()> {
        let _: serde_json::Value = self
            .post_json(
                tenant,
                "move_file",
                &format!("/open-apis/drive/v1/files/{token}/move"),
                serde_json::json!({ "parent_token": new_parent }),
            )
            .await?;
        Ok(())
    }

    async fn copy_entry(
        &self,
        tenant: &Tenant,
        token: &str,
        new_parent: &str,
        new_name: &str,
    ) -> EngineResult<String> {
        let data: CopyData = self
            .post_json(
                tenant,
                "copy_file",
                &format!("/open-apis/drive/v1/files/{token}/copy"),
                serde_json::json!({ "parent_token": new_parent, "name": new_name }),
            )
            .await?;
        Ok(data.token)
    }

    async fn rename_entry(&self, tenant: &Tenant, token: &str, new_name: &str) -> EngineResult<()> {
        let access = self.access_token(tenant).await?;
        let url = self.url_for(tenant, &format!("/open-apis/drive/v1/files/{token}"), &[])?;
        let response = self
            .http
            .patch(url)
            .bearer_auth(access)
            .json(&serde_json::json!({ "name": new_name }))
            .send()
            .await
            .map_err(map_transport_error)?;
        let response = check_status("rename_file", response).await?;
        response
            .json::<ApiEnvelope<serde_json::Value>>()
            .await
            .map_err(|e| EngineError::UpstreamPermanent(format!("rename_file: {e}")))?
            .into_data("rename_file")?;
        Ok(())
    }

    async fn delete_entry(
        &self,
        tenant: &Tenant,
        token: &str,
        kind: EntryKind,
    ) -> EngineResult<()> {
        let access = self.access_token(tenant).await?;
        let url = self.url_for(
            tenant,
            &format!("/open-apis/drive/v1/files/{token}"),
            &[("type", kind.as_str().to_string())],
        )?;
        let response = self
            .http
            .delete(url)
            .bearer_auth(access)
            .send()
            .await
            .map_err(map_transport_error)?;
        check_status("delete_file", response).await?;
        Ok(())
    }

    async fn upload_init(
        &self,
        tenant: &Tenant,
        parent_token: &str,
        file_name: &str,
        size: u64,
    ) -> EngineResult<UploadSession> {
        let data: UploadPrepareData = self
            .post_json(
                tenant,
                "upload_prepare",
                "/open-apis/drive/v1/files/upload_prepare",
                serde_json::json!({
                    "file_name": file_name,
                    "parent_type": "explorer",
                    "parent_node": parent_token,
                    "size": size,
                }),
            )
            .await?;
        debug!(
            upload_id = %data.upload_id,
            block_size = data.block_size,
            "Upload session opened"
        );
        Ok(UploadSession {
            upload_id: data.upload_id,
            block_size: data.block_size,
        })
    }

    async fn upload_block(
        &self,
        tenant: &Tenant,
        upload_id: &str,
        seq: u64,
        bytes: Vec<u8>,
    ) -> EngineResult<()> {
        let access = self.access_token(tenant).await?;
        let url = self.url_for(tenant, "/open-apis/drive/v1/files/upload_part", &[])?;
        let checksum = adler32(&bytes);
        let len = bytes.len();
        let form = multipart::Form::new()
            .text("upload_id", upload_id.to_string())
            .text("seq", seq.to_string())
            .text("size", len.to_string())
            .text("checksum", checksum.to_string())
            .part("file", multipart::Part::bytes(bytes).file_name(format!("part-{seq}")));
        let response = self
            .http
            .post(url)
            .bearer_auth(access)
            .multipart(form)
            .send()
            .await
            .map_err(map_transport_error)?;
        let response = check_status("upload_part", response).await?;
        response
            .json::<ApiEnvelope<serde_json::Value>>()
            .await
            .map_err(|e| EngineError::UpstreamPermanent(format!("upload_part: {e}")))?
            .into_data("upload_part")?;
        Ok(())
    }

    async fn upload_finish(
        &self,
        tenant: &Tenant,
        upload_id: &str,
        block_count: u64,
    ) -> EngineResult<String> {
        let data: UploadFinishData = self
            .post_json(
                tenant,
                "upload_finish",
                "/open-apis/drive/v1/files/upload_finish",
                serde_json::json!({ "upload_id": upload_id, "block_num": block_count }),
            )
            .await?;
        Ok(data.file_token)
    }

    async fn upload_abort(&self, tenant: &Tenant, upload_id: &str) -> EngineResult<()> {
        let _: serde_json::Value = self
            .post_json(
                tenant,
                "upload_abort",
                "/open-apis/drive/v1/files/upload_abort",
                serde_json::json!({ "upload_id": upload_id }),
            )
            .await?;
        Ok(())
    }

    async fn download_range(
        &self,
        tenant: &Tenant,
        token: &str,
        offset: u64,
        len: u64,
    ) -> EngineResult<Vec<u8>> {
        let access = self.access_token(tenant).await?;
        let url = self.url_for(
            tenant,
            &format!("/open-apis/drive/v1/files/{token}/download"),
            &[],
        )?;
        let end = offset + len.max(1) - 1;
        let response = self
            .http
            .get(url)
            .bearer_auth(access)
            .header("Range", format!("bytes={offset}-{end}"))
            .send()
            .await
            .map_err(map_transport_error)?;
        // Past-the-end reads signal a clean EOF.
        if response.status() == reqwest::StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(Vec::new());
        }
        let response = check_status("download", response).await?;
        let bytes = response.bytes().await.map_err(map_transport_error)?;
        Ok(bytes.to_vec())
    }

    async fn quota(&self, tenant: &Tenant) -> EngineResult<QuotaUsage> {
        let data: QuotaData = self
            .get_json(
                tenant,
                "metering_quota",
                "/open-apis/drive/v1/metering/quota",
                &[],
            )
            .await?;
        Ok(QuotaUsage {
            used_bytes: data.used,
            total_bytes: data.total,
        })
    }
}
