//! FileService: the single entry point composing lifecycle, shares and
//! metrics. This is what the HTTP layer holds as state.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use sqlx::SqlitePool;
use std::{io, sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{
    models::{
        file::{CreateFileArgs, FileRecord, FileStatus, FindFilesQuery, ListFilesQuery, UpdateFileArgs},
        metrics::{FilesMetrics, StorageMetrics},
        share::{CreateShareArgs, ListSharesQuery, ShareObject, ShareUpdate, ShareWithToken},
    },
    services::{
        error::{FileServiceError, FileServiceResult},
        file_lifecycle::FileLifecycle,
        metadata_repository::MetadataRepository,
        share_service::ShareService,
        storage::{BackendRegistry, ByteStream},
        usage_metrics::{DEFAULT_BACKEND_TIMEOUT, UsageMetrics},
    },
};

#[derive(Debug, Clone, Copy)]
pub struct FileServiceOptions {
    /// Per-backend bound for usage reports.
    pub metrics_timeout: Duration,
    /// Upload claims older than this are released by [`FileService::reconcile`].
    pub stale_upload_after: Duration,
}

impl Default for FileServiceOptions {
    fn default() -> Self {
        Self {
            metrics_timeout: DEFAULT_BACKEND_TIMEOUT,
            stale_upload_after: Duration::from_secs(3600),
        }
    }
}

/// What one reconciliation pass cleaned up.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub expired_shares: u64,
    pub dangling_shares: u64,
    pub released_uploads: u64,
    pub finished_deletes: u64,
    pub orphaned_content: u64,
}

#[derive(Clone)]
pub struct FileService {
    db: Arc<SqlitePool>,
    repo: MetadataRepository,
    registry: Arc<BackendRegistry>,
    lifecycle: FileLifecycle,
    shares: ShareService,
    metrics: UsageMetrics,
    options: FileServiceOptions,
}

impl FileService {
    pub fn new(db: Arc<SqlitePool>, registry: BackendRegistry, options: FileServiceOptions) -> Self {
        let registry = Arc::new(registry);
        let repo = MetadataRepository::new(db.clone());
        let shares = ShareService::new(repo.clone());
        let lifecycle = FileLifecycle::new(repo.clone(), registry.clone(), shares.clone());
        let metrics = UsageMetrics::new(repo.clone(), registry.clone(), options.metrics_timeout);
        Self {
            db,
            repo,
            registry,
            lifecycle,
            shares,
            metrics,
            options,
        }
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    // ---------------------------------------------------------------------
    // Files
    // ---------------------------------------------------------------------

    pub async fn create<M>(&self, args: CreateFileArgs<M>) -> FileServiceResult<FileRecord<M>>
    where
        M: Serialize + DeserializeOwned,
    {
        let meta = encode_meta(&args.meta)?;
        let created = self
            .lifecycle
            .create(CreateFileArgs {
                id: args.id,
                kind: args.kind,
                name: args.name,
                mime_type: args.mime_type,
                alt: args.alt,
                meta,
                created_by: args.created_by,
            })
            .await?;
        created.decode_meta()
    }

    pub async fn update<M>(&self, args: UpdateFileArgs<M>) -> FileServiceResult<FileRecord<M>>
    where
        M: Serialize + DeserializeOwned,
    {
        let meta = args.meta.as_ref().map(encode_meta).transpose()?;
        self.lifecycle
            .update(&args.id, &args.kind, args.name, meta)
            .await?
            .decode_meta()
    }

    /// Cascades to shares and content; the metadata row goes last.
    pub async fn delete(&self, id: &str, kind: &str) -> FileServiceResult<()> {
        self.lifecycle.delete(id, kind).await
    }

    pub async fn get_by_id<M: DeserializeOwned>(
        &self,
        id: &str,
        kind: &str,
    ) -> FileServiceResult<FileRecord<M>> {
        self.lifecycle.get_by_id(id, kind).await?.decode_meta()
    }

    pub async fn find<M: DeserializeOwned>(
        &self,
        query: &FindFilesQuery,
    ) -> FileServiceResult<Vec<FileRecord<M>>> {
        decode_all(self.lifecycle.find(query).await?)
    }

    pub async fn list<M: DeserializeOwned>(
        &self,
        kind: &str,
        query: &ListFilesQuery,
    ) -> FileServiceResult<Vec<FileRecord<M>>> {
        self.registry.resolve(kind)?;
        decode_all(self.lifecycle.list(kind, query).await?)
    }

    pub async fn upload_content<S>(&self, id: &str, kind: &str, content: S) -> FileServiceResult<FileRecord>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        self.lifecycle.upload_content(id, kind, content).await
    }

    pub async fn download(&self, id: &str, kind: &str) -> FileServiceResult<(FileRecord, ByteStream)> {
        self.lifecycle.download(id, kind).await
    }

    pub async fn get_by_token<M: DeserializeOwned>(&self, token: &str) -> FileServiceResult<FileRecord<M>> {
        self.lifecycle.get_by_token(token).await?.decode_meta()
    }

    pub async fn download_by_token(&self, token: &str) -> FileServiceResult<(FileRecord, ByteStream)> {
        self.lifecycle.download_by_token(token).await
    }

    // ---------------------------------------------------------------------
    // Shares
    // ---------------------------------------------------------------------

    pub async fn create_share_object(&self, args: CreateShareArgs) -> FileServiceResult<ShareWithToken> {
        self.shares.create(args).await
    }

    pub async fn get_share_object(&self, id: &str) -> FileServiceResult<ShareObject> {
        self.shares.get(id).await
    }

    pub async fn list_share_objects(&self, query: &ListSharesQuery) -> FileServiceResult<Vec<ShareObject>> {
        self.shares.list(query).await
    }

    pub async fn update_share_object(
        &self,
        id: &str,
        patch: &ShareUpdate,
    ) -> FileServiceResult<ShareObject> {
        self.shares.update(id, patch).await
    }

    pub async fn delete_share_object(&self, id: &str) -> FileServiceResult<()> {
        self.shares.delete(id).await
    }

    // ---------------------------------------------------------------------
    // Metrics and maintenance
    // ---------------------------------------------------------------------

    pub async fn get_usage_metrics(&self) -> FileServiceResult<FilesMetrics> {
        self.metrics.collect().await
    }

    /// Per-backend usage only; never fails.
    pub async fn storage_metrics(&self) -> Vec<(String, StorageMetrics)> {
        self.metrics.storage_metrics().await
    }

    /// One reconciliation pass. Each step is independent; a failing step is
    /// logged and the others still run.
    pub async fn reconcile(&self) -> ReconcileReport {
        self.reconcile_at(Utc::now()).await
    }

    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        match self.shares.purge_expired(now).await {
            Ok(count) => report.expired_shares = count,
            Err(err) => warn!(error = %err, "failed to purge expired shares"),
        }

        match self.shares.purge_dangling().await {
            Ok(count) => report.dangling_shares = count,
            Err(err) => warn!(error = %err, "failed to purge dangling shares"),
        }

        let stale_after = chrono::Duration::from_std(self.options.stale_upload_after)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        match self.repo.release_stale_uploads(now - stale_after).await {
            Ok(count) => report.released_uploads = count,
            Err(err) => warn!(error = %err, "failed to release stale uploads"),
        }

        match self.repo.files_with_status(FileStatus::Deleted).await {
            Ok(tombstones) => {
                for (id, kind) in tombstones {
                    match self.lifecycle.delete(&id, &kind).await {
                        Ok(()) => report.finished_deletes += 1,
                        Err(err) => warn!(file_id = %id, kind = %kind, error = %err, "failed to finish delete"),
                    }
                }
            }
            Err(err) => warn!(error = %err, "failed to list deleted files"),
        }

        for kind in self.registry.kinds() {
            match self.remove_orphaned_content(&kind.id).await {
                Ok(count) => report.orphaned_content += count,
                Err(err) => warn!(kind = %kind.id, error = %err, "orphan sweep failed"),
            }
        }

        if report != ReconcileReport::default() {
            info!(?report, "reconciliation pass finished");
        }
        report
    }

    async fn remove_orphaned_content(&self, kind: &str) -> FileServiceResult<u64> {
        let backend = self.registry.resolve(kind)?.backend;
        let stored = backend
            .list_content(kind)
            .await
            .map_err(|err| FileServiceError::backend(backend.name(), err))?;
        if stored.is_empty() {
            return Ok(0);
        }

        let known = self.repo.file_ids_for_kind(kind).await?;
        let mut removed = 0;
        for id in stored.into_iter().filter(|id| !known.contains(id)) {
            match backend.delete(&id, kind).await {
                Ok(()) => removed += 1,
                Err(err) => warn!(file_id = %id, kind = %kind, error = %err, "failed to remove orphaned content"),
            }
        }
        Ok(removed)
    }
}

fn encode_meta<M: Serialize>(meta: &M) -> FileServiceResult<Value> {
    serde_json::to_value(meta)
        .map_err(|err| FileServiceError::Validation(format!("metadata is not serializable: {err}")))
}

fn decode_all<M: DeserializeOwned>(records: Vec<FileRecord>) -> FileServiceResult<Vec<FileRecord<M>>> {
    records.into_iter().map(|record| record.decode_meta()).collect()
}
