//! FileLifecycle: create, upload, update, download and delete file records.
//!
//! Metadata goes through [`MetadataRepository`], content through the backend
//! the file's kind is routed to. Content upload claims the record first
//! (`AwaitingUpload -> Uploading`), so two concurrent uploads of one file can
//! never both write.

use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    models::file::{
        CreateFileArgs, FileRecord, FileStatus, FindFilesQuery, ListFilesQuery, extension_of,
    },
    services::{
        error::{FileServiceError, FileServiceResult},
        metadata_repository::MetadataRepository,
        share_service::ShareService,
        storage::{BackendError, BackendRegistry, ByteStream, ensure_segment_safe},
    },
};

const MAX_NAME_LEN: usize = 256;

#[derive(Clone)]
pub struct FileLifecycle {
    repo: MetadataRepository,
    registry: Arc<BackendRegistry>,
    shares: ShareService,
}

impl FileLifecycle {
    pub fn new(repo: MetadataRepository, registry: Arc<BackendRegistry>, shares: ShareService) -> Self {
        Self {
            repo,
            registry,
            shares,
        }
    }

    /// Insert an `AwaitingUpload` record. Does not touch backend storage.
    pub async fn create(&self, args: CreateFileArgs<Value>) -> FileServiceResult<FileRecord> {
        let resolved = self.registry.resolve(&args.kind)?;
        ensure_name(&args.name)?;
        if !resolved.kind.accepts_mime_type(args.mime_type.as_deref()) {
            return Err(FileServiceError::Validation(format!(
                "mime type {:?} is not allowed for kind `{}`",
                args.mime_type, args.kind
            )));
        }
        let id = match args.id {
            Some(id) => {
                ensure_segment_safe("file id", &id)?;
                id
            }
            None => Uuid::new_v4().to_string(),
        };

        let now = Utc::now();
        let record = FileRecord {
            id,
            extension: extension_of(&args.name),
            kind: args.kind,
            name: args.name,
            mime_type: args.mime_type,
            alt: args.alt,
            meta: args.meta,
            status: FileStatus::AwaitingUpload,
            size: None,
            hash: None,
            created_by: args.created_by,
            created_at: now,
            updated_at: now,
        };

        let created = self.repo.create_file(&record).await?;
        info!(file_id = %created.id, kind = %created.kind, "created file");
        Ok(created)
    }

    /// Stream content into the kind's backend and mark the record `Ready`.
    ///
    /// On failure or cancellation the record goes back to `AwaitingUpload`
    /// and nothing written is left readable.
    pub async fn upload_content<S>(
        &self,
        id: &str,
        kind: &str,
        content: S,
    ) -> FileServiceResult<FileRecord>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let resolved = self.registry.resolve(kind)?;
        let backend = resolved.backend;
        let version = self.repo.claim_upload(id, kind).await?;
        let mut claim = UploadClaim::new(self.repo.clone(), id, kind, version);

        let faults = Arc::new(StreamFaults::default());
        let content = watch_content(content, resolved.kind.max_size_bytes, faults.clone());

        let outcome = match backend.write(id, kind, content).await {
            Ok(outcome) => outcome,
            Err(err) => {
                claim.release().await;
                if faults.exceeded.load(Ordering::SeqCst) {
                    return Err(FileServiceError::Validation(format!(
                        "content exceeds the {} byte limit of kind `{}`",
                        resolved.kind.max_size_bytes.unwrap_or_default(),
                        kind
                    )));
                }
                if faults.source_failed.load(Ordering::SeqCst) {
                    // the caller's stream broke; the backend is fine
                    info!(file_id = %id, kind = %kind, error = %err, "content stream aborted by caller");
                    return Err(FileServiceError::Validation(format!(
                        "content stream ended with an error: {err}"
                    )));
                }
                warn!(file_id = %id, kind = %kind, error = %err, "content upload failed");
                return Err(FileServiceError::backend(backend.name(), err));
            }
        };

        match self
            .repo
            .finalize_upload(id, kind, version, outcome.size, &outcome.hash)
            .await
        {
            Ok(record) => {
                claim.disarm();
                info!(file_id = %id, kind = %kind, size = outcome.size, "file ready");
                Ok(record)
            }
            Err(err) => {
                // The record moved on (deleted, or the claim was released as
                // stale) while we were writing.
                if let Err(cleanup) = backend.delete(id, kind).await {
                    warn!(file_id = %id, error = %cleanup, "failed to remove unclaimed content");
                }
                claim.release().await;
                Err(err)
            }
        }
    }

    /// Record plus content stream. Only `Ready` files have content.
    pub async fn download(&self, id: &str, kind: &str) -> FileServiceResult<(FileRecord, ByteStream)> {
        let resolved = self.registry.resolve(kind)?;
        let record = self.repo.get_file(id, kind).await?;
        if !record.is_ready() {
            return Err(FileServiceError::InvalidState(format!(
                "file `{}` has no content while it is {}",
                id,
                record.status.as_str()
            )));
        }

        let content = resolved
            .backend
            .read(id, kind)
            .await
            .map_err(|err| match err {
                BackendError::ContentNotFound(_) => FileServiceError::file_not_found(id, kind),
                other => FileServiceError::backend(resolved.backend.name(), other),
            })?;
        Ok((record, content))
    }

    /// Patch `name` and/or `meta`; never status, kind or content.
    pub async fn update(
        &self,
        id: &str,
        kind: &str,
        name: Option<String>,
        meta: Option<Value>,
    ) -> FileServiceResult<FileRecord> {
        if let Some(name) = &name {
            ensure_name(name)?;
        }
        self.repo.update_file(id, kind, name, meta).await
    }

    /// Tombstone, drop shares, drop content (best effort), drop metadata.
    pub async fn delete(&self, id: &str, kind: &str) -> FileServiceResult<()> {
        let resolved = self.registry.resolve(kind)?;
        self.repo.mark_deleted(id, kind).await?;

        let shares = self.shares.delete_for_file(id, kind).await?;

        if let Err(err) = resolved.backend.delete(id, kind).await {
            warn!(
                file_id = %id,
                kind = %kind,
                backend = resolved.backend.name(),
                error = %err,
                "failed to delete content; leaving it for the reconciliation sweep"
            );
        }

        self.repo.delete_file(id, kind).await?;
        info!(file_id = %id, kind = %kind, shares, "deleted file");
        Ok(())
    }

    pub async fn get_by_id(&self, id: &str, kind: &str) -> FileServiceResult<FileRecord> {
        self.repo.get_file(id, kind).await
    }

    pub async fn find(&self, query: &FindFilesQuery) -> FileServiceResult<Vec<FileRecord>> {
        self.repo.find_files(query).await
    }

    pub async fn list(&self, kind: &str, query: &ListFilesQuery) -> FileServiceResult<Vec<FileRecord>> {
        self.repo.list_files(kind, query).await
    }

    /// Resolve a share token to its file. Bad tokens, expired tokens and
    /// deleted files are indistinguishable.
    pub async fn get_by_token(&self, token: &str) -> FileServiceResult<FileRecord> {
        let (file_id, kind) = self.shares.resolve_by_token(token).await?;
        match self.repo.get_file(&file_id, &kind).await {
            Ok(record) if record.status != FileStatus::Deleted => Ok(record),
            Ok(_) => Err(FileServiceError::token_not_found()),
            Err(err) if err.is_not_found() => Err(FileServiceError::token_not_found()),
            Err(err) => Err(err),
        }
    }

    pub async fn download_by_token(&self, token: &str) -> FileServiceResult<(FileRecord, ByteStream)> {
        let record = self.get_by_token(token).await?;
        self.download(&record.id, &record.kind)
            .await
            .map_err(|err| match err {
                FileServiceError::NotFound(_) => FileServiceError::token_not_found(),
                other => other,
            })
    }
}

fn ensure_name(name: &str) -> FileServiceResult<()> {
    if name.trim().is_empty() {
        return Err(FileServiceError::Validation("file name is required".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FileServiceError::Validation(format!(
            "file name must be at most {MAX_NAME_LEN} bytes"
        )));
    }
    Ok(())
}

/// What went wrong on the caller's side of an upload stream.
#[derive(Default)]
struct StreamFaults {
    exceeded: AtomicBool,
    source_failed: AtomicBool,
}

/// Pass content through, flagging errors raised by the caller's stream and
/// failing once more than `limit` bytes went through.
fn watch_content<S>(content: S, limit: Option<u64>, faults: Arc<StreamFaults>) -> ByteStream
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    let mut seen = 0u64;
    content
        .map(move |chunk| {
            let chunk = chunk.inspect_err(|_| faults.source_failed.store(true, Ordering::SeqCst))?;
            seen += chunk.len() as u64;
            match limit {
                Some(max) if seen > max => {
                    faults.exceeded.store(true, Ordering::SeqCst);
                    Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("content exceeds {max} bytes"),
                    ))
                }
                _ => Ok(chunk),
            }
        })
        .boxed()
}

/// An upload claim on a record. Unless disarmed, it returns the record to
/// `AwaitingUpload`, also when the upload future is dropped mid-stream.
struct UploadClaim {
    repo: MetadataRepository,
    id: String,
    kind: String,
    version: i64,
    armed: bool,
}

impl UploadClaim {
    fn new(repo: MetadataRepository, id: &str, kind: &str, version: i64) -> Self {
        Self {
            repo,
            id: id.to_string(),
            kind: kind.to_string(),
            version,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    async fn release(&mut self) {
        self.armed = false;
        if let Err(err) = self
            .repo
            .release_upload(&self.id, &self.kind, self.version)
            .await
        {
            warn!(file_id = %self.id, error = %err, "failed to release upload claim");
        }
    }
}

impl Drop for UploadClaim {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(file_id = %self.id, "upload cancelled outside a runtime; claim left for the sweep");
            return;
        };
        let repo = self.repo.clone();
        let (id, kind, version) = (self.id.clone(), self.kind.clone(), self.version);
        handle.spawn(async move {
            match repo.release_upload(&id, &kind, version).await {
                Ok(_) => info!(file_id = %id, "released claim of cancelled upload"),
                Err(err) => warn!(file_id = %id, error = %err, "failed to release upload claim"),
            }
        });
    }
}
