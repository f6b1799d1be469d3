//! ShareService: issues and resolves bearer-token shares of single files.

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    models::{
        file::FileStatus,
        share::{CreateShareArgs, ListSharesQuery, ShareObject, ShareUpdate, ShareWithToken},
    },
    services::{
        error::{FileServiceError, FileServiceResult},
        metadata_repository::MetadataRepository,
        token,
    },
};

const MAX_SHARE_NAME_LEN: usize = 256;

#[derive(Clone)]
pub struct ShareService {
    repo: MetadataRepository,
}

impl ShareService {
    pub fn new(repo: MetadataRepository) -> Self {
        Self { repo }
    }

    /// Share an existing file. The returned token is never shown again.
    pub async fn create(&self, args: CreateShareArgs) -> FileServiceResult<ShareWithToken> {
        if let Some(name) = &args.name {
            ensure_share_name(name)?;
        }

        let file = self.repo.get_file(&args.file_id, &args.kind).await?;
        if file.status == FileStatus::Deleted {
            return Err(FileServiceError::file_not_found(&args.file_id, &args.kind));
        }

        let now = Utc::now();
        let share = ShareObject {
            id: Uuid::new_v4().to_string(),
            file_id: file.id,
            file_kind: file.kind,
            name: args.name,
            valid_until: args.valid_until,
            created_at: now,
            updated_at: now,
        };
        let token = token::generate_token();
        let digest = token::token_digest(&token);
        // the file may have been deleted since it was read above
        let inserted = self
            .repo
            .insert_share(&share, digest.to_hex().as_str())
            .await?;
        if !inserted {
            return Err(FileServiceError::file_not_found(&share.file_id, &share.file_kind));
        }

        info!(share_id = %share.id, file_id = %share.file_id, "created share");
        Ok(ShareWithToken { share, token })
    }

    pub async fn get(&self, id: &str) -> FileServiceResult<ShareObject> {
        self.repo.get_share(id).await
    }

    pub async fn list(&self, query: &ListSharesQuery) -> FileServiceResult<Vec<ShareObject>> {
        self.repo.list_shares(query).await
    }

    pub async fn update(&self, id: &str, patch: &ShareUpdate) -> FileServiceResult<ShareObject> {
        if let Some(name) = &patch.name {
            ensure_share_name(name)?;
        }
        self.repo.update_share(id, patch).await
    }

    pub async fn delete(&self, id: &str) -> FileServiceResult<()> {
        self.repo.delete_share(id).await?;
        info!(share_id = %id, "deleted share");
        Ok(())
    }

    /// Resolve a token to `(file_id, kind)`.
    ///
    /// Unknown, malformed and expired tokens all yield the same `NotFound`.
    pub async fn resolve_by_token(&self, token: &str) -> FileServiceResult<(String, String)> {
        self.resolve_by_token_at(token, Utc::now()).await
    }

    pub(crate) async fn resolve_by_token_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> FileServiceResult<(String, String)> {
        if !token::is_well_formed(token) {
            return Err(FileServiceError::token_not_found());
        }

        let digest = token::token_digest(token);
        let row = self
            .repo
            .find_share_by_digest(digest.to_hex().as_str())
            .await?
            .ok_or_else(FileServiceError::token_not_found)?;

        if !token::digest_matches(&row.token_digest, &digest) {
            return Err(FileServiceError::token_not_found());
        }
        if row.share.is_expired_at(now) {
            debug!(share_id = %row.share.id, "rejected expired share token");
            return Err(FileServiceError::token_not_found());
        }

        Ok((row.share.file_id, row.share.file_kind))
    }

    /// Remove every share of a file. Part of the delete cascade.
    pub async fn delete_for_file(&self, file_id: &str, kind: &str) -> FileServiceResult<u64> {
        self.repo.delete_shares_for_file(file_id, kind).await
    }

    /// Drop shares left pointing at a file row that no longer exists.
    pub async fn purge_dangling(&self) -> FileServiceResult<u64> {
        self.repo.delete_dangling_shares().await
    }

    /// Drop shares whose expiry has passed. Expired shares are already inert.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> FileServiceResult<u64> {
        self.repo.delete_expired_shares(now).await
    }
}

fn ensure_share_name(name: &str) -> FileServiceResult<()> {
    if name.len() > MAX_SHARE_NAME_LEN {
        return Err(FileServiceError::Validation(format!(
            "share name must be at most {MAX_SHARE_NAME_LEN} bytes"
        )));
    }
    Ok(())
}
