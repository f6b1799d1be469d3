//! src/services/metadata_repository.rs
//!
//! MetadataRepository: persistence of file records and share objects in
//! SQLite. Every file operation is scoped by `(kind, id)`. Each write is a
//! single statement, so concurrent writers on the same record never see or
//! produce half-applied patches; lifecycle transitions are conditional on the
//! current status (and, for upload finalisation, on the row `version`).

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite, types::Json};
use std::{collections::HashSet, sync::Arc};

use crate::{
    models::{
        file::{
            FileRecord, FileRow, FileStatus, FindFilesQuery, ListFilesQuery, Page, extension_of,
        },
        share::{ListSharesQuery, ShareDigestRow, ShareObject, ShareUpdate},
    },
    services::error::{FileServiceError, FileServiceResult},
};

const FILE_COLUMNS: &str = "id, kind, name, mime_type, extension, alt, meta, status, \
     size_bytes, hash, created_by, version, created_at, updated_at";

const SHARE_COLUMNS: &str = "id, file_id, file_kind, name, valid_until, created_at, updated_at";

#[derive(Clone)]
pub struct MetadataRepository {
    db: Arc<SqlitePool>,
}

impl MetadataRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    // ---------------------------------------------------------------------
    // Files
    // ---------------------------------------------------------------------

    /// Insert a new record. An existing `(kind, id)` is an `InvalidState`.
    pub async fn create_file(&self, record: &FileRecord) -> FileServiceResult<FileRecord> {
        let sql = format!(
            "INSERT INTO files ({FILE_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
             RETURNING {FILE_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, FileRow>(&sql)
            .bind(&record.id)
            .bind(&record.kind)
            .bind(&record.name)
            .bind(&record.mime_type)
            .bind(&record.extension)
            .bind(&record.alt)
            .bind(Json(&record.meta))
            .bind(record.status)
            .bind(record.size.map(|size| size as i64))
            .bind(&record.hash)
            .bind(&record.created_by)
            .bind(record.created_at)
            .bind(record.updated_at)
            .fetch_one(&*self.db)
            .await;

        match inserted {
            Ok(row) => Ok(row.into()),
            Err(err) if is_unique_violation(&err) => Err(FileServiceError::InvalidState(format!(
                "file `{}` of kind `{}` already exists",
                record.id, record.kind
            ))),
            Err(err) => Err(FileServiceError::Sqlx(err)),
        }
    }

    async fn fetch_file_row(&self, id: &str, kind: &str) -> FileServiceResult<FileRow> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ? AND kind = ?");
        sqlx::query_as::<_, FileRow>(&sql)
            .bind(id)
            .bind(kind)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => FileServiceError::file_not_found(id, kind),
                other => FileServiceError::Sqlx(other),
            })
    }

    pub async fn get_file(&self, id: &str, kind: &str) -> FileServiceResult<FileRecord> {
        self.fetch_file_row(id, kind).await.map(Into::into)
    }

    /// Patch `name` and/or `meta`. Tombstoned records cannot be updated.
    pub async fn update_file(
        &self,
        id: &str,
        kind: &str,
        name: Option<String>,
        meta: Option<Value>,
    ) -> FileServiceResult<FileRecord> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE files SET updated_at = ");
        builder.push_bind(Utc::now());
        builder.push(", version = version + 1");
        if let Some(name) = name {
            builder.push(", extension = ");
            builder.push_bind(extension_of(&name));
            builder.push(", name = ");
            builder.push_bind(name);
        }
        if let Some(meta) = meta {
            builder.push(", meta = ");
            builder.push_bind(Json(meta));
        }
        builder.push(" WHERE id = ");
        builder.push_bind(id.to_string());
        builder.push(" AND kind = ");
        builder.push_bind(kind.to_string());
        builder.push(" AND status != ");
        builder.push_bind(FileStatus::Deleted);
        builder.push(format!(" RETURNING {FILE_COLUMNS}"));

        let updated: Option<FileRow> = builder.build_query_as().fetch_optional(&*self.db).await?;
        match updated {
            Some(row) => Ok(row.into()),
            None => Err(self.transition_failure(id, kind, "update").await),
        }
    }

    /// Explain why a conditional statement matched no row.
    async fn transition_failure(&self, id: &str, kind: &str, action: &str) -> FileServiceError {
        match self.fetch_file_row(id, kind).await {
            Ok(row) => FileServiceError::InvalidState(format!(
                "cannot {action} file `{id}` while it is {}",
                row.status.as_str()
            )),
            Err(err) => err,
        }
    }

    pub async fn delete_file(&self, id: &str, kind: &str) -> FileServiceResult<()> {
        let result = sqlx::query("DELETE FROM files WHERE id = ? AND kind = ?")
            .bind(id)
            .bind(kind)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(FileServiceError::file_not_found(id, kind));
        }
        Ok(())
    }

    /// Tombstone a record. Repeating it on a tombstone is allowed so that an
    /// interrupted delete can be retried.
    pub async fn mark_deleted(&self, id: &str, kind: &str) -> FileServiceResult<FileRecord> {
        let sql = format!(
            "UPDATE files SET status = ?, version = version + 1, updated_at = ?
             WHERE id = ? AND kind = ?
             RETURNING {FILE_COLUMNS}"
        );
        sqlx::query_as::<_, FileRow>(&sql)
            .bind(FileStatus::Deleted)
            .bind(Utc::now())
            .bind(id)
            .bind(kind)
            .fetch_optional(&*self.db)
            .await?
            .map(Into::into)
            .ok_or_else(|| FileServiceError::file_not_found(id, kind))
    }

    /// `AwaitingUpload -> Uploading`. Returns the claimed row version.
    pub async fn claim_upload(&self, id: &str, kind: &str) -> FileServiceResult<i64> {
        let claimed: Option<i64> = sqlx::query_scalar(
            "UPDATE files SET status = ?, version = version + 1, updated_at = ?
             WHERE id = ? AND kind = ? AND status = ?
             RETURNING version",
        )
        .bind(FileStatus::Uploading)
        .bind(Utc::now())
        .bind(id)
        .bind(kind)
        .bind(FileStatus::AwaitingUpload)
        .fetch_optional(&*self.db)
        .await?;

        match claimed {
            Some(version) => Ok(version),
            None => Err(self.transition_failure(id, kind, "upload content to").await),
        }
    }

    /// `Uploading -> Ready`, only if nobody touched the row since the claim.
    pub async fn finalize_upload(
        &self,
        id: &str,
        kind: &str,
        version: i64,
        size: u64,
        hash: &str,
    ) -> FileServiceResult<FileRecord> {
        let sql = format!(
            "UPDATE files SET status = ?, size_bytes = ?, hash = ?,
                    version = version + 1, updated_at = ?
             WHERE id = ? AND kind = ? AND status = ? AND version = ?
             RETURNING {FILE_COLUMNS}"
        );
        let finalized = sqlx::query_as::<_, FileRow>(&sql)
            .bind(FileStatus::Ready)
            .bind(size as i64)
            .bind(hash)
            .bind(Utc::now())
            .bind(id)
            .bind(kind)
            .bind(FileStatus::Uploading)
            .bind(version)
            .fetch_optional(&*self.db)
            .await?;

        match finalized {
            Some(row) => Ok(row.into()),
            None => Err(self.transition_failure(id, kind, "finalize upload of").await),
        }
    }

    /// `Uploading -> AwaitingUpload` for the claim identified by `version`.
    pub async fn release_upload(&self, id: &str, kind: &str, version: i64) -> FileServiceResult<bool> {
        let result = sqlx::query(
            "UPDATE files SET status = ?, version = version + 1, updated_at = ?
             WHERE id = ? AND kind = ? AND status = ? AND version = ?",
        )
        .bind(FileStatus::AwaitingUpload)
        .bind(Utc::now())
        .bind(id)
        .bind(kind)
        .bind(FileStatus::Uploading)
        .bind(version)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Release upload claims not touched since `older_than`.
    pub async fn release_stale_uploads(&self, older_than: DateTime<Utc>) -> FileServiceResult<u64> {
        let result = sqlx::query(
            "UPDATE files SET status = ?, version = version + 1, updated_at = ?
             WHERE status = ? AND updated_at < ?",
        )
        .bind(FileStatus::AwaitingUpload)
        .bind(Utc::now())
        .bind(FileStatus::Uploading)
        .bind(older_than)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected())
    }

    /// `(id, kind)` of every record in `status`.
    pub async fn files_with_status(&self, status: FileStatus) -> FileServiceResult<Vec<(String, String)>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT id, kind FROM files WHERE status = ? ORDER BY updated_at ASC",
        )
        .bind(status)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    pub async fn file_ids_for_kind(&self, kind: &str) -> FileServiceResult<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM files WHERE kind = ?")
            .bind(kind)
            .fetch_all(&*self.db)
            .await?;
        Ok(ids.into_iter().collect())
    }

    /// Filtered search across kinds. Nothing matching is an empty vector.
    pub async fn find_files(&self, query: &FindFilesQuery) -> FileServiceResult<Vec<FileRecord>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE 1 = 1"
        ));

        push_in(&mut builder, "kind", &query.kind, false);
        push_in(&mut builder, "kind", &query.kind_to_exclude, true);
        push_in(&mut builder, "extension", &lowercased(&query.extension), false);
        push_in(&mut builder, "mime_type", &query.mime_type, false);

        if !query.status.is_empty() {
            builder.push(" AND status IN (");
            let mut separated = builder.separated(", ");
            for status in &query.status {
                separated.push_bind(*status);
            }
            separated.push_unseparated(")");
        }

        if !query.name.is_empty() {
            builder.push(" AND (");
            let mut separated = builder.separated(" OR ");
            for name in &query.name {
                separated.push("name LIKE ");
                separated.push_bind_unseparated(format!("%{}%", name));
            }
            separated.push_unseparated(")");
        }

        match &query.meta {
            None | Some(Value::Null) => {}
            Some(Value::Object(fields)) => {
                if let Some(key) = fields.keys().find(|key| key.contains('"')) {
                    return Err(FileServiceError::Validation(format!(
                        "metadata filter key {key:?} must not contain '\"'"
                    )));
                }
                for (key, value) in fields {
                    builder.push(" AND json_extract(meta, ");
                    builder.push_bind(format!("$.\"{key}\""));
                    builder.push(") IS json_extract(");
                    builder.push_bind(value.to_string());
                    builder.push(", '$')");
                }
            }
            Some(_) => {
                return Err(FileServiceError::Validation(
                    "metadata filter must be an object".into(),
                ));
            }
        }

        push_page(&mut builder, &query.page);
        let rows: Vec<FileRow> = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// All records of one kind, newest first.
    pub async fn list_files(
        &self,
        kind: &str,
        query: &ListFilesQuery,
    ) -> FileServiceResult<Vec<FileRecord>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE kind = "
        ));
        builder.push_bind(kind.to_string());
        if let Some(status) = query.status {
            builder.push(" AND status = ");
            builder.push_bind(status);
        }

        push_page(&mut builder, &query.page());
        let rows: Vec<FileRow> = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn count_by_status(&self) -> FileServiceResult<Vec<(FileStatus, i64)>> {
        let rows = sqlx::query_as::<_, (FileStatus, i64)>(
            "SELECT status, COUNT(*) FROM files GROUP BY status",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    pub async fn count_by_extension(&self) -> FileServiceResult<Vec<(String, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT extension, COUNT(*) FROM files
             WHERE extension IS NOT NULL AND status != ?
             GROUP BY extension",
        )
        .bind(FileStatus::Deleted)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    // ---------------------------------------------------------------------
    // Shares
    // ---------------------------------------------------------------------

    /// Insert a share only while its file exists and is not tombstoned.
    /// Returns `false` when the file is gone. The delete cascade tombstones
    /// before it removes shares, so no share can outlive its file.
    pub async fn insert_share(&self, share: &ShareObject, token_digest: &str) -> FileServiceResult<bool> {
        let result = sqlx::query(
            "INSERT INTO shares (id, file_id, file_kind, name, token_digest, valid_until, created_at, updated_at)
             SELECT ?, ?, ?, ?, ?, ?, ?, ?
             WHERE EXISTS (
                 SELECT 1 FROM files WHERE id = ? AND kind = ? AND status != ?
             )",
        )
        .bind(&share.id)
        .bind(&share.file_id)
        .bind(&share.file_kind)
        .bind(&share.name)
        .bind(token_digest)
        .bind(share.valid_until)
        .bind(share.created_at)
        .bind(share.updated_at)
        .bind(&share.file_id)
        .bind(&share.file_kind)
        .bind(FileStatus::Deleted)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_share(&self, id: &str) -> FileServiceResult<ShareObject> {
        let sql = format!("SELECT {SHARE_COLUMNS} FROM shares WHERE id = ?");
        sqlx::query_as::<_, ShareObject>(&sql)
            .bind(id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| FileServiceError::share_not_found(id))
    }

    pub(crate) async fn find_share_by_digest(
        &self,
        token_digest: &str,
    ) -> FileServiceResult<Option<ShareDigestRow>> {
        let sql = format!("SELECT {SHARE_COLUMNS}, token_digest FROM shares WHERE token_digest = ?");
        let row = sqlx::query_as::<_, ShareDigestRow>(&sql)
            .bind(token_digest)
            .fetch_optional(&*self.db)
            .await?;
        Ok(row)
    }

    pub async fn list_shares(&self, query: &ListSharesQuery) -> FileServiceResult<Vec<ShareObject>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {SHARE_COLUMNS} FROM shares WHERE 1 = 1"
        ));
        if let Some(file_id) = &query.file_id {
            builder.push(" AND file_id = ");
            builder.push_bind(file_id.clone());
        }
        if let Some(kind) = &query.kind {
            builder.push(" AND file_kind = ");
            builder.push_bind(kind.clone());
        }

        let page = Page {
            page: query.page,
            per_page: query.per_page,
        };
        push_page(&mut builder, &page);
        let shares: Vec<ShareObject> = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(shares)
    }

    pub async fn update_share(&self, id: &str, patch: &ShareUpdate) -> FileServiceResult<ShareObject> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE shares SET updated_at = ");
        builder.push_bind(Utc::now());
        if let Some(name) = &patch.name {
            builder.push(", name = ");
            builder.push_bind(name.clone());
        }
        if let Some(valid_until) = patch.valid_until {
            builder.push(", valid_until = ");
            builder.push_bind(valid_until);
        }
        builder.push(" WHERE id = ");
        builder.push_bind(id.to_string());
        builder.push(format!(" RETURNING {SHARE_COLUMNS}"));

        builder
            .build_query_as::<ShareObject>()
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| FileServiceError::share_not_found(id))
    }

    pub async fn delete_share(&self, id: &str) -> FileServiceResult<()> {
        let result = sqlx::query("DELETE FROM shares WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(FileServiceError::share_not_found(id));
        }
        Ok(())
    }

    pub async fn delete_shares_for_file(&self, file_id: &str, kind: &str) -> FileServiceResult<u64> {
        let result = sqlx::query("DELETE FROM shares WHERE file_id = ? AND file_kind = ?")
            .bind(file_id)
            .bind(kind)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }

    /// Shares whose file row no longer exists.
    pub async fn delete_dangling_shares(&self) -> FileServiceResult<u64> {
        let result = sqlx::query(
            "DELETE FROM shares WHERE NOT EXISTS (
                 SELECT 1 FROM files WHERE files.id = shares.file_id AND files.kind = shares.file_kind
             )",
        )
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_expired_shares(&self, now: DateTime<Utc>) -> FileServiceResult<u64> {
        let result =
            sqlx::query("DELETE FROM shares WHERE valid_until IS NOT NULL AND valid_until <= ?")
                .bind(now)
                .execute(&*self.db)
                .await?;
        Ok(result.rows_affected())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

fn push_in(builder: &mut QueryBuilder<'_, Sqlite>, column: &str, values: &[String], negate: bool) {
    if values.is_empty() {
        return;
    }
    builder.push(format!(
        " AND {} {} (",
        column,
        if negate { "NOT IN" } else { "IN" }
    ));
    let mut separated = builder.separated(", ");
    for value in values {
        separated.push_bind(value.clone());
    }
    separated.push_unseparated(")");
}

fn push_page(builder: &mut QueryBuilder<'_, Sqlite>, page: &Page) {
    let (limit, offset) = page.limit_offset();
    builder.push(" ORDER BY created_at DESC, id ASC LIMIT ");
    builder.push_bind(limit);
    builder.push(" OFFSET ");
    builder.push_bind(offset);
}

fn lowercased(values: &[String]) -> Vec<String> {
    values.iter().map(|value| value.to_ascii_lowercase()).collect()
}
