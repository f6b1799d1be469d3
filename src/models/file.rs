//! Represents a file record: metadata about uploaded content, never the bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use sqlx::{FromRow, types::Json};

use crate::services::error::{FileServiceError, FileServiceResult};

/// Lifecycle state of a file record.
///
/// `AwaitingUpload -> Uploading -> Ready`, with `Uploading` falling back to
/// `AwaitingUpload` when the upload fails or is cancelled. `Deleted` is a
/// tombstone written at the start of the delete cascade.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "TEXT", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    AwaitingUpload,
    Uploading,
    Ready,
    Deleted,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::AwaitingUpload => "AWAITING_UPLOAD",
            FileStatus::Uploading => "UPLOADING",
            FileStatus::Ready => "READY",
            FileStatus::Deleted => "DELETED",
        }
    }
}

/// A single file known to the service.
///
/// `meta` is a caller-defined payload stored and returned verbatim. The
/// default type parameter keeps it untyped; [`FileRecord::decode_meta`]
/// turns it into the caller's own shape.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord<M = Value> {
    /// Opaque identifier, unique within `kind`.
    pub id: String,

    /// Namespace tag of the owning feature. Immutable after creation.
    pub kind: String,

    pub name: String,

    pub mime_type: Option<String>,

    /// Lowercased extension derived from `name`, if any.
    pub extension: Option<String>,

    /// Alternative text, mostly for images.
    pub alt: Option<String>,

    pub meta: M,

    pub status: FileStatus,

    /// Content length in bytes; set when the upload is finalised.
    pub size: Option<u64>,

    /// Hex MD5 of the content; set when the upload is finalised.
    pub hash: Option<String>,

    /// Identity of the (already authenticated) caller that created the file.
    pub created_by: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl FileRecord<Value> {
    /// Re-type the metadata payload.
    pub fn decode_meta<M: DeserializeOwned>(self) -> FileServiceResult<FileRecord<M>> {
        let meta = serde_json::from_value(self.meta).map_err(|err| {
            FileServiceError::Validation(format!(
                "metadata of file `{}` does not match the requested shape: {}",
                self.id, err
            ))
        })?;

        Ok(FileRecord {
            id: self.id,
            kind: self.kind,
            name: self.name,
            mime_type: self.mime_type,
            extension: self.extension,
            alt: self.alt,
            meta,
            status: self.status,
            size: self.size,
            hash: self.hash,
            created_by: self.created_by,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl<M> FileRecord<M> {
    pub fn is_ready(&self) -> bool {
        self.status == FileStatus::Ready
    }
}

/// Row shape of the `files` table.
#[derive(FromRow, Debug)]
pub(crate) struct FileRow {
    pub id: String,
    pub kind: String,
    pub name: String,
    pub mime_type: Option<String>,
    pub extension: Option<String>,
    pub alt: Option<String>,
    pub meta: Json<Value>,
    pub status: FileStatus,
    pub size_bytes: Option<i64>,
    pub hash: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<FileRow> for FileRecord {
    fn from(row: FileRow) -> Self {
        Self {
            id: row.id,
            kind: row.kind,
            name: row.name,
            mime_type: row.mime_type,
            extension: row.extension,
            alt: row.alt,
            meta: row.meta.0,
            status: row.status,
            size: row.size_bytes.map(|size| size.max(0) as u64),
            hash: row.hash,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Arguments for creating a file record.
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateFileArgs<M = Value> {
    /// Caller-chosen id; a UUID is generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub alt: Option<String>,
    pub meta: M,
    #[serde(default)]
    pub created_by: Option<String>,
}

/// Arguments for patching a file record. Only `name` and `meta` are mutable.
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFileArgs<M = Value> {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub meta: Option<M>,
}

/// Pagination shared by `find` and `list`.
#[derive(Deserialize, Clone, Copy, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    /// 1-based page number.
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub per_page: Option<u32>,
}

pub const DEFAULT_PER_PAGE: u32 = 100;
pub const MAX_PER_PAGE: u32 = 1000;

impl Page {
    /// Returns `(limit, offset)`.
    pub fn limit_offset(&self) -> (i64, i64) {
        let per_page = self
            .per_page
            .unwrap_or(DEFAULT_PER_PAGE)
            .clamp(1, MAX_PER_PAGE) as i64;
        let page = self.page.unwrap_or(1).max(1) as i64;
        (per_page, (page - 1) * per_page)
    }
}

/// Filters accepted by `find`. Empty vectors mean "no constraint".
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct FindFilesQuery {
    pub kind: Vec<String>,
    pub kind_to_exclude: Vec<String>,
    /// Substring match on the file name.
    pub name: Vec<String>,
    pub extension: Vec<String>,
    pub status: Vec<FileStatus>,
    pub mime_type: Vec<String>,
    /// Top-level keys that must be equal in the stored metadata.
    pub meta: Option<Value>,
    #[serde(flatten)]
    pub page: Page,
}

/// Filters accepted by `list`, which is always scoped to one kind.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ListFilesQuery {
    pub status: Option<FileStatus>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl ListFilesQuery {
    pub fn page(&self) -> Page {
        Page {
            page: self.page,
            per_page: self.per_page,
        }
    }
}

/// Derive the lowercased extension from a file name (`"q1.PDF"` -> `"pdf"`).
pub fn extension_of(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 16 {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extension_is_derived_from_last_dot() {
        assert_eq!(extension_of("q1.pdf").as_deref(), Some("pdf"));
        assert_eq!(extension_of("archive.tar.GZ").as_deref(), Some("gz"));
        assert_eq!(extension_of("README"), None);
        assert_eq!(extension_of(".env"), None);
        assert_eq!(extension_of("trailing."), None);
    }

    #[test]
    fn page_defaults_and_clamps() {
        assert_eq!(Page::default().limit_offset(), (100, 0));
        let page = Page {
            page: Some(3),
            per_page: Some(5000),
        };
        assert_eq!(page.limit_offset(), (1000, 2000));
        let page = Page {
            page: Some(0),
            per_page: Some(0),
        };
        assert_eq!(page.limit_offset(), (1, 0));
    }

    #[test]
    fn status_serializes_in_screaming_snake_case() {
        assert_eq!(
            serde_json::to_value(FileStatus::AwaitingUpload).unwrap(),
            json!("AWAITING_UPLOAD")
        );
        assert_eq!(FileStatus::Ready.as_str(), "READY");
    }

    #[derive(Deserialize, Debug, PartialEq)]
    struct ReportMeta {
        quarter: u8,
    }

    #[test]
    fn decode_meta_retypes_payload() {
        let now = Utc::now();
        let record = FileRecord {
            id: "f1".into(),
            kind: "reports".into(),
            name: "q1.pdf".into(),
            mime_type: None,
            extension: Some("pdf".into()),
            alt: None,
            meta: json!({ "quarter": 1 }),
            status: FileStatus::AwaitingUpload,
            size: None,
            hash: None,
            created_by: None,
            created_at: now,
            updated_at: now,
        };

        let typed = record.clone().decode_meta::<ReportMeta>().unwrap();
        assert_eq!(typed.meta, ReportMeta { quarter: 1 });

        let mut broken = record;
        broken.meta = json!("not an object");
        assert!(matches!(
            broken.decode_meta::<ReportMeta>(),
            Err(FileServiceError::Validation(_))
        ));
    }
}
