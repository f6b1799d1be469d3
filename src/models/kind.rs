//! File kinds: namespaces that route files to a storage backend.

use serde::{Deserialize, Serialize};

/// Per-kind registration, resolved once at startup.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileKind {
    /// Kind identifier, e.g. `"reports"`.
    pub id: String,

    /// Name of the backend that owns this kind's content.
    pub backend: String,

    /// Upper bound for a single file's content.
    #[serde(default)]
    pub max_size_bytes: Option<u64>,

    /// Accepted MIME types; `None` accepts anything.
    #[serde(default)]
    pub allowed_mime_types: Option<Vec<String>>,
}

impl FileKind {
    pub fn new(id: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            backend: backend.into(),
            max_size_bytes: None,
            allowed_mime_types: None,
        }
    }

    pub fn accepts_mime_type(&self, mime_type: Option<&str>) -> bool {
        match (&self.allowed_mime_types, mime_type) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(allowed), Some(candidate)) => allowed
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(candidate)),
        }
    }
}
