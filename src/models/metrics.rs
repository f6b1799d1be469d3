//! Usage metrics. Computed per request, never persisted.

use serde::Serialize;
use std::collections::BTreeMap;

use super::file::FileStatus;

/// Consumption of a single storage backend, or of all of them combined.
///
/// `used` is `None` when the backend failed or did not answer in time;
/// `capacity` is `None` for unbounded backends.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageMetrics {
    pub used: Option<u64>,
    pub capacity: Option<u64>,
    pub available: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StorageMetrics {
    pub fn known(used: u64, capacity: Option<u64>) -> Self {
        Self {
            used: Some(used),
            capacity,
            available: capacity.map(|cap| cap.saturating_sub(used)),
            error: None,
        }
    }

    pub fn unknown(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[derive(Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct FilesMetrics {
    /// Keyed by backend name.
    pub storage: BTreeMap<String, StorageMetrics>,
    pub total: StorageMetrics,
    pub count_by_status: BTreeMap<FileStatus, u64>,
    pub count_by_extension: BTreeMap<String, u64>,
}
