//! UsageMetrics: on-demand usage figures across all registered backends.
//!
//! Backends are polled concurrently, each under its own timeout. A backend
//! that errors or does not answer in time is reported as unknown; the call
//! itself still succeeds.

use futures::future::join_all;
use std::{sync::Arc, time::Duration};
use tokio::time::timeout;
use tracing::warn;

use crate::{
    models::metrics::{FilesMetrics, StorageMetrics},
    services::{
        error::FileServiceResult, metadata_repository::MetadataRepository, storage::BackendRegistry,
    },
};

pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone)]
pub struct UsageMetrics {
    repo: MetadataRepository,
    registry: Arc<BackendRegistry>,
    backend_timeout: Duration,
}

impl UsageMetrics {
    pub fn new(
        repo: MetadataRepository,
        registry: Arc<BackendRegistry>,
        backend_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            registry,
            backend_timeout,
        }
    }

    pub async fn collect(&self) -> FileServiceResult<FilesMetrics> {
        let storage = self.storage_metrics().await;
        let total = combine(storage.iter().map(|(_, metrics)| metrics));

        let mut metrics = FilesMetrics {
            total,
            storage: storage.into_iter().collect(),
            ..FilesMetrics::default()
        };
        for (status, count) in self.repo.count_by_status().await? {
            metrics.count_by_status.insert(status, count.max(0) as u64);
        }
        for (extension, count) in self.repo.count_by_extension().await? {
            metrics
                .count_by_extension
                .insert(extension, count.max(0) as u64);
        }
        Ok(metrics)
    }

    /// Poll every backend; never fails and never waits longer than the
    /// per-backend timeout.
    pub async fn storage_metrics(&self) -> Vec<(String, StorageMetrics)> {
        let lookups = self.registry.backends().map(|(name, backend)| {
            let name = name.to_string();
            let backend = Arc::clone(backend);
            let limit = self.backend_timeout;
            async move {
                let metrics = match timeout(limit, backend.report_usage()).await {
                    Ok(Ok(usage)) => StorageMetrics::known(usage.used, usage.capacity),
                    Ok(Err(err)) => {
                        warn!(backend = %name, error = %err, "usage report failed");
                        StorageMetrics::unknown(err.to_string())
                    }
                    Err(_) => {
                        warn!(backend = %name, timeout_ms = limit.as_millis() as u64, "usage report timed out");
                        StorageMetrics::unknown(format!(
                            "no answer within {} ms",
                            limit.as_millis()
                        ))
                    }
                };
                (name, metrics)
            }
        });
        join_all(lookups).await
    }
}

/// Totals: `used` only when every backend answered, `capacity` only when
/// every backend also reported one.
fn combine<'a>(parts: impl Iterator<Item = &'a StorageMetrics>) -> StorageMetrics {
    let mut used = Some(0u64);
    let mut capacity = Some(0u64);
    let mut any = false;
    for part in parts {
        any = true;
        used = used.zip(part.used).map(|(a, b)| a + b);
        capacity = capacity.zip(part.capacity).map(|(a, b)| a + b);
    }
    if !any {
        return StorageMetrics::known(0, Some(0));
    }
    match used {
        Some(used) => StorageMetrics::known(used, capacity),
        None => StorageMetrics {
            capacity,
            ..StorageMetrics::default()
        },
    }
}
