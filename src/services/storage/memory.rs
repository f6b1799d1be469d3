//! In-memory backend for tests, development and small scratch kinds.
//!
//! Content is buffered until the stream ends and only then inserted, so a
//! failed or cancelled write never becomes visible.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};

use super::{BackendError, BackendResult, BackendUsage, ByteStream, StorageBackend, WriteOutcome};

/// Chunk size used when streaming content back out.
const READ_CHUNK: usize = 64 * 1024;

#[derive(Clone)]
pub struct MemoryBackend {
    name: String,
    capacity: Option<u64>,
    // (kind, file_id) -> content
    content: Arc<RwLock<HashMap<(String, String), Bytes>>>,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>, capacity: Option<u64>) -> Self {
        Self {
            name: name.into(),
            capacity,
            content: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn contains(&self, file_id: &str, kind: &str) -> bool {
        self.content
            .read()
            .contains_key(&(kind.to_string(), file_id.to_string()))
    }

    fn used(&self) -> u64 {
        self.content
            .read()
            .values()
            .map(|bytes| bytes.len() as u64)
            .sum()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(
        &self,
        file_id: &str,
        kind: &str,
        mut content: ByteStream,
    ) -> BackendResult<WriteOutcome> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = content.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        let bytes = buffer.freeze();
        let size = bytes.len() as u64;
        let hash = format!("{:x}", md5::compute(&bytes));

        let key = (kind.to_string(), file_id.to_string());
        let mut content = self.content.write();
        if let Some(capacity) = self.capacity {
            let used: u64 = content
                .iter()
                .filter(|(existing, _)| **existing != key)
                .map(|(_, bytes)| bytes.len() as u64)
                .sum();
            let available = capacity.saturating_sub(used);
            if size > available {
                return Err(BackendError::InsufficientCapacity {
                    needed: size,
                    available,
                });
            }
        }
        content.insert(key, bytes);

        Ok(WriteOutcome { size, hash })
    }

    async fn read(&self, file_id: &str, kind: &str) -> BackendResult<ByteStream> {
        let bytes = self
            .content
            .read()
            .get(&(kind.to_string(), file_id.to_string()))
            .cloned()
            .ok_or_else(|| BackendError::ContentNotFound(file_id.to_string()))?;

        let chunks: Vec<_> = (0..bytes.len())
            .step_by(READ_CHUNK)
            .map(|start| Ok(bytes.slice(start..(start + READ_CHUNK).min(bytes.len()))))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn delete(&self, file_id: &str, kind: &str) -> BackendResult<()> {
        self.content
            .write()
            .remove(&(kind.to_string(), file_id.to_string()));
        Ok(())
    }

    async fn report_usage(&self) -> BackendResult<BackendUsage> {
        Ok(BackendUsage {
            used: self.used(),
            capacity: self.capacity,
        })
    }

    async fn list_content(&self, kind: &str) -> BackendResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .content
            .read()
            .keys()
            .filter(|(stored_kind, _)| stored_kind == kind)
            .map(|(_, id)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
