//! Storage backend adapters and the kind -> backend registry.
//!
//! A backend only ever sees `(file_id, kind, bytes)`; file records, shares and
//! lifecycle states live in the metadata repository. Backends must never make
//! partially written content readable.

pub mod local;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::{
    collections::{BTreeMap, HashMap},
    io,
    sync::Arc,
};
use thiserror::Error;

use crate::{
    config::{BackendConfig, BackendType, StorageConfig},
    models::kind::FileKind,
    services::error::{FileServiceError, FileServiceResult},
};

pub use local::LocalFsBackend;
pub use memory::MemoryBackend;

/// Content moving in or out of a backend.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

const MAX_SEGMENT_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no content stored for file `{0}`")]
    ContentNotFound(String),
    #[error("capacity exceeded: {needed} bytes needed, {available} available")]
    InsufficientCapacity { needed: u64, available: u64 },
    #[error("{0}")]
    Unavailable(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Produced as a side effect of a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub size: u64,
    /// Hex MD5 of the written bytes.
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendUsage {
    pub used: u64,
    pub capacity: Option<u64>,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Registry name of this backend instance.
    fn name(&self) -> &str;

    /// Consume `content` and store it. On error nothing becomes readable.
    async fn write(&self, file_id: &str, kind: &str, content: ByteStream)
    -> BackendResult<WriteOutcome>;

    async fn read(&self, file_id: &str, kind: &str) -> BackendResult<ByteStream>;

    /// Idempotent: removing absent content succeeds.
    async fn delete(&self, file_id: &str, kind: &str) -> BackendResult<()>;

    async fn report_usage(&self) -> BackendResult<BackendUsage>;

    /// Ids of every file with stored content under `kind`.
    async fn list_content(&self, kind: &str) -> BackendResult<Vec<String>>;
}

/// Reject ids and kinds that could escape a backend's namespace.
pub fn ensure_segment_safe(what: &str, value: &str) -> FileServiceResult<()> {
    let invalid = |reason: &str| {
        Err(FileServiceError::Validation(format!(
            "{what} `{}` is invalid: {reason}",
            value.escape_debug()
        )))
    };

    if value.is_empty() {
        return invalid("must not be empty");
    }
    if value.len() > MAX_SEGMENT_LEN {
        return invalid("too long");
    }
    if value == "." || value.contains("..") || value.starts_with(".tmp-") {
        return invalid("reserved name");
    }
    if value
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'/' || b == b'\\')
    {
        return invalid("contains path separators or control characters");
    }
    Ok(())
}

/// A kind together with the backend that owns its content.
#[derive(Clone)]
pub struct ResolvedKind<'a> {
    pub kind: &'a FileKind,
    pub backend: Arc<dyn StorageBackend>,
}

/// Static map from kind to backend, built once at startup.
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn StorageBackend>>,
    kinds: HashMap<String, FileKind>,
}

impl BackendRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Instantiate every configured backend and validate kind routing.
    pub async fn from_config(config: &StorageConfig) -> FileServiceResult<Self> {
        let mut builder = Self::builder();
        for backend in &config.backends {
            builder = builder.backend(instantiate(backend).await?);
        }
        for kind in &config.kinds {
            builder = builder.kind(kind.clone());
        }
        builder.build()
    }

    /// Unregistered kinds are a configuration error, fatal to the operation.
    pub fn resolve(&self, kind: &str) -> FileServiceResult<ResolvedKind<'_>> {
        let kind = self
            .kinds
            .get(kind)
            .ok_or_else(|| FileServiceError::unknown_kind(kind))?;
        let backend = self.backends.get(&kind.backend).cloned().ok_or_else(|| {
            FileServiceError::Configuration(format!(
                "kind `{}` routes to unknown backend `{}`",
                kind.id, kind.backend
            ))
        })?;
        Ok(ResolvedKind { kind, backend })
    }

    pub fn backends(&self) -> impl Iterator<Item = (&str, &Arc<dyn StorageBackend>)> {
        self.backends
            .iter()
            .map(|(name, backend)| (name.as_str(), backend))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &FileKind> {
        self.kinds.values()
    }
}

async fn instantiate(config: &BackendConfig) -> FileServiceResult<Arc<dyn StorageBackend>> {
    match config.backend_type {
        BackendType::Local => {
            let path = config.path.as_ref().ok_or_else(|| {
                FileServiceError::Configuration(format!(
                    "local backend `{}` requires a path",
                    config.name
                ))
            })?;
            let backend = LocalFsBackend::new(&config.name, path, config.capacity_bytes)
                .await
                .map_err(|err| {
                    FileServiceError::Configuration(format!(
                        "cannot initialise local backend `{}` at {}: {}",
                        config.name,
                        path.display(),
                        err
                    ))
                })?;
            Ok(Arc::new(backend))
        }
        BackendType::Memory => Ok(Arc::new(MemoryBackend::new(
            &config.name,
            config.capacity_bytes,
        ))),
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    backends: Vec<Arc<dyn StorageBackend>>,
    kinds: Vec<FileKind>,
}

impl RegistryBuilder {
    pub fn backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn kind(mut self, kind: FileKind) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn build(self) -> FileServiceResult<BackendRegistry> {
        let mut backends = BTreeMap::new();
        for backend in self.backends {
            let name = backend.name().to_string();
            if backends.insert(name.clone(), backend).is_some() {
                return Err(FileServiceError::Configuration(format!(
                    "backend `{name}` registered twice"
                )));
            }
        }

        let mut kinds = HashMap::new();
        for kind in self.kinds {
            ensure_segment_safe("kind", &kind.id)
                .map_err(|err| FileServiceError::Configuration(err.to_string()))?;
            if !backends.contains_key(&kind.backend) {
                return Err(FileServiceError::Configuration(format!(
                    "kind `{}` routes to unknown backend `{}`",
                    kind.id, kind.backend
                )));
            }
            if kinds.contains_key(&kind.id) {
                return Err(FileServiceError::Configuration(format!(
                    "kind `{}` registered twice",
                    kind.id
                )));
            }
            kinds.insert(kind.id.clone(), kind);
        }

        Ok(BackendRegistry { backends, kinds })
    }
}
