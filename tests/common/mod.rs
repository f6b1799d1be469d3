#![allow(dead_code)]

use bytes::Bytes;
use files_service::{
    db,
    models::{file::CreateFileArgs, kind::FileKind},
    services::{
        file_service::{FileService, FileServiceOptions},
        storage::{BackendRegistry, ByteStream, MemoryBackend, StorageBackend},
    },
};
use futures::{Stream, StreamExt, stream};
use serde_json::{Value, json};
use std::{io, sync::Arc, time::Duration};

pub const KIND: &str = "reports";

pub struct Harness {
    pub service: FileService,
    pub memory: MemoryBackend,
}

/// Service over an in-memory database with `reports` routed to a memory
/// backend, plus any extra backends/kinds.
pub async fn harness_with(
    extra_backends: Vec<Arc<dyn StorageBackend>>,
    extra_kinds: Vec<FileKind>,
) -> Harness {
    let pool = db::connect_in_memory().await.expect("in-memory pool");
    db::run_migrations(&pool).await.expect("migrations");

    let memory = MemoryBackend::new("mem", None);
    let mut builder = BackendRegistry::builder()
        .backend(Arc::new(memory.clone()))
        .kind(FileKind::new(KIND, "mem"));
    for backend in extra_backends {
        builder = builder.backend(backend);
    }
    for kind in extra_kinds {
        builder = builder.kind(kind);
    }

    let service = FileService::new(
        Arc::new(pool),
        builder.build().expect("registry"),
        FileServiceOptions {
            metrics_timeout: Duration::from_millis(200),
            stale_upload_after: Duration::from_secs(60),
        },
    );
    Harness { service, memory }
}

pub async fn harness() -> Harness {
    harness_with(Vec::new(), Vec::new()).await
}

pub fn new_file(name: &str) -> CreateFileArgs<Value> {
    CreateFileArgs {
        id: None,
        kind: KIND.into(),
        name: name.into(),
        mime_type: Some("application/pdf".into()),
        alt: None,
        meta: json!({}),
        created_by: Some("analyst".into()),
    }
}

pub fn body(data: Vec<u8>) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    stream::iter(vec![Ok(Bytes::from(data))])
}

pub fn chunked(data: Vec<u8>, chunk: usize) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    let chunks: Vec<io::Result<Bytes>> = data
        .chunks(chunk)
        .map(|part| Ok(Bytes::copy_from_slice(part)))
        .collect();
    stream::iter(chunks)
}

pub async fn collect(mut content: ByteStream) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = content.next().await {
        out.extend_from_slice(&chunk.expect("chunk"));
    }
    out
}
