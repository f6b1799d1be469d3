//! Local filesystem backend.
//!
//! Payloads live at `root/{kind}/{shard}/{shard}/{file_id}` where the shards
//! are the first two bytes of MD5(`kind/file_id`). Writes go to a temp file in
//! the target directory, are fsynced, then renamed into place, so readers only
//! ever see complete content.
//!
//! With a capacity set, every write reserves its bytes against a ledger shared
//! by all writes of this backend instance, so concurrent uploads cannot jointly
//! overshoot it. The ledger is seeded from a walk of `root` on first use;
//! instances sharing one directory do not see each other's reservations.

use async_trait::async_trait;
use futures::StreamExt;
use md5::Context;
use parking_lot::Mutex;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

use super::{BackendError, BackendResult, BackendUsage, ByteStream, StorageBackend, WriteOutcome};

const TMP_PREFIX: &str = ".tmp-";

pub struct LocalFsBackend {
    name: String,
    root: PathBuf,
    capacity: Option<u64>,
    ledger: Mutex<Ledger>,
}

/// Bytes stored (`None` until first loaded) and bytes reserved by writes
/// still streaming.
#[derive(Default)]
struct Ledger {
    committed: Option<u64>,
    reserved: u64,
}

impl LocalFsBackend {
    /// Create the backend, making sure `root` exists.
    pub async fn new(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        capacity: Option<u64>,
    ) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            name: name.into(),
            root,
            capacity,
            ledger: Mutex::new(Ledger::default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn kind_root(&self, kind: &str) -> PathBuf {
        self.root.join(kind)
    }

    fn shards(kind: &str, file_id: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", kind, file_id));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn content_path(&self, kind: &str, file_id: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(kind, file_id);
        let mut path = self.kind_root(kind);
        path.push(shard_a);
        path.push(shard_b);
        path.push(file_id);
        path
    }

    /// Remove empty directories from `start` up to (not including) `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    async fn reserve(&self, capacity: u64) -> io::Result<Reservation<'_>> {
        let loaded = self.ledger.lock().committed.is_some();
        if !loaded {
            let used = self.used_bytes().await?;
            self.ledger.lock().committed.get_or_insert(used);
        }
        Ok(Reservation {
            ledger: &self.ledger,
            capacity,
            bytes: 0,
        })
    }

    fn forget_committed(&self, bytes: u64) {
        if let Some(committed) = self.ledger.lock().committed.as_mut() {
            *committed = committed.saturating_sub(bytes);
        }
    }

    async fn used_bytes(&self) -> io::Result<u64> {
        let mut total = 0u64;
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if file_type.is_file() {
                    total += entry.metadata().await?.len();
                }
            }
        }
        Ok(total)
    }
}

/// Bytes held for one in-flight write. Released on drop unless committed.
struct Reservation<'a> {
    ledger: &'a Mutex<Ledger>,
    capacity: u64,
    bytes: u64,
}

impl Reservation<'_> {
    fn grow(&mut self, more: u64) -> BackendResult<()> {
        let mut ledger = self.ledger.lock();
        let in_use = ledger.committed.unwrap_or(0) + ledger.reserved;
        let available = self.capacity.saturating_sub(in_use);
        if more > available {
            return Err(BackendError::InsufficientCapacity {
                needed: self.bytes + more,
                available: available + self.bytes,
            });
        }
        ledger.reserved += more;
        self.bytes += more;
        Ok(())
    }

    /// The write landed; `replaced` bytes of previous content were freed.
    fn commit(mut self, replaced: u64) {
        let mut ledger = self.ledger.lock();
        ledger.reserved = ledger.reserved.saturating_sub(self.bytes);
        let committed = ledger.committed.unwrap_or(0) + self.bytes;
        ledger.committed = Some(committed.saturating_sub(replaced));
        self.bytes = 0;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.bytes > 0 {
            let mut ledger = self.ledger.lock();
            ledger.reserved = ledger.reserved.saturating_sub(self.bytes);
        }
    }
}

/// Create `path` inside `dir`. A concurrent delete may prune `dir` between
/// creating it and creating the file, so a missing directory is retried once.
async fn create_in_dir(dir: &Path, path: &Path) -> io::Result<File> {
    fs::create_dir_all(dir).await?;
    match File::create(path).await {
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!("directory {} vanished, recreating", dir.display());
            fs::create_dir_all(dir).await?;
            File::create(path).await
        }
        other => other,
    }
}

/// Removes the temp file unless it was renamed into place. Covers early
/// returns as well as the write future being dropped mid-stream.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = std::fs::remove_file(&self.path) {
                if err.kind() != ErrorKind::NotFound {
                    debug!("failed to remove temp file {}: {}", self.path.display(), err);
                }
            }
        }
    }
}

#[async_trait]
impl StorageBackend for LocalFsBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(
        &self,
        file_id: &str,
        kind: &str,
        mut content: ByteStream,
    ) -> BackendResult<WriteOutcome> {
        let file_path = self.content_path(kind, file_id);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            BackendError::Io(io::Error::other("content path missing parent directory"))
        })?;
        let mut guard = TempFileGuard::new(parent.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4())));
        let mut file = create_in_dir(&parent, &guard.path).await?;

        let mut reservation = match self.capacity {
            Some(capacity) => Some(self.reserve(capacity).await?),
            None => None,
        };

        let mut size: u64 = 0;
        let mut digest = Context::new();
        while let Some(chunk) = content.next().await {
            let chunk = chunk?;
            if let Some(reservation) = reservation.as_mut() {
                reservation.grow(chunk.len() as u64)?;
            }
            size += chunk.len() as u64;
            digest.consume(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let replaced = match fs::metadata(&file_path).await {
            Ok(existing) => existing.len(),
            Err(_) => 0,
        };
        if let Err(err) = fs::rename(&guard.path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&guard.path, &file_path).await?;
            } else {
                return Err(BackendError::Io(err));
            }
        }
        guard.disarm();
        if let Some(reservation) = reservation {
            reservation.commit(replaced);
        }

        debug!("stored {} bytes at {}", size, file_path.display());
        Ok(WriteOutcome {
            size,
            hash: format!("{:x}", digest.compute()),
        })
    }

    async fn read(&self, file_id: &str, kind: &str) -> BackendResult<ByteStream> {
        let file_path = self.content_path(kind, file_id);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                BackendError::ContentNotFound(file_id.to_string())
            } else {
                BackendError::Io(err)
            }
        })?;
        Ok(ReaderStream::new(file).boxed())
    }

    async fn delete(&self, file_id: &str, kind: &str) -> BackendResult<()> {
        let file_path = self.content_path(kind, file_id);
        let size = fs::metadata(&file_path).await.map(|meta| meta.len()).ok();
        match fs::remove_file(&file_path).await {
            Ok(_) => {
                self.forget_committed(size.unwrap_or(0));
                debug!("removed content file {}", file_path.display());
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("content file {} already missing", file_path.display());
                return Ok(());
            }
            Err(err) => return Err(BackendError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let kind_root = self.kind_root(kind);
            self.prune_empty_dirs(parent, &kind_root).await;
        }
        Ok(())
    }

    async fn report_usage(&self) -> BackendResult<BackendUsage> {
        Ok(BackendUsage {
            used: self.used_bytes().await?,
            capacity: self.capacity,
        })
    }

    async fn list_content(&self, kind: &str) -> BackendResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut pending = vec![self.kind_root(kind)];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(BackendError::Io(err)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if file_type.is_file() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if !name.starts_with(TMP_PREFIX) {
                        ids.push(name);
                    }
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    fn chunks(parts: &[&'static [u8]]) -> ByteStream {
        stream::iter(
            parts
                .iter()
                .map(|part| Ok(Bytes::from_static(part)))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    async fn collect(stream: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut stream = stream;
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    async fn backend(dir: &tempfile::TempDir, capacity: Option<u64>) -> LocalFsBackend {
        LocalFsBackend::new("local", dir.path().join("files"), capacity)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn write_then_read_round_trips_content() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir, None).await;

        let outcome = backend
            .write("f1", "reports", chunks(&[b"hello ", b"world"]))
            .await
            .unwrap();
        assert_eq!(outcome.size, 11);
        assert_eq!(outcome.hash, format!("{:x}", md5::compute(b"hello world")));

        let read = backend.read("f1", "reports").await.unwrap();
        assert_eq!(collect(read).await, b"hello world");
        assert_eq!(backend.list_content("reports").await.unwrap(), vec!["f1"]);
        assert!(backend.list_content("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_stream_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir, None).await;

        let broken = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(ErrorKind::ConnectionReset, "client went away")),
        ])
        .boxed();
        let err = backend.write("f1", "reports", broken).await.unwrap_err();
        assert!(matches!(err, BackendError::Io(_)));

        assert!(matches!(
            backend.read("f1", "reports").await,
            Err(BackendError::ContentNotFound(_))
        ));
        assert_eq!(backend.report_usage().await.unwrap().used, 0);
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_prunes_directories() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir, None).await;
        backend
            .write("f1", "reports", chunks(&[b"abc"]))
            .await
            .unwrap();

        backend.delete("f1", "reports").await.unwrap();
        backend.delete("f1", "reports").await.unwrap();
        backend.delete("never-existed", "reports").await.unwrap();

        let kind_root = backend.root().join("reports");
        let mut entries = fs::read_dir(&kind_root).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn usage_reports_bytes_and_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir, Some(10)).await;
        backend
            .write("f1", "reports", chunks(&[b"1234"]))
            .await
            .unwrap();

        let usage = backend.report_usage().await.unwrap();
        assert_eq!(usage, BackendUsage { used: 4, capacity: Some(10) });

        let err = backend
            .write("f2", "reports", chunks(&[b"1234567"]))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InsufficientCapacity { .. }));
        assert_eq!(backend.report_usage().await.unwrap().used, 4);
    }

    #[tokio::test]
    async fn concurrent_writes_share_one_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(backend(&dir, Some(10)).await);

        // first write holds 6 bytes and stalls until released
        let (started_tx, started) = oneshot::channel();
        let (release, gate) = oneshot::channel::<()>();
        let held = stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(b"123456"))])
            .chain(stream::once(async move {
                let _ = started_tx.send(());
                let _ = gate.await;
                Ok(Bytes::new())
            }))
            .boxed();
        let first = tokio::spawn({
            let backend = backend.clone();
            async move { backend.write("f1", "reports", held).await }
        });
        started.await.unwrap();

        let err = backend
            .write("f2", "reports", chunks(&[b"654321"]))
            .await
            .unwrap_err();
        assert!(
            matches!(err, BackendError::InsufficientCapacity { available: 4, .. }),
            "{err:?}"
        );

        release.send(()).unwrap();
        assert_eq!(first.await.unwrap().unwrap().size, 6);

        // deleting frees the space again
        backend.delete("f1", "reports").await.unwrap();
        backend
            .write("f2", "reports", chunks(&[b"654321"]))
            .await
            .unwrap();
        assert_eq!(backend.report_usage().await.unwrap().used, 6);
    }

    #[tokio::test]
    async fn overwrite_counts_only_the_new_content() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir, Some(10)).await;
        backend
            .write("f1", "reports", chunks(&[b"12345678"]))
            .await
            .unwrap();
        backend
            .write("f1", "reports", chunks(&[b"12"]))
            .await
            .unwrap();
        backend
            .write("f2", "reports", chunks(&[b"12345678"]))
            .await
            .unwrap();
        assert_eq!(backend.report_usage().await.unwrap().used, 10);
    }

    #[tokio::test]
    async fn file_creation_recreates_a_pruned_directory() {
        let dir = tempfile::tempdir().unwrap();
        let shard = dir.path().join("reports").join("ab").join("cd");

        drop(create_in_dir(&shard, &shard.join("one")).await.unwrap());
        fs::remove_file(shard.join("one")).await.unwrap();
        fs::remove_dir(&shard).await.unwrap();

        drop(create_in_dir(&shard, &shard.join("two")).await.unwrap());
        assert!(fs::metadata(shard.join("two")).await.unwrap().is_file());
    }
}
