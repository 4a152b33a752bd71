//! Local filesystem backend.
//!
//! Artifacts live at `{root}/{storage path}`. Writes go to a sibling temp file that is renamed
//! over the target, so readers see either the previous artifact or the complete new one. The
//! file's modification time is the artifact's creation time. The stored content type lives in a
//! hidden sidecar (`.meta-{file name}`) written the same way just before the artifact.

use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use super::context::{BackendContext, TrimCandidate, TrimProgress};
use super::error::{BackendError, BackendResult};
use super::retry::{bounded, with_retry};
use super::{
    ArtifactMeta, ByteStream, CacheBackend, ConditionalRequest, Freshness, ServeInstruction,
    SourceMeta, TrimReport,
};
use crate::cache::config::DeliveryMode;
use crate::cache::index::CacheEntry;
use crate::cache::keys::StoragePath;

const SOURCE: &str = "cache::backend::filesystem";
const STREAM_CHUNK_SIZE: usize = 64 * 1024;
const TEMP_PREFIX: &str = ".tmp-";
const META_PREFIX: &str = ".meta-";
/// Attempts to recreate a shard directory removed by a concurrent trim.
const CREATE_DIR_ATTEMPTS: u32 = 3;
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

pub struct FilesystemBackend {
    root: PathBuf,
    public_base_url: Option<Url>,
    context: BackendContext,
}

impl FilesystemBackend {
    /// Create the backend, creating `root` if needed.
    ///
    /// `public_base_url` is where a CDN or static server exposes `root`; redirect delivery is
    /// only possible when it is set.
    pub async fn new(
        root: impl AsRef<Path>,
        public_base_url: Option<Url>,
        context: BackendContext,
    ) -> BackendResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            public_base_url: public_base_url.map(with_trailing_slash),
            context,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn context(&self) -> &BackendContext {
        &self.context
    }

    /// Absolute location of `path`, rejecting anything that could leave `root`.
    fn resolve(&self, path: &StoragePath) -> BackendResult<PathBuf> {
        let relative = path.as_str();
        if relative.is_empty() || relative.contains('\\') {
            return Err(BackendError::InvalidPath(relative.to_string()));
        }

        for component in Path::new(relative).components() {
            if !matches!(component, Component::Normal(_)) {
                return Err(BackendError::InvalidPath(relative.to_string()));
            }
        }

        Ok(self.root.join(relative))
    }

    async fn modified_at(file: &Path) -> BackendResult<Option<OffsetDateTime>> {
        match fs::metadata(file).await {
            Ok(meta) if meta.is_file() => Ok(Some(OffsetDateTime::from(meta.modified()?))),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn public_url(&self, path: &StoragePath) -> Option<Url> {
        self.public_base_url
            .as_ref()
            .and_then(|base| base.join(path.as_str()).ok())
    }

    async fn open_for_serving(
        &self,
        path: &StoragePath,
        conditions: &ConditionalRequest,
    ) -> BackendResult<ServeInstruction> {
        let file_path = self.resolve(path)?;
        let file = match fs::File::open(&file_path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(ServeInstruction::Missing),
            Err(err) => return Err(err.into()),
        };

        let metadata = file.metadata().await?;
        let modified = metadata.modified()?;
        let content_type = match stored_content_type(&file_path).await {
            Some(content_type) => content_type,
            None => content_type_for(path),
        };
        let meta = ArtifactMeta {
            content_type: Some(content_type),
            etag: Some(file_etag(metadata.len(), modified)),
            last_modified: Some(OffsetDateTime::from(modified)),
            content_length: Some(metadata.len()),
        };

        if conditions.is_not_modified(meta.etag.as_deref(), meta.last_modified) {
            return Ok(ServeInstruction::NotModified { meta });
        }

        Ok(ServeInstruction::Stream {
            meta,
            body: file_stream(file),
        })
    }

    /// Artifacts directly inside `dir`; subdirectories are pushed onto `pending`.
    ///
    /// Hidden files (temp files, sidecars) are ignored. I/O errors on the directory or on a
    /// single entry are logged and skipped.
    async fn scan_directory(&self, dir: &Path, pending: &mut Vec<PathBuf>) -> Vec<TrimCandidate> {
        let mut candidates = Vec::new();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return candidates,
            Err(err) => {
                warn!(
                    target = SOURCE,
                    op = "trim",
                    dir = %dir.display(),
                    result = "error",
                    error = %err,
                    "Skipping unreadable cache directory"
                );
                return candidates;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!(
                        target = SOURCE,
                        op = "trim",
                        dir = %dir.display(),
                        result = "error",
                        error = %err,
                        "Stopped listing cache directory early"
                    );
                    break;
                }
            };
            let entry_path = entry.path();
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    warn!(
                        target = SOURCE,
                        op = "trim",
                        entry = %entry_path.display(),
                        result = "error",
                        error = %err,
                        "Skipping unreadable cache entry"
                    );
                    continue;
                }
            };
            if metadata.is_dir() {
                pending.push(entry_path);
                continue;
            }
            if !metadata.is_file() {
                continue;
            }

            let Some(relative) = relative_storage_path(&self.root, &entry_path) else {
                continue;
            };
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            candidates.push(TrimCandidate {
                path: relative,
                modified: OffsetDateTime::from(modified),
            });
        }

        candidates
    }

    async fn delete(&self, path: StoragePath) -> BackendResult<()> {
        let file_path = self.resolve(&path)?;
        match fs::remove_file(&file_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        if let Some(sidecar) = sidecar_path(&file_path) {
            match fs::remove_file(&sidecar).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.prune_empty_dirs(&file_path).await;
        Ok(())
    }

    /// Remove the now-empty shard directories above `file`, stopping at `root`.
    async fn prune_empty_dirs(&self, file: &Path) {
        let mut dir = file.parent();
        while let Some(current) = dir {
            if current == self.root || !current.starts_with(&self.root) {
                break;
            }
            // Fails while the directory still has entries.
            if fs::remove_dir(current).await.is_err() {
                break;
            }
            dir = current.parent();
        }
    }
}

#[async_trait]
impl CacheBackend for FilesystemBackend {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip_all, fields(backend = "filesystem", path = %path))]
    async fn is_fresh_or_missing(
        &self,
        path: &StoragePath,
        source: &SourceMeta,
    ) -> BackendResult<Freshness> {
        let file_path = self.resolve(path)?;
        let timeout = self.context.config().backend_timeout();
        let policy = self.context.retry_policy();

        self.context
            .evaluate(path, source, || async {
                with_retry(&policy, "metadata", || {
                    bounded(timeout, "metadata", Self::modified_at(&file_path))
                })
                .await
            })
            .await
    }

    #[instrument(skip_all, fields(backend = "filesystem", path = %path, size = bytes.len()))]
    async fn store(
        &self,
        path: &StoragePath,
        bytes: Bytes,
        content_type: &str,
    ) -> BackendResult<CacheEntry> {
        let target = self.resolve(path)?;
        let timeout = self.context.config().backend_timeout();

        let stored_type = content_type.to_string();
        let write =
            tokio::task::spawn_blocking(move || write_atomically(&target, &bytes, &stored_type));
        let created_at = bounded(timeout, "store", async {
            write
                .await
                .map_err(|err| BackendError::Task(err.to_string()))?
        })
        .await
        .map_err(|err| match err {
            BackendError::Io(io) => BackendError::Write {
                path: path.to_string(),
                message: io.to_string(),
            },
            other => other,
        })?;

        debug!(
            target = SOURCE,
            op = "store",
            path = %path,
            content_type,
            result = "ok",
            "Stored artifact"
        );
        Ok(self.context.record_stored(path, created_at))
    }

    #[instrument(skip_all, fields(backend = "filesystem", path = %path))]
    async fn serve_or_redirect(
        &self,
        path: &StoragePath,
        conditions: &ConditionalRequest,
    ) -> BackendResult<ServeInstruction> {
        let config = self.context.config();

        if config.delivery_mode == DeliveryMode::Redirect
            && let Some(location) = self.public_url(path)
        {
            let file_path = self.resolve(path)?;
            let checked = bounded(config.head_check_timeout(), "head_check", async {
                Ok(fs::try_exists(&file_path).await?)
            })
            .await;
            match checked {
                Ok(true) => return Ok(ServeInstruction::Redirect { location }),
                Ok(false) => debug!(
                    target = SOURCE,
                    op = "head_check",
                    path = %path,
                    result = "absent",
                    "Redirect existence check found nothing; streaming instead"
                ),
                Err(err) => debug!(
                    target = SOURCE,
                    op = "head_check",
                    path = %path,
                    result = "error",
                    error = %err,
                    "Redirect existence check failed; streaming instead"
                ),
            }
        }

        let timeout = config.backend_timeout();
        let policy = self.context.retry_policy();
        with_retry(&policy, "open", || {
            bounded(timeout, "open", self.open_for_serving(path, conditions))
        })
        .await
    }

    /// Walks the tree one directory at a time, deleting expired artifacts oldest-first within
    /// each directory. Cancellation is checked before every directory and every page.
    async fn trim_older_than(
        &self,
        horizon: OffsetDateTime,
        cancel: &CancellationToken,
    ) -> BackendResult<TrimReport> {
        let mut report = TrimReport::default();
        let page_size = self.context.config().trim_page_size_non_zero();
        let mut pending = vec![self.root.clone()];

        'walk: while let Some(dir) = pending.pop() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let mut candidates = self.scan_directory(&dir, &mut pending).await;
            candidates.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));

            for page in candidates.chunks(page_size) {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break 'walk;
                }
                report.pages += 1;

                let progress = self
                    .context
                    .trim_candidates(page.to_vec(), horizon, cancel, &mut report, |path| {
                        self.delete(path)
                    })
                    .await;
                match progress {
                    TrimProgress::Continue => {}
                    // Everything left in this directory is newer.
                    TrimProgress::ReachedFresh => break,
                    TrimProgress::Cancelled => {
                        report.cancelled = true;
                        break 'walk;
                    }
                }
            }
        }

        Ok(report)
    }

    fn invalidate(&self, path: &StoragePath) {
        self.context.forget(path);
    }
}

/// Write the content-type sidecar, then `bytes`, each through a temp file renamed into place.
fn write_atomically(
    target: &Path,
    bytes: &[u8],
    content_type: &str,
) -> BackendResult<OffsetDateTime> {
    let parent = target
        .parent()
        .ok_or_else(|| BackendError::InvalidPath(target.display().to_string()))?;
    let sidecar =
        sidecar_path(target).ok_or_else(|| BackendError::InvalidPath(target.display().to_string()))?;

    persist_in(parent, &sidecar, content_type.as_bytes())?;
    let file = persist_in(parent, target, bytes)?;

    let modified = file.metadata()?.modified()?;
    Ok(OffsetDateTime::from(modified))
}

fn persist_in(parent: &Path, target: &Path, bytes: &[u8]) -> std::io::Result<std::fs::File> {
    let mut attempt = 1;
    let mut temp = loop {
        std::fs::create_dir_all(parent)?;
        match tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(parent)
        {
            Ok(temp) => break temp,
            // Trim pruned the shard directory between creating and using it.
            Err(err) if err.kind() == ErrorKind::NotFound && attempt < CREATE_DIR_ATTEMPTS => {
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    };
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(target).map_err(|err| err.error)
}

fn sidecar_path(file: &Path) -> Option<PathBuf> {
    let name = file.file_name()?.to_str()?;
    Some(file.with_file_name(format!("{META_PREFIX}{name}")))
}

/// Content type recorded at store time, if a readable sidecar exists.
async fn stored_content_type(file: &Path) -> Option<String> {
    let sidecar = sidecar_path(file)?;
    match fs::read_to_string(&sidecar).await {
        Ok(value) => Some(value.trim().to_string()).filter(|value| !value.is_empty()),
        Err(err) if err.kind() == ErrorKind::NotFound => None,
        Err(err) => {
            warn!(
                target = SOURCE,
                op = "serve",
                sidecar = %sidecar.display(),
                result = "error",
                error = %err,
                "Unreadable content-type sidecar; guessing from the extension"
            );
            None
        }
    }
}

fn file_stream(file: fs::File) -> ByteStream {
    let stream = async_stream::try_stream! {
        let mut file = file;
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            yield Bytes::copy_from_slice(&buf[..n]);
        }
    };
    Box::pin(stream)
}

fn file_etag(len: u64, modified: SystemTime) -> String {
    let nanos = modified
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    format!("\"{len:x}-{nanos:x}\"")
}

fn content_type_for(path: &StoragePath) -> String {
    path.extension()
        .and_then(|ext| mime_guess::from_ext(ext).first())
        .map(|mime| mime.essence_str().to_string())
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
}

fn relative_storage_path(root: &Path, file: &Path) -> Option<StoragePath> {
    let relative = file.strip_prefix(root).ok()?;
    let segments: Vec<_> = relative
        .components()
        .map(|component| match component {
            Component::Normal(segment) => segment.to_str(),
            _ => None,
        })
        .collect::<Option<_>>()?;
    Some(StoragePath::from_backend(segments.join("/")))
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
