//! C5: the storage service. Owns the on-disk temporary-chunk directory (always
//! local, regardless of backend) and delegates completed uploads to a
//! pluggable [`BlobStore`] that commits the blob and its metadata index entry
//! together. This mirrors the reference system's `Transport` trait
//! (`crate`-internal predecessor: local filesystem and S3 both satisfy one
//! interface) but narrowed to the commit/query/clean operations this
//! protocol actually needs.

mod local;
mod s3;

pub use local::LocalBlobStore;
pub use s3::S3BlobStore;

use crate::logging::event;
use crate::model::{MetadataDocument, Uploadable};
use crate::session::UploadIdentifier;
use crate::Error;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use slog::{info, o, warn, Logger};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Outcome of appending bytes to a temporary chunk: either it now holds the
/// full declared payload (`Complete`) or it is still waiting for more bytes
/// (`Incomplete`). Neither variant commits to the blob store; that is a
/// separate, explicit step (`StorageService::commit`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Complete { size: u64 },
    Incomplete { size: u64 },
}

/// A `Content-Range: bytes <from>-<to>/<total>` header, parsed and validated
/// per §4.3. Rejects the `from > total` case that the reference system left
/// undefined (open question 9c).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub from: u64,
    pub to: u64,
    pub total: u64,
}

impl ContentRange {
    pub fn parse(header: &str) -> Result<ContentRange, Error> {
        let rest = header
            .strip_prefix("bytes ")
            .ok_or_else(|| Error::Unparsable(format!("not a bytes Content-Range: {header}")))?;
        let (range, total) = rest
            .split_once('/')
            .ok_or_else(|| Error::Unparsable(format!("missing total in Content-Range: {header}")))?;
        let (from, to) = range
            .split_once('-')
            .ok_or_else(|| Error::Unparsable(format!("missing range in Content-Range: {header}")))?;
        let from: u64 = from
            .parse()
            .map_err(|_| Error::Unparsable(format!("invalid range start: {from}")))?;
        let to: u64 = to
            .parse()
            .map_err(|_| Error::Unparsable(format!("invalid range end: {to}")))?;
        let total: u64 = total
            .parse()
            .map_err(|_| Error::Unparsable(format!("invalid total: {total}")))?;

        if from > to || to >= total {
            return Err(Error::Unparsable(format!(
                "Content-Range out of order or past total: {header}"
            )));
        }

        Ok(ContentRange { from, to, total })
    }

    pub fn body_len(&self) -> u64 {
        self.to - self.from + 1
    }
}

/// Parses the status-query form, `Content-Range: bytes */<total>`, used by
/// C4's empty-body PUT.
pub fn parse_status_query_total(header: &str) -> Result<u64, Error> {
    let rest = header
        .strip_prefix("bytes */")
        .ok_or_else(|| Error::Unparsable(format!("not a status-query Content-Range: {header}")))?;
    rest.parse()
        .map_err(|_| Error::Unparsable(format!("invalid total: {rest}")))
}

/// Error surfaced by a [`BlobStore`] commit. `Duplicate` maps to `409`;
/// anything else maps to `500` and retains the session.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("a measurement with this key is already stored")]
    Duplicate,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The pluggable half of C5: where completed uploads and their metadata
/// documents ultimately land. `is_stored` is also consulted by C2 (duplicate
/// detection) and C4 (status queries for already-committed measurements).
#[async_trait]
pub trait BlobStore: std::fmt::Debug + Send + Sync {
    async fn is_stored(
        &self,
        device_id: Uuid,
        measurement_id: u64,
        file_type: &str,
    ) -> Result<bool, anyhow::Error>;

    /// Streams `data` into the blob store under the key derived from
    /// `(device_id, measurement_id, file_type)`, alongside `metadata` as the
    /// index entry. Must succeed or fail atomically (§4.5 commit contract):
    /// implementations that cannot offer true atomicity must detect and
    /// report a partial write as `CommitError::Other`, never leave it silent.
    async fn put(
        &self,
        device_id: Uuid,
        measurement_id: u64,
        file_type: &str,
        data: Vec<u8>,
        metadata: &MetadataDocument,
    ) -> Result<(), CommitError>;
}

/// Manages the append-only temporary chunk files that back every in-flight
/// session, independent of which `BlobStore` eventually receives the
/// completed upload.
#[derive(Clone)]
struct ChunkDirectory {
    directory: PathBuf,
}

impl ChunkDirectory {
    fn path_for(&self, id: UploadIdentifier) -> PathBuf {
        self.directory.join(id.to_string())
    }

    async fn current_size(&self, id: UploadIdentifier) -> std::io::Result<Option<u64>> {
        match fs::metadata(self.path_for(id)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn open_for_append(&self, id: UploadIdentifier) -> std::io::Result<File> {
        fs::create_dir_all(&self.directory).await?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(id))
            .await
    }

    async fn remove(&self, id: UploadIdentifier) -> std::io::Result<()> {
        match fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// C5 itself: the narrow interface consumed by C2/C3/C4, combining the local
/// chunk directory with a pluggable blob store.
#[derive(Clone)]
pub struct StorageService {
    chunks: ChunkDirectory,
    blob_store: Arc<dyn BlobStore>,
    logger: Logger,
}

impl StorageService {
    pub fn new(uploads_directory: PathBuf, blob_store: Arc<dyn BlobStore>, logger: Logger) -> Self {
        StorageService {
            chunks: ChunkDirectory {
                directory: uploads_directory,
            },
            blob_store,
            logger,
        }
    }

    pub async fn is_stored(
        &self,
        device_id: Uuid,
        measurement_id: u64,
        file_type: &str,
    ) -> Result<bool, Error> {
        self.blob_store
            .is_stored(device_id, measurement_id, file_type)
            .await
            .map_err(Error::StorageFailure)
    }

    /// The current size of `id`'s temporary chunk, or `None` if no chunk
    /// exists yet (the NEW state, or a reaped session).
    pub async fn bytes_uploaded(&self, id: UploadIdentifier) -> Result<Option<u64>, Error> {
        self.chunks
            .current_size(id)
            .await
            .map_err(|e| Error::StorageFailure(e.into()))
    }

    /// Appends every byte of `body` to `id`'s temporary chunk, then reports
    /// whether the chunk now matches `range.total`. Callers are responsible
    /// for holding the session's append lock and for having already checked
    /// that `range.from` matches the chunk's current size -- this method does
    /// not re-derive the FSM transition, only performs the write.
    pub async fn append<S, E>(
        &self,
        id: UploadIdentifier,
        range: &ContentRange,
        mut body: S,
    ) -> Result<StoreOutcome, Error>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::error::Error + Send + Sync + 'static,
    {
        use futures::StreamExt;

        let mut file = self
            .chunks
            .open_for_append(id)
            .await
            .map_err(|e| Error::StorageFailure(e.into()))?;

        let mut written: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| Error::StorageFailure(anyhow::Error::new(e)))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::StorageFailure(e.into()))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| Error::StorageFailure(e.into()))?;

        if written != range.body_len() {
            return Err(Error::Unparsable(format!(
                "Content-Range declared {} bytes but body carried {}",
                range.body_len(),
                written
            )));
        }

        let new_size = range.to + 1;
        if new_size == range.total {
            Ok(StoreOutcome::Complete { size: new_size })
        } else {
            Ok(StoreOutcome::Incomplete { size: new_size })
        }
    }

    /// Commits a completed temporary chunk to the blob store along with its
    /// metadata document, then removes the chunk file. On failure the chunk
    /// file is retained so the client can retry (§4.3 completion path, §7
    /// propagation policy).
    pub async fn commit(
        &self,
        id: UploadIdentifier,
        uploadable: &Uploadable,
        user_id: &str,
    ) -> Result<(), Error> {
        let logger = self.logger.new(o!(event::STORAGE_KEY => id.to_string()));
        let path = self.chunks.path_for(id);
        let data = fs::read(&path).await.map_err(|e| Error::StorageFailure(e.into()))?;
        let doc = MetadataDocument::from_uploadable(uploadable, user_id);

        let result = self
            .blob_store
            .put(
                uploadable.device_id,
                uploadable.measurement_id,
                uploadable.file_type(),
                data,
                &doc,
            )
            .await;

        match result {
            Ok(()) => {
                self.chunks
                    .remove(id)
                    .await
                    .map_err(|e| Error::StorageFailure(e.into()))?;
                info!(logger, "committed upload to blob store");
                Ok(())
            }
            Err(CommitError::Duplicate) => Err(Error::Duplicate),
            Err(CommitError::Other(e)) => {
                warn!(logger, "commit failed, retaining temporary chunk"; "error" => format!("{e:#}"));
                Err(Error::StorageFailure(e))
            }
        }
    }

    /// Deletes `id`'s temporary chunk without committing it. Used for
    /// terminal failures such as `PayloadTooLarge` (§7).
    pub async fn clean(&self, id: UploadIdentifier) -> Result<(), Error> {
        self.chunks
            .remove(id)
            .await
            .map_err(|e| Error::StorageFailure(e.into()))
    }

    /// C6's sweep: deletes every regular file in the chunk directory whose
    /// modification time is older than `max_age`. Never inspects sessions --
    /// deliberately stateless, per §4.6.
    pub async fn reap_expired(&self, max_age: Duration) -> std::io::Result<usize> {
        reap_directory(&self.chunks.directory, max_age, &self.logger).await
    }
}

async fn reap_directory(directory: &Path, max_age: Duration, logger: &Logger) -> std::io::Result<usize> {
    let mut removed = 0;
    let mut entries = match fs::read_dir(directory).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    while let Some(entry) = entries.next_entry().await? {
        let metadata = match entry.metadata().await {
            Ok(m) => m,
            Err(e) => {
                warn!(logger, "could not stat chunk during reap"; "error" => e.to_string());
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }
        let age = match metadata.modified().and_then(|m| {
            SystemTime::now()
                .duration_since(m)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
        }) {
            Ok(age) => age,
            Err(_) => continue,
        };
        if age < max_age {
            continue;
        }
        match fs::remove_file(entry.path()).await {
            Ok(()) => {
                removed += 1;
                info!(logger, "reaped expired temporary chunk"; "path" => entry.path().display().to_string());
            }
            Err(e) => {
                warn!(logger, "failed to reap temporary chunk, will retry next tick";
                    "path" => entry.path().display().to_string(), "error" => e.to_string());
            }
        }
    }
    Ok(removed)
}
