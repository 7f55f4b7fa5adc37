//! A filesystem-backed [`BlobStore`], grounded on the reference system's
//! `LocalFileTransport`: blobs and their metadata sidecar documents live
//! under a root directory, keyed by `<deviceId>/<measurementId>-<fileType>`.
//! Intended for local development and single-node deployments; production
//! multi-node deployments use [`super::S3BlobStore`] instead.
//!
//! The unique index on `(deviceId, measurementId, fileType)` this backend
//! must enforce (§4.5) has no native equivalent on a plain filesystem, so it
//! is kept as an in-process `HashSet`, populated by scanning the blob
//! directory at startup and updated transactionally on each commit.

use super::{BlobStore, CommitError};
use crate::model::MetadataDocument;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
enum LocalStoreError {
    #[error("could not create directory {path}: {source}")]
    Mkdirp {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not write blob {path}: {source}")]
    WriteBlob {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not write metadata {path}: {source}")]
    WriteMetadata {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not serialize metadata: {0}")]
    SerializeMetadata(#[from] serde_json::Error),
    #[error("could not scan blob directory {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

type MeasurementKey = (Uuid, u64, String);

#[derive(Debug)]
pub struct LocalBlobStore {
    root: PathBuf,
    index: Mutex<HashSet<MeasurementKey>>,
}

impl LocalBlobStore {
    /// Builds a store rooted at `root`, scanning it for pre-existing blobs so
    /// the in-process unique index reflects what is already on disk (e.g.
    /// after a restart).
    pub async fn new(root: PathBuf) -> Result<Self, anyhow::Error> {
        let index = scan_existing(&root).await?;
        Ok(LocalBlobStore { root, index: Mutex::new(index) })
    }

    fn blob_path(&self, device_id: Uuid, measurement_id: u64, file_type: &str) -> PathBuf {
        self.directory_for(device_id)
            .join(format!("{measurement_id}-{file_type}.bin"))
    }

    fn metadata_path(&self, device_id: Uuid, measurement_id: u64, file_type: &str) -> PathBuf {
        self.directory_for(device_id)
            .join(format!("{measurement_id}-{file_type}.json"))
    }

    fn directory_for(&self, device_id: Uuid) -> PathBuf {
        self.root.join(device_id.to_string())
    }
}

async fn scan_existing(root: &Path) -> Result<HashSet<MeasurementKey>, LocalStoreError> {
    let mut index = HashSet::new();
    let mut device_dirs = match fs::read_dir(root).await {
        Ok(dirs) => dirs,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(index),
        Err(source) => return Err(LocalStoreError::Scan { path: root.to_owned(), source }),
    };

    while let Some(device_dir) = device_dirs
        .next_entry()
        .await
        .map_err(|source| LocalStoreError::Scan { path: root.to_owned(), source })?
    {
        let Ok(device_id) = device_dir.file_name().to_string_lossy().parse::<Uuid>() else {
            continue;
        };
        let mut files = fs::read_dir(device_dir.path())
            .await
            .map_err(|source| LocalStoreError::Scan { path: device_dir.path(), source })?;
        while let Some(file) = files
            .next_entry()
            .await
            .map_err(|source| LocalStoreError::Scan { path: device_dir.path(), source })?
        {
            let name = file.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(".bin") else {
                continue;
            };
            let Some((measurement_id, file_type)) = stem.split_once('-') else {
                continue;
            };
            if let Ok(measurement_id) = measurement_id.parse::<u64>() {
                index.insert((device_id, measurement_id, file_type.to_owned()));
            }
        }
    }
    Ok(index)
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn is_stored(
        &self,
        device_id: Uuid,
        measurement_id: u64,
        file_type: &str,
    ) -> Result<bool, anyhow::Error> {
        Ok(self
            .index
            .lock()
            .unwrap()
            .contains(&(device_id, measurement_id, file_type.to_owned())))
    }

    async fn put(
        &self,
        device_id: Uuid,
        measurement_id: u64,
        file_type: &str,
        data: Vec<u8>,
        metadata: &MetadataDocument,
    ) -> Result<(), CommitError> {
        let key = (device_id, measurement_id, file_type.to_owned());
        {
            let mut index = self.index.lock().unwrap();
            if index.contains(&key) {
                return Err(CommitError::Duplicate);
            }
            // Reserve the key before writing so a concurrent commit for the
            // same triple observes the reservation instead of racing past
            // this check onto the filesystem.
            index.insert(key.clone());
        }

        let blob_path = self.blob_path(device_id, measurement_id, file_type);
        let metadata_path = self.metadata_path(device_id, measurement_id, file_type);
        let dir = self.directory_for(device_id);

        let result: Result<(), CommitError> = async {
            mkdirp(&dir).await?;
            write_new_file(&blob_path, &data)
                .await
                .map_err(|source| LocalStoreError::WriteBlob { path: blob_path.clone(), source })?;

            let encoded = serde_json::to_vec_pretty(metadata).map_err(LocalStoreError::from)?;
            if let Err(source) = write_new_file(&metadata_path, &encoded).await {
                let _ = fs::remove_file(&blob_path).await;
                return Err(LocalStoreError::WriteMetadata { path: metadata_path, source }.into());
            }
            Ok(())
        }
        .await;

        if result.is_err() {
            // Writing failed after all -- release the reservation so a
            // retry is not spuriously reported as a duplicate.
            self.index.lock().unwrap().remove(&key);
        }
        result
    }
}

async fn mkdirp(dir: &Path) -> Result<(), LocalStoreError> {
    fs::create_dir_all(dir)
        .await
        .map_err(|source| LocalStoreError::Mkdirp { path: dir.to_owned(), source })
}

async fn write_new_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut file = fs::OpenOptions::new().write(true).create_new(true).open(path).await?;
    file.write_all(data).await?;
    file.flush().await
}

impl From<LocalStoreError> for CommitError {
    fn from(error: LocalStoreError) -> Self {
        CommitError::Other(error.into())
    }
}
