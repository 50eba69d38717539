//! On-disk metadata records.
//!
//! Every record is a small JSON sidecar. Records are written to a temp file
//! under the store's `.tmp/` directory, fsynced, and renamed over the final
//! path, so a reader (or a restart) sees either the old record or the new
//! one and never a torn write.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::TempPath;

use crate::errors::StoreError;
use crate::storage::types::{BucketInfo, ObjectAttributes, ObjectInfo, PartInfo, UploadInfo};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRecord {
    pub name: String,
    pub created: DateTime<Utc>,
}

impl BucketRecord {
    pub fn to_info(&self) -> BucketInfo {
        BucketInfo {
            name: self.name.clone(),
            created: self.created,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub key: String,
    /// File name of the content blob under the bucket's `blobs/` directory.
    pub blob: String,
    pub size: u64,
    pub etag: String,
    pub checksum_sha256: String,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub attributes: ObjectAttributes,
}

impl ObjectRecord {
    pub fn to_info(&self, bucket: &str) -> ObjectInfo {
        ObjectInfo {
            bucket: bucket.to_string(),
            key: self.key.clone(),
            size: self.size,
            etag: self.etag.clone(),
            checksum_sha256: self.checksum_sha256.clone(),
            last_modified: self.last_modified,
            attributes: self.attributes.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub initiated: DateTime<Utc>,
    #[serde(default)]
    pub attributes: ObjectAttributes,
}

impl UploadRecord {
    pub fn to_info(&self) -> UploadInfo {
        UploadInfo {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            upload_id: self.upload_id.clone(),
            initiated: self.initiated,
            attributes: self.attributes.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    pub part_number: u32,
    /// File name of the part blob inside the upload directory.
    pub blob: String,
    pub size: u64,
    pub etag: String,
    pub checksum_sha256: String,
    pub last_modified: DateTime<Utc>,
}

impl PartRecord {
    pub fn to_info(&self) -> PartInfo {
        PartInfo {
            part_number: self.part_number,
            size: self.size,
            etag: self.etag.clone(),
            checksum_sha256: self.checksum_sha256.clone(),
            last_modified: self.last_modified,
        }
    }
}

/// A record written and synced to a temp file, waiting to be published.
/// Dropping it removes the temp file.
#[derive(Debug)]
pub struct StagedRecord {
    path: TempPath,
}

impl StagedRecord {
    /// Atomically rename the staged record over `dest`.
    pub fn publish(self, dest: &Path) -> Result<(), StoreError> {
        self.path
            .persist(dest)
            .map_err(|err| StoreError::from(err.error))
    }
}

/// Serialize `value` into a synced temp file under `tmp_dir`.
pub fn stage<T: Serialize>(tmp_dir: &Path, value: &T) -> Result<StagedRecord, StoreError> {
    let body = serde_json::to_vec_pretty(value).map_err(|source| StoreError::CorruptRecord {
        path: tmp_dir.display().to_string(),
        source,
    })?;
    let mut file = tempfile::Builder::new()
        .prefix("record-")
        .suffix(".json")
        .tempfile_in(tmp_dir)?;
    file.write_all(&body)?;
    file.as_file().sync_all()?;
    Ok(StagedRecord {
        path: file.into_temp_path(),
    })
}

/// Stage and publish in one step.
pub fn write<T: Serialize>(tmp_dir: &Path, dest: &Path, value: &T) -> Result<(), StoreError> {
    stage(tmp_dir, value)?.publish(dest)
}

pub fn read<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let body = std::fs::read(path)?;
    serde_json::from_slice(&body).map_err(|source| StoreError::CorruptRecord {
        path: path.display().to_string(),
        source,
    })
}

/// List `*.json` files in `dir`, sorted by name. A missing directory is empty.
pub fn list_json(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
