//! Multipart upload manager.
//!
//! Each upload lives in `uploads/<upload-id>/` next to the object store's
//! buckets:
//!
//! ```text
//! uploads/<id>/upload.json          upload record (bucket, key, attributes)
//! uploads/<id>/00001.json           part record
//! uploads/<id>/00001-<uuid>.part    part content
//! ```
//!
//! Uploads move `Initiated -> Completed` or `Initiated -> Aborted`; both end
//! states are terminal and the upload disappears from the registry. State
//! transitions and part publication for one upload are serialized by that
//! upload's mutex, so a racing Complete and Abort have exactly one winner.
//! Part bodies are streamed to staging before the mutex is taken, so parts
//! of one upload can be uploaded in parallel.

use std::collections::{BTreeMap, HashSet};
use std::io::SeekFrom;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::blob::StagedBlob;
use super::local::{ObjectStore, UPLOADS_DIR};
use super::types::{ByteRange, CompletedPart, ObjectAttributes, ObjectInfo, PartInfo, UploadInfo};
use super::{validate_key, validate_part_number};
use crate::errors::StoreError;
use crate::metadata::records::{self, PartRecord, UploadRecord};

const UPLOAD_RECORD: &str = "upload.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initiated,
    Completed,
    Aborted,
}

struct UploadState {
    phase: Phase,
    parts: BTreeMap<u32, PartRecord>,
}

struct Upload {
    record: UploadRecord,
    dir: PathBuf,
    state: Mutex<UploadState>,
}

/// Registry key; ordering gives (key, upload id) order within a bucket.
type UploadKey = (String, String, String);

fn part_record_name(part_number: u32) -> String {
    format!("{part_number:05}.json")
}

/// Strip surrounding double quotes from an ETag string for comparison.
fn strip_etag_quotes(etag: &str) -> &str {
    let etag = etag.trim();
    etag.strip_prefix('"')
        .and_then(|e| e.strip_suffix('"'))
        .unwrap_or(etag)
}

pub struct MultipartManager {
    store: Arc<ObjectStore>,
    dir: PathBuf,
    uploads: RwLock<BTreeMap<UploadKey, Arc<Upload>>>,
}

impl MultipartManager {
    /// Open the manager over `store`, reloading uploads that were in flight
    /// when the previous process stopped.
    pub fn open(store: Arc<ObjectStore>) -> Result<Self, StoreError> {
        let dir = store.root().join(UPLOADS_DIR);
        std::fs::create_dir_all(&dir)?;
        let manager = Self {
            store,
            dir,
            uploads: RwLock::new(BTreeMap::new()),
        };
        manager.recover()?;
        Ok(manager)
    }

    fn recover(&self) -> Result<(), StoreError> {
        let mut recovered = 0usize;
        for dir_entry in std::fs::read_dir(&self.dir)? {
            let dir = dir_entry?.path();
            if !dir.is_dir() {
                continue;
            }
            let record_path = dir.join(UPLOAD_RECORD);
            if !record_path.exists() {
                warn!("Removing upload directory without a record: {}", dir.display());
                std::fs::remove_dir_all(&dir)?;
                continue;
            }
            let record: UploadRecord = records::read(&record_path)?;
            if !self.store.bucket_exists(&record.bucket) {
                warn!(
                    "Discarding upload {}: bucket {} no longer exists",
                    record.upload_id, record.bucket
                );
                std::fs::remove_dir_all(&dir)?;
                continue;
            }

            let parts = recover_parts(&dir)?;
            self.store.retain_upload(&record.bucket)?;
            let key = (
                record.bucket.clone(),
                record.key.clone(),
                record.upload_id.clone(),
            );
            let upload = Upload {
                record,
                dir,
                state: Mutex::new(UploadState {
                    phase: Phase::Initiated,
                    parts,
                }),
            };
            self.write_uploads().insert(key, Arc::new(upload));
            recovered += 1;
        }
        if recovered > 0 {
            info!("Recovered {} in-flight multipart uploads", recovered);
        }
        Ok(())
    }

    fn write_uploads(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<UploadKey, Arc<Upload>>> {
        self.uploads.write().expect("uploads lock poisoned")
    }

    fn read_uploads(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<UploadKey, Arc<Upload>>> {
        self.uploads.read().expect("uploads lock poisoned")
    }

    fn lookup(&self, bucket: &str, key: &str, upload_id: &str) -> Result<Arc<Upload>, StoreError> {
        let lookup_key = (bucket.to_string(), key.to_string(), upload_id.to_string());
        self.read_uploads()
            .get(&lookup_key)
            .cloned()
            .ok_or_else(|| StoreError::InvalidUploadId {
                upload_id: upload_id.to_string(),
            })
    }

    /// Drop a terminal upload from the registry.
    fn forget(&self, upload: &Upload) {
        let record = &upload.record;
        self.write_uploads().remove(&(
            record.bucket.clone(),
            record.key.clone(),
            record.upload_id.clone(),
        ));
        self.store.release_upload(&record.bucket);
    }

    /// Move a terminal upload's directory out of `uploads/` and delete it.
    async fn discard_dir(&self, upload: &Upload) {
        let trash = self
            .store
            .tmp_dir()
            .join(format!("trash-{}", uuid::Uuid::new_v4().simple()));
        let target = match tokio::fs::rename(&upload.dir, &trash).await {
            Ok(()) => trash,
            Err(err) => {
                warn!("Failed to move upload directory {}: {}", upload.dir.display(), err);
                upload.dir.clone()
            }
        };
        if let Err(err) = tokio::fs::remove_dir_all(&target).await {
            warn!("Failed to remove upload directory {}: {}", target.display(), err);
        }
    }

    // -- Operations -----------------------------------------------------------

    pub fn initiate_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        attributes: ObjectAttributes,
    ) -> Result<UploadInfo, StoreError> {
        validate_key(key)?;
        self.store.retain_upload(bucket)?;

        let record = UploadRecord {
            upload_id: uuid::Uuid::new_v4().to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            initiated: Utc::now(),
            attributes: attributes.normalized(),
        };
        let dir = self.dir.join(&record.upload_id);
        let persisted = std::fs::create_dir_all(&dir)
            .map_err(StoreError::from)
            .and_then(|()| records::write(&self.store.tmp_dir(), &dir.join(UPLOAD_RECORD), &record));
        if let Err(err) = persisted {
            self.store.release_upload(bucket);
            if let Err(cleanup) = std::fs::remove_dir_all(&dir) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove upload directory {}: {}", dir.display(), cleanup);
                }
            }
            return Err(err);
        }

        let info = record.to_info();
        let upload = Upload {
            record,
            dir,
            state: Mutex::new(UploadState {
                phase: Phase::Initiated,
                parts: BTreeMap::new(),
            }),
        };
        self.write_uploads().insert(
            (bucket.to_string(), key.to_string(), info.upload_id.clone()),
            Arc::new(upload),
        );
        debug!("Initiated upload {} for {}/{}", info.upload_id, bucket, key);
        Ok(info)
    }

    /// Stream `body` in as part `part_number`, replacing any earlier upload
    /// of the same part number.
    pub async fn upload_part<R>(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: &mut R,
    ) -> Result<PartInfo, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        validate_part_number(part_number)?;
        let upload = self.lookup(bucket, key, upload_id)?;

        let mut writer = self.store.blob_writer()?;
        writer.copy_from(body).await?;
        let staged = writer.finish().await?;
        self.publish_part(&upload, part_number, staged).await
    }

    /// Fill part `part_number` from an existing object, or from the
    /// inclusive byte `range` of it.
    #[allow(clippy::too_many_arguments)]
    pub async fn upload_part_copy(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        src_bucket: &str,
        src_key: &str,
        range: Option<ByteRange>,
    ) -> Result<PartInfo, StoreError> {
        validate_part_number(part_number)?;
        let upload = self.lookup(bucket, key, upload_id)?;
        let (source, file) = self.store.open_blob(src_bucket, src_key)?;
        let mut file = tokio::fs::File::from_std(file);

        let mut writer = self.store.blob_writer()?;
        match range {
            Some(range) => {
                if range.start > range.end || range.end >= source.size {
                    return Err(StoreError::InvalidRange);
                }
                file.seek(SeekFrom::Start(range.start)).await?;
                writer.copy_from(&mut (&mut file).take(range.len())).await?;
            }
            None => {
                writer.copy_from(&mut file).await?;
            }
        }
        let staged = writer.finish().await?;
        self.publish_part(&upload, part_number, staged).await
    }

    async fn publish_part(
        &self,
        upload: &Upload,
        part_number: u32,
        staged: StagedBlob,
    ) -> Result<PartInfo, StoreError> {
        let mut state = upload.state.lock().await;
        if state.phase != Phase::Initiated {
            return Err(StoreError::InvalidUploadId {
                upload_id: upload.record.upload_id.clone(),
            });
        }

        let record = PartRecord {
            part_number,
            blob: format!("{part_number:05}-{}.part", uuid::Uuid::new_v4().simple()),
            size: staged.size,
            etag: staged.etag(),
            checksum_sha256: staged.checksum_sha256(),
            last_modified: Utc::now(),
        };
        let blob_path = upload.dir.join(&record.blob);
        staged.persist(&blob_path)?;
        if let Err(err) = records::write(
            &self.store.tmp_dir(),
            &upload.dir.join(part_record_name(part_number)),
            &record,
        ) {
            remove_file_logged(&blob_path).await;
            return Err(err);
        }
        let previous = state.parts.insert(part_number, record.clone());
        drop(state);

        if let Some(previous) = previous {
            remove_file_logged(&upload.dir.join(previous.blob)).await;
        }
        debug!(
            "Stored part {} of upload {} ({} bytes)",
            part_number, upload.record.upload_id, record.size
        );
        Ok(record.to_info())
    }

    /// Assemble the listed parts, in order, into `bucket/key`.
    ///
    /// Part numbers must be strictly ascending, every part must have been
    /// uploaded, and any ETag given must match the stored part. A failed
    /// validation leaves the upload untouched and in progress.
    pub async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<ObjectInfo, StoreError> {
        let upload = self.lookup(bucket, key, upload_id)?;
        let mut state = upload.state.lock().await;
        if state.phase != Phase::Initiated {
            return Err(StoreError::InvalidUploadId {
                upload_id: upload_id.to_string(),
            });
        }

        if parts.is_empty() {
            return Err(StoreError::InvalidArgument(
                "you must specify at least one part".to_string(),
            ));
        }
        if parts
            .windows(2)
            .any(|pair| pair[1].part_number <= pair[0].part_number)
        {
            return Err(StoreError::InvalidPartOrder);
        }
        let mut sources = Vec::with_capacity(parts.len());
        for part in parts {
            let stored = state
                .parts
                .get(&part.part_number)
                .ok_or_else(|| StoreError::InvalidPart {
                    part_number: part.part_number,
                    reason: "part has not been uploaded".to_string(),
                })?;
            if let Some(etag) = &part.etag {
                if strip_etag_quotes(etag) != stored.etag {
                    return Err(StoreError::InvalidPart {
                        part_number: part.part_number,
                        reason: format!("etag {etag} does not match"),
                    });
                }
            }
            sources.push(upload.dir.join(&stored.blob));
        }

        let mut writer = self.store.blob_writer()?;
        for path in &sources {
            let mut part = tokio::fs::File::open(path).await?;
            writer.copy_from(&mut part).await?;
        }
        let staged = writer.finish().await?;
        let info = self
            .store
            .commit_object(bucket, key, staged, upload.record.attributes.clone())
            .await?;

        state.phase = Phase::Completed;
        state.parts.clear();
        self.forget(&upload);
        self.discard_dir(&upload).await;
        drop(state);

        debug!(
            "Completed upload {} into {}/{} ({} parts, {} bytes)",
            upload_id,
            bucket,
            key,
            parts.len(),
            info.size
        );
        Ok(info)
    }

    /// Discard every part and end the upload. Aborting twice fails.
    pub async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        let upload = self.lookup(bucket, key, upload_id)?;
        let mut state = upload.state.lock().await;
        if state.phase != Phase::Initiated {
            return Err(StoreError::InvalidUploadId {
                upload_id: upload_id.to_string(),
            });
        }
        state.phase = Phase::Aborted;
        state.parts.clear();
        self.forget(&upload);
        self.discard_dir(&upload).await;
        drop(state);

        debug!("Aborted upload {} for {}/{}", upload_id, bucket, key);
        Ok(())
    }

    /// In-progress uploads of `bucket` ordered by (key, upload id), filtered
    /// by key prefix, resuming strictly after the marker pair. With only a
    /// key marker, uploads for keys after it are returned.
    pub fn list_multipart_uploads(
        &self,
        bucket: &str,
        prefix: &str,
        key_marker: &str,
        upload_id_marker: &str,
        limit: usize,
    ) -> Result<Vec<UploadInfo>, StoreError> {
        if !self.store.bucket_exists(bucket) {
            return Err(StoreError::NoSuchBucket {
                bucket: bucket.to_string(),
            });
        }
        let after_marker = |key: &str, upload_id: &str| {
            if key_marker.is_empty() {
                true
            } else if upload_id_marker.is_empty() {
                key > key_marker
            } else {
                (key, upload_id) > (key_marker, upload_id_marker)
            }
        };

        let start = (bucket.to_string(), String::new(), String::new());
        Ok(self
            .read_uploads()
            .range(start..)
            .take_while(|((b, _, _), _)| b == bucket)
            .filter(|((_, key, id), _)| key.starts_with(prefix) && after_marker(key, id))
            .take(limit)
            .map(|(_, upload)| upload.record.to_info())
            .collect())
    }

    /// Stored parts of one upload in part-number order, strictly after
    /// `part_number_marker`.
    pub async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number_marker: u32,
        limit: usize,
    ) -> Result<Vec<PartInfo>, StoreError> {
        let upload = self.lookup(bucket, key, upload_id)?;
        let state = upload.state.lock().await;
        if state.phase != Phase::Initiated {
            return Err(StoreError::InvalidUploadId {
                upload_id: upload_id.to_string(),
            });
        }
        Ok(state
            .parts
            .range((Bound::Excluded(part_number_marker), Bound::Unbounded))
            .take(limit)
            .map(|(_, part)| part.to_info())
            .collect())
    }
}

/// Load the part records of one upload directory, dropping records whose
/// blob is missing and blobs no record points at.
fn recover_parts(dir: &Path) -> Result<BTreeMap<u32, PartRecord>, StoreError> {
    let mut parts = BTreeMap::new();
    let mut referenced = HashSet::new();
    for path in records::list_json(dir)? {
        if path.file_name().is_some_and(|name| name == UPLOAD_RECORD) {
            continue;
        }
        let record: PartRecord = records::read(&path)?;
        if !dir.join(&record.blob).is_file() {
            warn!("Dropping part record {}: blob is missing", path.display());
            std::fs::remove_file(&path)?;
            continue;
        }
        referenced.insert(record.blob.clone());
        parts.insert(record.part_number, record);
    }
    for dir_entry in std::fs::read_dir(dir)? {
        let path = dir_entry?.path();
        let is_part_blob = path.extension().is_some_and(|ext| ext == "part");
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if is_part_blob && !referenced.contains(&name) {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(parts)
}

async fn remove_file_logged(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), err);
        }
    }
}
