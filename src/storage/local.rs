//! Local filesystem object store.
//!
//! Layout under the root directory:
//!
//! ```text
//! .tmp/                                   staging area, emptied on open
//! buckets/<bucket>/bucket.json            bucket record
//! buckets/<bucket>/meta/<sha256(key)>.json object record
//! buckets/<bucket>/blobs/<uuid>           object content
//! uploads/                                owned by the multipart manager
//! ```
//!
//! An in-memory index of every bucket and object record is rebuilt from disk
//! by [`ObjectStore::open`] (crash-only: every startup is a recovery).
//!
//! Writes stream into `.tmp/`, get renamed into `blobs/`, and only become
//! visible when the object record is renamed into `meta/` and the index entry
//! is swapped, both under the index write lock. A superseded blob is unlinked
//! after the swap. Readers resolve the record and open the blob under the read
//! lock, so an open reader always streams one complete version
//! (snapshot-at-open).

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use super::blob::{BlobWriter, StagedBlob};
use super::types::{BucketInfo, ListEntry, ObjectAttributes, ObjectInfo};
use super::{validate_bucket_name, validate_key};
use crate::errors::StoreError;
use crate::metadata::records::{self, BucketRecord, ObjectRecord};

const TMP_DIR: &str = ".tmp";
const BUCKETS_DIR: &str = "buckets";
pub(crate) const UPLOADS_DIR: &str = "uploads";
const BUCKET_RECORD: &str = "bucket.json";
const META_DIR: &str = "meta";
const BLOBS_DIR: &str = "blobs";

struct BucketEntry {
    record: BucketRecord,
    objects: BTreeMap<String, ObjectRecord>,
    /// Multipart uploads in flight for this bucket.
    open_uploads: usize,
}

/// An object opened for reading.
#[derive(Debug)]
pub struct ObjectReader {
    pub info: ObjectInfo,
    /// The content as it was when the object was opened.
    pub body: tokio::fs::File,
}

/// Buckets and objects on the local filesystem.
pub struct ObjectStore {
    root: PathBuf,
    index: RwLock<BTreeMap<String, BucketEntry>>,
}

impl ObjectStore {
    /// Open (or create) a store rooted at `root`, recovering state left by
    /// a previous process.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(root.join(BUCKETS_DIR))?;
        std::fs::create_dir_all(root.join(UPLOADS_DIR))?;

        let tmp = root.join(TMP_DIR);
        if tmp.exists() {
            let stale = std::fs::read_dir(&tmp)?.count();
            if stale > 0 {
                info!("Removing {} stale temp entries from {}", stale, tmp.display());
            }
            std::fs::remove_dir_all(&tmp)?;
        }
        std::fs::create_dir_all(&tmp)?;

        let store = Self {
            root,
            index: RwLock::new(BTreeMap::new()),
        };
        let index = store.recover()?;
        let objects: usize = index.values().map(|b| b.objects.len()).sum();
        info!(
            "Object store opened at {}: {} buckets, {} objects",
            store.root.display(),
            index.len(),
            objects
        );
        *store.write_index() = index;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(BUCKETS_DIR).join(bucket)
    }

    fn meta_path(&self, bucket: &str, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.bucket_dir(bucket)
            .join(META_DIR)
            .join(format!("{digest}.json"))
    }

    fn blob_path(&self, bucket: &str, blob: &str) -> PathBuf {
        self.bucket_dir(bucket).join(BLOBS_DIR).join(blob)
    }

    fn read_index(&self) -> RwLockReadGuard<'_, BTreeMap<String, BucketEntry>> {
        self.index.read().expect("index lock poisoned")
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, BTreeMap<String, BucketEntry>> {
        self.index.write().expect("index lock poisoned")
    }

    // -- Recovery -------------------------------------------------------------

    fn recover(&self) -> Result<BTreeMap<String, BucketEntry>, StoreError> {
        let mut index = BTreeMap::new();
        for dir_entry in std::fs::read_dir(self.root.join(BUCKETS_DIR))? {
            let dir = dir_entry?.path();
            if !dir.is_dir() {
                continue;
            }
            let record_path = dir.join(BUCKET_RECORD);
            if !record_path.exists() {
                // A bucket whose creation never finished.
                warn!("Removing bucket directory without a record: {}", dir.display());
                std::fs::remove_dir_all(&dir)?;
                continue;
            }
            let record: BucketRecord = records::read(&record_path)?;
            let objects = self.recover_objects(&record.name)?;
            index.insert(
                record.name.clone(),
                BucketEntry {
                    record,
                    objects,
                    open_uploads: 0,
                },
            );
        }
        Ok(index)
    }

    fn recover_objects(&self, bucket: &str) -> Result<BTreeMap<String, ObjectRecord>, StoreError> {
        let bucket_dir = self.bucket_dir(bucket);
        let blobs_dir = bucket_dir.join(BLOBS_DIR);
        std::fs::create_dir_all(bucket_dir.join(META_DIR))?;
        std::fs::create_dir_all(&blobs_dir)?;

        let mut objects = BTreeMap::new();
        let mut referenced = HashSet::new();
        for path in records::list_json(&bucket_dir.join(META_DIR))? {
            let record: ObjectRecord = records::read(&path)?;
            if !blobs_dir.join(&record.blob).is_file() {
                warn!(
                    "Dropping record for {}/{}: blob {} is missing",
                    bucket, record.key, record.blob
                );
                std::fs::remove_file(&path)?;
                continue;
            }
            referenced.insert(record.blob.clone());
            objects.insert(record.key.clone(), record);
        }

        let mut orphans = 0usize;
        for dir_entry in std::fs::read_dir(&blobs_dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            if !referenced.contains(name.to_string_lossy().as_ref()) {
                std::fs::remove_file(dir_entry.path())?;
                orphans += 1;
            }
        }
        if orphans > 0 {
            info!("Removed {} orphaned blobs from bucket {}", orphans, bucket);
        }
        Ok(objects)
    }

    // -- Buckets --------------------------------------------------------------

    pub fn create_bucket(&self, name: &str) -> Result<BucketInfo, StoreError> {
        validate_bucket_name(name)?;
        let mut index = self.write_index();
        if index.contains_key(name) {
            return Err(StoreError::BucketAlreadyExists {
                bucket: name.to_string(),
            });
        }

        let dir = self.bucket_dir(name);
        std::fs::create_dir_all(dir.join(META_DIR))?;
        std::fs::create_dir_all(dir.join(BLOBS_DIR))?;
        let record = BucketRecord {
            name: name.to_string(),
            created: Utc::now(),
        };
        records::write(&self.tmp_dir(), &dir.join(BUCKET_RECORD), &record)?;

        let info = record.to_info();
        index.insert(
            name.to_string(),
            BucketEntry {
                record,
                objects: BTreeMap::new(),
                open_uploads: 0,
            },
        );
        debug!("Created bucket {}", name);
        Ok(info)
    }

    /// Delete an empty bucket. Buckets holding objects or in-flight
    /// multipart uploads are rejected with `BucketNotEmpty`.
    pub fn delete_bucket(&self, name: &str) -> Result<(), StoreError> {
        let trash = self
            .tmp_dir()
            .join(format!("trash-{}", uuid::Uuid::new_v4().simple()));
        {
            let mut index = self.write_index();
            let entry = index.get(name).ok_or_else(|| StoreError::NoSuchBucket {
                bucket: name.to_string(),
            })?;
            if !entry.objects.is_empty() || entry.open_uploads > 0 {
                return Err(StoreError::BucketNotEmpty {
                    bucket: name.to_string(),
                });
            }
            std::fs::rename(self.bucket_dir(name), &trash)?;
            index.remove(name);
        }
        if let Err(err) = std::fs::remove_dir_all(&trash) {
            warn!("Failed to remove deleted bucket directory {}: {}", trash.display(), err);
        }
        debug!("Deleted bucket {}", name);
        Ok(())
    }

    pub fn bucket_exists(&self, name: &str) -> bool {
        self.read_index().contains_key(name)
    }

    pub fn head_bucket(&self, name: &str) -> Result<BucketInfo, StoreError> {
        self.read_index()
            .get(name)
            .map(|entry| entry.record.to_info())
            .ok_or_else(|| StoreError::NoSuchBucket {
                bucket: name.to_string(),
            })
    }

    /// Buckets in name order whose name starts with `prefix`, strictly after
    /// `after` (empty = from the start), at most `limit` of them.
    pub fn list_buckets(&self, prefix: &str, after: &str, limit: usize) -> Vec<BucketInfo> {
        let index = self.read_index();
        let start = if after.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(after)
        };
        index
            .range::<str, _>((start, Bound::Unbounded))
            .filter(|(name, _)| name.starts_with(prefix))
            .take(limit)
            .map(|(_, entry)| entry.record.to_info())
            .collect()
    }

    /// Count an in-flight multipart upload against `bucket`.
    pub(crate) fn retain_upload(&self, bucket: &str) -> Result<(), StoreError> {
        let mut index = self.write_index();
        let entry = index
            .get_mut(bucket)
            .ok_or_else(|| StoreError::NoSuchBucket {
                bucket: bucket.to_string(),
            })?;
        entry.open_uploads += 1;
        Ok(())
    }

    pub(crate) fn release_upload(&self, bucket: &str) {
        if let Some(entry) = self.write_index().get_mut(bucket) {
            entry.open_uploads = entry.open_uploads.saturating_sub(1);
        }
    }

    fn require_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        if self.bucket_exists(bucket) {
            Ok(())
        } else {
            Err(StoreError::NoSuchBucket {
                bucket: bucket.to_string(),
            })
        }
    }

    // -- Objects --------------------------------------------------------------

    /// Stream `body` into a new version of `bucket/key`.
    ///
    /// When `expected_sha256` is given and the body hashes differently the
    /// write fails with `ChecksumMismatch` and the current object, if any, is
    /// left untouched.
    pub async fn put_object<R>(
        &self,
        bucket: &str,
        key: &str,
        body: &mut R,
        attributes: ObjectAttributes,
        expected_sha256: Option<[u8; 32]>,
    ) -> Result<ObjectInfo, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        validate_key(key)?;
        self.require_bucket(bucket)?;

        let mut writer = self.blob_writer()?;
        writer.copy_from(body).await?;
        let staged = writer.finish().await?;
        if let Some(expected) = expected_sha256 {
            staged.verify_sha256(&expected)?;
        }
        self.commit_object(bucket, key, staged, attributes).await
    }

    pub(crate) fn blob_writer(&self) -> Result<BlobWriter, StoreError> {
        BlobWriter::create(&self.tmp_dir())
    }

    /// Publish a staged blob as the current content of `bucket/key`.
    pub(crate) async fn commit_object(
        &self,
        bucket: &str,
        key: &str,
        staged: StagedBlob,
        attributes: ObjectAttributes,
    ) -> Result<ObjectInfo, StoreError> {
        let record = ObjectRecord {
            key: key.to_string(),
            blob: uuid::Uuid::new_v4().simple().to_string(),
            size: staged.size,
            etag: staged.etag(),
            checksum_sha256: staged.checksum_sha256(),
            last_modified: Utc::now(),
            attributes: attributes.normalized(),
        };
        let blob_path = self.blob_path(bucket, &record.blob);
        if let Err(err) = staged.persist(&blob_path) {
            self.require_bucket(bucket)?;
            return Err(err.into());
        }
        let staged_record = match records::stage(&self.tmp_dir(), &record) {
            Ok(staged_record) => staged_record,
            Err(err) => {
                remove_blob(&blob_path).await;
                return Err(err);
            }
        };

        let published = {
            let mut index = self.write_index();
            match index.get_mut(bucket) {
                None => Err(StoreError::NoSuchBucket {
                    bucket: bucket.to_string(),
                }),
                Some(entry) => staged_record
                    .publish(&self.meta_path(bucket, key))
                    .map(|()| entry.objects.insert(key.to_string(), record.clone())),
            }
        };
        let previous = match published {
            Ok(previous) => previous,
            Err(err) => {
                remove_blob(&blob_path).await;
                return Err(err);
            }
        };
        if let Some(previous) = previous {
            remove_blob(&self.blob_path(bucket, &previous.blob)).await;
        }

        debug!(
            "Stored {}/{} ({} bytes, etag {})",
            bucket, key, record.size, record.etag
        );
        Ok(record.to_info(bucket))
    }

    /// Resolve `bucket/key` and open its blob, both under the read lock.
    pub(crate) fn open_blob(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<(ObjectRecord, std::fs::File), StoreError> {
        let index = self.read_index();
        let entry = index.get(bucket).ok_or_else(|| StoreError::NoSuchBucket {
            bucket: bucket.to_string(),
        })?;
        let record = entry.objects.get(key).ok_or_else(|| StoreError::NoSuchKey {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })?;
        let file = std::fs::File::open(self.blob_path(bucket, &record.blob))?;
        Ok((record.clone(), file))
    }

    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectReader, StoreError> {
        let (record, file) = self.open_blob(bucket, key)?;
        Ok(ObjectReader {
            info: record.to_info(bucket),
            body: tokio::fs::File::from_std(file),
        })
    }

    pub fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StoreError> {
        let index = self.read_index();
        let entry = index.get(bucket).ok_or_else(|| StoreError::NoSuchBucket {
            bucket: bucket.to_string(),
        })?;
        entry
            .objects
            .get(key)
            .map(|record| record.to_info(bucket))
            .ok_or_else(|| StoreError::NoSuchKey {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    /// Delete `bucket/key`. Deleting a key that does not exist succeeds.
    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let removed = {
            let mut index = self.write_index();
            let entry = index
                .get_mut(bucket)
                .ok_or_else(|| StoreError::NoSuchBucket {
                    bucket: bucket.to_string(),
                })?;
            if !entry.objects.contains_key(key) {
                return Ok(());
            }
            std::fs::remove_file(self.meta_path(bucket, key))?;
            entry.objects.remove(key)
        };
        if let Some(record) = removed {
            remove_blob(&self.blob_path(bucket, &record.blob)).await;
            debug!("Deleted {}/{}", bucket, key);
        }
        Ok(())
    }

    /// Copy `src_bucket/src_key` to `dst_bucket/dst_key`. Without an
    /// override the source's attributes and metadata are copied verbatim;
    /// with one they are replaced wholesale. Copying a key onto itself
    /// rewrites it (a metadata refresh).
    pub async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        attributes_override: Option<ObjectAttributes>,
    ) -> Result<ObjectInfo, StoreError> {
        validate_key(dst_key)?;
        let (source, file) = self.open_blob(src_bucket, src_key)?;
        self.require_bucket(dst_bucket)?;

        let mut body = tokio::fs::File::from_std(file);
        let mut writer = self.blob_writer()?;
        writer.copy_from(&mut body).await?;
        let staged = writer.finish().await?;

        let attributes = attributes_override.unwrap_or(source.attributes);
        self.commit_object(dst_bucket, dst_key, staged, attributes)
            .await
    }

    /// Move `src_key` to `dst_key` within one bucket. The destination is
    /// replaced if it exists; the content blob is reused, not copied.
    pub async fn rename_object(
        &self,
        bucket: &str,
        src_key: &str,
        dst_key: &str,
    ) -> Result<ObjectInfo, StoreError> {
        validate_key(dst_key)?;
        loop {
            let source = {
                let index = self.read_index();
                let entry = index.get(bucket).ok_or_else(|| StoreError::NoSuchBucket {
                    bucket: bucket.to_string(),
                })?;
                entry
                    .objects
                    .get(src_key)
                    .cloned()
                    .ok_or_else(|| StoreError::NoSuchKey {
                        bucket: bucket.to_string(),
                        key: src_key.to_string(),
                    })?
            };
            if src_key == dst_key {
                return Ok(source.to_info(bucket));
            }

            let renamed = ObjectRecord {
                key: dst_key.to_string(),
                last_modified: Utc::now(),
                ..source.clone()
            };
            let staged = records::stage(&self.tmp_dir(), &renamed)?;

            let replaced = {
                let mut index = self.write_index();
                let entry = index
                    .get_mut(bucket)
                    .ok_or_else(|| StoreError::NoSuchBucket {
                        bucket: bucket.to_string(),
                    })?;
                // The source changed while the record was being staged.
                if entry.objects.get(src_key).map(|r| &r.blob) != Some(&source.blob) {
                    continue;
                }
                staged.publish(&self.meta_path(bucket, dst_key))?;
                std::fs::remove_file(self.meta_path(bucket, src_key))?;
                entry.objects.remove(src_key);
                entry.objects.insert(dst_key.to_string(), renamed.clone())
            };
            if let Some(replaced) = replaced {
                remove_blob(&self.blob_path(bucket, &replaced.blob)).await;
            }
            debug!("Renamed {}/{} -> {}", bucket, src_key, dst_key);
            return Ok(renamed.to_info(bucket));
        }
    }

    /// List up to `limit` entries of `bucket` in key order, starting strictly
    /// after `marker`.
    ///
    /// Keys outside `prefix` are skipped. With a non-empty `delimiter`, keys
    /// containing it after the prefix collapse into one
    /// [`ListEntry::CommonPrefix`] (prefix through the first delimiter),
    /// positioned where that prefix sorts. A common prefix equal to `marker`
    /// was already returned and is skipped; a marker inside a group still
    /// yields the group when keys follow it.
    pub fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: &str,
        marker: &str,
        limit: usize,
    ) -> Result<Vec<ListEntry>, StoreError> {
        let index = self.read_index();
        let entry = index.get(bucket).ok_or_else(|| StoreError::NoSuchBucket {
            bucket: bucket.to_string(),
        })?;

        let start = if !marker.is_empty() && marker >= prefix {
            Bound::Excluded(marker)
        } else if !prefix.is_empty() {
            Bound::Included(prefix)
        } else {
            Bound::Unbounded
        };

        let mut entries: Vec<ListEntry> = Vec::new();
        if limit == 0 {
            return Ok(entries);
        }
        for (key, record) in entry.objects.range::<str, _>((start, Bound::Unbounded)) {
            // Keys sharing a prefix are contiguous, so the first miss ends it.
            if !key.starts_with(prefix) {
                break;
            }
            if !delimiter.is_empty() {
                if let Some(pos) = key[prefix.len()..].find(delimiter) {
                    let common = &key[..prefix.len() + pos + delimiter.len()];
                    let seen = matches!(entries.last(), Some(ListEntry::CommonPrefix(p)) if p == common);
                    if seen || common == marker {
                        continue;
                    }
                    entries.push(ListEntry::CommonPrefix(common.to_string()));
                    if entries.len() >= limit {
                        break;
                    }
                    continue;
                }
            }
            entries.push(ListEntry::Object(record.to_info(bucket)));
            if entries.len() >= limit {
                break;
            }
        }
        Ok(entries)
    }
}

/// Best-effort unlink of a superseded or abandoned blob.
async fn remove_blob(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove blob {}: {}", path.display(), err);
        }
    }
}
