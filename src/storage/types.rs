//! Value types returned by the object store and multipart manager.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pagination::Cursor;

/// Content type reported for objects stored without one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Content attributes and user metadata carried with an object or captured
/// when a multipart upload is initiated. Always replaced as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_disposition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    /// User metadata; keys are stored lowercased.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user_metadata: BTreeMap<String, String>,
}

impl ObjectAttributes {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata(mut self, name: &str, value: impl Into<String>) -> Self {
        self.user_metadata
            .insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Case-insensitive user metadata lookup.
    pub fn metadata(&self, name: &str) -> Option<&str> {
        self.user_metadata
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn content_type(&self) -> &str {
        self.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE)
    }

    /// Lowercase every user metadata key. Later duplicates win.
    pub(crate) fn normalized(mut self) -> Self {
        if self
            .user_metadata
            .keys()
            .any(|k| k.bytes().any(|b| b.is_ascii_uppercase()))
        {
            self.user_metadata = std::mem::take(&mut self.user_metadata)
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect();
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketInfo {
    pub name: String,
    pub created: DateTime<Utc>,
}

impl Cursor for BucketInfo {
    type Marker = String;
    fn marker(&self) -> String {
        self.name.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    /// Lowercase hex SHA-256 of the stored bytes, unquoted.
    pub etag: String,
    /// Base64 SHA-256 of the stored bytes.
    pub checksum_sha256: String,
    pub last_modified: DateTime<Utc>,
    pub attributes: ObjectAttributes,
}

/// One entry of an object listing, in key order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListEntry {
    Object(ObjectInfo),
    CommonPrefix(String),
}

impl ListEntry {
    pub fn key(&self) -> &str {
        match self {
            ListEntry::Object(info) => &info.key,
            ListEntry::CommonPrefix(prefix) => prefix,
        }
    }
}

impl Cursor for ListEntry {
    type Marker = String;
    fn marker(&self) -> String {
        self.key().to_string()
    }
}

/// Split listing entries into objects and common prefixes, each keeping
/// key order.
pub fn split_entries(entries: Vec<ListEntry>) -> (Vec<ObjectInfo>, Vec<String>) {
    let mut objects = Vec::new();
    let mut prefixes = Vec::new();
    for entry in entries {
        match entry {
            ListEntry::Object(info) => objects.push(info),
            ListEntry::CommonPrefix(prefix) => prefixes.push(prefix),
        }
    }
    (objects, prefixes)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadInfo {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub initiated: DateTime<Utc>,
    pub attributes: ObjectAttributes,
}

impl Cursor for UploadInfo {
    type Marker = (String, String);
    fn marker(&self) -> (String, String) {
        (self.key.clone(), self.upload_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartInfo {
    pub part_number: u32,
    pub size: u64,
    /// Lowercase hex SHA-256 of the part's bytes, unquoted.
    pub etag: String,
    pub checksum_sha256: String,
    pub last_modified: DateTime<Utc>,
}

impl Cursor for PartInfo {
    type Marker = u32;
    fn marker(&self) -> u32 {
        self.part_number
    }
}

/// A part as declared by the client in CompleteMultipartUpload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    /// Optional; quotes are ignored when comparing.
    pub etag: Option<String>,
}

/// An inclusive byte range already resolved against an object's size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// A `bytes=` range as sent by a client, before it is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// bytes=start-end
    StartEnd(u64, u64),
    /// bytes=start-
    StartOpen(u64),
    /// bytes=-N (last N bytes)
    Suffix(u64),
}

impl RangeSpec {
    /// Parse a single-range header value like "bytes=0-4", "bytes=5-",
    /// "bytes=-3". Multi-range requests are not supported.
    pub fn parse(value: &str) -> Option<RangeSpec> {
        let spec = value.trim().strip_prefix("bytes=")?;
        if spec.contains(',') {
            return None;
        }

        if let Some(suffix) = spec.strip_prefix('-') {
            let n: u64 = suffix.parse().ok()?;
            if n == 0 {
                return None;
            }
            Some(RangeSpec::Suffix(n))
        } else if let Some(start) = spec.strip_suffix('-') {
            Some(RangeSpec::StartOpen(start.parse().ok()?))
        } else {
            let (start, end) = spec.split_once('-')?;
            let start: u64 = start.parse().ok()?;
            let end: u64 = end.parse().ok()?;
            if start > end {
                return None;
            }
            Some(RangeSpec::StartEnd(start, end))
        }
    }

    /// Resolve against a total length. `None` if unsatisfiable.
    pub fn resolve(&self, total: u64) -> Option<ByteRange> {
        if total == 0 {
            return None;
        }
        let (start, end) = match *self {
            RangeSpec::StartEnd(start, end) => (start, end.min(total - 1)),
            RangeSpec::StartOpen(start) => (start, total - 1),
            RangeSpec::Suffix(n) => (total.saturating_sub(n), total - 1),
        };
        (start < total).then_some(ByteRange { start, end })
    }
}
