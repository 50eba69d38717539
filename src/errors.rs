//! Error types.
//!
//! [`StoreError`] is what the storage engine returns; callers branch on
//! [`StoreError::kind`] rather than on individual variants. [`S3Error`] is
//! the wire-level S3 error. It implements [`axum::response::IntoResponse`],
//! so handlers can simply return `Err(S3Error::NoSuchBucket { .. })` or
//! propagate a `StoreError` with `?`.

use std::io;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::chunked::ChunkError;
use crate::xml::render_error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

// -- Storage engine errors ----------------------------------------------------

/// Which resource a `NotFound` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Bucket,
    Object,
    Upload,
}

/// Closed classification of every [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound(Resource),
    AlreadyExists,
    InvalidArgument,
    ChecksumMismatch,
    ChunkTooLarge,
    Internal,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bucket not found: {bucket}")]
    NoSuchBucket { bucket: String },

    #[error("object not found: {bucket}/{key}")]
    NoSuchKey { bucket: String, key: String },

    #[error("invalid upload id: {upload_id}")]
    InvalidUploadId { upload_id: String },

    #[error("bucket already exists: {bucket}")]
    BucketAlreadyExists { bucket: String },

    #[error("bucket not empty: {bucket}")]
    BucketNotEmpty { bucket: String },

    #[error("invalid bucket name: {name:?}")]
    InvalidBucketName { name: String },

    #[error("invalid object key: {reason}")]
    InvalidKey { reason: &'static str },

    #[error("object key exceeds {max} bytes", max = crate::storage::MAX_KEY_LEN)]
    KeyTooLong,

    #[error("part number {part_number} is outside 1..={max}", max = crate::storage::MAX_PART_NUMBER)]
    InvalidPartNumber { part_number: u32 },

    #[error("parts are not in strictly ascending order")]
    InvalidPartOrder,

    #[error("part {part_number}: {reason}")]
    InvalidPart { part_number: u32, reason: String },

    #[error("requested range is not satisfiable")]
    InvalidRange,

    #[error("rename across buckets is not supported ({src_bucket} -> {dst_bucket})")]
    CrossBucketRename {
        src_bucket: String,
        dst_bucket: String,
    },

    #[error("{0}")]
    InvalidArgument(String),

    #[error("invalid chunk format")]
    InvalidChunkFormat,

    #[error("chunk size {size} exceeds maximum")]
    ChunkTooLarge { size: u64 },

    #[error("sha256 mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },

    #[error("corrupt record {path}: {source}")]
    CorruptRecord {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("storage i/o error: {0}")]
    Io(#[source] io::Error),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NoSuchBucket { .. } => ErrorKind::NotFound(Resource::Bucket),
            StoreError::NoSuchKey { .. } => ErrorKind::NotFound(Resource::Object),
            StoreError::InvalidUploadId { .. } => ErrorKind::NotFound(Resource::Upload),
            StoreError::BucketAlreadyExists { .. } => ErrorKind::AlreadyExists,
            StoreError::BucketNotEmpty { .. }
            | StoreError::InvalidBucketName { .. }
            | StoreError::InvalidKey { .. }
            | StoreError::KeyTooLong
            | StoreError::InvalidPartNumber { .. }
            | StoreError::InvalidPartOrder
            | StoreError::InvalidPart { .. }
            | StoreError::InvalidRange
            | StoreError::CrossBucketRename { .. }
            | StoreError::InvalidArgument(_)
            | StoreError::InvalidChunkFormat => ErrorKind::InvalidArgument,
            StoreError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            StoreError::ChunkTooLarge { .. } => ErrorKind::ChunkTooLarge,
            StoreError::CorruptRecord { .. } | StoreError::Io(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound(_))
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        match ChunkError::from_io(&err) {
            Some(ChunkError::InvalidChunkFormat) => StoreError::InvalidChunkFormat,
            Some(ChunkError::ChunkTooLarge { size }) => StoreError::ChunkTooLarge { size },
            None => StoreError::Io(err),
        }
    }
}

impl From<ChunkError> for StoreError {
    fn from(err: ChunkError) -> Self {
        io::Error::from(err).into()
    }
}

// -- S3 wire errors -----------------------------------------------------------

/// S3 error codes expressed as a Rust enum.
#[derive(Debug, Error)]
pub enum S3Error {
    /// The specified bucket does not exist.
    #[error("The specified bucket does not exist")]
    NoSuchBucket { bucket: String },

    /// The specified key does not exist.
    #[error("The resource you requested does not exist")]
    NoSuchKey { key: String },

    /// The specified multipart upload does not exist.
    #[error("The specified upload does not exist. The upload ID may be invalid, or the upload may have been aborted or completed.")]
    NoSuchUpload { upload_id: String },

    /// A bucket with the requested name already exists.
    #[error("The requested bucket name is not available. The bucket namespace is shared by all users of the system. Please select a different name and try again.")]
    BucketAlreadyExists { bucket: String },

    /// The bucket you tried to delete is not empty.
    #[error("The bucket you tried to delete is not empty")]
    BucketNotEmpty { bucket: String },

    /// A request argument is invalid.
    #[error("{message}")]
    InvalidArgument { message: String },

    /// A query parameter the operation needs was not sent.
    #[error("The request was missing a required parameter: {name}")]
    MissingParameter { name: String },

    /// An invalid bucket name was provided.
    #[error("The specified bucket is not valid.")]
    InvalidBucketName { name: String },

    /// The body's SHA-256 does not match the one the client declared.
    #[error("The Content-SHA256 you specified did not match what we received.")]
    BadDigest,

    /// A streamed chunk declared a size above the accepted maximum.
    #[error("Your proposed upload exceeds the maximum allowed object size.")]
    EntityTooLarge,

    /// The streamed body framing could not be decoded.
    #[error("You did not provide the number of bytes specified by the Content-Length HTTP header.")]
    IncompleteBody,

    /// The object key is too long (> 1024 bytes).
    #[error("Your key is too long")]
    KeyTooLongError,

    /// Invalid part in multipart upload.
    #[error("{message}")]
    InvalidPart { message: String },

    /// Invalid part order in CompleteMultipartUpload.
    #[error("The list of parts was not in ascending order. Parts must be ordered by part number.")]
    InvalidPartOrder,

    /// Malformed XML in request body.
    #[error("The XML you provided was not well-formed or did not validate against our published schema.")]
    MalformedXML,

    /// Feature not implemented.
    #[error("A header you provided implies functionality that is not implemented")]
    NotImplemented,

    /// Invalid range request.
    #[error("The requested range is not satisfiable")]
    InvalidRange,

    /// Catch-all for unexpected internal errors.
    #[error("We encountered an internal error, please try again.")]
    InternalError(#[from] anyhow::Error),
}

impl S3Error {
    /// Return the S3 XML error code string.
    pub fn code(&self) -> &'static str {
        match self {
            S3Error::NoSuchBucket { .. } => "NoSuchBucket",
            S3Error::NoSuchKey { .. } => "NoSuchKey",
            S3Error::NoSuchUpload { .. } => "NoSuchUpload",
            S3Error::BucketAlreadyExists { .. } => "BucketAlreadyExists",
            S3Error::BucketNotEmpty { .. } => "BucketNotEmpty",
            S3Error::InvalidArgument { .. } => "InvalidArgument",
            S3Error::MissingParameter { .. } => "MissingParameter",
            S3Error::InvalidBucketName { .. } => "InvalidBucketName",
            S3Error::BadDigest => "BadDigest",
            S3Error::EntityTooLarge => "EntityTooLarge",
            S3Error::IncompleteBody => "IncompleteBody",
            S3Error::KeyTooLongError => "KeyTooLongError",
            S3Error::InvalidPart { .. } => "InvalidPart",
            S3Error::InvalidPartOrder => "InvalidPartOrder",
            S3Error::MalformedXML => "MalformedXML",
            S3Error::NotImplemented => "NotImplemented",
            S3Error::InvalidRange => "InvalidRange",
            S3Error::InternalError(_) => "InternalError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            S3Error::NoSuchBucket { .. } => StatusCode::NOT_FOUND,
            S3Error::NoSuchKey { .. } => StatusCode::NOT_FOUND,
            S3Error::NoSuchUpload { .. } => StatusCode::NOT_FOUND,
            S3Error::BucketAlreadyExists { .. } => StatusCode::CONFLICT,
            S3Error::BucketNotEmpty { .. } => StatusCode::CONFLICT,
            S3Error::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            S3Error::MissingParameter { .. } => StatusCode::BAD_REQUEST,
            S3Error::InvalidBucketName { .. } => StatusCode::BAD_REQUEST,
            S3Error::BadDigest => StatusCode::BAD_REQUEST,
            S3Error::EntityTooLarge => StatusCode::BAD_REQUEST,
            S3Error::IncompleteBody => StatusCode::BAD_REQUEST,
            S3Error::KeyTooLongError => StatusCode::BAD_REQUEST,
            S3Error::InvalidPart { .. } => StatusCode::BAD_REQUEST,
            S3Error::InvalidPartOrder => StatusCode::BAD_REQUEST,
            S3Error::MalformedXML => StatusCode::BAD_REQUEST,
            S3Error::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            S3Error::InvalidRange => StatusCode::RANGE_NOT_SATISFIABLE,
            S3Error::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The resource string reported in the XML `<Resource>` element.
    fn resource(&self) -> &str {
        match self {
            S3Error::NoSuchBucket { bucket }
            | S3Error::BucketAlreadyExists { bucket }
            | S3Error::BucketNotEmpty { bucket } => bucket,
            S3Error::NoSuchKey { key } => key,
            S3Error::NoSuchUpload { upload_id } => upload_id,
            S3Error::InvalidBucketName { name } => name,
            _ => "",
        }
    }
}

impl From<StoreError> for S3Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NoSuchBucket { bucket } => S3Error::NoSuchBucket { bucket },
            StoreError::NoSuchKey { key, .. } => S3Error::NoSuchKey { key },
            StoreError::InvalidUploadId { upload_id } => S3Error::NoSuchUpload { upload_id },
            StoreError::BucketAlreadyExists { bucket } => S3Error::BucketAlreadyExists { bucket },
            StoreError::BucketNotEmpty { bucket } => S3Error::BucketNotEmpty { bucket },
            StoreError::InvalidBucketName { name } => S3Error::InvalidBucketName { name },
            StoreError::KeyTooLong => S3Error::KeyTooLongError,
            StoreError::InvalidPartOrder => S3Error::InvalidPartOrder,
            err @ StoreError::InvalidPart { .. } => S3Error::InvalidPart {
                message: err.to_string(),
            },
            StoreError::InvalidRange => S3Error::InvalidRange,
            StoreError::ChecksumMismatch { .. } => S3Error::BadDigest,
            StoreError::ChunkTooLarge { .. } => S3Error::EntityTooLarge,
            StoreError::InvalidChunkFormat => S3Error::IncompleteBody,
            err @ (StoreError::InvalidKey { .. }
            | StoreError::InvalidPartNumber { .. }
            | StoreError::CrossBucketRename { .. }
            | StoreError::InvalidArgument(_)) => S3Error::InvalidArgument {
                message: err.to_string(),
            },
            err @ (StoreError::CorruptRecord { .. } | StoreError::Io(_)) => {
                tracing::error!("storage failure: {err}");
                S3Error::InternalError(anyhow::Error::new(err))
            }
        }
    }
}

impl IntoResponse for S3Error {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());

        let body = render_error(self.code(), &self.to_string(), self.resource(), &request_id);

        (
            status,
            [
                ("content-type", "application/xml".to_string()),
                ("x-amz-request-id", request_id),
                ("date", date),
                ("server", "CubbyStore".to_string()),
            ],
            body,
        )
            .into_response()
    }
}
