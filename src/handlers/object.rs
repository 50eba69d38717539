//! Object-level S3 API handlers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::{
    body_reader, expected_sha256, head_error, header_str, insert_object_headers,
    object_attributes, parse_source, query_str, xml_response, COPY_SOURCE, METADATA_DIRECTIVE,
    RENAME_SOURCE,
};
use crate::errors::{S3Error, StoreError};
use crate::metrics::{record_bytes_received, record_bytes_sent};
use crate::pagination::{fetch_page, parse_limit, Page};
use crate::storage::types::{split_entries, ListEntry, RangeSpec};
use crate::xml::{self, DeleteError, ListObjectsMarkers, ListObjectsResult};
use crate::AppState;

/// Default and maximum `max-keys`.
const MAX_KEYS: usize = 1000;

// -- Writes -------------------------------------------------------------------

/// `PUT /{bucket}/{key}` -- Upload an object, streaming the body to disk.
pub async fn put_object(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, S3Error> {
    let attributes = object_attributes(headers);
    let expected = expected_sha256(headers)?;
    let mut reader = body_reader(headers, body);

    let info = state
        .store
        .put_object(bucket, key, &mut reader, attributes, expected)
        .await?;
    record_bytes_received(info.size);

    let mut response = StatusCode::OK.into_response();
    let hdrs = response.headers_mut();
    if let Ok(etag) = HeaderValue::from_str(&xml::quote_etag(&info.etag)) {
        hdrs.insert("etag", etag);
    }
    if let Ok(checksum) = HeaderValue::from_str(&info.checksum_sha256) {
        hdrs.insert("x-amz-checksum-sha256", checksum);
    }
    Ok(response)
}

/// `PUT /{bucket}/{key}` with `x-amz-copy-source` -- Copy an object.
///
/// Attributes are copied from the source unless
/// `x-amz-metadata-directive: REPLACE` is given, in which case they come
/// from this request's headers.
pub async fn copy_object(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    let (src_bucket, src_key) = parse_source(header_str(headers, COPY_SOURCE).unwrap_or(""))?;
    let attributes = match header_str(headers, METADATA_DIRECTIVE).unwrap_or("COPY") {
        d if d.eq_ignore_ascii_case("COPY") => None,
        d if d.eq_ignore_ascii_case("REPLACE") => Some(object_attributes(headers)),
        other => {
            return Err(S3Error::InvalidArgument {
                message: format!("Unknown metadata directive: {other}"),
            })
        }
    };

    let info = state
        .store
        .copy_object(&src_bucket, &src_key, bucket, key, attributes)
        .await?;
    Ok(xml_response(xml::render_copy_object_result(&info)))
}

/// `PUT /{bucket}/{key}` with `x-amz-rename-source` -- Rename an object
/// within one bucket.
pub async fn rename_object(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    let (src_bucket, src_key) = parse_source(header_str(headers, RENAME_SOURCE).unwrap_or(""))?;
    if src_bucket != bucket {
        return Err(StoreError::CrossBucketRename {
            src_bucket,
            dst_bucket: bucket.to_string(),
        }
        .into());
    }

    let info = state.store.rename_object(bucket, &src_key, key).await?;
    let mut response = StatusCode::OK.into_response();
    if let Ok(etag) = HeaderValue::from_str(&xml::quote_etag(&info.etag)) {
        response.headers_mut().insert("etag", etag);
    }
    Ok(response)
}

/// `DELETE /{bucket}/{key}` -- Delete an object. Absent keys succeed.
pub async fn delete_object(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
) -> Result<Response, S3Error> {
    state.store.delete_object(bucket, key).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `POST /{bucket}?delete` -- Delete many objects. Each key is reported on
/// its own; a key that did not exist counts as deleted.
pub async fn delete_objects(
    state: Arc<AppState>,
    bucket: &str,
    body: &[u8],
) -> Result<Response, S3Error> {
    state.store.head_bucket(bucket)?;
    let (keys, quiet) = xml::parse_delete_request(body)?;

    let mut deleted = Vec::new();
    let mut errors = Vec::new();
    for key in keys {
        match state.store.delete_object(bucket, &key).await {
            Ok(()) => deleted.push(key),
            Err(err) => {
                let s3 = S3Error::from(err);
                errors.push(DeleteError {
                    key,
                    code: s3.code(),
                    message: s3.to_string(),
                });
            }
        }
    }
    debug!(
        "Batch delete in {}: {} deleted, {} failed",
        bucket,
        deleted.len(),
        errors.len()
    );
    Ok(xml_response(xml::render_delete_result(&deleted, &errors, quiet)))
}

// -- Reads --------------------------------------------------------------------

/// `GET /{bucket}/{key}` -- Stream an object, honoring a single
/// `Range: bytes=` header.
pub async fn get_object(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    let mut object = state.store.get_object(bucket, key).await?;
    let total = object.info.size;

    // A malformed Range header is ignored and the whole object is returned.
    let range = header_str(headers, "range").and_then(RangeSpec::parse);
    let (status, length, content_range, body) = match range {
        Some(spec) => {
            let range = spec.resolve(total).ok_or(S3Error::InvalidRange)?;
            object
                .body
                .seek(std::io::SeekFrom::Start(range.start))
                .await
                .map_err(StoreError::from)?;
            let limited = object.body.take(range.len());
            (
                StatusCode::PARTIAL_CONTENT,
                range.len(),
                Some(format!("bytes {}-{}/{}", range.start, range.end, total)),
                Body::from_stream(ReaderStream::new(limited)),
            )
        }
        None => (
            StatusCode::OK,
            total,
            None,
            Body::from_stream(ReaderStream::new(object.body)),
        ),
    };
    record_bytes_sent(length);

    let mut response = (status, body).into_response();
    let hdrs = response.headers_mut();
    insert_object_headers(hdrs, &object.info);
    hdrs.insert(CONTENT_LENGTH, HeaderValue::from(length));
    hdrs.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(value) = content_range.and_then(|cr| HeaderValue::from_str(&cr).ok()) {
        hdrs.insert(CONTENT_RANGE, value);
    }
    Ok(response)
}

/// `HEAD /{bucket}/{key}` -- Object headers without the body.
pub async fn head_object(state: Arc<AppState>, bucket: &str, key: &str) -> Response {
    match state.store.head_object(bucket, key) {
        Ok(info) => {
            let mut response = StatusCode::OK.into_response();
            let hdrs = response.headers_mut();
            insert_object_headers(hdrs, &info);
            hdrs.insert(CONTENT_LENGTH, HeaderValue::from(info.size));
            hdrs.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
            response
        }
        Err(err) => head_error(err.into()),
    }
}

// -- Listing ------------------------------------------------------------------

/// `GET /{bucket}` -- ListObjects (v1), resuming after `marker`.
pub async fn list_objects_v1(
    state: Arc<AppState>,
    bucket: &str,
    query: &HashMap<String, String>,
) -> Result<Response, S3Error> {
    let prefix = query_str(query, "prefix");
    let delimiter = query_str(query, "delimiter");
    let marker = query_str(query, "marker");
    let max_keys = parse_limit(query.get("max-keys").map(String::as_str), MAX_KEYS, MAX_KEYS);

    let page = list_page(&state, bucket, prefix, delimiter, marker, max_keys)?;
    let is_truncated = page.is_truncated();
    let (objects, common_prefixes) = split_entries(page.items);
    let xml = xml::render_list_objects_result(&ListObjectsResult {
        bucket,
        prefix,
        delimiter,
        max_keys,
        is_truncated,
        objects: &objects,
        common_prefixes: &common_prefixes,
        markers: ListObjectsMarkers::V1 {
            marker,
            next_marker: page.next_marker.as_deref(),
        },
    });
    Ok(xml_response(xml))
}

/// `GET /{bucket}?list-type=2` -- ListObjectsV2. A continuation token takes
/// precedence over `start-after`.
pub async fn list_objects_v2(
    state: Arc<AppState>,
    bucket: &str,
    query: &HashMap<String, String>,
) -> Result<Response, S3Error> {
    let prefix = query_str(query, "prefix");
    let delimiter = query_str(query, "delimiter");
    let start_after = query_str(query, "start-after");
    let continuation_token = query.get("continuation-token").map(String::as_str);
    let max_keys = parse_limit(query.get("max-keys").map(String::as_str), MAX_KEYS, MAX_KEYS);
    let marker = continuation_token.unwrap_or(start_after);

    let page = list_page(&state, bucket, prefix, delimiter, marker, max_keys)?;
    let is_truncated = page.is_truncated();
    let (objects, common_prefixes) = split_entries(page.items);
    let xml = xml::render_list_objects_result(&ListObjectsResult {
        bucket,
        prefix,
        delimiter,
        max_keys,
        is_truncated,
        objects: &objects,
        common_prefixes: &common_prefixes,
        markers: ListObjectsMarkers::V2 {
            start_after,
            continuation_token,
            next_continuation_token: page.next_marker.as_deref(),
        },
    });
    Ok(xml_response(xml))
}

fn list_page(
    state: &AppState,
    bucket: &str,
    prefix: &str,
    delimiter: &str,
    marker: &str,
    max_keys: usize,
) -> Result<Page<ListEntry>, S3Error> {
    // With max-keys=0 nothing is fetched, but a missing bucket is still 404.
    state.store.head_bucket(bucket)?;
    Ok(fetch_page(max_keys, |n| {
        state.store.list_objects(bucket, prefix, delimiter, marker, n)
    })?)
}
