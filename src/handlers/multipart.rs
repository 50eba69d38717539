//! Multipart upload S3 API handlers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use super::{
    body_reader, header_str, object_attributes, parse_source, query_str, required_query,
    xml_response, COPY_SOURCE, COPY_SOURCE_RANGE,
};
use crate::errors::S3Error;
use crate::metrics::record_bytes_received;
use crate::pagination::{fetch_page, parse_limit, Page};
use crate::storage::types::{ByteRange, RangeSpec};
use crate::xml::{self, ListPartsResult, ListUploadsResult};
use crate::AppState;

/// Default and maximum `max-uploads` / `max-parts`.
const MAX_UPLOADS: usize = 1000;
const MAX_PARTS: usize = 1000;

fn part_number(query: &HashMap<String, String>) -> Result<u32, S3Error> {
    required_query(query, "partNumber")?
        .parse()
        .map_err(|_| S3Error::InvalidArgument {
            message: "Part number must be an integer between 1 and 10000, inclusive".to_string(),
        })
}

/// `POST /{bucket}/{key}?uploads` -- Start a multipart upload. Content
/// attributes and metadata are captured now and applied on completion.
pub async fn create_multipart_upload(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    let upload = state
        .multipart
        .initiate_multipart_upload(bucket, key, object_attributes(headers))?;
    Ok(xml_response(xml::render_initiate_multipart_upload_result(
        &upload,
    )))
}

/// `PUT /{bucket}/{key}?partNumber=N&uploadId=ID` -- Upload one part.
pub async fn upload_part(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, S3Error> {
    let upload_id = required_query(query, "uploadId")?;
    let part_number = part_number(query)?;
    let mut reader = body_reader(headers, body);

    let part = state
        .multipart
        .upload_part(bucket, key, upload_id, part_number, &mut reader)
        .await?;
    record_bytes_received(part.size);

    let mut response = StatusCode::OK.into_response();
    if let Ok(etag) = HeaderValue::from_str(&xml::quote_etag(&part.etag)) {
        response.headers_mut().insert("etag", etag);
    }
    Ok(response)
}

/// `PUT /{bucket}/{key}?partNumber=N&uploadId=ID` with `x-amz-copy-source`
/// -- Fill a part from an existing object, optionally limited by
/// `x-amz-copy-source-range: bytes=first-last`.
pub async fn upload_part_copy(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    let upload_id = required_query(query, "uploadId")?;
    let part_number = part_number(query)?;
    let (src_bucket, src_key) = parse_source(header_str(headers, COPY_SOURCE).unwrap_or(""))?;
    let range = match header_str(headers, COPY_SOURCE_RANGE) {
        None => None,
        Some(value) => match RangeSpec::parse(value) {
            Some(RangeSpec::StartEnd(start, end)) => Some(ByteRange { start, end }),
            _ => {
                return Err(S3Error::InvalidArgument {
                    message: format!("Invalid {COPY_SOURCE_RANGE}: {value}"),
                })
            }
        },
    };

    let part = state
        .multipart
        .upload_part_copy(
            bucket,
            key,
            upload_id,
            part_number,
            &src_bucket,
            &src_key,
            range,
        )
        .await?;
    Ok(xml_response(xml::render_copy_part_result(&part)))
}

/// `POST /{bucket}/{key}?uploadId=ID` -- Assemble the declared parts into
/// the final object.
pub async fn complete_multipart_upload(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
    body: &[u8],
) -> Result<Response, S3Error> {
    let upload_id = required_query(query, "uploadId")?;
    let parts = xml::parse_complete_multipart_upload(body)?;

    let info = state
        .multipart
        .complete_multipart_upload(bucket, key, upload_id, &parts)
        .await?;
    Ok(xml_response(xml::render_complete_multipart_upload_result(
        &info,
    )))
}

/// `DELETE /{bucket}/{key}?uploadId=ID` -- Abort an upload.
pub async fn abort_multipart_upload(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
) -> Result<Response, S3Error> {
    let upload_id = required_query(query, "uploadId")?;
    state
        .multipart
        .abort_multipart_upload(bucket, key, upload_id)
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `GET /{bucket}?uploads` -- List in-progress uploads.
pub async fn list_multipart_uploads(
    state: Arc<AppState>,
    bucket: &str,
    query: &HashMap<String, String>,
) -> Result<Response, S3Error> {
    let prefix = query_str(query, "prefix");
    let key_marker = query_str(query, "key-marker");
    let upload_id_marker = query_str(query, "upload-id-marker");
    let max_uploads = parse_limit(
        query.get("max-uploads").map(String::as_str),
        MAX_UPLOADS,
        MAX_UPLOADS,
    );

    let page = fetch_page(max_uploads, |n| {
        state
            .multipart
            .list_multipart_uploads(bucket, prefix, key_marker, upload_id_marker, n)
    })?;
    let xml = xml::render_list_multipart_uploads_result(&ListUploadsResult {
        bucket,
        prefix,
        key_marker,
        upload_id_marker,
        max_uploads,
        uploads: &page.items,
        next_marker: page.next_marker.as_ref(),
    });
    Ok(xml_response(xml))
}

/// `GET /{bucket}/{key}?uploadId=ID` -- List the parts of one upload.
pub async fn list_parts(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
) -> Result<Response, S3Error> {
    let upload_id = required_query(query, "uploadId")?;
    let part_number_marker = match query.get("part-number-marker") {
        None => 0,
        Some(raw) => raw.trim().parse().map_err(|_| S3Error::InvalidArgument {
            message: "part-number-marker must be an integer".to_string(),
        })?,
    };
    let max_parts = parse_limit(
        query.get("max-parts").map(String::as_str),
        MAX_PARTS,
        MAX_PARTS,
    );

    // Fetched directly so an unknown upload is reported even for max-parts=0.
    let fetched = state
        .multipart
        .list_parts(
            bucket,
            key,
            upload_id,
            part_number_marker,
            max_parts.saturating_add(1),
        )
        .await?;
    let page = Page::from_overfetch(fetched, max_parts);

    let xml = xml::render_list_parts_result(&ListPartsResult {
        bucket,
        key,
        upload_id,
        part_number_marker,
        max_parts,
        parts: &page.items,
        next_part_number_marker: page.next_marker,
    });
    Ok(xml_response(xml))
}
