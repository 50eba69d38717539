//! S3 API handlers, grouped by resource, plus the header and body plumbing
//! they share.

pub mod bucket;
pub mod multipart;
pub mod object;

use std::collections::HashMap;
use std::io;
use std::pin::Pin;

use axum::body::Body;
use axum::http::header::{HeaderName, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::prelude::{Engine, BASE64_STANDARD};
use futures::TryStreamExt;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use crate::chunked::{is_streaming_payload, ChunkedReader};
use crate::errors::S3Error;
use crate::storage::types::{ObjectAttributes, ObjectInfo};
use crate::xml::quote_etag;

pub(crate) const CONTENT_SHA256: &str = "x-amz-content-sha256";
pub(crate) const CHECKSUM_SHA256: &str = "x-amz-checksum-sha256";
pub(crate) const COPY_SOURCE: &str = "x-amz-copy-source";
pub(crate) const COPY_SOURCE_RANGE: &str = "x-amz-copy-source-range";
pub(crate) const RENAME_SOURCE: &str = "x-amz-rename-source";
pub(crate) const METADATA_DIRECTIVE: &str = "x-amz-metadata-directive";
const USER_METADATA_PREFIX: &str = "x-amz-meta-";

/// A streamed request body.
pub(crate) type BodyReader = Pin<Box<dyn AsyncRead + Send>>;

/// Turn a request body into a byte reader without buffering it. Bodies sent
/// with AWS streaming framing are decoded on the fly.
pub(crate) fn body_reader(headers: &HeaderMap, body: Body) -> BodyReader {
    let reader = StreamReader::new(body.into_data_stream().map_err(io::Error::other));
    let streaming = header_str(headers, CONTENT_SHA256).is_some_and(is_streaming_payload);
    if streaming {
        Box::pin(ChunkedReader::new(reader))
    } else {
        Box::pin(reader)
    }
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// The client-declared SHA-256 of the payload, if any: `x-amz-checksum-sha256`
/// (base64) wins over a hex `x-amz-content-sha256`. Placeholder values such
/// as `UNSIGNED-PAYLOAD` or `STREAMING-...` declare nothing.
pub(crate) fn expected_sha256(headers: &HeaderMap) -> Result<Option<[u8; 32]>, S3Error> {
    if let Some(value) = header_str(headers, CHECKSUM_SHA256) {
        let invalid = || S3Error::InvalidArgument {
            message: format!("invalid {CHECKSUM_SHA256} value"),
        };
        let bytes = BASE64_STANDARD
            .decode(value.trim())
            .map_err(|_| invalid())?;
        return <[u8; 32]>::try_from(bytes.as_slice())
            .map(Some)
            .map_err(|_| invalid());
    }
    let declared = header_str(headers, CONTENT_SHA256)
        .filter(|v| v.len() == 64)
        .and_then(|v| hex::decode(v).ok())
        .and_then(|bytes| <[u8; 32]>::try_from(bytes.as_slice()).ok());
    Ok(declared)
}

/// Content attributes and `x-amz-meta-*` user metadata from request headers.
pub(crate) fn object_attributes(headers: &HeaderMap) -> ObjectAttributes {
    let get = |name: &str| header_str(headers, name).map(str::to_string);
    let mut attributes = ObjectAttributes {
        content_type: get("content-type"),
        content_disposition: get("content-disposition"),
        cache_control: get("cache-control"),
        content_encoding: get("content-encoding"),
        ..ObjectAttributes::default()
    };
    for (name, value) in headers {
        if let Some(meta_key) = name.as_str().strip_prefix(USER_METADATA_PREFIX) {
            if let Ok(v) = value.to_str() {
                attributes = attributes.with_metadata(meta_key, v);
            }
        }
    }
    attributes
}

/// Set the headers that describe a stored object on a GET/HEAD/PUT response.
pub(crate) fn insert_object_headers(headers: &mut HeaderMap, info: &ObjectInfo) {
    let attrs = &info.attributes;
    let mut set = |name: HeaderName, value: &str| {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    };
    set(CONTENT_TYPE, attrs.content_type());
    set(HeaderName::from_static("etag"), &quote_etag(&info.etag));
    set(
        HeaderName::from_static("last-modified"),
        &httpdate::fmt_http_date(info.last_modified.into()),
    );
    set(HeaderName::from_static(CHECKSUM_SHA256), &info.checksum_sha256);
    if let Some(v) = &attrs.content_disposition {
        set(HeaderName::from_static("content-disposition"), v);
    }
    if let Some(v) = &attrs.cache_control {
        set(HeaderName::from_static("cache-control"), v);
    }
    if let Some(v) = &attrs.content_encoding {
        set(HeaderName::from_static("content-encoding"), v);
    }
    for (key, value) in &attrs.user_metadata {
        if let Ok(name) = HeaderName::from_bytes(format!("{USER_METADATA_PREFIX}{key}").as_bytes()) {
            set(name, value);
        }
    }
}

/// Parse an `x-amz-copy-source` style value (`/bucket/key` or `bucket/key`,
/// URL-encoded, optional `?versionId=`) into bucket and key.
pub(crate) fn parse_source(value: &str) -> Result<(String, String), S3Error> {
    let value = value.split_once('?').map_or(value, |(path, _)| path);
    let decoded = percent_encoding::percent_decode_str(value)
        .decode_utf8()
        .map_err(|_| S3Error::InvalidArgument {
            message: "source is not valid UTF-8".to_string(),
        })?;
    let trimmed = decoded.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
            Ok((bucket.to_string(), key.to_string()))
        }
        _ => Err(S3Error::InvalidArgument {
            message: format!("invalid source: {value}"),
        }),
    }
}

pub(crate) fn query_str<'a>(query: &'a HashMap<String, String>, name: &str) -> &'a str {
    query.get(name).map(String::as_str).unwrap_or("")
}

pub(crate) fn required_query<'a>(
    query: &'a HashMap<String, String>,
    name: &str,
) -> Result<&'a str, S3Error> {
    query
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| S3Error::MissingParameter {
            name: name.to_string(),
        })
}

/// A 200 response carrying an XML document.
pub(crate) fn xml_response(xml: String) -> Response {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, HeaderValue::from_static("application/xml"))],
        xml,
    )
        .into_response()
}

/// HEAD responses carry no body, so errors are reduced to their status
/// plus the S3 code in a header.
pub(crate) fn head_error(err: S3Error) -> Response {
    let mut response = err.status_code().into_response();
    response
        .headers_mut()
        .insert("x-amz-error-code", HeaderValue::from_static(err.code()));
    response
}
