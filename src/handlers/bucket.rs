//! Bucket-level S3 API handlers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::info;

use super::{head_error, query_str, xml_response};
use crate::errors::{S3Error, StoreError};
use crate::pagination::{fetch_page, parse_limit};
use crate::xml;
use crate::AppState;

/// Default and maximum page size for ListBuckets.
const MAX_BUCKETS: usize = 10_000;

/// `GET /` -- List buckets, optionally filtered by `prefix` and paged with
/// `continuation-token` / `max-buckets`.
pub async fn list_buckets(
    state: Arc<AppState>,
    query: &HashMap<String, String>,
) -> Result<Response, S3Error> {
    let prefix = query_str(query, "prefix");
    let after = query_str(query, "continuation-token");
    let limit = parse_limit(query.get("max-buckets").map(String::as_str), MAX_BUCKETS, MAX_BUCKETS);

    let page = fetch_page(limit, |n| {
        Ok::<_, StoreError>(state.store.list_buckets(prefix, after, n))
    })?;
    let xml = xml::render_list_buckets_result(&page.items, prefix, page.next_marker.as_deref());
    Ok(xml_response(xml))
}

/// `PUT /{bucket}` -- Create a bucket.
pub async fn create_bucket(state: Arc<AppState>, bucket: &str) -> Result<Response, S3Error> {
    state.store.create_bucket(bucket)?;
    info!("Created bucket {}", bucket);

    let mut response = StatusCode::OK.into_response();
    if let Ok(location) = HeaderValue::from_str(&format!("/{bucket}")) {
        response.headers_mut().insert("location", location);
    }
    Ok(response)
}

/// `DELETE /{bucket}` -- Delete an empty bucket.
pub async fn delete_bucket(state: Arc<AppState>, bucket: &str) -> Result<Response, S3Error> {
    state.store.delete_bucket(bucket)?;
    info!("Deleted bucket {}", bucket);
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `HEAD /{bucket}` -- 200 if the bucket exists, a bodiless 404 otherwise.
pub async fn head_bucket(state: Arc<AppState>, bucket: &str) -> Response {
    match state.store.head_bucket(bucket) {
        Ok(_) => StatusCode::OK.into_response(),
        Err(err) => head_error(err.into()),
    }
}
