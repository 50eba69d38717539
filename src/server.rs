//! Axum router construction and S3 route mapping.
//!
//! The [`app`] function wires every S3-compatible endpoint to its handler
//! and returns a ready-to-serve [`axum::Router`].
//!
//! S3 distinguishes operations by query parameters and headers, not just
//! path+method. For example, `GET /:bucket` is ListObjectsV2 with
//! `?list-type=2`, ListMultipartUploads with `?uploads`, and ListObjects
//! (v1) otherwise. We use a single handler per method+path that dispatches
//! internally.

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, RawQuery, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::errors::{generate_request_id, S3Error};
use crate::handlers::{self, COPY_SOURCE, RENAME_SOURCE};
use crate::metrics::{metrics_handler, metrics_middleware, record_operation};
use crate::AppState;

/// Build the axum [`Router`] with all S3-compatible routes.
///
/// `/health` and `/metrics` are mounted only when enabled in
/// `config.observability`. The returned router is ready to be passed to
/// `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    let mut router = Router::new();
    if state.config.observability.health_check {
        router = router.route("/health", get(health_check));
    }
    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        // Service-level: GET / -> ListBuckets
        .route("/", get(handle_get_service))
        // Bucket-level routes
        .route(
            "/:bucket",
            get(handle_get_bucket)
                .put(handle_put_bucket)
                .delete(handle_delete_bucket)
                .head(handle_head_bucket)
                .post(handle_post_bucket),
        )
        // Object-level routes (wildcard key captures slashes)
        .route(
            "/:bucket/*key",
            get(handle_get_object)
                .put(handle_put_object)
                .delete(handle_delete_object)
                .head(handle_head_object)
                .post(handle_post_object),
        )
        .with_state(state.clone())
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(middleware::from_fn_with_state(
            state,
            common_headers_middleware,
        ))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        // Bodies are streamed to disk, so no size limit applies here.
        .layer(DefaultBodyLimit::disable())
}

// -- Common headers middleware -----------------------------------------------

/// Adds the headers every S3 response carries:
/// - `x-amz-request-id`: 16-character uppercase hex string
/// - `Date`: RFC 7231 formatted timestamp
/// - `Server`: `CubbyStore`
/// - `x-amz-bucket-region`: the configured region
async fn common_headers_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    // Error responses already carry the id that appears in their body.
    if !headers.contains_key("x-amz-request-id") {
        if let Ok(id) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-amz-request-id", id);
        }
    }
    if let Ok(date) = HeaderValue::from_str(&httpdate::fmt_http_date(std::time::SystemTime::now()))
    {
        headers.insert("date", date);
    }
    headers.insert("server", HeaderValue::from_static("CubbyStore"));
    if let Ok(region) = HeaderValue::from_str(&state.config.server.region) {
        headers.insert("x-amz-bucket-region", region);
    }

    response
}

// -- Health check ------------------------------------------------------------

/// `GET /health` -- Returns `{"status":"ok"}` with 200 OK.
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

// -- Helpers -----------------------------------------------------------------

/// Parse raw query string into a HashMap.
fn parse_query(raw: Option<String>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(qs) = raw {
        for part in qs.split('&') {
            if let Some((k, v)) = part.split_once('=') {
                map.insert(decode_query_component(k), decode_query_component(v));
            } else if !part.is_empty() {
                // Flags without a value, e.g. `?uploads` or `?delete`.
                map.insert(decode_query_component(part), String::new());
            }
        }
    }
    map
}

fn decode_query_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    percent_encoding::percent_decode_str(&spaced)
        .decode_utf8_lossy()
        .into_owned()
}

/// Count the outcome of one S3 operation and turn it into a response.
fn finish(operation: &'static str, result: Result<Response, S3Error>) -> Response {
    match result {
        Ok(response) => {
            record_operation(operation, "ok");
            response
        }
        Err(err) => {
            record_operation(operation, err.code());
            err.into_response()
        }
    }
}

/// HEAD handlers answer with a bare response; the error code travels in a
/// header.
fn finish_head(operation: &'static str, response: Response) -> Response {
    let outcome = response
        .headers()
        .get("x-amz-error-code")
        .and_then(|v| v.to_str().ok())
        .map_or("ok", error_code_label);
    record_operation(operation, outcome);
    response
}

fn error_code_label(code: &str) -> &'static str {
    match code {
        "NoSuchBucket" => "NoSuchBucket",
        "NoSuchKey" => "NoSuchKey",
        "InvalidBucketName" => "InvalidBucketName",
        "InvalidArgument" => "InvalidArgument",
        "KeyTooLongError" => "KeyTooLongError",
        _ => "InternalError",
    }
}

// -- Service-level dispatch --------------------------------------------------

/// `GET /` -- ListBuckets
async fn handle_get_service(
    State(state): State<Arc<AppState>>,
    RawQuery(raw_query): RawQuery,
) -> Response {
    let query = parse_query(raw_query);
    finish("ListBuckets", handlers::bucket::list_buckets(state, &query).await)
}

// -- Bucket-level dispatch ---------------------------------------------------

/// `GET /:bucket` -- dispatches based on query params:
/// - `?uploads` -> ListMultipartUploads
/// - `?list-type=2` -> ListObjectsV2
/// - default -> ListObjects (v1)
async fn handle_get_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    RawQuery(raw_query): RawQuery,
) -> Response {
    let query = parse_query(raw_query);

    if query.contains_key("uploads") {
        finish(
            "ListMultipartUploads",
            handlers::multipart::list_multipart_uploads(state, &bucket, &query).await,
        )
    } else if query.get("list-type").is_some_and(|v| v == "2") {
        finish(
            "ListObjectsV2",
            handlers::object::list_objects_v2(state, &bucket, &query).await,
        )
    } else {
        finish(
            "ListObjects",
            handlers::object::list_objects_v1(state, &bucket, &query).await,
        )
    }
}

/// `PUT /:bucket` -- CreateBucket
async fn handle_put_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
) -> Response {
    finish("CreateBucket", handlers::bucket::create_bucket(state, &bucket).await)
}

/// `DELETE /:bucket` -- DeleteBucket
async fn handle_delete_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
) -> Response {
    finish("DeleteBucket", handlers::bucket::delete_bucket(state, &bucket).await)
}

/// `HEAD /:bucket` -- HeadBucket
async fn handle_head_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
) -> Response {
    finish_head("HeadBucket", handlers::bucket::head_bucket(state, &bucket).await)
}

/// `POST /:bucket` -- dispatches based on query params:
/// - `?delete` -> DeleteObjects (batch delete)
/// - default -> NotImplemented
async fn handle_post_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    RawQuery(raw_query): RawQuery,
    body: Bytes,
) -> Response {
    let query = parse_query(raw_query);

    if query.contains_key("delete") {
        finish(
            "DeleteObjects",
            handlers::object::delete_objects(state, &bucket, &body).await,
        )
    } else {
        finish("PostBucket", Err(S3Error::NotImplemented))
    }
}

// -- Object-level dispatch ---------------------------------------------------

/// `GET /:bucket/*key` -- dispatches based on query params:
/// - `?uploadId=...` -> ListParts
/// - default -> GetObject
async fn handle_get_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let query = parse_query(raw_query);

    if query.contains_key("uploadId") {
        finish(
            "ListParts",
            handlers::multipart::list_parts(state, &bucket, &key, &query).await,
        )
    } else {
        finish(
            "GetObject",
            handlers::object::get_object(state, &bucket, &key, &headers).await,
        )
    }
}

/// `PUT /:bucket/*key` -- dispatches based on query params and headers:
/// - `?partNumber=...` or `?uploadId=...` -> UploadPart, or UploadPartCopy
///   with `x-amz-copy-source` (MissingParameter unless both are present)
/// - `x-amz-rename-source` header -> RenameObject
/// - `x-amz-copy-source` header -> CopyObject
/// - default -> PutObject
async fn handle_put_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let query = parse_query(raw_query);

    // Either part parameter alone is a malformed part upload, never a plain
    // put; the part handlers reject it with MissingParameter.
    if query.contains_key("partNumber") || query.contains_key("uploadId") {
        if headers.contains_key(COPY_SOURCE) {
            finish(
                "UploadPartCopy",
                handlers::multipart::upload_part_copy(state, &bucket, &key, &query, &headers).await,
            )
        } else {
            finish(
                "UploadPart",
                handlers::multipart::upload_part(state, &bucket, &key, &query, &headers, body).await,
            )
        }
    } else if headers.contains_key(RENAME_SOURCE) {
        finish(
            "RenameObject",
            handlers::object::rename_object(state, &bucket, &key, &headers).await,
        )
    } else if headers.contains_key(COPY_SOURCE) {
        finish(
            "CopyObject",
            handlers::object::copy_object(state, &bucket, &key, &headers).await,
        )
    } else {
        finish(
            "PutObject",
            handlers::object::put_object(state, &bucket, &key, &headers, body).await,
        )
    }
}

/// `DELETE /:bucket/*key` -- dispatches based on query params:
/// - `?uploadId=...` -> AbortMultipartUpload
/// - default -> DeleteObject
async fn handle_delete_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
) -> Response {
    let query = parse_query(raw_query);

    if query.contains_key("uploadId") {
        finish(
            "AbortMultipartUpload",
            handlers::multipart::abort_multipart_upload(state, &bucket, &key, &query).await,
        )
    } else {
        finish(
            "DeleteObject",
            handlers::object::delete_object(state, &bucket, &key).await,
        )
    }
}

/// `HEAD /:bucket/*key` -- HeadObject
async fn handle_head_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
) -> Response {
    finish_head("HeadObject", handlers::object::head_object(state, &bucket, &key).await)
}

/// `POST /:bucket/*key` -- dispatches based on query params:
/// - `?uploads` -> CreateMultipartUpload
/// - `?uploadId=...` -> CompleteMultipartUpload
/// - default -> NotImplemented
async fn handle_post_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let query = parse_query(raw_query);

    if query.contains_key("uploads") {
        finish(
            "CreateMultipartUpload",
            handlers::multipart::create_multipart_upload(state, &bucket, &key, &headers).await,
        )
    } else if query.contains_key("uploadId") {
        finish(
            "CompleteMultipartUpload",
            handlers::multipart::complete_multipart_upload(state, &bucket, &key, &query, &body).await,
        )
    } else {
        finish("PostObject", Err(S3Error::NotImplemented))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use base64::prelude::{Engine, BASE64_STANDARD};
    use sha2::{Digest, Sha256};
    use tower::ServiceExt;

    fn test_app() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.root_dir = dir.path().to_string_lossy().into_owned();
        let state = Arc::new(AppState::open(config).unwrap());
        (dir, app(state))
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        headers: &[(&str, &str)],
        body: impl Into<Body>,
    ) -> Response {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        app.clone()
            .oneshot(builder.body(body.into()).unwrap())
            .await
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn element<'a>(xml: &'a str, name: &str) -> &'a str {
        let open = format!("<{name}>");
        let close = format!("</{name}>");
        let start = xml.find(&open).unwrap() + open.len();
        let end = start + xml[start..].find(&close).unwrap();
        &xml[start..end]
    }

    #[test]
    fn test_parse_query() {
        let q = parse_query(Some("uploads&prefix=a%2Fb&start-after=x+y&list-type=2".into()));
        assert_eq!(q.get("uploads").map(String::as_str), Some(""));
        assert_eq!(q.get("prefix").map(String::as_str), Some("a/b"));
        assert_eq!(q.get("start-after").map(String::as_str), Some("x y"));
        assert_eq!(q.get("list-type").map(String::as_str), Some("2"));
        assert!(parse_query(None).is_empty());
    }

    #[tokio::test]
    async fn test_health_and_common_headers() {
        let (_dir, app) = test_app();
        let resp = send(&app, "GET", "/health", &[], Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let headers = resp.headers().clone();
        assert_eq!(body_string(resp).await, r#"{"status":"ok"}"#);
        assert_eq!(headers.get("server").unwrap(), "CubbyStore");
        assert_eq!(headers.get("x-amz-bucket-region").unwrap(), "us-east-1");
        assert_eq!(headers.get("x-amz-request-id").unwrap().len(), 16);
        assert!(headers.contains_key("date"));
    }

    #[tokio::test]
    async fn test_bucket_lifecycle() {
        let (_dir, app) = test_app();
        let resp = send(&app, "PUT", "/photos", &[], Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("location").unwrap(), "/photos");

        let resp = send(&app, "PUT", "/photos", &[], Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert!(body_string(resp).await.contains("<Code>BucketAlreadyExists</Code>"));

        let resp = send(&app, "PUT", "/Bad_Name", &[], Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send(&app, "HEAD", "/photos", &[], Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send(&app, "GET", "/", &[], Body::empty()).await;
        assert!(body_string(resp).await.contains("<Name>photos</Name>"));

        send(&app, "PUT", "/photos/a.jpg", &[], "x").await;
        let resp = send(&app, "DELETE", "/photos", &[], Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert!(body_string(resp).await.contains("<Code>BucketNotEmpty</Code>"));

        send(&app, "DELETE", "/photos/a.jpg", &[], Body::empty()).await;
        let resp = send(&app, "DELETE", "/photos", &[], Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = send(&app, "HEAD", "/photos", &[], Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.headers().get("x-amz-error-code").unwrap(), "NoSuchBucket");
    }

    #[tokio::test]
    async fn test_put_get_head_object() {
        let (_dir, app) = test_app();
        send(&app, "PUT", "/docs", &[], Body::empty()).await;

        let resp = send(
            &app,
            "PUT",
            "/docs/notes/today.txt",
            &[("content-type", "text/plain"), ("x-amz-meta-Author", "ana")],
            "hello world",
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("etag").unwrap(),
            "\"b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9\""
        );

        let resp = send(&app, "GET", "/docs/notes/today.txt", &[], Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("content-type").unwrap(), "text/plain");
        assert_eq!(resp.headers().get("x-amz-meta-author").unwrap(), "ana");
        assert_eq!(resp.headers().get("content-length").unwrap(), "11");
        assert_eq!(body_string(resp).await, "hello world");

        let resp = send(&app, "HEAD", "/docs/notes/today.txt", &[], Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("content-length").unwrap(), "11");

        let resp = send(&app, "HEAD", "/docs/missing", &[], Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.headers().get("x-amz-error-code").unwrap(), "NoSuchKey");

        let resp = send(&app, "GET", "/docs/missing", &[], Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(body_string(resp).await.contains("<Code>NoSuchKey</Code>"));

        let resp = send(&app, "PUT", "/nobucket/k", &[], "x").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_object_range() {
        let (_dir, app) = test_app();
        send(&app, "PUT", "/bkt", &[], Body::empty()).await;
        send(&app, "PUT", "/bkt/digits", &[], "0123456789").await;

        let resp = send(&app, "GET", "/bkt/digits", &[("range", "bytes=2-5")], Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers().get("content-range").unwrap(), "bytes 2-5/10");
        assert_eq!(body_string(resp).await, "2345");

        let resp = send(&app, "GET", "/bkt/digits", &[("range", "bytes=-3")], Body::empty()).await;
        assert_eq!(body_string(resp).await, "789");

        let resp = send(&app, "GET", "/bkt/digits", &[("range", "bytes=20-")], Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert!(body_string(resp).await.contains("<Code>InvalidRange</Code>"));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_bad_digest() {
        let (_dir, app) = test_app();
        send(&app, "PUT", "/bkt", &[], Body::empty()).await;
        let wrong = BASE64_STANDARD.encode(Sha256::digest(b"something else"));
        let resp = send(
            &app,
            "PUT",
            "/bkt/k",
            &[("x-amz-checksum-sha256", wrong.as_str())],
            "payload",
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(resp).await.contains("<Code>BadDigest</Code>"));

        let resp = send(&app, "HEAD", "/bkt/k", &[], Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let right = BASE64_STANDARD.encode(Sha256::digest(b"payload"));
        let resp = send(
            &app,
            "PUT",
            "/bkt/k",
            &[("x-amz-checksum-sha256", right.as_str())],
            "payload",
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("x-amz-checksum-sha256").unwrap(), right.as_str());
    }

    #[tokio::test]
    async fn test_streaming_put_is_decoded() {
        let (_dir, app) = test_app();
        send(&app, "PUT", "/bkt", &[], Body::empty()).await;
        let framed = "5;chunk-signature=aa\r\nhello\r\n0;chunk-signature=bb\r\n\r\n";
        let resp = send(
            &app,
            "PUT",
            "/bkt/greeting",
            &[("x-amz-content-sha256", "STREAMING-UNSIGNED-PAYLOAD-TRAILER")],
            framed,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send(&app, "GET", "/bkt/greeting", &[], Body::empty()).await;
        assert_eq!(body_string(resp).await, "hello");
    }

    #[tokio::test]
    async fn test_list_objects_v2_with_delimiter() {
        let (_dir, app) = test_app();
        send(&app, "PUT", "/bkt", &[], Body::empty()).await;
        for key in ["a.txt", "photos/1.jpg", "photos/2.jpg", "z.txt"] {
            send(&app, "PUT", &format!("/bkt/{key}"), &[], "x").await;
        }

        let resp = send(
            &app,
            "GET",
            "/bkt?list-type=2&delimiter=%2F&max-keys=2",
            &[],
            Body::empty(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let xml = body_string(resp).await;
        assert!(xml.contains("<Key>a.txt</Key>"));
        assert!(xml.contains("<Prefix>photos/</Prefix>"));
        assert!(!xml.contains("<Key>z.txt</Key>"));
        assert_eq!(element(&xml, "IsTruncated"), "true");
        let token = element(&xml, "NextContinuationToken").to_string();

        let resp = send(
            &app,
            "GET",
            &format!("/bkt?list-type=2&delimiter=%2F&continuation-token={token}"),
            &[],
            Body::empty(),
        )
        .await;
        let xml = body_string(resp).await;
        assert!(xml.contains("<Key>z.txt</Key>"));
        assert!(!xml.contains("<Prefix>photos/</Prefix>"));
        assert_eq!(element(&xml, "IsTruncated"), "false");

        let resp = send(&app, "GET", "/bkt?marker=photos%2F1.jpg", &[], Body::empty()).await;
        let xml = body_string(resp).await;
        assert!(!xml.contains("<Key>a.txt</Key>"));
        assert!(xml.contains("<Key>photos/2.jpg</Key>"));

        let resp = send(&app, "GET", "/missing?list-type=2", &[], Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_copy_and_rename() {
        let (_dir, app) = test_app();
        send(&app, "PUT", "/src", &[], Body::empty()).await;
        send(&app, "PUT", "/dst", &[], Body::empty()).await;
        send(
            &app,
            "PUT",
            "/src/orig",
            &[("content-type", "image/png")],
            "pixels",
        )
        .await;

        let resp = send(
            &app,
            "PUT",
            "/dst/copy",
            &[("x-amz-copy-source", "/src/orig")],
            Body::empty(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_string(resp).await.contains("<CopyObjectResult"));
        let resp = send(&app, "GET", "/dst/copy", &[], Body::empty()).await;
        assert_eq!(resp.headers().get("content-type").unwrap(), "image/png");
        assert_eq!(body_string(resp).await, "pixels");

        let resp = send(
            &app,
            "PUT",
            "/src/renamed",
            &[("x-amz-rename-source", "/src/orig")],
            Body::empty(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = send(&app, "HEAD", "/src/orig", &[], Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = send(&app, "GET", "/src/renamed", &[], Body::empty()).await;
        assert_eq!(body_string(resp).await, "pixels");

        let resp = send(
            &app,
            "PUT",
            "/dst/moved",
            &[("x-amz-rename-source", "/src/renamed")],
            Body::empty(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(resp).await.contains("<Code>InvalidArgument</Code>"));
    }

    #[tokio::test]
    async fn test_part_upload_without_part_number_is_rejected() {
        let (_dir, app) = test_app();
        send(&app, "PUT", "/bkt", &[], Body::empty()).await;
        send(&app, "PUT", "/bkt/k", &[], "original").await;
        let resp = send(&app, "POST", "/bkt/k?uploads", &[], Body::empty()).await;
        let upload_id = element(&body_string(resp).await, "UploadId").to_string();

        let resp = send(
            &app,
            "PUT",
            &format!("/bkt/k?uploadId={upload_id}"),
            &[],
            "clobber",
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(resp).await.contains("<Code>MissingParameter</Code>"));

        let resp = send(&app, "PUT", "/bkt/k?partNumber=1", &[], "clobber").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send(&app, "GET", "/bkt/k", &[], Body::empty()).await;
        assert_eq!(body_string(resp).await, "original");
    }

    #[tokio::test]
    async fn test_rename_source_wins_over_copy_source() {
        let (_dir, app) = test_app();
        send(&app, "PUT", "/bkt", &[], Body::empty()).await;
        send(&app, "PUT", "/bkt/renamed-from", &[], "moved").await;
        send(&app, "PUT", "/bkt/copied-from", &[], "copied").await;

        let resp = send(
            &app,
            "PUT",
            "/bkt/target",
            &[
                ("x-amz-rename-source", "/bkt/renamed-from"),
                ("x-amz-copy-source", "/bkt/copied-from"),
            ],
            Body::empty(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send(&app, "GET", "/bkt/target", &[], Body::empty()).await;
        assert_eq!(body_string(resp).await, "moved");
        let resp = send(&app, "HEAD", "/bkt/renamed-from", &[], Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = send(&app, "HEAD", "/bkt/copied-from", &[], Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_start_after_inside_delimited_group() {
        let (_dir, app) = test_app();
        send(&app, "PUT", "/bkt", &[], Body::empty()).await;
        for key in ["docs/a.txt", "docs/b.txt", "readme"] {
            send(&app, "PUT", &format!("/bkt/{key}"), &[], "x").await;
        }

        let resp = send(
            &app,
            "GET",
            "/bkt?list-type=2&delimiter=%2F&start-after=docs%2Fa.txt",
            &[],
            Body::empty(),
        )
        .await;
        let xml = body_string(resp).await;
        assert!(xml.contains("<CommonPrefixes><Prefix>docs/</Prefix></CommonPrefixes>"));
        assert!(xml.contains("<Key>readme</Key>"));
    }

    #[tokio::test]
    async fn test_batch_delete() {
        let (_dir, app) = test_app();
        send(&app, "PUT", "/bkt", &[], Body::empty()).await;
        send(&app, "PUT", "/bkt/one", &[], "1").await;
        send(&app, "PUT", "/bkt/two", &[], "2").await;

        let request = "<Delete><Object><Key>one</Key></Object>\
                       <Object><Key>never-existed</Key></Object></Delete>";
        let resp = send(&app, "POST", "/bkt?delete", &[], request).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let xml = body_string(resp).await;
        assert!(xml.contains("<Key>one</Key>"));
        assert!(xml.contains("<Key>never-existed</Key>"));
        assert!(!xml.contains("<Error>"));

        let resp = send(&app, "HEAD", "/bkt/one", &[], Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = send(&app, "HEAD", "/bkt/two", &[], Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send(&app, "POST", "/bkt", &[], Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn test_multipart_upload_round_trip() {
        let (_dir, app) = test_app();
        send(&app, "PUT", "/bkt", &[], Body::empty()).await;

        let resp = send(
            &app,
            "POST",
            "/bkt/big.bin?uploads",
            &[("content-type", "application/x-custom")],
            Body::empty(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let upload_id = element(&body_string(resp).await, "UploadId").to_string();

        let mut etags = Vec::new();
        for (n, chunk) in [(1, "first-"), (2, "second")] {
            let resp = send(
                &app,
                "PUT",
                &format!("/bkt/big.bin?partNumber={n}&uploadId={upload_id}"),
                &[],
                chunk,
            )
            .await;
            assert_eq!(resp.status(), StatusCode::OK);
            etags.push(resp.headers().get("etag").unwrap().to_str().unwrap().to_string());
        }

        let resp = send(&app, "GET", "/bkt?uploads", &[], Body::empty()).await;
        assert!(body_string(resp).await.contains(&upload_id));

        let resp = send(
            &app,
            "GET",
            &format!("/bkt/big.bin?uploadId={upload_id}&max-parts=1"),
            &[],
            Body::empty(),
        )
        .await;
        let xml = body_string(resp).await;
        assert_eq!(element(&xml, "IsTruncated"), "true");
        assert_eq!(element(&xml, "NextPartNumberMarker"), "1");

        let complete = format!(
            "<CompleteMultipartUpload>\
             <Part><PartNumber>1</PartNumber><ETag>{}</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>{}</ETag></Part>\
             </CompleteMultipartUpload>",
            etags[0], etags[1]
        );
        let resp = send(
            &app,
            "POST",
            &format!("/bkt/big.bin?uploadId={upload_id}"),
            &[],
            complete.clone(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let expected_etag = hex::encode(Sha256::digest(b"first-second"));
        assert!(body_string(resp).await.contains(&expected_etag));

        let resp = send(&app, "GET", "/bkt/big.bin", &[], Body::empty()).await;
        assert_eq!(resp.headers().get("content-type").unwrap(), "application/x-custom");
        assert_eq!(body_string(resp).await, "first-second");

        // The upload is gone once completed.
        let resp = send(
            &app,
            "POST",
            &format!("/bkt/big.bin?uploadId={upload_id}"),
            &[],
            complete,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(body_string(resp).await.contains("<Code>NoSuchUpload</Code>"));
    }

    #[tokio::test]
    async fn test_abort_and_invalid_part_order() {
        let (_dir, app) = test_app();
        send(&app, "PUT", "/bkt", &[], Body::empty()).await;
        let resp = send(&app, "POST", "/bkt/k?uploads", &[], Body::empty()).await;
        let upload_id = element(&body_string(resp).await, "UploadId").to_string();
        for n in [1, 2] {
            send(
                &app,
                "PUT",
                &format!("/bkt/k?partNumber={n}&uploadId={upload_id}"),
                &[],
                "data",
            )
            .await;
        }

        let reversed = "<CompleteMultipartUpload>\
                        <Part><PartNumber>2</PartNumber></Part>\
                        <Part><PartNumber>1</PartNumber></Part>\
                        </CompleteMultipartUpload>";
        let resp = send(
            &app,
            "POST",
            &format!("/bkt/k?uploadId={upload_id}"),
            &[],
            reversed,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(resp).await.contains("<Code>InvalidPartOrder</Code>"));

        let resp = send(
            &app,
            "DELETE",
            &format!("/bkt/k?uploadId={upload_id}"),
            &[],
            Body::empty(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = send(
            &app,
            "GET",
            &format!("/bkt/k?uploadId={upload_id}"),
            &[],
            Body::empty(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_upload_part_copy_with_range() {
        let (_dir, app) = test_app();
        send(&app, "PUT", "/bkt", &[], Body::empty()).await;
        send(&app, "PUT", "/bkt/source", &[], "0123456789").await;
        let resp = send(&app, "POST", "/bkt/dest?uploads", &[], Body::empty()).await;
        let upload_id = element(&body_string(resp).await, "UploadId").to_string();

        let resp = send(
            &app,
            "PUT",
            &format!("/bkt/dest?partNumber=1&uploadId={upload_id}"),
            &[
                ("x-amz-copy-source", "bkt/source"),
                ("x-amz-copy-source-range", "bytes=3-6"),
            ],
            Body::empty(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_string(resp).await.contains("<CopyPartResult"));

        let complete = "<CompleteMultipartUpload>\
                        <Part><PartNumber>1</PartNumber></Part>\
                        </CompleteMultipartUpload>";
        send(
            &app,
            "POST",
            &format!("/bkt/dest?uploadId={upload_id}"),
            &[],
            complete,
        )
        .await;
        let resp = send(&app, "GET", "/bkt/dest", &[], Body::empty()).await;
        assert_eq!(body_string(resp).await, "3456");
    }

    #[tokio::test]
    async fn test_observability_routes_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.root_dir = dir.path().to_string_lossy().into_owned();
        config.observability.health_check = false;
        config.observability.metrics = false;
        let app = app(Arc::new(AppState::open(config).unwrap()));

        // With the route gone, `/health` is just a bucket that does not exist.
        let resp = send(&app, "GET", "/health", &[], Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(body_string(resp).await.contains("<Code>NoSuchBucket</Code>"));
    }
}
