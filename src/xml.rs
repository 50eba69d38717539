//! S3 XML request parsing and response rendering.
//!
//! All S3 API responses are XML-encoded.  This module produces the payloads
//! with `quick-xml` and parses the two XML request bodies the server
//! accepts (`<CompleteMultipartUpload>` and `<Delete>`).

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;

use crate::errors::S3Error;
use crate::storage::types::{BucketInfo, CompletedPart, ObjectInfo, PartInfo, UploadInfo};

const S3_NAMESPACE: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// Owner reported in listings. There is a single implicit owner.
const OWNER_ID: &str = "cubbystore";
const OWNER_DISPLAY_NAME: &str = "cubbystore";

const STORAGE_CLASS: &str = "STANDARD";

type XmlWriter = Writer<Cursor<Vec<u8>>>;

/// Format a timestamp the way S3 does in XML bodies
/// (`2024-01-02T03:04:05.000Z`).
pub fn iso8601(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Wrap an ETag in double quotes for the wire.
pub fn quote_etag(etag: &str) -> String {
    format!("\"{etag}\"")
}

// ── Error response ──────────────────────────────────────────────────

/// Render an S3 `<Error>` XML document.
///
/// ```xml
/// <?xml version="1.0" encoding="UTF-8"?>
/// <Error>
///   <Code>NoSuchBucket</Code>
///   <Message>The specified bucket does not exist</Message>
///   <Resource>/mybucket</Resource>
///   <RequestId>abcd-1234</RequestId>
/// </Error>
/// ```
pub fn render_error(code: &str, message: &str, resource: &str, request_id: &str) -> String {
    let mut writer = new_document();
    write_simple_element_group(
        &mut writer,
        "Error",
        &[
            ("Code", code),
            ("Message", message),
            ("Resource", resource),
            ("RequestId", request_id),
        ],
    );
    finish(writer)
}

// ── ListAllMyBucketsResult ──────────────────────────────────────────

/// Render `<ListAllMyBucketsResult>` for `GET /`.
pub fn render_list_buckets_result(
    buckets: &[BucketInfo],
    prefix: &str,
    continuation_token: Option<&str>,
) -> String {
    let mut writer = new_document();
    start_root(&mut writer, "ListAllMyBucketsResult");
    write_owner(&mut writer, "Owner");

    start(&mut writer, "Buckets");
    for bucket in buckets {
        write_simple_element_group(
            &mut writer,
            "Bucket",
            &[("Name", &bucket.name), ("CreationDate", &iso8601(&bucket.created))],
        );
    }
    end(&mut writer, "Buckets");

    if !prefix.is_empty() {
        write_text_element(&mut writer, "Prefix", prefix);
    }
    if let Some(token) = continuation_token {
        write_text_element(&mut writer, "ContinuationToken", token);
    }
    end(&mut writer, "ListAllMyBucketsResult");
    finish(writer)
}

// ── ListBucketResult ────────────────────────────────────────────────

/// Which ListObjects flavor to render, with its version-specific fields.
pub enum ListObjectsMarkers<'a> {
    V1 {
        marker: &'a str,
        next_marker: Option<&'a str>,
    },
    V2 {
        start_after: &'a str,
        continuation_token: Option<&'a str>,
        next_continuation_token: Option<&'a str>,
    },
}

/// Everything that goes into a `<ListBucketResult>`.
pub struct ListObjectsResult<'a> {
    pub bucket: &'a str,
    pub prefix: &'a str,
    pub delimiter: &'a str,
    pub max_keys: usize,
    pub is_truncated: bool,
    pub objects: &'a [ObjectInfo],
    pub common_prefixes: &'a [String],
    pub markers: ListObjectsMarkers<'a>,
}

/// Render `<ListBucketResult>` for ListObjects (v1) or ListObjectsV2.
pub fn render_list_objects_result(result: &ListObjectsResult<'_>) -> String {
    let mut writer = new_document();
    start_root(&mut writer, "ListBucketResult");

    write_text_element(&mut writer, "Name", result.bucket);
    write_text_element(&mut writer, "Prefix", result.prefix);
    if let ListObjectsMarkers::V1 { marker, .. } = result.markers {
        write_text_element(&mut writer, "Marker", marker);
    }
    if !result.delimiter.is_empty() {
        write_text_element(&mut writer, "Delimiter", result.delimiter);
    }
    write_text_element(&mut writer, "MaxKeys", &result.max_keys.to_string());
    match result.markers {
        ListObjectsMarkers::V1 { next_marker, .. } => {
            write_bool_element(&mut writer, "IsTruncated", result.is_truncated);
            if let Some(next) = next_marker {
                write_text_element(&mut writer, "NextMarker", next);
            }
        }
        ListObjectsMarkers::V2 {
            start_after,
            continuation_token,
            next_continuation_token,
        } => {
            let key_count = result.objects.len() + result.common_prefixes.len();
            write_text_element(&mut writer, "KeyCount", &key_count.to_string());
            write_bool_element(&mut writer, "IsTruncated", result.is_truncated);
            if let Some(token) = continuation_token {
                write_text_element(&mut writer, "ContinuationToken", token);
            }
            if let Some(token) = next_continuation_token {
                write_text_element(&mut writer, "NextContinuationToken", token);
            }
            if !start_after.is_empty() {
                write_text_element(&mut writer, "StartAfter", start_after);
            }
        }
    }

    for object in result.objects {
        start(&mut writer, "Contents");
        write_text_element(&mut writer, "Key", &object.key);
        write_text_element(&mut writer, "LastModified", &iso8601(&object.last_modified));
        write_text_element(&mut writer, "ETag", &quote_etag(&object.etag));
        write_text_element(&mut writer, "Size", &object.size.to_string());
        write_text_element(&mut writer, "StorageClass", STORAGE_CLASS);
        end(&mut writer, "Contents");
    }
    for prefix in result.common_prefixes {
        write_simple_element_group(&mut writer, "CommonPrefixes", &[("Prefix", prefix)]);
    }

    end(&mut writer, "ListBucketResult");
    finish(writer)
}

// ── DeleteResult ────────────────────────────────────────────────────

/// A key that could not be deleted in a DeleteObjects request.
pub struct DeleteError {
    pub key: String,
    pub code: &'static str,
    pub message: String,
}

/// Render `<DeleteResult>` for batch DeleteObjects. In quiet mode only
/// errors are listed.
pub fn render_delete_result(deleted: &[String], errors: &[DeleteError], quiet: bool) -> String {
    let mut writer = new_document();
    start_root(&mut writer, "DeleteResult");

    if !quiet {
        for key in deleted {
            write_simple_element_group(&mut writer, "Deleted", &[("Key", key)]);
        }
    }
    for error in errors {
        write_simple_element_group(
            &mut writer,
            "Error",
            &[("Key", &error.key), ("Code", error.code), ("Message", &error.message)],
        );
    }

    end(&mut writer, "DeleteResult");
    finish(writer)
}

// ── Copy results ────────────────────────────────────────────────────

/// Render `<CopyObjectResult>` returned by `PUT` with `x-amz-copy-source`.
pub fn render_copy_object_result(info: &ObjectInfo) -> String {
    render_copy_result("CopyObjectResult", &info.etag, &info.last_modified)
}

/// Render `<CopyPartResult>` returned by UploadPartCopy.
pub fn render_copy_part_result(part: &PartInfo) -> String {
    render_copy_result("CopyPartResult", &part.etag, &part.last_modified)
}

fn render_copy_result(root: &str, etag: &str, last_modified: &DateTime<Utc>) -> String {
    let mut writer = new_document();
    write_simple_element_group(
        &mut writer,
        root,
        &[("ETag", &quote_etag(etag)), ("LastModified", &iso8601(last_modified))],
    );
    finish(writer)
}

// ── Multipart ───────────────────────────────────────────────────────

/// Render `<InitiateMultipartUploadResult>`.
pub fn render_initiate_multipart_upload_result(upload: &UploadInfo) -> String {
    let mut writer = new_document();
    start_root(&mut writer, "InitiateMultipartUploadResult");
    write_text_element(&mut writer, "Bucket", &upload.bucket);
    write_text_element(&mut writer, "Key", &upload.key);
    write_text_element(&mut writer, "UploadId", &upload.upload_id);
    end(&mut writer, "InitiateMultipartUploadResult");
    finish(writer)
}

/// Render `<CompleteMultipartUploadResult>`.
pub fn render_complete_multipart_upload_result(info: &ObjectInfo) -> String {
    let mut writer = new_document();
    start_root(&mut writer, "CompleteMultipartUploadResult");
    write_text_element(
        &mut writer,
        "Location",
        &format!("/{}/{}", info.bucket, info.key),
    );
    write_text_element(&mut writer, "Bucket", &info.bucket);
    write_text_element(&mut writer, "Key", &info.key);
    write_text_element(&mut writer, "ETag", &quote_etag(&info.etag));
    end(&mut writer, "CompleteMultipartUploadResult");
    finish(writer)
}

/// Everything that goes into a `<ListMultipartUploadsResult>`.
pub struct ListUploadsResult<'a> {
    pub bucket: &'a str,
    pub prefix: &'a str,
    pub key_marker: &'a str,
    pub upload_id_marker: &'a str,
    pub max_uploads: usize,
    pub uploads: &'a [UploadInfo],
    /// `(key, upload id)` to resume from, present when truncated.
    pub next_marker: Option<&'a (String, String)>,
}

/// Render `<ListMultipartUploadsResult>` for ListMultipartUploads.
pub fn render_list_multipart_uploads_result(result: &ListUploadsResult<'_>) -> String {
    let mut writer = new_document();
    start_root(&mut writer, "ListMultipartUploadsResult");

    write_text_element(&mut writer, "Bucket", result.bucket);
    write_text_element(&mut writer, "KeyMarker", result.key_marker);
    write_text_element(&mut writer, "UploadIdMarker", result.upload_id_marker);
    if let Some((key, upload_id)) = result.next_marker {
        write_text_element(&mut writer, "NextKeyMarker", key);
        write_text_element(&mut writer, "NextUploadIdMarker", upload_id);
    }
    if !result.prefix.is_empty() {
        write_text_element(&mut writer, "Prefix", result.prefix);
    }
    write_text_element(&mut writer, "MaxUploads", &result.max_uploads.to_string());
    write_bool_element(&mut writer, "IsTruncated", result.next_marker.is_some());

    for upload in result.uploads {
        start(&mut writer, "Upload");
        write_text_element(&mut writer, "Key", &upload.key);
        write_text_element(&mut writer, "UploadId", &upload.upload_id);
        write_owner(&mut writer, "Initiator");
        write_owner(&mut writer, "Owner");
        write_text_element(&mut writer, "StorageClass", STORAGE_CLASS);
        write_text_element(&mut writer, "Initiated", &iso8601(&upload.initiated));
        end(&mut writer, "Upload");
    }

    end(&mut writer, "ListMultipartUploadsResult");
    finish(writer)
}

/// Everything that goes into a `<ListPartsResult>`.
pub struct ListPartsResult<'a> {
    pub bucket: &'a str,
    pub key: &'a str,
    pub upload_id: &'a str,
    pub part_number_marker: u32,
    pub max_parts: usize,
    pub parts: &'a [PartInfo],
    pub next_part_number_marker: Option<u32>,
}

/// Render `<ListPartsResult>` for ListParts.
pub fn render_list_parts_result(result: &ListPartsResult<'_>) -> String {
    let mut writer = new_document();
    start_root(&mut writer, "ListPartsResult");

    write_text_element(&mut writer, "Bucket", result.bucket);
    write_text_element(&mut writer, "Key", result.key);
    write_text_element(&mut writer, "UploadId", result.upload_id);
    write_owner(&mut writer, "Initiator");
    write_owner(&mut writer, "Owner");
    write_text_element(&mut writer, "StorageClass", STORAGE_CLASS);
    write_text_element(
        &mut writer,
        "PartNumberMarker",
        &result.part_number_marker.to_string(),
    );
    if let Some(next) = result.next_part_number_marker {
        write_text_element(&mut writer, "NextPartNumberMarker", &next.to_string());
    }
    write_text_element(&mut writer, "MaxParts", &result.max_parts.to_string());
    write_bool_element(
        &mut writer,
        "IsTruncated",
        result.next_part_number_marker.is_some(),
    );

    for part in result.parts {
        start(&mut writer, "Part");
        write_text_element(&mut writer, "PartNumber", &part.part_number.to_string());
        write_text_element(&mut writer, "LastModified", &iso8601(&part.last_modified));
        write_text_element(&mut writer, "ETag", &quote_etag(&part.etag));
        write_text_element(&mut writer, "Size", &part.size.to_string());
        end(&mut writer, "Part");
    }

    end(&mut writer, "ListPartsResult");
    finish(writer)
}

// ── Request parsing ─────────────────────────────────────────────────

/// Parse a `<CompleteMultipartUpload>` body into the declared parts, in
/// document order. `<ETag>` is optional per part; `<PartNumber>` is not.
pub fn parse_complete_multipart_upload(body: &[u8]) -> Result<Vec<CompletedPart>, S3Error> {
    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);

    let mut parts = Vec::new();
    let mut current: Option<(Option<u32>, Option<String>)> = None;
    let mut current_tag = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if tag == "Part" {
                    current = Some((None, None));
                }
                current_tag = tag;
            }
            Ok(Event::Text(ref e)) => {
                if let Some((part_number, etag)) = current.as_mut() {
                    let text = e.unescape().map_err(|_| S3Error::MalformedXML)?;
                    match current_tag.as_str() {
                        "PartNumber" => {
                            *part_number =
                                Some(text.trim().parse().map_err(|_| S3Error::MalformedXML)?);
                        }
                        "ETag" => *etag = Some(text.into_owned()),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"Part" {
                    match current.take() {
                        Some((Some(part_number), etag)) => {
                            parts.push(CompletedPart { part_number, etag })
                        }
                        _ => return Err(S3Error::MalformedXML),
                    }
                }
                current_tag.clear();
            }
            Ok(Event::Eof) => break,
            Err(_) => return Err(S3Error::MalformedXML),
            _ => {}
        }
        buf.clear();
    }

    if parts.is_empty() {
        return Err(S3Error::MalformedXML);
    }
    Ok(parts)
}

/// Parse a `<Delete>` body into the keys to delete and the quiet flag.
pub fn parse_delete_request(body: &[u8]) -> Result<(Vec<String>, bool), S3Error> {
    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);

    let mut keys = Vec::new();
    let mut quiet = false;
    let mut current_tag = String::new();
    let mut in_object = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                current_tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if current_tag == "Object" {
                    in_object = true;
                }
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"Object" {
                    in_object = false;
                }
                current_tag.clear();
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().map_err(|_| S3Error::MalformedXML)?;
                if in_object && current_tag == "Key" {
                    keys.push(text.into_owned());
                } else if current_tag == "Quiet" {
                    quiet = text.trim().eq_ignore_ascii_case("true");
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => return Err(S3Error::MalformedXML),
            _ => {}
        }
        buf.clear();
    }

    if keys.is_empty() {
        return Err(S3Error::MalformedXML);
    }
    Ok((keys, quiet))
}

// ── Helpers ─────────────────────────────────────────────────────────

fn new_document() -> XmlWriter {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .expect("xml decl");
    writer
}

fn finish(writer: XmlWriter) -> String {
    String::from_utf8(writer.into_inner().into_inner()).expect("valid utf-8")
}

/// Open a root element carrying the S3 namespace.
fn start_root(writer: &mut XmlWriter, tag: &str) {
    let root = BytesStart::new(tag).with_attributes([("xmlns", S3_NAMESPACE)]);
    writer.write_event(Event::Start(root)).expect("start root");
}

fn start(writer: &mut XmlWriter, tag: &str) {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .expect("start tag");
}

fn end(writer: &mut XmlWriter, tag: &str) {
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .expect("end tag");
}

/// Write a `<tag>text</tag>` element.
fn write_text_element(writer: &mut XmlWriter, tag: &str, text: &str) {
    start(writer, tag);
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .expect("text");
    end(writer, tag);
}

fn write_bool_element(writer: &mut XmlWriter, tag: &str, value: bool) {
    write_text_element(writer, tag, if value { "true" } else { "false" });
}

fn write_owner(writer: &mut XmlWriter, tag: &str) {
    write_simple_element_group(
        writer,
        tag,
        &[("ID", OWNER_ID), ("DisplayName", OWNER_DISPLAY_NAME)],
    );
}

/// Write a parent element containing a flat list of child text elements.
fn write_simple_element_group(writer: &mut XmlWriter, parent: &str, children: &[(&str, &str)]) {
    start(writer, parent);
    for (tag, value) in children {
        write_text_element(writer, tag, value);
    }
    end(writer, parent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::ObjectAttributes;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()
    }

    fn object(key: &str) -> ObjectInfo {
        ObjectInfo {
            bucket: "photos".into(),
            key: key.into(),
            size: 42,
            etag: "abc123".into(),
            checksum_sha256: String::new(),
            last_modified: ts(),
            attributes: ObjectAttributes::default(),
        }
    }

    #[test]
    fn test_iso8601() {
        assert_eq!(iso8601(&ts()), "2024-01-02T03:04:05.000Z");
    }

    #[test]
    fn test_render_error_escapes_text() {
        let xml = render_error("NoSuchKey", "missing <key> & more", "/b/k", "REQ1");
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<Code>NoSuchKey</Code>"));
        assert!(xml.contains("missing &lt;key&gt; &amp; more"));
        assert!(xml.contains("<RequestId>REQ1</RequestId>"));
    }

    #[test]
    fn test_render_list_objects_v2() {
        let objects = vec![object("a.txt")];
        let prefixes = vec!["dir/".to_string()];
        let xml = render_list_objects_result(&ListObjectsResult {
            bucket: "photos",
            prefix: "",
            delimiter: "/",
            max_keys: 2,
            is_truncated: true,
            objects: &objects,
            common_prefixes: &prefixes,
            markers: ListObjectsMarkers::V2 {
                start_after: "",
                continuation_token: None,
                next_continuation_token: Some("dir/"),
            },
        });
        assert!(xml.contains("<KeyCount>2</KeyCount>"));
        assert!(xml.contains("<IsTruncated>true</IsTruncated>"));
        assert!(xml.contains("<NextContinuationToken>dir/</NextContinuationToken>"));
        assert!(xml.contains("<ETag>&quot;abc123&quot;</ETag>"));
        assert!(xml.contains("<CommonPrefixes><Prefix>dir/</Prefix></CommonPrefixes>"));
        assert!(!xml.contains("<Marker>"));
    }

    #[test]
    fn test_render_list_objects_v1() {
        let xml = render_list_objects_result(&ListObjectsResult {
            bucket: "photos",
            prefix: "p",
            delimiter: "",
            max_keys: 1000,
            is_truncated: false,
            objects: &[],
            common_prefixes: &[],
            markers: ListObjectsMarkers::V1 {
                marker: "m",
                next_marker: None,
            },
        });
        assert!(xml.contains("<Marker>m</Marker>"));
        assert!(xml.contains("<IsTruncated>false</IsTruncated>"));
        assert!(!xml.contains("<Delimiter>"));
        assert!(!xml.contains("KeyCount"));
    }

    #[test]
    fn test_render_delete_result_quiet() {
        let deleted = vec!["a".to_string()];
        let errors = vec![DeleteError {
            key: "b".into(),
            code: "InternalError",
            message: "boom".into(),
        }];
        let loud = render_delete_result(&deleted, &errors, false);
        assert!(loud.contains("<Deleted><Key>a</Key></Deleted>"));
        let quiet = render_delete_result(&deleted, &errors, true);
        assert!(!quiet.contains("<Deleted>"));
        assert!(quiet.contains("<Code>InternalError</Code>"));
    }

    #[test]
    fn test_render_complete_result() {
        let xml = render_complete_multipart_upload_result(&object("dir/big.bin"));
        assert!(xml.contains("<Location>/photos/dir/big.bin</Location>"));
        assert!(xml.contains("<Key>dir/big.bin</Key>"));
    }

    #[test]
    fn test_parse_complete_multipart_upload() {
        let body = br#"<CompleteMultipartUpload>
            <Part><PartNumber>1</PartNumber><ETag>"etag1"</ETag></Part>
            <Part><ETag>etag2</ETag><PartNumber>2</PartNumber></Part>
            <Part><PartNumber>5</PartNumber></Part>
        </CompleteMultipartUpload>"#;
        let parts = parse_complete_multipart_upload(body).unwrap();
        assert_eq!(
            parts,
            vec![
                CompletedPart {
                    part_number: 1,
                    etag: Some("\"etag1\"".into())
                },
                CompletedPart {
                    part_number: 2,
                    etag: Some("etag2".into())
                },
                CompletedPart {
                    part_number: 5,
                    etag: None
                },
            ]
        );
    }

    #[test]
    fn test_parse_complete_multipart_upload_rejects_bad_bodies() {
        for body in [
            &b""[..],
            b"<CompleteMultipartUpload></CompleteMultipartUpload>",
            b"<CompleteMultipartUpload><Part><ETag>x</ETag></Part></CompleteMultipartUpload>",
            b"<CompleteMultipartUpload><Part><PartNumber>one</PartNumber></Part></CompleteMultipartUpload>",
            b"<CompleteMultipartUpload><Part>",
        ] {
            assert!(
                matches!(parse_complete_multipart_upload(body), Err(S3Error::MalformedXML)),
                "{}",
                String::from_utf8_lossy(body)
            );
        }
    }

    #[test]
    fn test_parse_delete_request() {
        let body = br#"<Delete>
            <Quiet>true</Quiet>
            <Object><Key>a.txt</Key></Object>
            <Object><Key>dir/b&amp;c.txt</Key></Object>
        </Delete>"#;
        let (keys, quiet) = parse_delete_request(body).unwrap();
        assert_eq!(keys, vec!["a.txt", "dir/b&c.txt"]);
        assert!(quiet);

        assert!(matches!(
            parse_delete_request(b"<Delete></Delete>"),
            Err(S3Error::MalformedXML)
        ));
    }
}
