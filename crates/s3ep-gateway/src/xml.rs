//! S3 XML request and response documents

use chrono::{DateTime, Utc};
use s3ep_backend::CompletedPart;
use s3ep_core::{LogicalPart, UploadSummary};
use serde::{Deserialize, Serialize};

const S3_NAMESPACE: &str = "http://s3.amazonaws.com/doc/2006-03-01/";
const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

#[derive(Serialize)]
#[serde(rename = "InitiateMultipartUploadResult", rename_all = "PascalCase")]
struct InitiateMultipartUploadResult<'a> {
    #[serde(rename = "@xmlns")]
    xmlns: &'a str,
    bucket: &'a str,
    key: &'a str,
    upload_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename = "CompleteMultipartUploadResult", rename_all = "PascalCase")]
struct CompleteMultipartUploadResult<'a> {
    #[serde(rename = "@xmlns")]
    xmlns: &'a str,
    location: &'a str,
    bucket: &'a str,
    key: &'a str,
    #[serde(rename = "ETag")]
    etag: String,
}

#[derive(Serialize)]
#[serde(rename = "ListPartsResult", rename_all = "PascalCase")]
struct ListPartsResult<'a> {
    #[serde(rename = "@xmlns")]
    xmlns: &'a str,
    bucket: &'a str,
    key: &'a str,
    upload_id: &'a str,
    is_truncated: bool,
    #[serde(rename = "Part")]
    parts: Vec<PartXml>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct PartXml {
    part_number: u32,
    last_modified: String,
    #[serde(rename = "ETag")]
    etag: String,
    size: u64,
}

#[derive(Serialize)]
#[serde(rename = "ListMultipartUploadsResult", rename_all = "PascalCase")]
struct ListMultipartUploadsResult<'a> {
    #[serde(rename = "@xmlns")]
    xmlns: &'a str,
    bucket: &'a str,
    is_truncated: bool,
    #[serde(rename = "Upload")]
    uploads: Vec<UploadXml>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct UploadXml {
    key: String,
    upload_id: String,
    initiated: String,
}

#[derive(Deserialize)]
struct CompleteMultipartUploadRequest {
    #[serde(rename = "Part", default)]
    parts: Vec<RequestedPartXml>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RequestedPartXml {
    part_number: u32,
    #[serde(rename = "ETag", default)]
    etag: String,
}

fn document<T: Serialize>(value: &T) -> Result<String, quick_xml::SeError> {
    Ok(format!("{}\n{}", XML_DECLARATION, quick_xml::se::to_string(value)?))
}

fn timestamp(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn quoted(etag: &str) -> String {
    format!("\"{}\"", etag)
}

pub fn initiate_multipart_upload_result(
    bucket: &str,
    key: &str,
    upload_id: &str,
) -> Result<String, quick_xml::SeError> {
    document(&InitiateMultipartUploadResult {
        xmlns: S3_NAMESPACE,
        bucket,
        key,
        upload_id,
    })
}

pub fn complete_multipart_upload_result(
    location: &str,
    bucket: &str,
    key: &str,
    etag: &str,
) -> Result<String, quick_xml::SeError> {
    document(&CompleteMultipartUploadResult {
        xmlns: S3_NAMESPACE,
        location,
        bucket,
        key,
        etag: quoted(etag),
    })
}

pub fn list_parts_result(
    bucket: &str,
    key: &str,
    upload_id: &str,
    parts: &[LogicalPart],
) -> Result<String, quick_xml::SeError> {
    document(&ListPartsResult {
        xmlns: S3_NAMESPACE,
        bucket,
        key,
        upload_id,
        is_truncated: false,
        parts: parts
            .iter()
            .map(|p| PartXml {
                part_number: p.part_number,
                last_modified: timestamp(&p.last_modified),
                etag: quoted(&p.etag),
                size: p.size,
            })
            .collect(),
    })
}

pub fn list_multipart_uploads_result(
    bucket: &str,
    uploads: &[UploadSummary],
) -> Result<String, quick_xml::SeError> {
    document(&ListMultipartUploadsResult {
        xmlns: S3_NAMESPACE,
        bucket,
        is_truncated: false,
        uploads: uploads
            .iter()
            .map(|u| UploadXml {
                key: u.key.clone(),
                upload_id: u.upload_id.clone(),
                initiated: timestamp(&u.initiated),
            })
            .collect(),
    })
}

/// Parse a `CompleteMultipartUpload` request body
///
/// An empty body yields `None`, meaning every uploaded part is used.
pub fn parse_complete_multipart_upload(body: &[u8]) -> Result<Option<Vec<CompletedPart>>, String> {
    let text = std::str::from_utf8(body).map_err(|e| e.to_string())?;
    if text.trim().is_empty() {
        return Ok(None);
    }
    let request: CompleteMultipartUploadRequest = quick_xml::de::from_str(text).map_err(|e| e.to_string())?;
    Ok(Some(
        request
            .parts
            .into_iter()
            .map(|p| CompletedPart::new(p.part_number, p.etag))
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_complete_request() {
        let body = br#"<?xml version="1.0" encoding="UTF-8"?>
<CompleteMultipartUpload xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Part><PartNumber>1</PartNumber><ETag>"aaa"</ETag></Part>
  <Part><PartNumber>2</PartNumber><ETag>"bbb"</ETag></Part>
</CompleteMultipartUpload>"#;

        let parts = parse_complete_multipart_upload(body).unwrap().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].part_number, 1);
        assert_eq!(parts[1].etag, "\"bbb\"");
    }

    #[test]
    fn test_empty_complete_body_means_all_parts() {
        assert!(parse_complete_multipart_upload(b"").unwrap().is_none());
        assert!(parse_complete_multipart_upload(b"  \n").unwrap().is_none());
    }

    #[test]
    fn test_initiate_result() {
        let xml = initiate_multipart_upload_result("photos", "a&b.jpg", "u-1").unwrap();
        assert!(xml.starts_with(XML_DECLARATION));
        assert!(xml.contains("<Bucket>photos</Bucket>"));
        assert!(xml.contains("<Key>a&amp;b.jpg</Key>"));
        assert!(xml.contains("<UploadId>u-1</UploadId>"));
    }

    #[test]
    fn test_list_parts_result() {
        let parts = vec![LogicalPart {
            part_number: 3,
            generation: 0,
            size: 10,
            etag: "abc".into(),
            last_modified: Utc::now(),
        }];
        let xml = list_parts_result("b", "k", "u", &parts).unwrap();
        assert!(xml.contains("<PartNumber>3</PartNumber>"));
        assert!(xml.contains("<ETag>"));
        assert!(xml.contains("abc"));
        assert!(xml.contains("<Size>10</Size>"));
    }
}
