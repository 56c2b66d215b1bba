//! S3-compatible HTTP backend

use crate::{
    signing::{self, Credentials, SigningRequest},
    BackendError, CompletedPart, Metadata, ObjectBackend, ObjectInfo, Result, StoredObject,
    normalize_etag,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, Response, header::HeaderMap};
use s3ep_crypto::sha256_hex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

const META_HEADER_PREFIX: &str = "x-amz-meta-";

/// Connection settings for an S3-compatible service
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// Service endpoint, e.g. `https://s3.us-east-1.amazonaws.com`
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    /// Address buckets as `/bucket/key` instead of `bucket.host/key`
    pub path_style: bool,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".to_string(),
            region: "us-east-1".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            path_style: true,
            timeout_secs: 60,
        }
    }
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &"[REDACTED]")
            .field("path_style", &self.path_style)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateMultipartUploadResult {
    upload_id: String,
}

#[derive(Deserialize)]
struct CompleteMultipartUploadResult {
    #[serde(rename = "ETag")]
    etag: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorDocument {
    code: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
struct CompleteMultipartUpload {
    #[serde(rename = "Part")]
    parts: Vec<CompletePartXml>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CompletePartXml {
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: String,
}

/// Backend speaking the S3 REST API with SigV4-signed requests
pub struct S3Backend {
    config: S3Config,
    credentials: Credentials,
    endpoint: Url,
    http: Client,
}

impl S3Backend {
    /// Create a new backend client
    pub fn new(config: S3Config) -> Result<Self> {
        let endpoint = Url::parse(config.endpoint.trim_end_matches('/'))
            .map_err(|e| BackendError::Configuration(format!("invalid endpoint: {}", e)))?;
        if endpoint.host_str().is_none() {
            return Err(BackendError::Configuration(format!(
                "endpoint has no host: {}",
                config.endpoint
            )));
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BackendError::Configuration(e.to_string()))?;

        let credentials = Credentials {
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
            region: config.region.clone(),
        };

        Ok(Self {
            config,
            credentials,
            endpoint,
            http,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &S3Config {
        &self.config
    }

    /// Host header value and unencoded request path for an object
    fn address(&self, bucket: &str, key: &str) -> (String, String) {
        let host = self.endpoint.host_str().unwrap_or_default();
        let host = match self.endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let base = self.endpoint.path().trim_end_matches('/');

        if self.config.path_style {
            (host, format!("{}/{}/{}", base, bucket, key))
        } else {
            (format!("{}.{}", bucket, host), format!("{}/{}", base, key))
        }
    }

    #[instrument(skip(self, query, extra_headers, body))]
    async fn send(
        &self,
        method: Method,
        bucket: &str,
        key: &str,
        query: Vec<(String, String)>,
        extra_headers: BTreeMap<String, String>,
        body: Bytes,
    ) -> Result<Response> {
        let (host, path) = self.address(bucket, key);
        let now = Utc::now();
        let payload_hash = sha256_hex(&body);

        let mut headers = extra_headers;
        headers.insert("host".to_string(), host.clone());
        headers.insert("x-amz-date".to_string(), now.format("%Y%m%dT%H%M%SZ").to_string());
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.clone());

        let authorization = signing::authorization_header(
            &self.credentials,
            &SigningRequest {
                method: method.as_str(),
                path: &path,
                query: &query,
                headers: &headers,
                payload_hash: &payload_hash,
            },
            now,
        );

        let mut url = format!(
            "{}://{}{}",
            self.endpoint.scheme(),
            host,
            signing::canonical_uri(&path)
        );
        let query_string = signing::canonical_query(&query);
        if !query_string.is_empty() {
            url.push('?');
            url.push_str(&query_string);
        }

        let mut request = self.http.request(method.clone(), &url);
        for (name, value) in headers.iter().filter(|(name, _)| name.as_str() != "host") {
            request = request.header(name.as_str(), value.as_str());
        }
        request = request.header("authorization", authorization);
        if !body.is_empty() {
            request = request.body(body);
        }

        debug!(%method, %url, "Sending backend request");
        let response = request.send().await.map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(error_from_document(status.as_u16(), &text, bucket, key));
        }
        Ok(response)
    }

    fn map_transport_error(&self, err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Timeout {
                seconds: self.config.timeout_secs,
            }
        } else {
            BackendError::from(err)
        }
    }

    /// Read a body that S3 may use for an error even on HTTP 200
    async fn read_checked_body(response: Response, bucket: &str, key: &str) -> Result<String> {
        let status = response.status().as_u16();
        let text = response.text().await?;
        if text.contains("<Error>") {
            warn!(bucket, key, "Backend returned an error document with a success status");
            return Err(error_from_document(status.max(500), &text, bucket, key));
        }
        Ok(text)
    }
}

fn metadata_headers(content_type: Option<&str>, metadata: &Metadata) -> BTreeMap<String, String> {
    let mut headers: BTreeMap<String, String> = metadata
        .iter()
        .map(|(k, v)| (format!("{}{}", META_HEADER_PREFIX, k.to_ascii_lowercase()), v.clone()))
        .collect();
    if let Some(ct) = content_type {
        headers.insert("content-type".to_string(), ct.to_string());
    }
    headers
}

fn object_info_from_headers(headers: &HeaderMap) -> ObjectInfo {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    let metadata = headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(META_HEADER_PREFIX)?;
            Some((key.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect();

    ObjectInfo {
        size: header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or_default(),
        etag: header("etag").map(|e| normalize_etag(&e)).unwrap_or_default(),
        content_type: header("content-type"),
        last_modified: header("last-modified")
            .and_then(|v| DateTime::parse_from_rfc2822(&v).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now),
        metadata,
    }
}

fn error_from_document(status: u16, body: &str, bucket: &str, key: &str) -> BackendError {
    let doc: Option<ErrorDocument> = quick_xml::de::from_str(body).ok();
    let (code, message) = match doc {
        Some(doc) => (doc.code, doc.message.unwrap_or_default()),
        None if status == 404 => ("NoSuchKey".to_string(), String::new()),
        None => (format!("HTTP{}", status), body.chars().take(200).collect()),
    };

    match code.as_str() {
        "NoSuchKey" => BackendError::NoSuchKey {
            bucket: bucket.to_string(),
            key: key.to_string(),
        },
        "NoSuchBucket" => BackendError::NoSuchBucket(bucket.to_string()),
        "NoSuchUpload" => BackendError::NoSuchUpload(message),
        "InvalidPart" => BackendError::InvalidPart(message),
        "InvalidPartOrder" => BackendError::InvalidPartOrder,
        _ => BackendError::S3 {
            status,
            code,
            message,
        },
    }
}

fn copy_source(bucket: &str, key: &str) -> String {
    signing::canonical_uri(&format!("/{}/{}", bucket, key))
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        metadata: &Metadata,
    ) -> Result<String> {
        let response = self
            .send(
                Method::POST,
                bucket,
                key,
                vec![("uploads".to_string(), String::new())],
                metadata_headers(content_type, metadata),
                Bytes::new(),
            )
            .await?;
        let text = Self::read_checked_body(response, bucket, key).await?;
        let result: InitiateMultipartUploadResult = quick_xml::de::from_str(&text)?;
        Ok(result.upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        let response = self
            .send(
                Method::PUT,
                bucket,
                key,
                vec![
                    ("partNumber".to_string(), part_number.to_string()),
                    ("uploadId".to_string(), upload_id.to_string()),
                ],
                BTreeMap::new(),
                data,
            )
            .await?;
        response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(normalize_etag)
            .ok_or_else(|| BackendError::InvalidResponse("UploadPart response has no ETag".to_string()))
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<String> {
        let body = quick_xml::se::to_string(&CompleteMultipartUpload {
            parts: parts
                .iter()
                .map(|p| CompletePartXml {
                    part_number: p.part_number,
                    etag: format!("\"{}\"", normalize_etag(&p.etag)),
                })
                .collect(),
        })
        .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/xml".to_string());
        let response = self
            .send(
                Method::POST,
                bucket,
                key,
                vec![("uploadId".to_string(), upload_id.to_string())],
                headers,
                Bytes::from(body),
            )
            .await?;
        let text = Self::read_checked_body(response, bucket, key).await?;
        let result: CompleteMultipartUploadResult = quick_xml::de::from_str(&text)?;
        Ok(result.etag.map(|e| normalize_etag(&e)).unwrap_or_default())
    }

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        self.send(
            Method::DELETE,
            bucket,
            key,
            vec![("uploadId".to_string(), upload_id.to_string())],
            BTreeMap::new(),
            Bytes::new(),
        )
        .await?;
        Ok(())
    }

    async fn replace_metadata(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        metadata: &Metadata,
    ) -> Result<()> {
        let mut headers = metadata_headers(content_type, metadata);
        headers.insert("x-amz-copy-source".to_string(), copy_source(bucket, key));
        headers.insert("x-amz-metadata-directive".to_string(), "REPLACE".to_string());

        let response = self
            .send(Method::PUT, bucket, key, Vec::new(), headers, Bytes::new())
            .await?;
        Self::read_checked_body(response, bucket, key).await?;
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
        metadata: &Metadata,
    ) -> Result<String> {
        let response = self
            .send(
                Method::PUT,
                bucket,
                key,
                Vec::new(),
                metadata_headers(content_type, metadata),
                data,
            )
            .await?;
        Ok(object_info_from_headers(response.headers()).etag)
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<StoredObject> {
        let response = self
            .send(Method::GET, bucket, key, Vec::new(), BTreeMap::new(), Bytes::new())
            .await?;
        let mut info = object_info_from_headers(response.headers());
        let data = response.bytes().await?;
        info.size = data.len() as u64;
        Ok(StoredObject { info, data })
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo> {
        let response = self
            .send(Method::HEAD, bucket, key, Vec::new(), BTreeMap::new(), Bytes::new())
            .await?;
        Ok(object_info_from_headers(response.headers()))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.send(Method::DELETE, bucket, key, Vec::new(), BTreeMap::new(), Bytes::new())
            .await?;
        Ok(())
    }
}
