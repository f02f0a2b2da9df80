//! Amazon S3 object store.
//!
//! Talks to the S3 REST API directly with AWS Signature V4 authentication
//! (`hmac` + `sha2`, no C dependencies). Supports `ListObjectsV2`
//! pagination, glob filtering on keys relative to the prefix, and custom
//! endpoints for S3-compatible services (MinIO, LocalStack), which are
//! addressed path-style.
//!
//! # Configuration
//!
//! ```toml
//! [storage.s3]
//! bucket = "acme-landing"
//! prefix = "data/input/"
//! region = "us-east-1"
//! include_globs = ["**/*.csv", "**/*.json"]
//! # endpoint_url = "http://localhost:9000"   # MinIO
//! ```
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID`: required
//! - `AWS_SECRET_ACCESS_KEY`: required
//! - `AWS_SESSION_TOKEN`: optional (temporary credentials / IAM roles)

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Method;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::S3StorageConfig;
use crate::error::{LoadError, Step};
use crate::models::ObjectDescriptor;
use crate::storage::{relative_key, KeyFilter, ObjectStore};

type HmacSha256 = Hmac<Sha256>;

/// Payload hash of an empty body.
const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

pub struct S3Store {
    config: S3StorageConfig,
    creds: AwsCredentials,
    filter: KeyFilter,
    client: reqwest::Client,
}

impl S3Store {
    /// Build a store with credentials from the environment.
    pub fn from_env(config: S3StorageConfig) -> Result<Self> {
        let creds = AwsCredentials::from_env()?;
        Self::new(config, creds)
    }

    pub fn new(config: S3StorageConfig, creds: AwsCredentials) -> Result<Self> {
        let filter = KeyFilter::new(&config.include_globs, &config.exclude_globs)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config,
            creds,
            filter,
            client,
        })
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::for_config(&self.config)
    }

    /// Send one signed request and return the response if it succeeded.
    async fn send(
        &self,
        step: Step,
        method: Method,
        key: Option<&str>,
        query: &[(String, String)],
        extra_headers: Vec<(String, String)>,
    ) -> Result<reqwest::Response, LoadError> {
        let endpoint = self.endpoint();
        let canonical_uri = endpoint.canonical_uri(key);

        let mut sorted_query = query.to_vec();
        sorted_query.sort();
        let canonical_query: String = sorted_query
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let headers = sign_request(
            &self.creds,
            &self.config.region,
            &endpoint.host,
            method.as_str(),
            &canonical_uri,
            &canonical_query,
            extra_headers,
            Utc::now(),
        );

        let mut url = format!("{}://{}{}", endpoint.scheme, endpoint.host, canonical_uri);
        if !canonical_query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query);
        }

        let mut req = self.client.request(method, &url);
        for (name, value) in &headers {
            if name != "host" {
                req = req.header(name.as_str(), value.as_str());
            }
        }

        let resp = req
            .send()
            .await
            .map_err(|e| LoadError::from_reqwest(step, e))?;

        if resp.status().is_success() {
            Ok(resp)
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(LoadError::from_status(step, status, &body))
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn name(&self) -> &str {
        "s3"
    }

    async fn list(&self) -> Result<Vec<ObjectDescriptor>, LoadError> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !self.config.prefix.is_empty() {
                query.push(("prefix".to_string(), self.config.prefix.clone()));
            }
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let resp = self
                .send(Step::List, Method::GET, None, &query, Vec::new())
                .await?;
            let xml = resp
                .text()
                .await
                .map_err(|e| LoadError::from_reqwest(Step::List, e))?;
            let page = parse_list_objects_response(&xml);
            debug!(
                bucket = %self.config.bucket,
                count = page.objects.len(),
                truncated = page.is_truncated,
                "listed page"
            );

            objects.extend(
                page.objects
                    .into_iter()
                    .filter(|o| self.filter.matches(relative_key(&o.key, &self.config.prefix))),
            );

            match (page.is_truncated, page.next_token) {
                (true, Some(token)) => continuation_token = Some(token),
                _ => break,
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn size_of(&self, key: &str) -> Result<u64, LoadError> {
        let resp = self
            .send(Step::Size, Method::HEAD, Some(key), &[], Vec::new())
            .await?;
        resp.headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| LoadError::fatal(Step::Size, format!("no Content-Length for '{}'", key)))
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>, LoadError> {
        let resp = self
            .send(Step::Fetch, Method::GET, Some(key), &[], Vec::new())
            .await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| LoadError::from_reqwest(Step::Fetch, e))?;
        Ok(bytes.to_vec())
    }

    fn location(&self, key: &str) -> String {
        format!("s3://{}/{}", self.config.bucket, key)
    }

    async fn archive(&self, key: &str, archive_key: &str) -> Result<(), LoadError> {
        let copy_source = format!("/{}/{}", self.config.bucket, encode_key(key));
        self.send(
            Step::Archive,
            Method::PUT,
            Some(archive_key),
            &[],
            vec![("x-amz-copy-source".to_string(), copy_source)],
        )
        .await?;
        self.send(Step::Archive, Method::DELETE, Some(key), &[], Vec::new())
            .await?;
        Ok(())
    }
}

// ============ AWS Credentials ============

/// AWS credentials loaded from environment variables.
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl AwsCredentials {
    /// Load credentials from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
    /// and optionally `AWS_SESSION_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

// ============ Addressing ============

struct Endpoint {
    scheme: String,
    host: String,
    /// `Some(bucket)` for path-style addressing.
    path_bucket: Option<String>,
}

impl Endpoint {
    /// Virtual-hosted `https://<bucket>.s3.<region>.amazonaws.com`, or
    /// path-style against a custom endpoint.
    fn for_config(config: &S3StorageConfig) -> Self {
        match &config.endpoint_url {
            Some(endpoint) => {
                let (scheme, rest) = match endpoint.split_once("://") {
                    Some((scheme, rest)) => (scheme.to_string(), rest),
                    None => ("https".to_string(), endpoint.as_str()),
                };
                Self {
                    scheme,
                    host: rest.trim_end_matches('/').to_string(),
                    path_bucket: Some(config.bucket.clone()),
                }
            }
            None => Self {
                scheme: "https".to_string(),
                host: format!("{}.s3.{}.amazonaws.com", config.bucket, config.region),
                path_bucket: None,
            },
        }
    }

    fn canonical_uri(&self, key: Option<&str>) -> String {
        let mut uri = String::from("/");
        if let Some(bucket) = &self.path_bucket {
            uri.push_str(&uri_encode(bucket));
            if key.is_some() {
                uri.push('/');
            }
        }
        if let Some(key) = key {
            uri.push_str(&encode_key(key));
        }
        uri
    }
}

// ============ AWS SigV4 Helpers ============

/// Produce the full header set for a SigV4-signed request with an empty
/// payload: `host`, `x-amz-*`, any `extra_headers`, and `authorization`.
#[allow(clippy::too_many_arguments)]
pub fn sign_request(
    creds: &AwsCredentials,
    region: &str,
    host: &str,
    method: &str,
    canonical_uri: &str,
    canonical_query: &str,
    extra_headers: Vec<(String, String)>,
    now: DateTime<Utc>,
) -> Vec<(String, String)> {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

    let mut headers = vec![
        ("host".to_string(), host.to_string()),
        ("x-amz-content-sha256".to_string(), EMPTY_SHA256.to_string()),
        ("x-amz-date".to_string(), amz_date.clone()),
    ];
    if let Some(ref token) = creds.session_token {
        headers.push(("x-amz-security-token".to_string(), token.clone()));
    }
    headers.extend(
        extra_headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string())),
    );
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let signed_headers: String = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method, canonical_uri, canonical_query, canonical_headers, signed_headers, EMPTY_SHA256
    );

    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(&creds.secret_access_key, &date_stamp, region, "s3");
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    headers.push((
        "authorization".to_string(),
        format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key_id, credential_scope, signed_headers, signature
        ),
    ));
    headers
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode per RFC 3986: everything but `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

/// Encode an object key segment by segment, keeping `/` separators.
fn encode_key(key: &str) -> String {
    key.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

// ============ XML Parsing ============

struct ListPage {
    objects: Vec<ObjectDescriptor>,
    is_truncated: bool,
    next_token: Option<String>,
}

/// Parse a `ListObjectsV2` response. Directory markers (keys ending in
/// `/`) are dropped.
fn parse_list_objects_response(xml: &str) -> ListPage {
    let mut objects = Vec::new();
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        remaining = &remaining[block_start + end + "</Contents>".len()..];

        let key = extract_xml_value(block, "Key").unwrap_or_default();
        if key.is_empty() || key.ends_with('/') {
            continue;
        }
        let size = extract_xml_value(block, "Size")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let last_modified = extract_xml_value(block, "LastModified")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        objects.push(ObjectDescriptor {
            key,
            size,
            last_modified,
        });
    }

    ListPage {
        objects,
        is_truncated,
        next_token,
    }
}

/// Text content of a simple, non-nested XML tag, entity-decoded.
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(unescape_xml(&xml[start..start + end]))
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
