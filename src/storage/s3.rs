//! # S3-Compatible Backend
//!
//! Stores entities in an object store speaking the S3 REST protocol
//! (AWS S3, MinIO, and friends). Vendor SDKs are out of scope, so requests
//! are signed directly with AWS Signature V4 over `reqwest`; the subset in
//! use is GetObject, PutObject, and ListObjectsV2.
//!
//! The key layout mirrors the filesystem backend: `files/<entityID>.json.enc`,
//! `files/<entityID>.meta.json`, `templates/<schemaID>.json`. Writes put the
//! blob first and the metadata sidecar second, relying on the store's
//! read-after-write consistency; a reader that can see the sidecar can see
//! the blob.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::{validate_name, EntityMetadata, StorageBackend, StorageError, StorageResult};

type HmacSha256 = Hmac<Sha256>;

const BLOB_SUFFIX: &str = ".json.enc";
const META_SUFFIX: &str = ".meta.json";

/// Connection parameters for an S3-compatible store.
#[derive(Clone)]
pub struct S3Config {
    /// Endpoint URL, e.g. `https://s3.eu-west-1.amazonaws.com` or a MinIO
    /// address. No trailing slash.
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    /// Path-style addressing (`endpoint/bucket/key`); required by MinIO.
    pub path_style: bool,
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("path_style", &self.path_style)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// Object-store storage backend.
pub struct S3Backend {
    config: S3Config,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    contents: Vec<ListEntry>,
    #[serde(default)]
    is_truncated: bool,
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    key: String,
}

impl S3Backend {
    pub fn new(config: S3Config) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn blob_key(entity_id: &str) -> String {
        format!("files/{}{}", entity_id, BLOB_SUFFIX)
    }

    fn meta_key(entity_id: &str) -> String {
        format!("files/{}{}", entity_id, META_SUFFIX)
    }

    fn template_key(schema_id: &str) -> String {
        format!("templates/{}.json", schema_id)
    }

    /// Request URL and the canonical path used for signing.
    fn locate(&self, key: &str) -> (String, String) {
        if self.config.path_style {
            let path = format!("/{}/{}", self.config.bucket, key);
            (format!("{}{}", self.config.endpoint, path), path)
        } else {
            // Virtual-hosted style: bucket becomes part of the host.
            let (scheme, host) = self
                .config
                .endpoint
                .split_once("://")
                .unwrap_or(("https", self.config.endpoint.as_str()));
            let path = format!("/{}", key);
            (
                format!("{}://{}.{}{}", scheme, self.config.bucket, host, path),
                path,
            )
        }
    }

    fn host_of(url: &str) -> String {
        url.split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(url)
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string()
    }

    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    /// AWS Signature Version 4 for a single request.
    fn sign(
        &self,
        method: &Method,
        canonical_path: &str,
        canonical_query: &str,
        host: &str,
        payload_hash: &str,
        amz_date: &str,
    ) -> String {
        let date_stamp = &amz_date[..8];
        let scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);

        let canonical_headers = format!(
            "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
            host, payload_hash, amz_date
        );
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_path,
            canonical_query,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let k_date = Self::hmac(
            format!("AWS4{}", self.config.secret_key).as_bytes(),
            date_stamp.as_bytes(),
        );
        let k_region = Self::hmac(&k_date, self.config.region.as_bytes());
        let k_service = Self::hmac(&k_region, b"s3");
        let k_signing = Self::hmac(&k_service, b"aws4_request");
        let signature = hex::encode(Self::hmac(&k_signing, string_to_sign.as_bytes()));

        format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.config.access_key, scope, signed_headers, signature
        )
    }

    async fn request(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, String)],
        body: Vec<u8>,
    ) -> StorageResult<reqwest::Response> {
        let (mut url, canonical_path) = self.locate(key);
        let host = Self::host_of(&url);

        // Canonical query string: keys sorted, values URI-encoded.
        let mut pairs: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| (k.to_string(), urlencoding::encode(v).into_owned()))
            .collect();
        pairs.sort();
        let canonical_query = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        if !canonical_query.is_empty() {
            url = format!("{}?{}", url, canonical_query);
        }

        let payload_hash = hex::encode(Sha256::digest(&body));
        let amz_date = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let authorization = self.sign(
            &method,
            &canonical_path,
            &canonical_query,
            &host,
            &payload_hash,
            &amz_date,
        );

        self.client
            .request(method, &url)
            .header("Host", &host)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date)
            .header("Authorization", authorization)
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::ObjectStore(format!("request failed: {}", e)))
    }

    async fn get_object(&self, key: &str, what: &str) -> StorageResult<Vec<u8>> {
        let response = self.request(Method::GET, key, &[], Vec::new()).await?;
        match response.status() {
            StatusCode::OK => response
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| StorageError::ObjectStore(format!("read body: {}", e))),
            StatusCode::NOT_FOUND => Err(StorageError::NotFound(what.to_string())),
            status => Err(StorageError::ObjectStore(format!(
                "get returned {}",
                status
            ))),
        }
    }

    async fn put_object(&self, key: &str, body: Vec<u8>) -> StorageResult<()> {
        let response = self.request(Method::PUT, key, &[], body).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(StorageError::ObjectStore(format!(
                "put returned {}",
                response.status()
            )))
        }
    }

    async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut query: Vec<(&str, String)> = vec![
                ("list-type", "2".to_string()),
                ("prefix", prefix.to_string()),
            ];
            if let Some(token) = &continuation {
                query.push(("continuation-token", token.clone()));
            }

            let response = self.request(Method::GET, "", &query, Vec::new()).await?;
            if !response.status().is_success() {
                return Err(StorageError::ObjectStore(format!(
                    "list returned {}",
                    response.status()
                )));
            }
            let text = response
                .text()
                .await
                .map_err(|e| StorageError::ObjectStore(format!("read body: {}", e)))?;
            let result: ListBucketResult = quick_xml::de::from_str(&text)
                .map_err(|e| StorageError::ObjectStore(format!("parse listing: {}", e)))?;

            keys.extend(result.contents.into_iter().map(|c| c.key));
            if result.is_truncated {
                continuation = result.next_continuation_token;
                if continuation.is_none() {
                    break;
                }
            } else {
                break;
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    async fn write_file(
        &self,
        entity_id: &str,
        blob: &[u8],
        metadata: &EntityMetadata,
    ) -> StorageResult<()> {
        validate_name(entity_id)?;
        let meta_bytes = serde_json::to_vec_pretty(metadata)
            .map_err(|_| StorageError::CorruptMetadata(entity_id.to_string()))?;

        // Blob first, sidecar last; the sidecar publishes the pair.
        self.put_object(&Self::blob_key(entity_id), blob.to_vec())
            .await?;
        self.put_object(&Self::meta_key(entity_id), meta_bytes).await
    }

    async fn read_file(&self, entity_id: &str) -> StorageResult<(Vec<u8>, EntityMetadata)> {
        validate_name(entity_id)?;
        let blob = self.get_object(&Self::blob_key(entity_id), entity_id).await?;
        let meta_bytes = self.get_object(&Self::meta_key(entity_id), entity_id).await?;
        let metadata = serde_json::from_slice(&meta_bytes)
            .map_err(|_| StorageError::CorruptMetadata(entity_id.to_string()))?;
        Ok((blob, metadata))
    }

    async fn read_metadata(&self, entity_id: &str) -> StorageResult<EntityMetadata> {
        validate_name(entity_id)?;
        let meta_bytes = self.get_object(&Self::meta_key(entity_id), entity_id).await?;
        serde_json::from_slice(&meta_bytes)
            .map_err(|_| StorageError::CorruptMetadata(entity_id.to_string()))
    }

    async fn list_files(&self) -> StorageResult<Vec<String>> {
        let keys = self.list_keys("files/").await?;
        let mut ids: Vec<String> = keys
            .iter()
            .filter_map(|k| k.strip_prefix("files/"))
            .filter_map(|k| k.strip_suffix(BLOB_SUFFIX))
            .map(|k| k.to_string())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn write_template(&self, schema_id: &str, bytes: &[u8]) -> StorageResult<()> {
        validate_name(schema_id)?;
        self.put_object(&Self::template_key(schema_id), bytes.to_vec())
            .await
    }

    async fn read_template(&self, schema_id: &str) -> StorageResult<Vec<u8>> {
        validate_name(schema_id)?;
        self.get_object(&Self::template_key(schema_id), schema_id)
            .await
    }

    async fn list_templates(&self) -> StorageResult<Vec<String>> {
        let keys = self.list_keys("templates/").await?;
        let mut ids: Vec<String> = keys
            .iter()
            .filter_map(|k| k.strip_prefix("templates/"))
            .filter_map(|k| k.strip_suffix(".json"))
            .map(|k| k.to_string())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn blob_path(&self, entity_id: &str) -> String {
        format!("s3://{}/{}", self.config.bucket, Self::blob_key(entity_id))
    }

    fn meta_path(&self, entity_id: &str) -> String {
        format!("s3://{}/{}", self.config.bucket, Self::meta_key(entity_id))
    }
}
