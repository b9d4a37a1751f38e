//! Azure Blob Storage implementation of [`BlobStore`].
//!
//! Talks to the Blob service REST API directly with `reqwest`.  Every
//! request is either signed with Shared Key (HMAC-SHA256 over the
//! canonicalized request) or carries a SAS token in the query string.
//!
//! Failures are classified from the HTTP status plus the
//! `x-ms-error-code` header, so callers only ever see [`StoreError`].
//!
//! Operation mapping:
//!   containers      -> `?restype=container` (+ `comp=acl|metadata|lease`)
//!   listing         -> `GET /?comp=list`, following `NextMarker`
//!   ranged reads    -> `GET` with `x-ms-range`
//!   buffered writes -> Put Block (`comp=block`) + Put Block List
//!   leases          -> `comp=lease` with `x-ms-lease-action`
//!
//! Leasing a blob name that does not exist yet first creates an empty
//! placeholder blob.  If the lease is released without a block list ever
//! being committed under it, the placeholder is deleted again, so a failed
//! first write leaves the name absent.  While the write is in progress the
//! placeholder is visible to readers as a 0-byte blob, and a handle that is
//! dropped without closing leaves it behind once the lease expires.
//!
//! Credentials are resolved from config first, then from:
//!   - `AZURE_STORAGE_KEY` (Shared Key)
//!   - `AZURE_STORAGE_CONNECTION_STRING` (its `AccountKey=` part)
//!   - `AZURE_STORAGE_SAS_TOKEN`

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use reqwest::header::HeaderMap;
use reqwest::{Method, Response, StatusCode};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::xml::{parse_container_listing, render_block_list};
use super::{
    BlobProperties, BlobStore, ContainerAttributes, ContainerProperties, PublicAccess,
    StoreError, StoreFuture, StoreResult,
};
use crate::config::AzureStorageConfig;

/// Azure REST API version used for all requests.
const AZURE_API_VERSION: &str = "2023-11-03";

/// Bounds the service accepts for a finite lease, in seconds.
const MIN_LEASE_SECS: u64 = 15;
const MAX_LEASE_SECS: u64 = 60;

/// Lease taken on a container while its metadata is rewritten.
const METADATA_LEASE_SECS: u64 = 15;

/// Prefix of user metadata headers.
const META_PREFIX: &str = "x-ms-meta-";

/// Percent-encoding set for blob paths: encode everything except
/// unreserved characters and '/'.
const AZURE_BLOB_ENCODE_SET: percent_encoding::AsciiSet = percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Percent-encoding set for query values (block IDs, markers).
const QUERY_ENCODE_SET: percent_encoding::AsciiSet = percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Store backed by one Azure storage account.
pub struct AzureStore {
    /// HTTP client for Blob REST API calls.
    client: reqwest::Client,
    /// Storage account name.
    account: String,
    /// Blob service endpoint without a trailing slash.
    base_url: String,
    /// Authentication method.
    auth: AzureAuth,
    /// Leases held on placeholder blobs that nothing was committed to yet.
    placeholders: Placeholders,
}

/// Lease tokens whose blob is a placeholder this store created.
#[derive(Debug, Default)]
struct Placeholders {
    tokens: DashSet<String>,
}

impl Placeholders {
    /// The blob leased by `token` is a fresh placeholder.
    fn created(&self, token: &str) {
        self.tokens.insert(token.to_string());
    }

    /// A block list was committed under `token`; the blob is real now.
    fn committed(&self, token: &str) {
        self.tokens.remove(token);
    }

    /// Forget `token`, returning whether its blob is still a placeholder.
    fn take_uncommitted(&self, token: &str) -> bool {
        self.tokens.remove(token).is_some()
    }
}

/// Azure authentication method.
#[derive(Debug, PartialEq, Eq)]
enum AzureAuth {
    /// Shared Key authentication using the storage account key.
    SharedKey { key_bytes: Vec<u8> },
    /// SAS token authentication (appended as query parameter).
    SasToken { token: String },
}

/// Container and optional blob a request targets.  `None` for the
/// service itself (container listing).
#[derive(Debug, Clone, Copy)]
struct Target<'a> {
    container: Option<&'a str>,
    blob: Option<&'a str>,
}

impl<'a> Target<'a> {
    fn service() -> Self {
        Self {
            container: None,
            blob: None,
        }
    }

    fn container(container: &'a str) -> Self {
        Self {
            container: Some(container),
            blob: None,
        }
    }

    fn blob(container: &'a str, blob: &'a str) -> Self {
        Self {
            container: Some(container),
            blob: Some(blob),
        }
    }

    /// Unencoded path, as used in the canonicalized resource.
    fn path(&self) -> String {
        match (self.container, self.blob) {
            (None, _) => "/".to_string(),
            (Some(c), None) => format!("/{c}"),
            (Some(c), Some(b)) => format!("/{c}/{b}"),
        }
    }

    /// Percent-encoded path for the request URL.
    fn encoded_path(&self) -> String {
        match (self.container, self.blob) {
            (None, _) => "/".to_string(),
            (Some(c), None) => format!("/{c}"),
            (Some(c), Some(b)) => format!(
                "/{c}/{}",
                percent_encoding::utf8_percent_encode(b, &AZURE_BLOB_ENCODE_SET)
            ),
        }
    }
}

impl AzureStore {
    /// Create a store for the account in `config`.
    ///
    /// Fails if no credentials can be found in the config or environment.
    pub fn new(config: &AzureStorageConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        let base_url = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", config.account))
            .trim_end_matches('/')
            .to_string();

        let auth = Self::resolve_auth(config)?;

        info!(
            "Azure blob store initialized: account={} endpoint={}",
            config.account, base_url
        );

        Ok(Self {
            client,
            account: config.account.clone(),
            base_url,
            auth,
            placeholders: Placeholders::default(),
        })
    }

    /// Resolve credentials: config values win over environment variables.
    fn resolve_auth(config: &AzureStorageConfig) -> anyhow::Result<AzureAuth> {
        if !config.connection_string.is_empty() {
            return Self::auth_from_parts(None, Some(&config.connection_string), None);
        }
        if !config.sas_token.is_empty() {
            return Self::auth_from_parts(None, None, Some(&config.sas_token));
        }
        let key = std::env::var("AZURE_STORAGE_KEY").ok();
        let conn = std::env::var("AZURE_STORAGE_CONNECTION_STRING").ok();
        let sas = std::env::var("AZURE_STORAGE_SAS_TOKEN").ok();
        Self::auth_from_parts(key.as_deref(), conn.as_deref(), sas.as_deref())
    }

    /// Pick an auth method from raw credential sources, in priority order.
    fn auth_from_parts(
        key: Option<&str>,
        connection_string: Option<&str>,
        sas: Option<&str>,
    ) -> anyhow::Result<AzureAuth> {
        if let Some(key) = key {
            let key_bytes = BASE64_STANDARD.decode(key).map_err(|e| {
                anyhow::anyhow!("Invalid AZURE_STORAGE_KEY (not valid base64): {}", e)
            })?;
            return Ok(AzureAuth::SharedKey { key_bytes });
        }

        if let Some(conn_str) = connection_string {
            for part in conn_str.split(';') {
                if let Some(key_val) = part.trim().strip_prefix("AccountKey=") {
                    let key_bytes = BASE64_STANDARD.decode(key_val).map_err(|e| {
                        anyhow::anyhow!("Invalid AccountKey in connection string: {}", e)
                    })?;
                    return Ok(AzureAuth::SharedKey { key_bytes });
                }
            }
            for part in conn_str.split(';') {
                if let Some(sas) = part.trim().strip_prefix("SharedAccessSignature=") {
                    let token = sas.strip_prefix('?').unwrap_or(sas).to_string();
                    return Ok(AzureAuth::SasToken { token });
                }
            }
        }

        if let Some(sas) = sas {
            let token = sas.strip_prefix('?').unwrap_or(sas).to_string();
            return Ok(AzureAuth::SasToken { token });
        }

        Err(anyhow::anyhow!(
            "No Azure credentials found. Set storage.azure.connection_string, \
             storage.azure.sas_token, AZURE_STORAGE_KEY, \
             AZURE_STORAGE_CONNECTION_STRING, or AZURE_STORAGE_SAS_TOKEN."
        ))
    }

    /// Base64 of the raw MD5 digest, as sent in `Content-MD5`.
    fn content_md5(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        BASE64_STANDARD.encode(hasher.finalize())
    }

    /// Get the current UTC date in RFC 1123 format for Azure headers.
    fn rfc1123_date() -> String {
        use std::time::SystemTime;
        httpdate::fmt_http_date(SystemTime::now())
    }

    /// `x-ms-range` value for `len` bytes from `offset`.  `len` must be > 0.
    fn range_header(offset: u64, len: u64) -> String {
        let end = offset.saturating_add(len - 1);
        format!("bytes={offset}-{end}")
    }

    /// `x-ms-lease-duration` value; finite leases are clamped to what the
    /// service accepts.
    fn lease_duration_header(duration: Option<Duration>) -> String {
        match duration {
            None => "-1".to_string(),
            Some(d) => d.as_secs().clamp(MIN_LEASE_SECS, MAX_LEASE_SECS).to_string(),
        }
    }

    /// `x-ms-blob-public-access` value, `None` for private containers.
    fn public_access_header(access: PublicAccess) -> Option<&'static str> {
        match access {
            PublicAccess::Public => Some("container"),
            PublicAccess::BlobOnly => Some("blob"),
            PublicAccess::Private => None,
        }
    }

    /// Build the Shared Key string-to-sign.
    ///
    /// ```text
    /// VERB\n
    /// Content-Encoding\n
    /// Content-Language\n
    /// Content-Length\n
    /// Content-MD5\n
    /// Content-Type\n
    /// Date\n
    /// If-Modified-Since\n
    /// If-Match\n
    /// If-None-Match\n
    /// If-Unmodified-Since\n
    /// Range\n
    /// CanonicalizedHeaders\n
    /// CanonicalizedResource
    /// ```
    ///
    /// `x-ms-date` replaces `Date`, so that slot stays empty.
    fn string_to_sign(
        account: &str,
        method: &str,
        path: &str,
        content_length: usize,
        content_type: &str,
        headers: &[(String, String)],
        query: &[(&str, String)],
    ) -> String {
        let standard = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
                .unwrap_or("")
        };

        // Content-Length: empty for 0.
        let content_length_str = match content_length {
            0 => String::new(),
            len => len.to_string(),
        };

        let mut ms_headers: Vec<(String, &str)> = headers
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.as_str()))
            .filter(|(k, _)| k.starts_with("x-ms-"))
            .collect();
        ms_headers.sort_by(|a, b| a.0.cmp(&b.0));
        let canonicalized_headers: String = ms_headers
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v.trim()))
            .collect::<Vec<_>>()
            .join("\n");

        // Unencoded path; query parameters sorted by lowercased name.
        let mut canonicalized_resource = format!("/{account}{path}");
        let mut params: Vec<(String, &str)> = query
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.as_str()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        for (k, v) in &params {
            canonicalized_resource.push_str(&format!("\n{k}:{v}"));
        }

        format!(
            "{}\n\n\n{}\n{}\n{}\n\n\n{}\n{}\n\n\n{}\n{}",
            method,
            content_length_str,
            standard("Content-MD5"),
            content_type,
            standard("If-Match"),
            standard("If-None-Match"),
            canonicalized_headers,
            canonicalized_resource
        )
    }

    /// Sign a request and return the `Authorization` header value.
    fn sign(key_bytes: &[u8], account: &str, string_to_sign: &str) -> StoreResult<String> {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(key_bytes)
            .map_err(|e| StoreError::InvalidRequest(format!("HMAC key error: {e}")))?;
        mac.update(string_to_sign.as_bytes());
        let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());
        Ok(format!("SharedKey {account}:{signature}"))
    }

    /// Full request URL, with a SAS token appended when using SAS auth.
    fn url(&self, target: &Target<'_>, query: &[(&str, String)]) -> String {
        let mut url = format!("{}{}", self.base_url, target.encoded_path());
        let mut sep = '?';
        for (k, v) in query {
            url.push(sep);
            url.push_str(k);
            url.push('=');
            url.push_str(&percent_encoding::utf8_percent_encode(v, &QUERY_ENCODE_SET).to_string());
            sep = '&';
        }
        if let AzureAuth::SasToken { token } = &self.auth {
            url.push(sep);
            url.push_str(token);
        }
        url
    }

    /// Send one request.  Transport failures (including timeouts) are
    /// transient; the response is returned whatever its status.
    async fn send(
        &self,
        method: Method,
        target: Target<'_>,
        query: &[(&str, String)],
        extra_headers: Vec<(String, String)>,
        body: Option<(Bytes, &str)>,
    ) -> StoreResult<Response> {
        let date = Self::rfc1123_date();
        let mut headers = vec![
            ("x-ms-date".to_string(), date),
            ("x-ms-version".to_string(), AZURE_API_VERSION.to_string()),
        ];
        headers.extend(extra_headers);

        let url = self.url(&target, query);
        let mut req = self.client.request(method.clone(), url.as_str());
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let (content_length, content_type) = match &body {
            Some((data, ct)) => (data.len(), *ct),
            None => (0, ""),
        };
        if let AzureAuth::SharedKey { key_bytes } = &self.auth {
            let to_sign = Self::string_to_sign(
                &self.account,
                method.as_str(),
                &target.path(),
                content_length,
                content_type,
                &headers,
                query,
            );
            req = req.header("Authorization", Self::sign(key_bytes, &self.account, &to_sign)?);
        }
        match body {
            Some((data, ct)) => req = req.header("Content-Type", ct).body(data),
            None if method == Method::PUT => req = req.body(Bytes::new()),
            None => {}
        }

        debug!(method = %method, path = %target.path(), "azure request");
        req.send()
            .await
            .map_err(|e| StoreError::Transient(format!("{} {}: {}", method, target.path(), e)))
    }

    /// Pass successful responses through; classify the rest.
    async fn check(resp: Response, what: &str) -> StoreResult<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let code = resp
            .headers()
            .get("x-ms-error-code")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await.unwrap_or_default();
        Err(Self::classify(status, code.as_deref(), &body, what))
    }

    /// Map an Azure error response to a [`StoreError`].
    fn classify(status: StatusCode, code: Option<&str>, body: &str, what: &str) -> StoreError {
        let code_str = code.unwrap_or("");
        let detail = if body.is_empty() {
            format!("Azure {what}: HTTP {status} {code_str}")
        } else {
            let snippet: String = body.chars().take(256).collect();
            format!("Azure {what}: HTTP {status} {code_str} - {snippet}")
        };
        let is_lease_code = code_str.starts_with("Lease");
        match status {
            StatusCode::NOT_FOUND => StoreError::NotFound(detail),
            StatusCode::CONFLICT if is_lease_code => StoreError::LeaseConflict(detail),
            StatusCode::CONFLICT if code_str.ends_with("AlreadyExists") => {
                StoreError::AlreadyExists(detail)
            }
            StatusCode::PRECONDITION_FAILED if is_lease_code => StoreError::LeaseConflict(detail),
            StatusCode::PRECONDITION_FAILED => StoreError::PreconditionFailed(detail),
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
                StoreError::PermissionDenied(detail)
            }
            StatusCode::BAD_REQUEST | StatusCode::RANGE_NOT_SATISFIABLE => {
                StoreError::InvalidRequest(detail)
            }
            _ => StoreError::Transient(detail),
        }
    }

    fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
        headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Collect `x-ms-meta-*` headers into a metadata map.
    fn metadata_from_headers(headers: &HeaderMap) -> HashMap<String, String> {
        headers
            .iter()
            .filter_map(|(name, value)| {
                let key = name.as_str().strip_prefix(META_PREFIX)?;
                let value = value.to_str().ok()?;
                Some((key.to_string(), value.to_string()))
            })
            .collect()
    }

    /// Metadata as request headers.  Keys must be identifiers and values
    /// printable ASCII, which is what the service accepts.
    fn metadata_headers(metadata: &HashMap<String, String>) -> StoreResult<Vec<(String, String)>> {
        let mut out = Vec::with_capacity(metadata.len());
        for (key, value) in metadata {
            let valid_key = key
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid_key {
                return Err(StoreError::InvalidRequest(format!(
                    "metadata key {key:?} is not an identifier"
                )));
            }
            if !value.chars().all(|c| c == ' ' || c.is_ascii_graphic()) {
                return Err(StoreError::InvalidRequest(format!(
                    "metadata value for {key:?} is not printable ASCII"
                )));
            }
            out.push((format!("{META_PREFIX}{}", key.to_lowercase()), value.clone()));
        }
        Ok(out)
    }

    fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
        httpdate::parse_http_date(value).ok().map(DateTime::<Utc>::from)
    }

    fn last_modified(headers: &HeaderMap) -> StoreResult<DateTime<Utc>> {
        Self::header_str(headers, "last-modified")
            .and_then(Self::parse_http_date)
            .ok_or_else(|| StoreError::InvalidRequest("missing or bad Last-Modified".to_string()))
    }

    fn etag(headers: &HeaderMap) -> String {
        Self::header_str(headers, "etag").unwrap_or_default().to_string()
    }

    fn container_attributes_from_headers(
        container: &str,
        headers: &HeaderMap,
    ) -> StoreResult<ContainerAttributes> {
        let last_modified = Self::last_modified(headers)?;
        Ok(ContainerAttributes {
            properties: ContainerProperties {
                name: container.to_string(),
                created: last_modified,
                last_modified,
            },
            metadata: Self::metadata_from_headers(headers),
            etag: Self::etag(headers),
        })
    }

    fn blob_properties_from_headers(
        container: &str,
        blob: &str,
        headers: &HeaderMap,
    ) -> StoreResult<BlobProperties> {
        let size = Self::header_str(headers, "content-length")
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| StoreError::InvalidRequest("missing Content-Length".to_string()))?;
        Ok(BlobProperties {
            container: container.to_string(),
            blob: blob.to_string(),
            size,
            etag: Self::etag(headers),
            last_modified: Self::last_modified(headers)?,
            metadata: Self::metadata_from_headers(headers),
            leased: Self::header_str(headers, "x-ms-lease-state") == Some("leased"),
        })
    }

    fn lease_header(token: &str) -> (String, String) {
        ("x-ms-lease-id".to_string(), token.to_string())
    }

    fn lease_action(action: &str) -> (String, String) {
        ("x-ms-lease-action".to_string(), action.to_string())
    }

    fn container_query(comp: Option<&str>) -> Vec<(&'static str, String)> {
        let mut query = vec![("restype", "container".to_string())];
        if let Some(comp) = comp {
            query.push(("comp", comp.to_string()));
        }
        query
    }

    // -- Blob REST API operations ---------------------------------------------

    async fn azure_container_head(&self, container: &str) -> StoreResult<Response> {
        let resp = self
            .send(
                Method::HEAD,
                Target::container(container),
                &Self::container_query(None),
                Vec::new(),
                None,
            )
            .await?;
        Self::check(resp, "get container properties").await
    }

    async fn azure_put_metadata(
        &self,
        container: &str,
        metadata: &HashMap<String, String>,
        lease: Option<&str>,
    ) -> StoreResult<String> {
        let mut headers = Self::metadata_headers(metadata)?;
        if let Some(token) = lease {
            headers.push(Self::lease_header(token));
        }
        let resp = self
            .send(
                Method::PUT,
                Target::container(container),
                &Self::container_query(Some("metadata")),
                headers,
                None,
            )
            .await?;
        let resp = Self::check(resp, "set container metadata").await?;
        Ok(Self::etag(resp.headers()))
    }

    async fn azure_lease(
        &self,
        target: Target<'_>,
        query: &[(&str, String)],
        headers: Vec<(String, String)>,
        what: &str,
    ) -> StoreResult<HeaderMap> {
        let resp = self.send(Method::PUT, target, query, headers, None).await?;
        let resp = Self::check(resp, what).await?;
        Ok(resp.headers().clone())
    }

    async fn azure_acquire_blob_lease(
        &self,
        container: &str,
        blob: &str,
        duration: Option<Duration>,
    ) -> StoreResult<String> {
        let headers = self
            .azure_lease(
                Target::blob(container, blob),
                &[("comp", "lease".to_string())],
                vec![
                    Self::lease_action("acquire"),
                    (
                        "x-ms-lease-duration".to_string(),
                        Self::lease_duration_header(duration),
                    ),
                ],
                "acquire lease",
            )
            .await?;
        Self::header_str(&headers, "x-ms-lease-id")
            .map(str::to_string)
            .ok_or_else(|| StoreError::InvalidRequest("lease response without id".to_string()))
    }

    /// Create an empty blob unless one exists, so a lease can be taken on
    /// a name that has never been written.  Returns whether this call
    /// created it.
    async fn azure_create_placeholder(&self, container: &str, blob: &str) -> StoreResult<bool> {
        let resp = self
            .send(
                Method::PUT,
                Target::blob(container, blob),
                &[],
                vec![
                    ("x-ms-blob-type".to_string(), "BlockBlob".to_string()),
                    ("If-None-Match".to_string(), "*".to_string()),
                ],
                None,
            )
            .await?;
        match Self::check(resp, "create placeholder blob").await {
            Ok(_) => Ok(true),
            // Someone else created it first; leasing decides who writes.
            Err(StoreError::AlreadyExists(_) | StoreError::PreconditionFailed(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete a leased blob.  The delete also ends the lease.
    async fn azure_delete_leased_blob(
        &self,
        container: &str,
        blob: &str,
        token: &str,
    ) -> StoreResult<()> {
        let resp = self
            .send(
                Method::DELETE,
                Target::blob(container, blob),
                &[],
                vec![Self::lease_header(token)],
                None,
            )
            .await?;
        match Self::check(resp, "delete placeholder blob").await {
            Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl BlobStore for AzureStore {
    fn list_containers(&self) -> StoreFuture<'_, Vec<String>> {
        Box::pin(async move {
            let mut names = Vec::new();
            let mut marker: Option<String> = None;
            loop {
                let mut query = vec![("comp", "list".to_string())];
                if let Some(m) = &marker {
                    query.push(("marker", m.clone()));
                }
                let resp = self
                    .send(Method::GET, Target::service(), &query, Vec::new(), None)
                    .await?;
                let resp = Self::check(resp, "list containers").await?;
                let body = resp
                    .text()
                    .await
                    .map_err(|e| StoreError::Transient(format!("list containers body: {e}")))?;
                let page = parse_container_listing(&body).map_err(|e| {
                    StoreError::InvalidRequest(format!("bad list containers response: {e}"))
                })?;
                names.extend(page.names().map(str::to_string));
                match page.continuation() {
                    Some(next) => marker = Some(next.to_string()),
                    None => break,
                }
            }
            names.sort();
            Ok(names)
        })
    }

    fn container_exists<'a>(&'a self, container: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            match self.azure_container_head(container).await {
                Ok(_) => Ok(true),
                Err(StoreError::NotFound(_)) => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    fn create_container<'a>(
        &'a self,
        container: &'a str,
        access: PublicAccess,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut headers = Vec::new();
            if let Some(level) = Self::public_access_header(access) {
                headers.push(("x-ms-blob-public-access".to_string(), level.to_string()));
            }
            let resp = self
                .send(
                    Method::PUT,
                    Target::container(container),
                    &Self::container_query(None),
                    headers,
                    None,
                )
                .await?;
            Self::check(resp, "create container").await?;
            info!(container, "container created");
            Ok(())
        })
    }

    fn set_container_access<'a>(
        &'a self,
        container: &'a str,
        access: PublicAccess,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut headers = Vec::new();
            if let Some(level) = Self::public_access_header(access) {
                headers.push(("x-ms-blob-public-access".to_string(), level.to_string()));
            }
            let resp = self
                .send(
                    Method::PUT,
                    Target::container(container),
                    &Self::container_query(Some("acl")),
                    headers,
                    None,
                )
                .await?;
            Self::check(resp, "set container acl").await?;
            Ok(())
        })
    }

    fn delete_container<'a>(&'a self, container: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let resp = self
                .send(
                    Method::DELETE,
                    Target::container(container),
                    &Self::container_query(None),
                    Vec::new(),
                    None,
                )
                .await?;
            Self::check(resp, "delete container").await?;
            info!(container, "container deleted");
            Ok(())
        })
    }

    fn container_attributes<'a>(
        &'a self,
        container: &'a str,
    ) -> StoreFuture<'a, ContainerAttributes> {
        Box::pin(async move {
            let resp = self.azure_container_head(container).await?;
            Self::container_attributes_from_headers(container, resp.headers())
        })
    }

    /// A conditional update holds a short container lease across the etag
    /// check and the upload, since Set Container Metadata has no `If-Match`.
    fn set_container_metadata<'a>(
        &'a self,
        container: &'a str,
        metadata: HashMap<String, String>,
        if_match: Option<&'a str>,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let Some(expected) = if_match else {
                return self.azure_put_metadata(container, &metadata, None).await;
            };

            let lease_query = Self::container_query(Some("lease"));
            let acquired = self
                .azure_lease(
                    Target::container(container),
                    &lease_query,
                    vec![
                        Self::lease_action("acquire"),
                        (
                            "x-ms-lease-duration".to_string(),
                            METADATA_LEASE_SECS.to_string(),
                        ),
                    ],
                    "acquire container lease",
                )
                .await
                .map_err(|e| match e {
                    StoreError::LeaseConflict(msg) => StoreError::PreconditionFailed(msg),
                    other => other,
                })?;
            let token = Self::header_str(&acquired, "x-ms-lease-id")
                .map(str::to_string)
                .ok_or_else(|| {
                    StoreError::InvalidRequest("lease response without id".to_string())
                })?;

            let result: StoreResult<String> = async {
                let current = self.azure_container_head(container).await?;
                let etag = Self::etag(current.headers());
                if etag != expected {
                    return Err(StoreError::PreconditionFailed(format!(
                        "container {container} etag is {etag}, expected {expected}"
                    )));
                }
                self.azure_put_metadata(container, &metadata, Some(&token))
                    .await
            }
            .await;

            let released = self
                .azure_lease(
                    Target::container(container),
                    &lease_query,
                    vec![Self::lease_action("release"), Self::lease_header(&token)],
                    "release container lease",
                )
                .await;
            if let Err(e) = released {
                warn!(container, error = %e, "failed to release container metadata lease");
            }
            result
        })
    }

    fn blob_properties<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
    ) -> StoreFuture<'a, BlobProperties> {
        Box::pin(async move {
            let resp = self
                .send(
                    Method::HEAD,
                    Target::blob(container, blob),
                    &[],
                    Vec::new(),
                    None,
                )
                .await?;
            let resp = Self::check(resp, "get blob properties").await?;
            Self::blob_properties_from_headers(container, blob, resp.headers())
        })
    }

    fn read_range<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        offset: u64,
        len: u64,
        if_match: Option<&'a str>,
    ) -> StoreFuture<'a, Bytes> {
        Box::pin(async move {
            if len == 0 {
                return Ok(Bytes::new());
            }
            let mut headers = vec![("x-ms-range".to_string(), Self::range_header(offset, len))];
            if let Some(etag) = if_match {
                headers.push(("If-Match".to_string(), etag.to_string()));
            }
            let resp = self
                .send(
                    Method::GET,
                    Target::blob(container, blob),
                    &[],
                    headers,
                    None,
                )
                .await?;
            if resp.status() == StatusCode::RANGE_NOT_SATISFIABLE {
                return Ok(Bytes::new());
            }
            let resp = Self::check(resp, "get blob").await?;
            resp.bytes()
                .await
                .map_err(|e| StoreError::Transient(format!("get blob body: {e}")))
        })
    }

    fn stage_block<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        block_id: &'a str,
        data: Bytes,
        lease: Option<&'a str>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut headers = vec![("Content-MD5".to_string(), Self::content_md5(&data))];
            if let Some(token) = lease {
                headers.push(Self::lease_header(token));
            }
            let query = [
                ("blockid", block_id.to_string()),
                ("comp", "block".to_string()),
            ];
            let resp = self
                .send(
                    Method::PUT,
                    Target::blob(container, blob),
                    &query,
                    headers,
                    Some((data, "application/octet-stream")),
                )
                .await?;
            Self::check(resp, "put block").await?;
            Ok(())
        })
    }

    fn commit_block_list<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        block_ids: &'a [String],
        lease: Option<&'a str>,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let xml = render_block_list(block_ids)
                .map_err(|e| StoreError::InvalidRequest(format!("block list xml: {e}")))?;
            let mut headers = Vec::new();
            if let Some(token) = lease {
                headers.push(Self::lease_header(token));
            }
            let resp = self
                .send(
                    Method::PUT,
                    Target::blob(container, blob),
                    &[("comp", "blocklist".to_string())],
                    headers,
                    Some((Bytes::from(xml), "application/xml")),
                )
                .await?;
            let resp = Self::check(resp, "put block list").await?;
            if let Some(token) = lease {
                self.placeholders.committed(token);
            }
            Ok(Self::etag(resp.headers()))
        })
    }

    fn acquire_lease<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        duration: Option<Duration>,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            if let Some(d) = duration {
                let secs = d.as_secs();
                if !(MIN_LEASE_SECS..=MAX_LEASE_SECS).contains(&secs) {
                    warn!(container, blob, secs, "lease duration outside 15..=60s, clamping");
                }
            }
            match self.azure_acquire_blob_lease(container, blob, duration).await {
                Err(StoreError::NotFound(_)) => {
                    let created = self.azure_create_placeholder(container, blob).await?;
                    let token = self
                        .azure_acquire_blob_lease(container, blob, duration)
                        .await?;
                    if created {
                        self.placeholders.created(&token);
                    }
                    Ok(token)
                }
                other => other,
            }
        })
    }

    fn renew_lease<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        token: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.azure_lease(
                Target::blob(container, blob),
                &[("comp", "lease".to_string())],
                vec![Self::lease_action("renew"), Self::lease_header(token)],
                "renew lease",
            )
            .await?;
            Ok(())
        })
    }

    fn release_lease<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        token: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if self.placeholders.take_uncommitted(token) {
                match self.azure_delete_leased_blob(container, blob, token).await {
                    Ok(()) => {
                        debug!(container, blob, "removed uncommitted placeholder blob");
                        return Ok(());
                    }
                    Err(e) => warn!(
                        container,
                        blob,
                        error = %e,
                        "failed to remove placeholder blob; releasing lease only"
                    ),
                }
            }
            self.azure_lease(
                Target::blob(container, blob),
                &[("comp", "lease".to_string())],
                vec![Self::lease_action("release"), Self::lease_header(token)],
                "release lease",
            )
            .await?;
            Ok(())
        })
    }
}
