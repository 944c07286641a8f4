//! REST implementations of the warehouse and object-store
//! capabilities.
//!
//! These speak the plain JSON APIs with a bearer token, either supplied
//! directly or fetched from the instance metadata service. URL signing
//! is delegated to the credentials service (signBlob), so no private
//! key material ever enters the process.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use maestro_warehouse::{
    parse_store_uri, ByteStream, JobConfiguration, ObjectStore, StoredObject, TableInfo,
    TableSchema, Warehouse, WarehouseError, WarehouseJob,
};

const METADATA_TOKEN_URL: &str = "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const TOKEN_SLACK: Duration = Duration::from_secs(60);

/// Where bearer tokens come from.
pub enum TokenSource {
    /// A long-lived token handed to the process (deploy-time secret).
    Static(String),
    /// The instance metadata service, refreshed before expiry.
    Metadata,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

pub struct Tokens {
    source: TokenSource,
    client: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

impl Tokens {
    pub fn new(source: TokenSource) -> Self {
        Self {
            source,
            client: reqwest::Client::new(),
            cached: Mutex::new(None),
        }
    }

    async fn bearer(&self) -> Result<String> {
        match &self.source {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::Metadata => {
                {
                    let cached = self.cached.lock().unwrap();
                    if let Some(cached) = cached.as_ref() {
                        if cached.expires_at > Instant::now() + TOKEN_SLACK {
                            return Ok(cached.token.clone());
                        }
                    }
                }
                let token: MetadataToken = self
                    .client
                    .get(METADATA_TOKEN_URL)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                let mut cached = self.cached.lock().unwrap();
                *cached = Some(CachedToken {
                    token: token.access_token.clone(),
                    expires_at: Instant::now() + Duration::from_secs(token.expires_in),
                });
                Ok(token.access_token)
            }
        }
    }
}

fn api_err(err: impl std::fmt::Display) -> WarehouseError {
    WarehouseError::Api(err.to_string())
}

/// Extract the essential message from an API error body when present.
async fn check_response(resp: reqwest::Response) -> std::result::Result<reqwest::Response, WarehouseError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();

    #[derive(Deserialize)]
    struct ApiError {
        error: Option<ApiErrorBody>,
    }
    #[derive(Deserialize)]
    struct ApiErrorBody {
        message: Option<String>,
    }

    let message = serde_json::from_str::<ApiError>(&body)
        .ok()
        .and_then(|e| e.error)
        .and_then(|e| e.message)
        .unwrap_or(body);
    Err(WarehouseError::Api(format!("{}: {}", status, message)))
}

/// The analytical store over its jobs API.
pub struct RestWarehouse {
    project: String,
    bucket: String,
    /// Service account used for signing; also the principal the token
    /// belongs to.
    email: String,
    url_expiry_secs: u64,
    tokens: std::sync::Arc<Tokens>,
    client: reqwest::Client,
}

impl RestWarehouse {
    pub fn new(
        project: &str,
        bucket: &str,
        email: &str,
        url_expiry_secs: u64,
        tokens: std::sync::Arc<Tokens>,
    ) -> Self {
        Self {
            project: project.to_string(),
            bucket: bucket.to_string(),
            email: email.to_string(),
            url_expiry_secs,
            tokens,
            client: reqwest::Client::new(),
        }
    }

    async fn bearer(&self) -> std::result::Result<String, WarehouseError> {
        self.tokens.bearer().await.map_err(api_err)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestTable {
    #[serde(default)]
    schema: TableSchema,
    #[serde(default)]
    num_rows: Option<String>,
    #[serde(default)]
    num_bytes: Option<String>,
}

#[async_trait]
impl Warehouse for RestWarehouse {
    async fn start_job(&self, conf: &JobConfiguration) -> std::result::Result<WarehouseJob, WarehouseError> {
        let token = self.bearer().await?;
        let url = format!(
            "https://bigquery.googleapis.com/bigquery/v2/projects/{}/jobs",
            self.project
        );
        let body = json!({ "configuration": conf });
        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(api_err)?;
        let resp = check_response(resp).await?;

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Inserted {
            job_reference: JobRef,
            #[serde(flatten)]
            job: WarehouseJob,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct JobRef {
            job_id: String,
        }

        let mut inserted: Inserted = resp.json().await.map_err(api_err)?;
        inserted.job.id = inserted.job_reference.job_id;
        debug!("started warehouse job {}", inserted.job.id);
        Ok(inserted.job)
    }

    async fn get_job(&self, job_id: &str) -> std::result::Result<WarehouseJob, WarehouseError> {
        let token = self.bearer().await?;
        let url = format!(
            "https://bigquery.googleapis.com/bigquery/v2/projects/{}/jobs/{}",
            self.project, job_id
        );
        let resp = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(api_err)?;
        let resp = check_response(resp).await?;

        let mut job: WarehouseJob = resp.json().await.map_err(api_err)?;
        if job.id.is_empty() {
            job.id = job_id.to_string();
        }
        Ok(job)
    }

    async fn get_table(&self, dataset: &str, table: &str) -> std::result::Result<TableInfo, WarehouseError> {
        let token = self.bearer().await?;
        let url = format!(
            "https://bigquery.googleapis.com/bigquery/v2/projects/{}/datasets/{}/tables/{}",
            self.project, dataset, table
        );
        let resp = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(api_err)?;
        let resp = check_response(resp).await?;

        let table: RestTable = resp.json().await.map_err(api_err)?;
        Ok(TableInfo {
            schema: table.schema,
            num_rows: table
                .num_rows
                .and_then(|n| n.parse().ok())
                .unwrap_or_default(),
            num_bytes: table
                .num_bytes
                .and_then(|n| n.parse().ok())
                .unwrap_or_default(),
        })
    }

    async fn signed_storage_url(
        &self,
        filename: &str,
        method: &str,
    ) -> std::result::Result<String, WarehouseError> {
        // Classic signed-URL format; the signature itself comes from
        // the credentials service so no key file is needed.
        let expires = chrono::Utc::now().timestamp() + self.url_expiry_secs as i64;
        let content_type = if method == "PUT" {
            "application/octet-stream"
        } else {
            ""
        };
        let string_to_sign = format!(
            "{}\n\n{}\n{}\n/{}/{}",
            method, content_type, expires, self.bucket, filename
        );

        let token = self.bearer().await?;
        let url = format!(
            "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/{}:signBlob",
            self.email
        );
        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&json!({ "payload": BASE64.encode(string_to_sign) }))
            .send()
            .await
            .map_err(api_err)?;
        let resp = check_response(resp).await?;

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Signed {
            signed_blob: String,
        }
        let signed: Signed = resp.json().await.map_err(api_err)?;

        let signature: String =
            url_encode(&signed.signed_blob);
        Ok(format!(
            "https://storage.googleapis.com/{}/{}?GoogleAccessId={}&Expires={}&Signature={}",
            self.bucket, filename, self.email, expires, signature
        ))
    }

    fn project_id(&self) -> &str {
        &self.project
    }
}

/// Percent-encode a query value.
fn url_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Object storage over its JSON/media API.
pub struct RestObjectStore {
    bucket: String,
    tokens: std::sync::Arc<Tokens>,
    client: reqwest::Client,
}

impl RestObjectStore {
    pub fn new(bucket: &str, tokens: std::sync::Arc<Tokens>) -> Self {
        Self {
            bucket: bucket.to_string(),
            tokens,
            client: reqwest::Client::new(),
        }
    }

    async fn bearer(&self) -> std::result::Result<String, WarehouseError> {
        self.tokens.bearer().await.map_err(api_err)
    }
}

#[async_trait]
impl ObjectStore for RestObjectStore {
    async fn insert(&self, name: &str, media: ByteStream) -> std::result::Result<StoredObject, WarehouseError> {
        let token = self.bearer().await?;
        let url = format!(
            "https://storage.googleapis.com/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.bucket,
            url_encode(name)
        );
        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header("Content-Type", "application/octet-stream")
            .body(reqwest::Body::wrap_stream(media))
            .send()
            .await
            .map_err(api_err)?;
        let resp = check_response(resp).await?;

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Object {
            name: String,
            #[serde(default)]
            self_link: String,
            #[serde(default)]
            size: Option<String>,
        }
        let object: Object = resp.json().await.map_err(api_err)?;
        Ok(StoredObject {
            name: object.name,
            self_link: object.self_link,
            size: object.size.and_then(|s| s.parse().ok()).unwrap_or_default(),
        })
    }

    async fn reader(&self, name: &str) -> std::result::Result<ByteStream, WarehouseError> {
        let token = self.bearer().await?;
        let url = format!(
            "https://storage.googleapis.com/storage/v1/b/{}/o/{}?alt=media",
            self.bucket,
            url_encode(name)
        );
        let resp = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(api_err)?;
        let resp = check_response(resp).await?;

        let stream = resp
            .bytes_stream()
            .map(|chunk: std::result::Result<Bytes, reqwest::Error>| {
                chunk.map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
            })
            .boxed();
        Ok(stream)
    }

    async fn delete_files(&self, uris: &[String]) -> std::result::Result<(), WarehouseError> {
        for uri in uris {
            let (bucket, name) = parse_store_uri(uri)?;
            if bucket != self.bucket {
                return Err(WarehouseError::WrongBucket(bucket, self.bucket.clone()));
            }
            let token = self.bearer().await?;
            let url = format!(
                "https://storage.googleapis.com/storage/v1/b/{}/o/{}",
                self.bucket,
                url_encode(&name)
            );
            let resp = self
                .client
                .delete(&url)
                .bearer_auth(token)
                .send()
                .await
                .map_err(api_err)?;
            check_response(resp).await?;
        }
        Ok(())
    }

    fn url_for_name(&self, name: &str) -> String {
        format!("gs://{}/{}", self.bucket, name)
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// Read a token source from the environment: an explicit token wins,
/// otherwise the metadata service is assumed.
pub fn token_source_from_env() -> Result<TokenSource> {
    match std::env::var("MAESTRO_ACCESS_TOKEN") {
        Ok(token) if !token.is_empty() => Ok(TokenSource::Static(token)),
        _ => Ok(TokenSource::Metadata),
    }
}

/// Sanity-check construction inputs early.
pub fn validate_conf(project: &str, bucket: &str, email: &str) -> Result<()> {
    if project.is_empty() || bucket.is_empty() || email.is_empty() {
        return Err(anyhow!(
            "warehouse configuration incomplete (project/bucket/email required)"
        ))
        .context("configure the warehouse before starting the daemon");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encoding() {
        assert_eq!(url_encode("plain-name_1.csv"), "plain-name_1.csv");
        assert_eq!(url_encode("a b+c"), "a%20b%2Bc");
        assert_eq!(url_encode("sig=="), "sig%3D%3D");
    }
}
