use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use super::{policy, tree::TreeNode};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DATA_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_ATTEMPTS: usize = 3;
const RETRY_INITIAL_DELAY_MS: u64 = 200;
const RETRY_MAX_DELAY_MS: u64 = 1_000;
const ERROR_BODY_PREVIEW_BYTES: usize = 512;

#[derive(Debug, Error)]
pub(crate) enum RemoteError {
    #[error("remote unreachable: {0}")]
    Unreachable(String),
    #[error("remote request timed out")]
    Timeout,
    #[error("remote rejected the request as unauthorized")]
    Unauthorized,
    #[error("remote path not found")]
    NotFound,
    #[error("remote reported a conflict")]
    Conflict,
    #[error("remote error: {0}")]
    Remote(String),
    #[error("path is not eligible for sync: {0}")]
    SyncForbidden(String),
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RemoteScript {
    pub(crate) path: String,
    #[serde(default)]
    pub(crate) modified: f64,
}

impl RemoteScript {
    /// Integer-second truncation keeps vector comparisons robust across
    /// platforms with different mtime precision.
    pub(crate) fn modified_unix(&self) -> i64 {
        self.modified.floor() as i64
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RemoteFile {
    #[serde(default)]
    pub(crate) content: String,
    #[serde(default)]
    pub(crate) encoding: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct RemoteMetadata {
    #[serde(default)]
    pub(crate) input_metadata: Option<String>,
    #[serde(default)]
    pub(crate) output_metadata: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScriptListing {
    #[serde(default)]
    scripts: Vec<RemoteScript>,
}

#[derive(Debug, Deserialize)]
struct TreeListing {
    tree: TreeNode,
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    #[serde(default)]
    status: String,
}

/// Typed client for the remote sandbox's REST surface.
pub(crate) struct RemoteClient {
    http: reqwest::Client,
    base: String,
}

impl RemoteClient {
    pub(crate) fn new(base_url: &str) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|error| RemoteError::Remote(format!("failed to build client: {error}")))?;

        Ok(Self {
            http,
            base: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub(crate) async fn health(&self) -> bool {
        let url = format!("{}/health", self.base);
        let response = match self.http.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(response) => response,
            Err(_) => return false,
        };

        if !response.status().is_success() {
            return false;
        }

        response
            .json::<HealthBody>()
            .await
            .map(|body| body.status == "ok")
            .unwrap_or(false)
    }

    pub(crate) async fn list_all(&self) -> Result<TreeNode, RemoteError> {
        let url = format!("{}/files", self.base);
        let listing: TreeListing = self.get_json(&url).await?;
        Ok(listing.tree)
    }

    pub(crate) async fn list_scripts(&self) -> Result<Vec<RemoteScript>, RemoteError> {
        let url = format!("{}/scripts", self.base);
        let listing: ScriptListing = self.get_json(&url).await?;
        Ok(listing.scripts)
    }

    pub(crate) async fn get_script(&self, path: &str) -> Result<RemoteFile, RemoteError> {
        let url = format!("{}/scripts/{}", self.base, encode_path(path));
        self.get_json(&url).await
    }

    pub(crate) async fn get_file(&self, path: &str) -> Result<RemoteFile, RemoteError> {
        let url = format!("{}/files/{}", self.base, encode_path(path));
        self.get_json(&url).await
    }

    pub(crate) async fn put_file(&self, path: &str, content: &str) -> Result<(), RemoteError> {
        let name = path.rsplit('/').next().unwrap_or(path);
        if policy::is_forbidden_for_sync(name) {
            return Err(RemoteError::SyncForbidden(path.to_string()));
        }

        let url = format!("{}/scripts/{}", self.base, encode_path(path));
        let body = json!({ "content": content });
        let response = self
            .send_with_retry(|| self.http.post(&url).timeout(DATA_TIMEOUT).json(&body))
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::status_error(response).await)
        }
    }

    pub(crate) async fn get_metadata(&self) -> Result<RemoteMetadata, RemoteError> {
        let url = format!("{}/metadata", self.base);
        self.get_json(&url).await
    }

    pub(crate) async fn put_metadata(
        &self,
        input_metadata: &str,
        output_metadata: &str,
    ) -> Result<(), RemoteError> {
        let url = format!("{}/metadata", self.base);
        let body = json!({
            "input_metadata": input_metadata,
            "output_metadata": output_metadata,
        });
        let response = self
            .send_with_retry(|| self.http.post(&url).timeout(DATA_TIMEOUT).json(&body))
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::status_error(response).await)
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, RemoteError> {
        let response = self
            .send_with_retry(|| self.http.get(url).timeout(DATA_TIMEOUT))
            .await?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        response
            .json::<T>()
            .await
            .map_err(|error| RemoteError::Remote(format!("invalid response body: {error}")))
    }

    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, RemoteError> {
        let mut attempt = 1usize;
        loop {
            match build().send().await {
                Ok(response) => return Ok(response),
                Err(error) if error.is_timeout() => return Err(RemoteError::Timeout),
                Err(error) => {
                    if attempt >= RETRY_ATTEMPTS {
                        return Err(RemoteError::Unreachable(error.to_string()));
                    }

                    let delay = retry_backoff(attempt);
                    debug!(attempt, ?delay, %error, "remote call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn status_error(response: reqwest::Response) -> RemoteError {
        let status = response.status();
        match status.as_u16() {
            401 | 403 => RemoteError::Unauthorized,
            404 => RemoteError::NotFound,
            409 => RemoteError::Conflict,
            _ => {
                let mut body = response.text().await.unwrap_or_default();
                body.truncate(ERROR_BODY_PREVIEW_BYTES);
                RemoteError::Remote(format!("status {status}: {body}"))
            }
        }
    }
}

fn retry_backoff(attempt: usize) -> Duration {
    let exp = 2u64.saturating_pow(attempt.saturating_sub(1) as u32);
    let base = (RETRY_INITIAL_DELAY_MS.saturating_mul(exp)).min(RETRY_MAX_DELAY_MS);
    let jitter = rand::rng().random_range(0.9..1.1);
    Duration::from_millis((base as f64 * jitter) as u64)
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
