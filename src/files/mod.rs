//! Remote file storage used to hand project documents to the agent.

use std::path::Path;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{RequestBuilder, Response};
use serde::{Deserialize, Serialize};

use crate::config::env;
use crate::error::{ArtelError, Result};

pub const DEFAULT_BASE_URL: &str = "https://api.moonshot.ai/v1";
pub const API_KEY_VAR: &str = "KIMI_API_KEY";
/// Purpose used for uploads when none is given.
pub const DEFAULT_PURPOSE: &str = "file-extract";

/// Metadata of a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileObject {
    pub id: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub created_at: i64,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    data: Vec<FileObject>,
}

#[derive(Debug, Deserialize)]
struct DeleteReply {
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    status: Option<String>,
}

/// A store of uploaded files.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn upload(&self, path: &Path, purpose: &str) -> Result<FileObject>;

    /// All files, optionally only those with the given purpose.
    async fn list(&self, purpose: Option<&str>) -> Result<Vec<FileObject>>;

    async fn get(&self, id: &str) -> Result<FileObject>;

    /// Returns whether the store confirmed the deletion.
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// Client for an OpenAI-compatible Files API.
pub struct FilesClient {
    http: reqwest::Client,
    base_url: String,
}

impl FilesClient {
    pub fn new(api_key: &str, base_url: impl Into<String>) -> Result<Self> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|e| {
            ArtelError::InvalidApiKey {
                reason: e.to_string(),
            }
        })?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Client for the default endpoint with the key found for `root`.
    pub fn from_project(root: &Path) -> Result<Self> {
        let api_key = env::lookup(root, API_KEY_VAR).ok_or(ArtelError::MissingApiKey)?;
        Self::new(&api_key, DEFAULT_BASE_URL)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    /// Raw text content of a stored file.
    pub async fn content(&self, id: &str) -> Result<String> {
        let res = send_checked(self.http.get(self.url(&format!("/files/{}/content", id)))).await?;
        Ok(res.text().await?)
    }
}

#[async_trait]
impl FileStore for FilesClient {
    async fn upload(&self, path: &Path, purpose: &str) -> Result<FileObject> {
        let bytes = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".into());
        tracing::info!("uploading {} ({} bytes, purpose {})", filename, bytes.len(), purpose);

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename)
            .mime_str("application/octet-stream")?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", purpose.to_string())
            .part("file", part);

        let res = send_checked(self.http.post(self.url("/files")).multipart(form)).await?;
        Ok(res.json().await?)
    }

    async fn list(&self, purpose: Option<&str>) -> Result<Vec<FileObject>> {
        let res = send_checked(self.http.get(self.url("/files"))).await?;
        let files = res.json::<FileList>().await?.data;
        Ok(filter_by_purpose(files, purpose))
    }

    async fn get(&self, id: &str) -> Result<FileObject> {
        let res = send_checked(self.http.get(self.url(&format!("/files/{}", id)))).await?;
        Ok(res.json().await?)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let res = send_checked(self.http.delete(self.url(&format!("/files/{}", id)))).await?;
        let reply: DeleteReply = res.json().await?;
        Ok(reply.deleted || reply.status.as_deref() == Some("ok"))
    }
}

/// Send once; any non-success status becomes an `Api` error with the body.
async fn send_checked(builder: RequestBuilder) -> Result<Response> {
    let res = builder.send().await?;
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    tracing::debug!("files api returned {}: {}", status, body);
    Err(ArtelError::Api {
        status: status.as_u16(),
        body,
    })
}

fn filter_by_purpose(files: Vec<FileObject>, purpose: Option<&str>) -> Vec<FileObject> {
    match purpose {
        Some(purpose) => files.into_iter().filter(|f| f.purpose == purpose).collect(),
        None => files,
    }
}
