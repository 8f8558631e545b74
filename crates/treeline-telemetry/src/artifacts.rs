//! Artifact uploads through the object store's presigned-URL protocol.
//!
//! 1. POST `/presigned-upload-url` → `{upload_url, s3_key}` (3 retries)
//! 2. PUT the bytes to `upload_url` (5 retries, exponential backoff)
//! 3. POST `/artifact-uploaded` with the metadata
//!
//! Uploads are best-effort: failures are logged and never fatal to the run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const PRESIGN_ATTEMPTS: u32 = 3;
const UPLOAD_ATTEMPTS: u32 = 5;
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(3600);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Packaging {
    File,
    Zip,
}

#[derive(Clone, Debug)]
pub struct ArtifactSpec {
    pub artifact_type: String,
    pub path: PathBuf,
    pub packaging: Packaging,
    pub archive_name: Option<String>,
    pub exclude_dir_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PresignedUpload {
    upload_url: String,
    s3_key: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("presigned url request failed: {0}")]
    Presign(String),
    #[error("upload failed: {0}")]
    Upload(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct ArtifactUploader {
    client: reqwest::Client,
    base_url: String,
    token: String,
    run_id: String,
}

impl ArtifactUploader {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, run_id: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            run_id: run_id.into(),
        }
    }

    /// Upload one artifact spec. Directories are walked and uploaded
    /// file-by-file under the archive name as a key prefix.
    pub async fn upload(&self, spec: &ArtifactSpec) -> Result<Vec<String>, ArtifactError> {
        let mut keys = Vec::new();
        if spec.path.is_dir() {
            let files = collect_files(&spec.path, &spec.exclude_dir_names)?;
            for file in files {
                let rel = file
                    .strip_prefix(&spec.path)
                    .unwrap_or(&file)
                    .to_string_lossy()
                    .replace('\\', "/");
                let name = match &spec.archive_name {
                    Some(prefix) => format!("{}/{}", prefix, rel),
                    None => rel,
                };
                keys.push(self.upload_file(&spec.artifact_type, &file, &name).await?);
            }
        } else {
            let name = spec
                .archive_name
                .clone()
                .or_else(|| {
                    spec.path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                })
                .unwrap_or_else(|| "artifact".to_string());
            keys.push(self.upload_file(&spec.artifact_type, &spec.path, &name).await?);
        }
        Ok(keys)
    }

    async fn upload_file(
        &self,
        artifact_type: &str,
        path: &Path,
        filename: &str,
    ) -> Result<String, ArtifactError> {
        let bytes = tokio::fs::read(path).await?;
        let content_type = content_type_for(path);
        let presigned = self
            .request_presigned_upload(artifact_type, filename, content_type, bytes.len() as u64)
            .await?;
        self.put_with_retry(&presigned.upload_url, content_type, bytes)
            .await?;
        self.notify_uploaded(artifact_type, &presigned.s3_key, filename)
            .await;
        Ok(presigned.s3_key)
    }

    async fn request_presigned_upload(
        &self,
        artifact_type: &str,
        filename: &str,
        content_type: &str,
        file_size: u64,
    ) -> Result<PresignedUpload, ArtifactError> {
        let url = format!("{}/{}/presigned-upload-url", self.base_url, self.run_id);
        let body = serde_json::json!({
            "artifact_type": artifact_type,
            "filename": filename,
            "content_type": content_type,
            "file_size": file_size,
            "metadata": {},
        });
        let mut last_err = String::new();
        for attempt in 1..=PRESIGN_ATTEMPTS {
            let result = self
                .client
                .post(&url)
                .bearer_auth(&self.token)
                .json(&body)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<PresignedUpload>()
                        .await
                        .map_err(|e| ArtifactError::Presign(e.to_string()));
                }
                Ok(response) => last_err = format!("status {}", response.status()),
                Err(e) => last_err = e.to_string(),
            }
            debug!("presigned-url attempt {}/{} failed: {}", attempt, PRESIGN_ATTEMPTS, last_err);
            tokio::time::sleep(INITIAL_BACKOFF).await;
        }
        Err(ArtifactError::Presign(last_err))
    }

    async fn put_with_retry(
        &self,
        upload_url: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<(), ArtifactError> {
        let mut backoff = INITIAL_BACKOFF;
        let mut last_err = String::new();
        for attempt in 1..=UPLOAD_ATTEMPTS {
            let result = self
                .client
                .put(upload_url)
                .header("Content-Type", content_type)
                .header("Content-Length", bytes.len())
                .body(bytes.clone())
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => last_err = format!("status {}", response.status()),
                Err(e) => last_err = e.to_string(),
            }
            debug!("artifact PUT attempt {}/{} failed: {}", attempt, UPLOAD_ATTEMPTS, last_err);
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
        }
        Err(ArtifactError::Upload(last_err))
    }

    async fn notify_uploaded(&self, artifact_type: &str, s3_key: &str, filename: &str) {
        let url = format!("{}/{}/artifact-uploaded", self.base_url, self.run_id);
        let body = serde_json::json!({
            "event": {
                "artifact_type": artifact_type,
                "s3_key": s3_key,
                "filename": filename,
                "metadata": Value::Object(Default::default()),
            }
        });
        let result = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await;
        if let Err(e) = result {
            warn!("failed to report uploaded artifact {}: {}", s3_key, e);
        }
    }
}

fn collect_files(dir: &Path, exclude_dir_names: &[String]) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                let name = entry.file_name().to_string_lossy().to_string();
                if !exclude_dir_names.contains(&name) {
                    stack.push(path);
                }
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("json") | Some("jsonl") => "application/json",
        Some("md") | Some("txt") | Some("log") | Some("py") => "text/plain",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}
