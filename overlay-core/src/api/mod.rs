//! api: blocking client for the detection backend
//!
//! Every JSON endpoint answers with `{ "success": true, "data": ... }` or
//! `{ "success": false, "error": "<CODE>" }`, usually with HTTP 200 either
//! way.  Codes are translated through a fixed table; anything unknown gets a
//! generic message.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use reqwest::blocking::{multipart, Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::DetectionCache;
use crate::config::ApiConfig;
use crate::detection::DetectionSet;

pub mod upload;

pub use upload::{validate_upload, CancelFlag, ProgressFn, UploadFile, MAX_UPLOAD_BYTES};

// ── Task ids ─────────────────────────────────────────────────────────────────

fn task_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^local_[a-z0-9]{6,8}$").expect("task id pattern compiles"))
}

/// Backend task identifier, `local_` followed by 6 to 8 lowercase
/// alphanumerics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let raw = raw.trim();
        if task_id_pattern().is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(ValidationError::InvalidTaskId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TaskId {
    type Error = ValidationError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl std::str::FromStr for TaskId {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Rejected locally, before any request is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid task id `{0}` (expected local_ followed by 6-8 lowercase letters or digits)")]
    InvalidTaskId(String),
    #[error("unsupported file type `{0}`: only MP4 videos are accepted")]
    UnsupportedFileType(String),
    #[error("file is {size} bytes, larger than the {limit} byte limit")]
    FileTooLarge { size: u64, limit: u64 },
    #[error("file `{0}` is empty")]
    EmptyFile(String),
    #[error("file not found: {0}")]
    MissingFile(String),
}

/// Coarse category recorded in upload history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    FileValidation,
    ServerError,
    Cancelled,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::FileValidation => "file_validation",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),
    #[error("request timed out: {0}")]
    Timeout(#[source] reqwest::Error),
    #[error("backend returned {code}: {}", backend_message(.code))]
    Backend { code: String },
    #[error("unexpected response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
    #[error("upload cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ApiError {
    fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout(err)
        } else {
            ApiError::Network(err)
        }
    }

    /// Transport failures are worth retrying; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Network(_) | ApiError::Timeout(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Validation(_) => ErrorKind::FileValidation,
            ApiError::Network(_) => ErrorKind::Network,
            ApiError::Timeout(_) => ErrorKind::Timeout,
            ApiError::Backend { code } if code == "UPLOAD_INVALID_FILE" => ErrorKind::FileValidation,
            ApiError::Backend { .. } => ErrorKind::ServerError,
            ApiError::Cancelled => ErrorKind::Cancelled,
            ApiError::Decode { .. } | ApiError::Io(_) => ErrorKind::Unknown,
        }
    }

    /// Short sentence suitable for showing to an end user.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Validation(err) => err.to_string(),
            ApiError::Network(_) => backend_message("NETWORK_ERROR").to_string(),
            ApiError::Timeout(_) => "The request timed out, please try again later".to_string(),
            ApiError::Backend { code } => backend_message(code).to_string(),
            ApiError::Cancelled => "Upload cancelled by user".to_string(),
            ApiError::Decode { .. } | ApiError::Io(_) => backend_message("UNKNOWN_ERROR").to_string(),
        }
    }
}

/// Message for a backend error code.
pub fn backend_message(code: &str) -> &'static str {
    match code {
        "UPLOAD_INVALID_FILE" => "Unsupported file format or file too large",
        "UPLOAD_SAVE_FAILED" => "Saving the upload failed, please retry",
        "TASK_NOT_FOUND" => "Task not found, please upload the video again",
        "DETECT_FAILED" => "Detection failed, please retry",
        "DETECT_NOT_IMPLEMENTED" => "Detection is not available on this server",
        "DETECTIONS_NOT_FOUND" => "No detection results for this task",
        "HISTORY_LOAD_FAILED" => "Loading task history failed",
        "INTERNAL_ERROR" => "Server error, please try again later",
        "NETWORK_ERROR" => "Network connection failed, check your network settings",
        "UNKNOWN_ERROR" => "Unknown error, please try again later",
        _ => "Request failed, please retry",
    }
}

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

/// Unwrap a `{success, data | error}` body.
pub fn decode_envelope<T: DeserializeOwned>(endpoint: &str, body: &str) -> Result<T, ApiError> {
    let envelope: Envelope<T> = serde_json::from_str(body).map_err(|err| ApiError::Decode {
        endpoint: endpoint.to_string(),
        message: err.to_string(),
    })?;
    match envelope {
        Envelope {
            success: true,
            data: Some(data),
            ..
        } => Ok(data),
        Envelope { success: true, .. } => Err(ApiError::Decode {
            endpoint: endpoint.to_string(),
            message: "success response without data".to_string(),
        }),
        Envelope { error, .. } => Err(ApiError::Backend {
            code: error.unwrap_or_else(|| "UNKNOWN_ERROR".to_string()),
        }),
    }
}

/// `POST /upload` result.  Video metadata is optional: the backend only
/// fills it when it could read the file metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// `POST /detect/{task_id}` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectOutcome {
    pub generated: bool,
    #[serde(default)]
    pub already_exists: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub task_id: String,
    pub created_at: String,
}

impl HistoryEntry {
    /// The backend writes naive local ISO-8601 timestamps.
    pub fn created_at(&self) -> Option<chrono::NaiveDateTime> {
        self.created_at.parse().ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthInfo {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub status: String,
}

// ── Client ───────────────────────────────────────────────────────────────────

pub struct ApiClient {
    base_url: String,
    http: Client,
    upload_timeout: Duration,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration, upload_timeout: Duration) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ApiError::from_transport)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            upload_timeout,
        })
    }

    pub fn from_config(config: &ApiConfig) -> Result<Self, ApiError> {
        Self::new(
            &config.base_url,
            Duration::from_secs(config.timeout_secs),
            Duration::from_secs(config.upload_timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `GET /`.  Not enveloped.
    pub fn health(&self) -> Result<HealthInfo, ApiError> {
        let response = self
            .http
            .get(self.url("/"))
            .send()
            .map_err(ApiError::from_transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Backend {
                code: format!("HTTP_{}", status.as_u16()),
            });
        }
        let body = response.text().map_err(ApiError::from_transport)?;
        serde_json::from_str(&body).map_err(|err| ApiError::Decode {
            endpoint: "/".to_string(),
            message: err.to_string(),
        })
    }

    /// Stream `path` to `POST /upload` as multipart field `file`.
    pub fn upload(
        &self,
        path: &Path,
        progress: Option<ProgressFn>,
        cancel: &CancelFlag,
    ) -> Result<UploadReceipt, ApiError> {
        let file = validate_upload(path)?;
        if cancel.is_cancelled() {
            return Err(ApiError::Cancelled);
        }

        let reader = upload::ProgressReader::open(path, file.size, progress, cancel.clone())?;
        let part = multipart::Part::reader_with_length(reader, file.size)
            .file_name(file.file_name.clone())
            .mime_str(upload::UPLOAD_MIME)
            .map_err(ApiError::from_transport)?;
        let form = multipart::Form::new().part("file", part);

        info!(file = %file.file_name, bytes = file.size, "uploading video");
        let sent = self
            .http
            .post(self.url("/upload"))
            .timeout(self.upload_timeout)
            .multipart(form)
            .send();
        let response = match sent {
            Ok(response) => response,
            Err(_) if cancel.is_cancelled() => return Err(ApiError::Cancelled),
            Err(err) => return Err(ApiError::from_transport(err)),
        };
        let receipt: UploadReceipt = self.read_envelope("/upload", response)?;
        info!(task_id = %receipt.task_id, "upload accepted");
        Ok(receipt)
    }

    /// `POST /detect/{task_id}`.  Idempotent on the backend side.
    pub fn trigger_detection(&self, task_id: &TaskId) -> Result<DetectOutcome, ApiError> {
        let endpoint = format!("/detect/{task_id}");
        let response = self
            .http
            .post(self.url(&endpoint))
            .send()
            .map_err(ApiError::from_transport)?;
        let outcome: DetectOutcome = self.read_envelope(&endpoint, response)?;
        debug!(%task_id, ?outcome, "detection triggered");
        Ok(outcome)
    }

    pub fn detections(&self, task_id: &TaskId) -> Result<DetectionSet, ApiError> {
        let endpoint = format!("/detections/{task_id}");
        let response = self
            .http
            .get(self.url(&endpoint))
            .send()
            .map_err(ApiError::from_transport)?;
        let set: DetectionSet = self.read_envelope(&endpoint, response)?;
        debug!(%task_id, frames = set.len(), "detections fetched");
        Ok(set)
    }

    /// Detections through `cache`; only a miss goes to the network.
    pub fn cached_detections(
        &self,
        cache: &mut DetectionCache,
        task_id: &TaskId,
    ) -> Result<Arc<DetectionSet>, ApiError> {
        if let Some(set) = cache.get(task_id) {
            debug!(%task_id, "detection cache hit");
            return Ok(set);
        }
        let set = Arc::new(self.detections(task_id)?);
        cache.insert(task_id.clone(), Arc::clone(&set));
        Ok(set)
    }

    pub fn history(&self) -> Result<Vec<HistoryEntry>, ApiError> {
        let response = self
            .http
            .get(self.url("/history"))
            .send()
            .map_err(ApiError::from_transport)?;
        self.read_envelope("/history", response)
    }

    /// `GET /videos/{task_id}` into `dest`.  Returns the byte count.
    pub fn download_video(&self, task_id: &TaskId, dest: &Path) -> Result<u64, ApiError> {
        let endpoint = format!("/videos/{task_id}");
        let mut response = self
            .http
            .get(self.url(&endpoint))
            .timeout(self.upload_timeout)
            .send()
            .map_err(ApiError::from_transport)?;

        let is_video = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("video/"));
        if !response.status().is_success() || !is_video {
            // Missing tasks come back as a JSON envelope, not a stream.
            return match self.read_envelope::<serde_json::Value>(&endpoint, response) {
                Err(err) => Err(err),
                Ok(_) => Err(ApiError::Decode {
                    endpoint,
                    message: "expected a video stream".to_string(),
                }),
            };
        }

        // Stream into a sibling file so a broken transfer never leaves a
        // truncated video at `dest`.
        let partial = partial_path(dest);
        let copied = File::create(&partial).map_err(ApiError::from).and_then(|file| {
            let mut out = BufWriter::new(file);
            let bytes = response.copy_to(&mut out).map_err(ApiError::from_transport)?;
            out.flush()?;
            Ok(bytes)
        });
        let bytes = match copied {
            Ok(bytes) => bytes,
            Err(err) => {
                if let Err(cleanup) = std::fs::remove_file(&partial) {
                    debug!(path = %partial.display(), %cleanup, "no partial download to remove");
                }
                warn!(%task_id, %err, "video download failed");
                return Err(err);
            }
        };
        std::fs::rename(&partial, dest)?;
        info!(%task_id, bytes, dest = %dest.display(), "video downloaded");
        Ok(bytes)
    }

    fn read_envelope<T: DeserializeOwned>(&self, endpoint: &str, response: Response) -> Result<T, ApiError> {
        let status = response.status();
        let body = response.text().map_err(ApiError::from_transport)?;
        match decode_envelope(endpoint, &body) {
            Err(ApiError::Decode { .. }) if !status.is_success() => {
                warn!(endpoint, status = status.as_u16(), "non-envelope error response");
                Err(ApiError::Backend {
                    code: format!("HTTP_{}", status.as_u16()),
                })
            }
            other => other,
        }
    }
}

/// `<dest>.part`, next to `dest` so the final rename stays on one filesystem.
fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
