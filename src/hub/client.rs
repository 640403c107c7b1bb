// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Blocking model-hub file transfer.
//!
//! Files are fetched from `{endpoint}/{repo_id}/resolve/{revision}/{filename}`
//! straight into the destination directory. Partial data lives next to the
//! target as `<name>.incomplete` and is resumed with a `Range` request on the
//! next attempt. An existing target file is returned without touching the
//! network.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::header::RANGE;
use reqwest::StatusCode;

use super::types::HubRequest;

const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Characters escaped inside a single URL path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Failure of a hub transfer.
///
/// The display text is only the detail; [`HubError::kind`] supplies the
/// category name shown in front of it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("{0}")]
    InvalidFilename(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    EntryNotFound(String),
    #[error("HTTP {status} for {url}")]
    Http { status: u16, url: String },
    #[error("{0}")]
    Network(String),
    #[error("{0}")]
    Io(String),
}

impl HubError {
    pub fn kind(&self) -> &'static str {
        match self {
            HubError::InvalidFilename(_) => "InvalidFilename",
            HubError::Unauthorized(_) => "Unauthorized",
            HubError::EntryNotFound(_) => "EntryNotFound",
            HubError::Http { .. } => "HttpError",
            HubError::Network(_) => "NetworkError",
            HubError::Io(_) => "IoError",
        }
    }
}

impl From<std::io::Error> for HubError {
    fn from(e: std::io::Error) -> Self {
        HubError::Io(e.to_string())
    }
}

/// A blocking hub download. Called from the blocking pool only.
pub trait HubDownloader: Send + Sync {
    fn download(&self, request: &HubRequest) -> Result<PathBuf, HubError>;
}

/// Hub downloader over plain HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpHubDownloader {
    endpoint: String,
}

impl HttpHubDownloader {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    /// Resolve URL for a file.
    pub fn file_url(&self, request: &HubRequest) -> Result<String, HubError> {
        let repo = encode_path(&request.repo_id).ok_or_else(|| {
            HubError::InvalidFilename(format!("Invalid repo id: {}", request.repo_id))
        })?;
        let file = encode_path(&request.filename).ok_or_else(|| {
            HubError::InvalidFilename(format!("Invalid filename: {}", request.filename))
        })?;
        let revision = utf8_percent_encode(&request.revision, SEGMENT);
        Ok(format!("{}/{}/resolve/{}/{}", self.endpoint, repo, revision, file))
    }
}

/// Percent-encode a relative path segment by segment.
///
/// `None` for empty, absolute or parent-escaping paths.
fn encode_path(raw: &str) -> Option<String> {
    let path = Path::new(raw);
    if raw.is_empty() || raw.contains('\\') {
        return None;
    }
    let mut segments = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(seg) => {
                segments.push(utf8_percent_encode(seg.to_str()?, SEGMENT).to_string())
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(".incomplete");
    PathBuf::from(name)
}

impl HubDownloader for HttpHubDownloader {
    fn download(&self, request: &HubRequest) -> Result<PathBuf, HubError> {
        let url = self.file_url(request)?;
        let dest = request.dest_dir.join(&request.filename);

        if dest.is_file() {
            tracing::info!(path = %dest.display(), "Hub file already present");
            return Ok(dest);
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let partial = partial_path(&dest);
        let offset = fs::metadata(&partial).map(|m| m.len()).unwrap_or(0);

        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(None::<Duration>)
            .user_agent(concat!("fetchhub/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HubError::Network(e.to_string()))?;

        let mut req = client.get(&url);
        if let Some(token) = request.token.as_deref() {
            req = req.bearer_auth(token);
        }
        if offset > 0 {
            req = req.header(RANGE, format!("bytes={}-", offset));
        }

        tracing::debug!(url = %url, resume_from = offset, "Requesting hub file");
        let mut resp = req.send().map_err(|e| HubError::Network(e.to_string()))?;

        let append = match resp.status() {
            StatusCode::PARTIAL_CONTENT => true,
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                fs::rename(&partial, &dest)?;
                return Ok(dest);
            }
            s if s.is_success() => false,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(HubError::Unauthorized(format!(
                    "Access to {} requires a valid token",
                    request.repo_id
                )))
            }
            StatusCode::NOT_FOUND => {
                return Err(HubError::EntryNotFound(format!(
                    "{} not found in {}",
                    request.filename, request.repo_id
                )))
            }
            s => return Err(HubError::Http { status: s.as_u16(), url }),
        };

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&partial)?;
        let written = resp
            .copy_to(&mut file)
            .map_err(|e| HubError::Network(e.to_string()))?;
        file.sync_all()?;
        drop(file);

        fs::rename(&partial, &dest)?;
        tracing::info!(
            path = %dest.display(),
            bytes = written,
            resumed = append,
            "Hub file downloaded"
        );
        Ok(dest)
    }
}
