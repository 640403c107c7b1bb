// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Jobs executed by the aria2 daemon.
//!
//! The daemon is the source of truth for these jobs. We hand it a URL and a
//! set of transfer options, keep the gid it gives back, and translate its
//! `tellStatus` output into a status record with percent and ETA computed
//! here from the raw byte counters. The only thing remembered locally is the
//! destination directory and filename hint for each gid.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use url::Url;

use crate::error::{redact_secrets, JobError};
use crate::paths::{basename, prepare_destination};
use crate::registry::JobRegistry;
use crate::resolver::FilenameResolver;
use crate::rpc::{DaemonSupervisor, RpcError, RpcTransport};

/// Parallel connections and splits requested per download.
const CONNECTIONS: u32 = 16;

/// Retry budget handed to the daemon.
const MAX_TRIES: u32 = 5;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Keys requested from `tellStatus`.
const STATUS_KEYS: [&str; 7] = [
    "status",
    "totalLength",
    "completedLength",
    "downloadSpeed",
    "errorMessage",
    "files",
    "dir",
];

/// Start request for a daemon download.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonStartRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub dest_dir: String,
    #[serde(default)]
    pub token: String,
}

/// What the caller learns from a successful start.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DaemonStarted {
    pub gid: String,
    pub dest_dir: String,
    pub guessed_out: String,
    pub confident: bool,
}

/// Normalized status of a daemon job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    pub status: String,
    pub percent: f64,
    pub completed_length: u64,
    pub total_length: u64,
    pub download_speed: u64,
    pub eta: Option<u64>,
    pub filename: String,
    pub filepath: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Local memory of a daemon job.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonJob {
    pub gid: String,
    pub dest_dir: PathBuf,
    /// Output name we forced, if any.
    pub filename_hint: Option<String>,
}

/// Percent complete, rounded to two decimals.
///
/// Unknown totals report 0 unless the daemon says the job is complete.
pub fn percent(total: u64, done: u64, status: &str) -> f64 {
    let raw = if total > 0 {
        (done as f64 / total as f64 * 100.0).min(100.0)
    } else if status == "complete" {
        100.0
    } else {
        0.0
    };
    (raw * 100.0).round() / 100.0
}

/// Seconds remaining at the current speed.
///
/// `None` while the total size is still unknown, unless the job is complete.
pub fn eta(total: u64, done: u64, speed: u64, status: &str) -> Option<u64> {
    if total == 0 && status != "complete" {
        return None;
    }
    Some(total.saturating_sub(done) / speed.max(1))
}

/// `scheme://host[:port]/` of a URL, used as the Referer.
pub fn origin_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    let origin = match parsed.port() {
        Some(port) => format!("{}://{}:{}/", parsed.scheme(), host, port),
        None => format!("{}://{}/", parsed.scheme(), host),
    };
    Some(origin)
}

/// Transfer options for `addUri`.
pub fn transfer_options(
    url: &str,
    dest_dir: &Path,
    token: Option<&str>,
    out: Option<&str>,
) -> Map<String, Value> {
    let mut headers = vec![
        "Accept: */*".to_string(),
        "Accept-Language: en-US,en;q=0.9".to_string(),
        format!("User-Agent: {}", BROWSER_USER_AGENT),
    ];
    if let Some(token) = token {
        headers.push(format!("Authorization: Bearer {}", token));
    }

    let mut opts = Map::new();
    opts.insert("continue".into(), json!("true"));
    opts.insert("max-connection-per-server".into(), json!(CONNECTIONS.to_string()));
    opts.insert("split".into(), json!(CONNECTIONS.to_string()));
    opts.insert("dir".into(), json!(dest_dir.to_string_lossy()));
    opts.insert("auto-file-renaming".into(), json!("true"));
    opts.insert("remote-time".into(), json!("true"));
    opts.insert("content-disposition-default-utf8".into(), json!("true"));
    opts.insert("header".into(), json!(headers));
    opts.insert("max-tries".into(), json!(MAX_TRIES.to_string()));
    if let Some(origin) = origin_of(url) {
        opts.insert("referer".into(), json!(origin));
    }
    if let Some(out) = out {
        opts.insert("out".into(), json!(out));
    }
    opts
}

/// aria2 reports byte counters as decimal strings.
fn counter(st: &Value, key: &str) -> u64 {
    match st.get(key) {
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        _ => 0,
    }
}

/// Build the normalized status from a `tellStatus` result.
pub fn normalize_status(st: &Value, hint: Option<&str>) -> DaemonStatus {
    let status = st
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let total = counter(st, "totalLength");
    let done = counter(st, "completedLength");
    let speed = counter(st, "downloadSpeed");

    let mut filepath = st
        .get("files")
        .and_then(Value::as_array)
        .and_then(|files| files.first())
        .and_then(|f| f.get("path"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let mut filename = basename(&filepath).to_string();

    if filepath.is_empty() {
        let dir = st.get("dir").and_then(Value::as_str).unwrap_or("");
        if let Some(hint) = hint.filter(|h| !h.is_empty()) {
            filename = hint.to_string();
            if !dir.is_empty() {
                filepath = Path::new(dir).join(hint).to_string_lossy().into_owned();
            }
        }
    }

    let error = (status == "error").then(|| {
        st.get("errorMessage")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .unwrap_or("unknown error")
            .to_string()
    });

    DaemonStatus {
        percent: percent(total, done, &status),
        eta: eta(total, done, speed, &status),
        status,
        completed_length: done,
        total_length: total,
        download_speed: speed,
        filename,
        filepath,
        error,
    }
}

fn rpc_failure(e: RpcError) -> JobError {
    JobError::Rpc(format!("aria2c RPC error: {}", e))
}

/// Start/status/stop for daemon-executed downloads.
#[derive(Clone)]
pub struct DaemonJobs {
    rpc: Arc<dyn RpcTransport>,
    supervisor: DaemonSupervisor,
    resolver: FilenameResolver,
    registry: Arc<JobRegistry<DaemonJob>>,
}

impl std::fmt::Debug for DaemonJobs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonJobs")
            .field("supervisor", &self.supervisor)
            .field("jobs", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl DaemonJobs {
    pub fn new(
        rpc: Arc<dyn RpcTransport>,
        supervisor: DaemonSupervisor,
        resolver: FilenameResolver,
        registry: Arc<JobRegistry<DaemonJob>>,
    ) -> Self {
        Self {
            rpc,
            supervisor,
            resolver,
            registry,
        }
    }

    /// Whether the daemon answers right now. Never launches it.
    pub async fn daemon_reachable(&self) -> bool {
        self.supervisor.is_reachable().await
    }

    /// Submit a download to the daemon.
    pub async fn start(&self, req: DaemonStartRequest) -> Result<DaemonStarted, JobError> {
        let url = req.url.trim();
        if url.is_empty() {
            return Err(JobError::invalid("URL is required."));
        }
        let token = Some(req.token.trim()).filter(|t| !t.is_empty());

        let dest_dir = prepare_destination(&req.dest_dir)?;

        self.supervisor
            .ensure_running()
            .await
            .map_err(|e| JobError::BackendUnavailable(e.to_string()))?;

        let resolved = self.resolver.resolve(url, token).await;
        let out = resolved.forced_name();
        let opts = transfer_options(url, &dest_dir, token, out);

        let result = self
            .rpc
            .call("addUri", vec![json!([url]), Value::Object(opts)])
            .await
            .map_err(rpc_failure)?;

        let gid = result
            .as_str()
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .ok_or_else(|| JobError::Rpc("aria2c did not return a gid.".to_string()))?;

        tracing::info!(
            gid = %gid,
            url = %redact_secrets(url),
            dest = %dest_dir.display(),
            out = ?out,
            confident = resolved.confident,
            "Daemon download submitted"
        );

        self.registry.insert(
            gid.clone(),
            DaemonJob {
                gid: gid.clone(),
                dest_dir: dest_dir.clone(),
                filename_hint: out.map(str::to_string),
            },
        );

        Ok(DaemonStarted {
            gid,
            dest_dir: dest_dir.to_string_lossy().into_owned(),
            guessed_out: out.unwrap_or("").to_string(),
            confident: resolved.confident,
        })
    }

    /// Poll the daemon for a job's state.
    pub async fn status(&self, gid: &str) -> Result<DaemonStatus, JobError> {
        let gid = gid.trim();
        if gid.is_empty() {
            return Err(JobError::invalid("gid is required."));
        }

        let st = self
            .rpc
            .call("tellStatus", vec![json!(gid), json!(STATUS_KEYS)])
            .await
            .map_err(rpc_failure)?;

        let hint = self.registry.get(gid).and_then(|job| job.filename_hint);
        Ok(normalize_status(&st, hint.as_deref()))
    }

    /// Ask the daemon to remove a job. Success is not verified.
    pub async fn stop(&self, gid: &str) -> Result<(), JobError> {
        let gid = gid.trim();
        if gid.is_empty() {
            return Err(JobError::invalid("gid is required."));
        }

        self.rpc
            .call("remove", vec![json!(gid)])
            .await
            .map_err(rpc_failure)?;
        tracing::info!(gid = %gid, "Daemon download removed");
        Ok(())
    }
}
