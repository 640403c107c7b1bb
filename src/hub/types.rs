// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Types for in-process hub jobs.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Coarse state of an in-process job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Record created, worker not yet running
    Starting,
    /// Blocking transfer in progress
    Running,
    /// File is on disk
    Done,
    /// Transfer failed or panicked
    Error,
    /// Stop requested by the user
    Stopped,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Starting => "starting",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Error => "error",
            JobState::Stopped => "stopped",
        }
    }

    /// Returns true once no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Error | JobState::Stopped)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry record for one in-process job.
#[derive(Debug, Clone, PartialEq)]
pub struct HubJob {
    pub state: JobState,
    pub msg: String,
    pub filepath: Option<PathBuf>,
    pub dest_dir: PathBuf,
    /// Advisory; the blocking transfer is not interrupted.
    pub cancel_requested: bool,
    /// Cleared by the worker in the same update that records its outcome.
    pub worker_active: bool,
}

impl HubJob {
    pub fn starting(dest_dir: PathBuf) -> Self {
        Self {
            state: JobState::Starting,
            msg: "Starting…".to_string(),
            filepath: None,
            dest_dir,
            cancel_requested: false,
            worker_active: true,
        }
    }

    pub fn view(&self, gid: &str) -> HubJobView {
        HubJobView {
            ok: true,
            gid: gid.to_string(),
            state: self.state,
            msg: self.msg.clone(),
            filepath: self
                .filepath
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        }
    }
}

/// Start request for a hub download.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HubStartRequest {
    #[serde(default)]
    pub repo_id: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub dest_dir: String,
    #[serde(default)]
    pub token_input: String,
    #[serde(default)]
    pub gid: String,
}

/// Caller-facing snapshot of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HubJobView {
    pub ok: bool,
    pub gid: String,
    pub state: JobState,
    pub msg: String,
    pub filepath: Option<String>,
}

/// One file to fetch from the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubRequest {
    pub repo_id: String,
    pub filename: String,
    pub dest_dir: PathBuf,
    pub token: Option<String>,
    pub revision: String,
}

impl HubRequest {
    pub const DEFAULT_REVISION: &'static str = "main";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(serde_json::to_value(JobState::Stopped).unwrap(), "stopped");
        assert_eq!(JobState::Running.to_string(), "running");
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Starting.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Done.is_terminal());
        assert!(JobState::Error.is_terminal());
        assert!(JobState::Stopped.is_terminal());
    }

    #[test]
    fn test_view_filepath_null_until_done() {
        let mut job = HubJob::starting(PathBuf::from("/tmp/x"));
        let v = serde_json::to_value(job.view("abc")).unwrap();
        assert!(v["filepath"].is_null());
        assert_eq!(v["state"], "starting");
        assert_eq!(v["msg"], "Starting…");

        job.state = JobState::Done;
        job.filepath = Some(PathBuf::from("/tmp/x/f.bin"));
        assert_eq!(job.view("abc").filepath.as_deref(), Some("/tmp/x/f.bin"));
    }

    #[test]
    fn test_start_request_missing_fields_are_empty() {
        let req: HubStartRequest = serde_json::from_str(r#"{"repo_id":"a/b"}"#).unwrap();
        assert_eq!(req.repo_id, "a/b");
        assert_eq!(req.filename, "");
        assert_eq!(req.gid, "");
    }
}
