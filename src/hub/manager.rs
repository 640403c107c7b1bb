// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Hub job manager - start, poll and stop in-process downloads.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::JobError;
use crate::paths::prepare_destination;
use crate::registry::{new_job_id, JobRegistry};

use super::client::{HubDownloader, HubError};
use super::types::{HubJob, HubJobView, HubRequest, HubStartRequest, JobState};

/// Controller for in-process hub jobs.
#[derive(Clone)]
pub struct HubJobs {
    downloader: Arc<dyn HubDownloader>,
    registry: Arc<JobRegistry<HubJob>>,
    default_token: Option<String>,
}

impl HubJobs {
    pub fn new(downloader: Arc<dyn HubDownloader>, registry: Arc<JobRegistry<HubJob>>) -> Self {
        Self {
            downloader,
            registry,
            default_token: None,
        }
    }

    /// Token used when a start request carries none.
    pub fn with_default_token(mut self, token: Option<String>) -> Self {
        self.default_token = token.filter(|t| !t.trim().is_empty());
        self
    }

    /// Number of tracked jobs, finished ones included.
    pub fn tracked(&self) -> usize {
        self.registry.len()
    }

    /// Create a job record and hand the transfer to a blocking worker.
    ///
    /// Must be called from within a tokio runtime. Returns as soon as the
    /// worker is spawned.
    pub fn start(&self, req: HubStartRequest) -> Result<HubJobView, JobError> {
        let repo_id = req.repo_id.trim();
        let filename = req.filename.trim();
        let dest_raw = req.dest_dir.trim();
        if repo_id.is_empty() || filename.is_empty() || dest_raw.is_empty() {
            return Err(JobError::invalid("repo_id, filename, dest_dir are required"));
        }

        let dest_dir = prepare_destination(dest_raw)?;

        let gid = match req.gid.trim() {
            "" => new_job_id(),
            supplied => supplied.to_string(),
        };

        let record = HubJob::starting(dest_dir.clone());
        if !self
            .registry
            .insert_unless(&gid, record.clone(), |existing| existing.worker_active)
        {
            return Err(JobError::invalid(format!("Job {} is still running.", gid)));
        }

        let token = Some(req.token_input.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .or_else(|| self.default_token.clone());

        let request = HubRequest {
            repo_id: repo_id.to_string(),
            filename: filename.to_string(),
            dest_dir,
            token,
            revision: HubRequest::DEFAULT_REVISION.to_string(),
        };

        tracing::info!(
            gid = %gid,
            repo = %request.repo_id,
            file = %request.filename,
            dest = %request.dest_dir.display(),
            "Hub download queued"
        );

        let registry = Arc::clone(&self.registry);
        let downloader = Arc::clone(&self.downloader);
        let worker_gid = gid.clone();
        // Detached: the record is the only channel back.
        tokio::task::spawn_blocking(move || {
            run_worker(&registry, downloader.as_ref(), &worker_gid, &request)
        });

        let snapshot = self.registry.get(&gid).unwrap_or(record);
        Ok(snapshot.view(&gid))
    }

    pub fn status(&self, gid: &str) -> Result<HubJobView, JobError> {
        self.registry
            .get(gid)
            .map(|job| job.view(gid))
            .ok_or_else(JobError::unknown_id)
    }

    /// Mark a job stopped. The blocking transfer keeps running if active.
    pub fn stop(&self, gid: &str) -> Result<HubJobView, JobError> {
        let view = self
            .registry
            .update(gid, |job| {
                job.state = JobState::Stopped;
                if job.worker_active {
                    job.cancel_requested = true;
                    job.msg = "Stop requested by user.".to_string();
                } else {
                    job.msg = "Already finished.".to_string();
                }
                job.view(gid)
            })
            .ok_or_else(JobError::unknown_id)?;

        tracing::info!(gid = %gid, msg = %view.msg, "Hub download stop");
        Ok(view)
    }
}

impl std::fmt::Debug for HubJobs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubJobs")
            .field("jobs", &self.registry.len())
            .field("default_token", &self.default_token.as_ref().map(|_| "<set>"))
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Worker
// ============================================================================

fn run_worker(
    registry: &JobRegistry<HubJob>,
    downloader: &dyn HubDownloader,
    gid: &str,
    request: &HubRequest,
) {
    registry.update(gid, |job| {
        if !job.cancel_requested {
            job.state = JobState::Running;
            job.msg = "Download started…".to_string();
        }
    });

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| downloader.download(request)));

    let (state, msg, filepath): (JobState, String, Option<PathBuf>) = match outcome {
        Ok(Ok(path)) => (JobState::Done, "File download complete.".to_string(), Some(path)),
        Ok(Err(e)) => (JobState::Error, describe(&e), None),
        Err(payload) => (
            JobState::Error,
            format!("Panic: {}", panic_message(payload.as_ref())),
            None,
        ),
    };

    let cancelled = registry.update(gid, |job| {
        job.worker_active = false;
        if job.cancel_requested {
            // The state stays stopped, but a file that landed is still reported.
            job.filepath = filepath.clone();
            return true;
        }
        job.state = state;
        job.msg = msg.clone();
        job.filepath = filepath.clone();
        false
    });

    match (cancelled, state) {
        (Some(true), _) => {
            tracing::info!(gid = %gid, outcome = %msg, "Hub worker finished after stop")
        }
        (_, JobState::Done) => tracing::info!(gid = %gid, "Hub download complete"),
        _ => tracing::warn!(gid = %gid, error = %msg, "Hub download failed"),
    }
}

fn describe(e: &HubError) -> String {
    format!("{}: {}", e.kind(), e)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
