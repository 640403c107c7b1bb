// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process model-hub downloads
//!
//! Each job runs one blocking hub transfer on tokio's blocking pool. The
//! worker is never joined: the job record in the registry is the only channel
//! back to callers, so status is coarse (`starting`, `running`, `done`,
//! `error`, `stopped`) rather than byte-level.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐ insert  ┌─────────────────┐
//! │ HubJobs         │────────▶│ JobRegistry     │
//! │ start/status/   │         │ <HubJob>        │
//! │ stop            │         └────────▲────────┘
//! └────────┬────────┘                  │ update
//!          │ spawn_blocking            │
//!          ▼                           │
//! ┌─────────────────┐         ┌────────┴────────┐
//! │ HubDownloader   │◀────────│ Worker          │
//! │ (blocking HTTP) │         │ (catch_unwind)  │
//! └─────────────────┘         └─────────────────┘
//! ```
//!
//! Stopping a job is advisory. The blocking call is not interrupted; the
//! record moves to `stopped` and stays there. A transfer that still completes
//! attaches its `filepath` so the file on disk can be found.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fetchhub::hub::{HttpHubDownloader, HubJobs, HubStartRequest};
//! use fetchhub::registry::JobRegistry;
//!
//! # async fn example() -> Result<(), fetchhub::error::JobError> {
//! let jobs = HubJobs::new(
//!     Arc::new(HttpHubDownloader::new("https://huggingface.co")),
//!     Arc::new(JobRegistry::new()),
//! );
//!
//! let started = jobs.start(HubStartRequest {
//!     repo_id: "openai-community/gpt2".into(),
//!     filename: "config.json".into(),
//!     dest_dir: "~/models/gpt2".into(),
//!     ..Default::default()
//! })?;
//!
//! let status = jobs.status(&started.gid)?;
//! println!("{}: {}", status.state, status.msg);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod manager;
pub mod types;

pub use client::{HttpHubDownloader, HubDownloader, HubError};
pub use manager::HubJobs;
pub use types::{HubJob, HubJobView, HubRequest, HubStartRequest, JobState};
