// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! fetchhub - background download jobs behind a small HTTP API
//!
//! Two structurally different backends share one status contract:
//!
//! **aria2 daemon** (out-of-process, byte progress) and
//! **model hub** (in-process worker, coarse state)
//!
//! # Core Modules
//!
//! - [`resolver`] - Destination filename resolution from URL hints and headers
//! - [`rpc`] - aria2 JSON-RPC client and on-demand daemon startup
//! - [`daemon`] - Jobs executed by the aria2 daemon
//! - [`hub`] - Jobs executed on in-process blocking workers
//! - [`registry`] - In-memory job table shared by handlers and workers
//! - [`browse`] - Destination folder listing and uploads
//! - [`server`] - HTTP control surface
//! - [`config`] - File and environment configuration
//! - [`error`] - Error type and HTTP mapping

pub mod browse;
pub mod config;
pub mod daemon;
pub mod error;
pub mod hub;
pub mod locks;
pub mod paths;
pub mod registry;
pub mod resolver;
pub mod rpc;
pub mod server;

pub use config::Config;
pub use daemon::{DaemonJobs, DaemonStartRequest, DaemonStarted, DaemonStatus};
pub use error::JobError;
pub use hub::{HttpHubDownloader, HubDownloader, HubError, HubJobs, HubStartRequest, JobState};
pub use registry::JobRegistry;
pub use resolver::{FilenameResolver, HeaderProbe, ResolvedName};
pub use rpc::{Aria2Rpc, DaemonSupervisor, RpcError, RpcTransport};
pub use server::{router, AppState, Server};
