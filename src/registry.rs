// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory job table shared between request handlers and workers.
//!
//! Each controller owns its own registry, so daemon gids and in-process ids
//! live in separate namespaces. Records are handed out as clones; all
//! mutation happens inside a single closure under the write lock, which keeps
//! readers from ever seeing half of an update. Callers must not do I/O inside
//! those closures.
//!
//! Nothing is ever evicted: records live until the process exits.

use std::collections::HashMap;
use std::sync::RwLock;

use uuid::Uuid;

use crate::locks::{resilient_read, resilient_write};

/// Generate a fresh job id (32 lowercase hex characters).
pub fn new_job_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Thread-safe map from job id to job record.
#[derive(Debug)]
pub struct JobRegistry<T> {
    jobs: RwLock<HashMap<String, T>>,
}

impl<T> Default for JobRegistry<T> {
    fn default() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Clone> JobRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record, returning the previous one.
    pub fn insert(&self, id: impl Into<String>, record: T) -> Option<T> {
        resilient_write(&self.jobs).insert(id.into(), record)
    }

    /// Insert `record` unless an existing record under `id` is `occupied`.
    ///
    /// The check and the insert happen under one lock, so two concurrent
    /// starts with the same id cannot both win. Returns `true` on insert.
    pub fn insert_unless<F>(&self, id: &str, record: T, occupied: F) -> bool
    where
        F: FnOnce(&T) -> bool,
    {
        let mut jobs = resilient_write(&self.jobs);
        if jobs.get(id).map(occupied).unwrap_or(false) {
            return false;
        }
        jobs.insert(id.to_string(), record);
        true
    }

    /// Snapshot of a record.
    pub fn get(&self, id: &str) -> Option<T> {
        resilient_read(&self.jobs).get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        resilient_read(&self.jobs).contains_key(id)
    }

    /// Apply `f` to a record under the write lock.
    ///
    /// Returns `None` when the id is unknown.
    pub fn update<R, F>(&self, id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        resilient_write(&self.jobs).get_mut(id).map(f)
    }

    pub fn len(&self) -> usize {
        resilient_read(&self.jobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of all tracked jobs, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = resilient_read(&self.jobs).keys().cloned().collect();
        ids.sort();
        ids
    }
}
