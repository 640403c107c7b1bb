// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Destination directory handling shared by both job controllers and the
//! upload endpoint.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::JobError;
use crate::registry::new_job_id;

/// Expand `~`, normalize to an absolute path.
///
/// An empty input means the current working directory. A bare drive letter
/// such as `C:` is treated as the drive root.
pub fn expand_path(raw: &str) -> PathBuf {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    }

    let mut owned = trimmed.to_string();
    if owned.len() == 2 && owned.ends_with(':') && owned.as_bytes()[0].is_ascii_alphabetic() {
        owned.push(std::path::MAIN_SEPARATOR);
    }

    let path = expand_home(&owned);
    std::path::absolute(&path).unwrap_or(path)
}

/// `~` and `~/rest` resolve against the home directory; `~user` is left alone.
fn expand_home(raw: &str) -> PathBuf {
    let rest = match raw.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with(['/', '\\']) => rest,
        _ => return PathBuf::from(raw),
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest.trim_start_matches(['/', '\\'])),
        None => PathBuf::from(raw),
    }
}

/// Make sure `raw` names a directory we can write into, creating it if needed.
///
/// Runs before any job record exists, so a failure here leaves no trace.
pub fn prepare_destination(raw: &str) -> Result<PathBuf, JobError> {
    let dir = expand_path(raw);

    fs::create_dir_all(&dir)
        .map_err(|e| JobError::invalid(format!("Cannot access destination: {}", e)))?;

    if !dir.is_dir() || !is_writable(&dir) {
        return Err(JobError::invalid(format!(
            "Destination not writable: {}",
            dir.display()
        )));
    }

    Ok(dir)
}

/// Probe writability by creating and removing a scratch file.
fn is_writable(dir: &Path) -> bool {
    let probe = dir.join(format!(".fetchhub-probe-{}", new_job_id()));
    match OpenOptions::new().write(true).create_new(true).open(&probe) {
        Ok(file) => {
            drop(file);
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// Last path component, splitting on both `/` and `\`.
pub fn basename(raw: &str) -> &str {
    raw.rsplit(['/', '\\']).next().unwrap_or(raw)
}
