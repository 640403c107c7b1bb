// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lock helpers that survive poisoning.
//!
//! A worker that panics while holding a registry lock poisons it. Job records
//! are plain data updated in single steps, so the last written state is still
//! meaningful; we log and keep serving instead of taking every later poll
//! down with the same panic.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(
                target: "fetchhub::locks",
                event = "LOCK_POISONED_READ",
                "Registry lock was poisoned; continuing with last written state"
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(
                target: "fetchhub::locks",
                event = "LOCK_POISONED_WRITE",
                "Registry lock was poisoned; continuing with last written state"
            );
            poisoned.into_inner()
        }
    }
}
