// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! File-backed per-client rate limiter.
//!
//! Each client key owns `throttle/<h2>/<key>.json` holding
//! `{window_start, count, cooldown_until}`. A check opens the file, takes a
//! blocking exclusive `flock`, then reads, mutates and rewrites it before
//! unlocking, so concurrent checks for one key serialize.
//!
//! States:
//! - `ok`: within `max_per_minute` for the current 60 second window
//! - `over`: above the limit, or still inside a cooldown
//! - `hard`: above `max_per_minute * hard_multiplier`

use crate::clock::Clock;
use crate::config::ThrottleConfig;
use crate::error::{StorageError, StorageResult};
use crate::lock::{open_lock_file, FileLockGuard};
use crate::storage::{self, PrivateDir};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub const WINDOW_SECONDS: i64 = 60;

/// Throttle state for a key after a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrottleState {
    Ok,
    Over,
    Hard,
}

impl std::fmt::Display for ThrottleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Over => write!(f, "over"),
            Self::Hard => write!(f, "hard"),
        }
    }
}

/// Result of a throttle check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleDecision {
    pub state: ThrottleState,
    /// Seconds until the client may retry; 0 when `Ok`, otherwise >= 1
    pub retry_after: u64,
    /// Requests counted in the current window, this one included
    pub count: u32,
}

impl ThrottleDecision {
    pub fn allowed(&self) -> bool {
        self.state == ThrottleState::Ok
    }

    fn unlimited() -> Self {
        Self {
            state: ThrottleState::Ok,
            retry_after: 0,
            count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Counter {
    window_start: i64,
    count: u32,
    cooldown_until: i64,
}

/// Thread- and process-safe file throttle.
pub struct Throttle {
    root: PathBuf,
    config: ThrottleConfig,
    stale_seconds: u64,
    clock: Arc<dyn Clock>,
}

impl Throttle {
    pub fn new(
        root: impl Into<PathBuf>,
        config: ThrottleConfig,
        stale_seconds: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            root: root.into(),
            config,
            stale_seconds,
            clock,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enable
    }

    fn counter_path(&self, key: &str) -> PathBuf {
        self.dir()
            .join(storage::h2(key))
            .join(format!("{key}.json"))
    }

    /// Count a request for `key` and classify it.
    ///
    /// Keys must be lowercase hex (see [`crate::client_ip::throttle_key`]).
    pub fn check(&self, key: &str) -> StorageResult<ThrottleDecision> {
        if !self.config.enable {
            return Ok(ThrottleDecision::unlimited());
        }
        if key.len() < 2 || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidInput("throttle key"));
        }

        PrivateDir::ensure(&self.root)?;
        let path = self.counter_path(key);
        let shard = path
            .parent()
            .ok_or(StorageError::InvalidInput("throttle path"))?;
        let file = storage::in_shard(shard, || open_lock_file(&path))?;
        let guard = FileLockGuard::lock(&file).map_err(|e| StorageError::io(&path, e))?;
        let decision = self
            .update_locked(guard.file())
            .map_err(|e| StorageError::io(&path, e))?;
        drop(guard);

        if !decision.allowed() {
            debug!(
                state = %decision.state,
                count = decision.count,
                retry_after = decision.retry_after,
                "Throttle limit reached"
            );
        }
        Ok(decision)
    }

    /// Read-modify-write of the counter. Caller holds the lock.
    fn update_locked(&self, mut file: &fs::File) -> io::Result<ThrottleDecision> {
        let now = self.clock.now();

        let mut raw = String::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_string(&mut raw)?;
        let fresh = Counter {
            window_start: now,
            count: 0,
            cooldown_until: 0,
        };
        let mut counter = if raw.trim().is_empty() {
            fresh
        } else {
            serde_json::from_str::<Counter>(&raw).unwrap_or_else(|err| {
                warn!(error = %err, "Discarding unreadable throttle counter");
                fresh
            })
        };

        if now - counter.window_start >= WINDOW_SECONDS {
            counter.window_start = now;
            counter.count = 0;
        }
        counter.count = counter.count.saturating_add(1);

        let max = self.config.max_per_minute;
        let hard_limit = f64::from(max) * f64::from(self.config.hard_multiplier);
        let in_cooldown = now < counter.cooldown_until;

        let state = if f64::from(counter.count) > hard_limit {
            ThrottleState::Hard
        } else if counter.count > max || in_cooldown {
            ThrottleState::Over
        } else {
            ThrottleState::Ok
        };
        if state != ThrottleState::Ok && !in_cooldown {
            counter.cooldown_until = now + self.config.cooldown_seconds as i64;
        }

        let retry_after = if state == ThrottleState::Ok {
            0
        } else {
            let window_remaining = counter.window_start + WINDOW_SECONDS - now;
            let cooldown_remaining = counter.cooldown_until - now;
            window_remaining.max(cooldown_remaining).max(1) as u64
        };

        let body = serde_json::to_vec(&counter).map_err(io::Error::other)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&body)?;
        file.sync_data()?;

        Ok(ThrottleDecision {
            state,
            retry_after,
            count: counter.count,
        })
    }

    /// Whether a counter file is past the stale threshold at `now`.
    ///
    /// This is the only eligibility rule for counters; GC sweeps the
    /// throttle directory with it.
    pub fn is_stale(&self, path: &Path, mtime: i64, now: i64) -> bool {
        path.extension().and_then(|e| e.to_str()) == Some("json")
            && now - mtime > self.stale_seconds as i64
    }

    /// Remove shard directories left empty by a sweep.
    pub fn prune_shards(&self) -> io::Result<usize> {
        storage::prune_empty_subdirs(&self.dir())
    }

    pub fn dir(&self) -> PathBuf {
        PrivateDir::at(&self.root).throttle_dir()
    }
}

pub(crate) fn unix_seconds(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as i64
}
