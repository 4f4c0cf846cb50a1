// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Garbage collection of expired on-disk state.
//!
//! A pass takes `gc.lock` with a non-blocking exclusive lock, then walks
//! `tokens`, `ledger`, `uploads` and `throttle` in that order. Each file's
//! eligibility is derived from disk at the moment it is visited; in apply
//! mode an eligible file is unlinked straight away, so a dry run and an
//! apply run over the same state report the same numbers.
//!
//! | type     | eligible when                                   |
//! |----------|-------------------------------------------------|
//! | tokens   | record `expires < now`                          |
//! | ledger   | `now >= mtime + token_ttl_max + ledger_grace`   |
//! | uploads  | `now >= mtime + retention` (control files kept) |
//! | throttle | [`Throttle::is_stale`]                          |
//!
//! Temp files orphaned by an interrupted record write count as tokens once
//! they are an hour old. An apply pass ends by pruning shard directories it
//! left empty.

use crate::clock::Clock;
use crate::config::Config;
use crate::lock::{open_lock_file, FileLockGuard};
use crate::storage::{self, PrivateDir, CONTROL_FILES};
use crate::throttle::{unix_seconds, Throttle};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Age after which an orphaned record temp file is swept.
const ORPHAN_TEMP_SECONDS: i64 = 3600;

/// Artifact categories in sweep order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    Tokens,
    Ledger,
    Uploads,
    Throttle,
}

impl GcKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tokens => "tokens",
            Self::Ledger => "ledger",
            Self::Uploads => "uploads",
            Self::Throttle => "throttle",
        }
    }
}

/// Options for a single pass.
#[derive(Debug, Clone, Default)]
pub struct GcOptions {
    pub dry_run: bool,
    /// Files examined before stopping; defaults to `gc.batch_limit`
    pub limit: Option<usize>,
    /// Override for the current time
    pub now: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TypeStats {
    pub scanned: usize,
    pub candidates: usize,
    pub candidate_bytes: u64,
    pub deleted: usize,
    pub deleted_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ByType {
    pub tokens: TypeStats,
    pub ledger: TypeStats,
    pub uploads: TypeStats,
    pub throttle: TypeStats,
}

impl ByType {
    fn get_mut(&mut self, kind: GcKind) -> &mut TypeStats {
        match kind {
            GcKind::Tokens => &mut self.tokens,
            GcKind::Ledger => &mut self.ledger,
            GcKind::Uploads => &mut self.uploads,
            GcKind::Throttle => &mut self.throttle,
        }
    }

    pub fn get(&self, kind: GcKind) -> &TypeStats {
        match kind {
            GcKind::Tokens => &self.tokens,
            GcKind::Ledger => &self.ledger,
            GcKind::Uploads => &self.uploads,
            GcKind::Throttle => &self.throttle,
        }
    }
}

/// Report of a pass, also emitted as the `EFORMS_GC_SUMMARY` log event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GcSummary {
    pub ok: bool,
    pub dry_run: bool,
    pub locked: bool,
    #[serde(skip_serializing_if = "str::is_empty")]
    pub reason: &'static str,
    pub limit: usize,
    pub now: i64,
    pub reached_limit: bool,
    pub scanned: usize,
    pub candidates: usize,
    pub candidate_bytes: u64,
    pub deleted: usize,
    pub deleted_bytes: u64,
    pub by_type: ByType,
}

impl GcSummary {
    fn new(dry_run: bool, limit: usize, now: i64) -> Self {
        Self {
            ok: true,
            dry_run,
            locked: false,
            reason: "",
            limit,
            now,
            reached_limit: false,
            scanned: 0,
            candidates: 0,
            candidate_bytes: 0,
            deleted: 0,
            deleted_bytes: 0,
            by_type: ByType::default(),
        }
    }

    fn failed(mut self, reason: &'static str) -> Self {
        self.ok = false;
        self.reason = reason;
        self
    }
}

#[derive(Deserialize)]
struct TokenExpiry {
    expires: i64,
}

/// Runs GC passes over the private directory.
pub struct GcRunner {
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    throttle: Throttle,
}

impl GcRunner {
    pub fn new(config: Arc<Config>, clock: Arc<dyn Clock>) -> Self {
        let throttle = Throttle::new(
            &config.storage.root,
            config.throttle.clone(),
            config.gc.throttle_stale_seconds,
            clock.clone(),
        );
        Self {
            config,
            clock,
            throttle,
        }
    }

    pub fn run(&self, options: &GcOptions) -> GcSummary {
        let now = options.now.unwrap_or_else(|| self.clock.now());
        let limit = options
            .limit
            .filter(|l| *l > 0)
            .unwrap_or(self.config.gc.batch_limit);
        let summary = GcSummary::new(options.dry_run, limit, now);

        let private = match PrivateDir::ensure(&self.config.storage.root) {
            Ok(private) => private,
            Err(err) => {
                warn!(code = "EFORMS_ERR_STORAGE_UNAVAILABLE", error = %err, "GC cannot open private dir");
                return log_summary(summary.failed("private_dir_unavailable"));
            }
        };

        let lock_path = private.gc_lock_path();
        let lock_file = match open_lock_file(&lock_path) {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %lock_path.display(), error = %err, "GC lock file unavailable");
                return log_summary(summary.failed("gc_lock_unavailable"));
            }
        };
        let guard = match FileLockGuard::try_lock(&lock_file) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                let mut summary = summary.failed("gc_lock_held");
                summary.locked = true;
                return log_summary(summary);
            }
            Err(err) => {
                warn!(path = %lock_path.display(), error = %err, "GC lock failed");
                return log_summary(summary.failed("gc_lock_unavailable"));
            }
        };

        let mut pass = Pass {
            config: &self.config,
            throttle: &self.throttle,
            summary,
        };
        pass.sweep(GcKind::Tokens, &private.tokens_dir());
        pass.sweep(GcKind::Ledger, &private.ledger_dir());
        if self.config.uploads.retention_seconds > 0 {
            pass.sweep(GcKind::Uploads, &private.uploads_dir());
        }
        pass.sweep(GcKind::Throttle, &self.throttle.dir());
        if !options.dry_run {
            self.prune_shards(&private);
        }
        drop(guard);

        log_summary(pass.summary)
    }
}

impl GcRunner {
    /// Remove empty token, ledger and throttle shards. Writers recreate a
    /// shard that disappears under them.
    fn prune_shards(&self, private: &PrivateDir) {
        let report = |dir: &Path, result: io::Result<usize>| match result {
            Ok(0) => {}
            Ok(removed) => debug!(dir = %dir.display(), removed, "Pruned empty shards"),
            Err(err) => debug!(dir = %dir.display(), error = %err, "Shard prune failed"),
        };

        let tokens = private.tokens_dir();
        report(&tokens, storage::prune_empty_subdirs(&tokens));

        let ledger = private.ledger_dir();
        if let Ok(forms) = fs::read_dir(&ledger) {
            for form in forms.filter_map(Result::ok).map(|e| e.path()) {
                report(&form, storage::prune_empty_subdirs(&form));
            }
        }
        report(&ledger, storage::prune_empty_subdirs(&ledger));

        report(&self.throttle.dir(), self.throttle.prune_shards());
    }
}

fn log_summary(summary: GcSummary) -> GcSummary {
    info!(
        code = "EFORMS_GC_SUMMARY",
        ok = summary.ok,
        dry_run = summary.dry_run,
        locked = summary.locked,
        reason = summary.reason,
        reached_limit = summary.reached_limit,
        scanned = summary.scanned,
        candidates = summary.candidates,
        candidate_bytes = summary.candidate_bytes,
        deleted = summary.deleted,
        deleted_bytes = summary.deleted_bytes,
        "GC pass finished"
    );
    summary
}

struct Pass<'a> {
    config: &'a Config,
    throttle: &'a Throttle,
    summary: GcSummary,
}

impl Pass<'_> {
    fn sweep(&mut self, kind: GcKind, dir: &Path) {
        if let Err(err) = self.visit_dir(kind, dir, dir) {
            warn!(kind = kind.as_str(), dir = %dir.display(), error = %err, "GC scan failed");
        }
    }

    /// Depth-first walk in sorted order. Returns `Ok(false)` once the limit
    /// has been reached.
    fn visit_dir(&mut self, kind: GcKind, base: &Path, dir: &Path) -> io::Result<bool> {
        let mut entries = match fs::read_dir(dir) {
            Ok(entries) => entries
                .map(|e| e.map(|e| e.path()))
                .collect::<io::Result<Vec<_>>>()?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(err),
        };
        entries.sort();

        for path in entries {
            let meta = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if meta.is_dir() {
                if !self.visit_dir(kind, base, &path)? {
                    return Ok(false);
                }
                continue;
            }
            if !meta.is_file() {
                continue;
            }
            if self.summary.scanned >= self.summary.limit {
                self.summary.reached_limit = true;
                return Ok(false);
            }
            self.visit_file(kind, base, &path, &meta);
        }
        Ok(true)
    }

    fn visit_file(&mut self, kind: GcKind, base: &Path, path: &Path, meta: &fs::Metadata) {
        self.summary.scanned += 1;
        self.summary.by_type.get_mut(kind).scanned += 1;

        if !self.eligible(kind, base, path, meta) {
            return;
        }
        let size = meta.len();
        self.summary.candidates += 1;
        self.summary.candidate_bytes += size;
        let stats = self.summary.by_type.get_mut(kind);
        stats.candidates += 1;
        stats.candidate_bytes += size;

        if self.summary.dry_run {
            return;
        }
        match fs::remove_file(path) {
            Ok(()) => {
                self.summary.deleted += 1;
                self.summary.deleted_bytes += size;
                let stats = self.summary.by_type.get_mut(kind);
                stats.deleted += 1;
                stats.deleted_bytes += size;
            }
            Err(err) => debug!(path = %path.display(), error = %err, "GC unlink failed"),
        }
    }

    fn eligible(&self, kind: GcKind, base: &Path, path: &Path, meta: &fs::Metadata) -> bool {
        let now = self.summary.now;
        let gc = &self.config.gc;
        let mtime = match meta.modified() {
            Ok(mtime) => unix_seconds(mtime),
            Err(_) => return false,
        };
        match kind {
            GcKind::Tokens if storage::is_write_temp(path) => now - mtime > ORPHAN_TEMP_SECONDS,
            GcKind::Tokens => {
                has_extension(path, "json")
                    && fs::read(path)
                        .ok()
                        .and_then(|raw| serde_json::from_slice::<TokenExpiry>(&raw).ok())
                        .map(|record| record.expires < now)
                        .unwrap_or(false)
            }
            GcKind::Ledger => {
                let window = (gc.token_ttl_max_seconds + gc.ledger_grace_seconds) as i64;
                has_extension(path, "used") && now >= mtime + window
            }
            GcKind::Uploads => {
                let retention = self.config.uploads.retention_seconds as i64;
                !is_control_file(base, path) && now >= mtime + retention
            }
            GcKind::Throttle => self.throttle.is_stale(path, mtime, now),
        }
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ext)
}

/// Deny-rule sentinels and dotfiles at the uploads root are never swept.
fn is_control_file(base: &Path, path: &Path) -> bool {
    if path.parent() != Some(base) {
        return false;
    }
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => CONTROL_FILES.contains(&name) || name.starts_with('.'),
        None => true,
    }
}
