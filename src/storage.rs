// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Private storage directory and filesystem primitives.
//!
//! All state lives under `<root>/eforms-private`:
//!
//! ```text
//! tokens/<h2>/<sha256(token)>.json
//! ledger/<form_id>/<h2>/<sha1>.used
//! throttle/<h2>/<key>.json
//! uploads/...
//! gc.lock
//! ```
//!
//! Directories are created `0700` and files `0600`. The two correctness
//! primitives are exclusive create ([`create_exclusive`]) and the advisory
//! locks in [`crate::lock`].

use crate::error::{StorageError, StorageResult};
use rand::RngCore;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub const PRIVATE_DIR_NAME: &str = "eforms-private";
pub const TOKENS_DIR: &str = "tokens";
pub const LEDGER_DIR: &str = "ledger";
pub const THROTTLE_DIR: &str = "throttle";
pub const UPLOADS_DIR: &str = "uploads";
pub const GC_LOCK_FILE: &str = "gc.lock";

pub const INDEX_FILENAME: &str = "index.html";
pub const HTACCESS_FILENAME: &str = ".htaccess";
pub const WEBCONFIG_FILENAME: &str = "web.config";

const INDEX_CONTENT: &str = "<!doctype html><title></title>";
const HTACCESS_CONTENT: &str = "<IfModule mod_authz_core.c>\n    Require all denied\n</IfModule>\n<IfModule !mod_authz_core.c>\n    Deny from all\n</IfModule>\n";
const WEBCONFIG_CONTENT: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<configuration>\n  <system.webServer>\n    <authorization>\n      <deny users=\"*\" />\n    </authorization>\n  </system.webServer>\n</configuration>\n";

/// Deny-rule files that must never be swept.
pub const CONTROL_FILES: [&str; 3] = [INDEX_FILENAME, HTACCESS_FILENAME, WEBCONFIG_FILENAME];

/// Handle on the private directory.
#[derive(Debug, Clone)]
pub struct PrivateDir {
    path: PathBuf,
}

impl PrivateDir {
    /// Path of the private directory for a storage root, without touching disk.
    pub fn at(root: &Path) -> Self {
        Self {
            path: root.join(PRIVATE_DIR_NAME),
        }
    }

    /// Create the private directory and its deny files if missing.
    pub fn ensure(root: &Path) -> StorageResult<Self> {
        if !root.is_dir() {
            return Err(StorageError::Unavailable(format!(
                "storage root {} is not a directory",
                root.display()
            )));
        }
        let private = Self::at(root);
        ensure_dir(&private.path).map_err(|e| StorageError::io(&private.path, e))?;
        for (name, content) in [
            (INDEX_FILENAME, INDEX_CONTENT),
            (HTACCESS_FILENAME, HTACCESS_CONTENT),
            (WEBCONFIG_FILENAME, WEBCONFIG_CONTENT),
        ] {
            let path = private.path.join(name);
            ensure_control_file(&path, content).map_err(|e| StorageError::io(&path, e))?;
        }
        Ok(private)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tokens_dir(&self) -> PathBuf {
        self.path.join(TOKENS_DIR)
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.path.join(LEDGER_DIR)
    }

    pub fn throttle_dir(&self) -> PathBuf {
        self.path.join(THROTTLE_DIR)
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.path.join(UPLOADS_DIR)
    }

    pub fn gc_lock_path(&self) -> PathBuf {
        self.path.join(GC_LOCK_FILE)
    }
}

fn ensure_control_file(path: &Path, content: &str) -> io::Result<()> {
    match create_exclusive(path) {
        Ok(mut file) => {
            file.write_all(content.as_bytes())?;
            file.sync_all()
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err),
    }
}

/// Shard prefix: the first two characters of a hex digest.
pub fn h2(hex: &str) -> &str {
    hex.get(..2).unwrap_or(hex)
}

/// Create a directory tree with owner-only permissions.
pub fn ensure_dir(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        return set_mode(path, 0o700);
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)?;
    set_mode(path, 0o700)
}

/// Run `op` for a file inside `shard`, creating the shard first. GC may
/// prune an empty shard between the two steps, so a `NotFound` from `op`
/// recreates it once. Shard failures never reach `op`'s error handling.
pub fn in_shard<T>(shard: &Path, mut op: impl FnMut() -> io::Result<T>) -> StorageResult<T> {
    ensure_dir(shard).map_err(|e| StorageError::io(shard, e))?;
    let result = match op() {
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            ensure_dir(shard).map_err(|e| StorageError::io(shard, e))?;
            op()
        }
        result => result,
    };
    result.map_err(|e| StorageError::io(shard, e))
}

/// Run filesystem work on the blocking pool so a slow disk never stalls an
/// async worker. The caller's span and subscriber follow the closure.
pub async fn run_blocking<T, F>(op: F) -> Result<T, tokio::task::JoinError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let span = tracing::Span::current();
    let dispatch = tracing::dispatcher::get_default(|d| d.clone());
    tokio::task::spawn_blocking(move || {
        tracing::dispatcher::with_default(&dispatch, || span.in_scope(op))
    })
    .await
}

/// Open a new file that must not already exist (`O_CREAT | O_EXCL`).
pub fn create_exclusive(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Write `bytes` to `path` through an exclusive temp file and rename, so
/// readers never observe a partial record.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp = dir.join(format!(".{name}.{}.tmp", random_hex(6)));

    let result = (|| {
        let mut file = create_exclusive(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Whether `path` is a temp file left by [`write_atomic`].
pub fn is_write_temp(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| name.starts_with('.') && name.ends_with(".tmp"))
}

/// Lowercase hex of `len` random bytes.
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Remove empty subdirectories directly below `dir`. Returns how many were
/// removed.
pub fn prune_empty_subdirs(dir: &Path) -> io::Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };
    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() && fs::read_dir(&path)?.next().is_none() && fs::remove_dir(&path).is_ok()
        {
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Outcome of a storage probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub ok: bool,
    /// Short machine-readable failure reason, empty when healthy
    pub reason: &'static str,
    pub private_dir: PathBuf,
}

/// Probes the private directory for the primitives the stores rely on.
///
/// The failure warning is emitted at most once per process.
#[derive(Debug)]
pub struct StorageHealth {
    root: PathBuf,
    warned: AtomicBool,
}

impl StorageHealth {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            warned: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run the probe: directory creation, temp write + rename, and
    /// exclusive create that refuses a second create.
    pub fn check(&self) -> HealthReport {
        let private = PrivateDir::at(&self.root);
        let reason = match PrivateDir::ensure(&self.root) {
            Ok(dir) => probe(dir.path()).err(),
            Err(StorageError::Unavailable(_)) => Some("storage_root_missing"),
            Err(_) => Some("private_dir_unavailable"),
        };

        let report = HealthReport {
            ok: reason.is_none(),
            reason: reason.unwrap_or(""),
            private_dir: private.path().to_path_buf(),
        };
        if report.ok {
            debug!(private_dir = %report.private_dir.display(), "Storage probe passed");
        } else if !self.warned.swap(true, Ordering::SeqCst) {
            // Per process; requests report their own failure
            warn!(
                reason = report.reason,
                private_dir = %report.private_dir.display(),
                "Storage health check failed"
            );
        }
        report
    }

    /// [`check`](Self::check) on the blocking pool.
    pub async fn check_async(self: Arc<Self>) -> HealthReport {
        let private_dir = PrivateDir::at(&self.root).path().to_path_buf();
        run_blocking(move || self.check())
            .await
            .unwrap_or(HealthReport {
                ok: false,
                reason: "probe_task_failed",
                private_dir,
            })
    }
}

fn probe(private_dir: &Path) -> Result<(), &'static str> {
    let salt = random_hex(4);
    let probe_dir = private_dir.join(format!(".eforms-health-{salt}"));
    if probe_dir.exists() {
        return Err("probe_collision");
    }
    ensure_dir(&probe_dir).map_err(|_| "probe_dir_create_failed")?;

    let result = probe_files(&probe_dir, &salt);
    let _ = fs::remove_dir_all(&probe_dir);
    result
}

fn probe_files(probe_dir: &Path, salt: &str) -> Result<(), &'static str> {
    let tmp = probe_dir.join(format!("probe-{salt}.tmp"));
    let finished = probe_dir.join(format!("probe-{salt}.final"));
    let exclusive = probe_dir.join(format!("probe-{salt}.xb"));

    let mut file = create_exclusive(&tmp).map_err(|_| "probe_write_failed")?;
    file.write_all(b"eforms-health")
        .map_err(|_| "probe_write_failed")?;
    drop(file);

    fs::rename(&tmp, &finished).map_err(|_| "probe_rename_failed")?;
    if !finished.is_file() {
        return Err("probe_rename_failed");
    }

    create_exclusive(&exclusive).map_err(|_| "probe_xb_failed")?;
    match create_exclusive(&exclusive) {
        Ok(_) => Err("probe_xb_not_exclusive"),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(_) => Err("probe_xb_failed"),
    }
}
