// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Replay ledger.
//!
//! A submission is consumed by creating `ledger/<form_id>/<h2>/<sha1>.used`
//! with `O_CREAT | O_EXCL`. Of any number of concurrent reservations for the
//! same `(form_id, token)` exactly one creates the file; the rest see
//! `AlreadyExists` and report [`Reservation::Duplicate`].

use crate::error::{StorageError, StorageResult};
use crate::storage::{self, PrivateDir};
use crate::token::is_valid_form_id;
use sha1::{Digest, Sha1};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

const MARKER_SUFFIX: &str = ".used";

/// Successful reservation outcomes. IO failures are returned as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// This caller consumed the token
    Reserved,
    /// Someone already did
    Duplicate,
}

/// `sha1(form_id + ":" + token)` as lowercase hex.
pub fn ledger_key(form_id: &str, token: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(form_id.as_bytes());
    hasher.update(b":");
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct Ledger {
    root: PathBuf,
}

impl Ledger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Marker path for a reservation.
    pub fn marker_path(&self, form_id: &str, token: &str) -> PathBuf {
        let key = ledger_key(form_id, token);
        PrivateDir::at(&self.root)
            .ledger_dir()
            .join(form_id)
            .join(storage::h2(&key))
            .join(format!("{key}{MARKER_SUFFIX}"))
    }

    /// Atomically consume `(form_id, token)`.
    pub fn reserve(&self, form_id: &str, token: &str) -> StorageResult<Reservation> {
        if !is_valid_form_id(form_id) {
            return Err(StorageError::InvalidInput("form_id"));
        }
        if token.is_empty() {
            return Err(StorageError::InvalidInput("token"));
        }

        let path = self.marker_path(form_id, token);
        let result = self.create_marker(&path);
        match &result {
            Ok(Reservation::Reserved) => debug!(form_id, code = "EFORMS_RESERVE", "Ledger reserved"),
            Ok(Reservation::Duplicate) => debug!(form_id, "Ledger duplicate"),
            // The caller reports the fatal condition
            Err(err) => debug!(form_id, path = %path.display(), error = %err, "Ledger reservation failed"),
        }
        result
    }

    fn create_marker(&self, path: &Path) -> StorageResult<Reservation> {
        PrivateDir::ensure(&self.root)?;
        let shard = path
            .parent()
            .ok_or(StorageError::InvalidInput("marker path"))?;
        storage::in_shard(shard, || match storage::create_exclusive(path) {
            Ok(file) => file.sync_all().map(|()| Reservation::Reserved),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(Reservation::Duplicate),
            Err(err) => Err(err),
        })
    }
}
