// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Durable per-user privacy preferences.
//!
//! One small JSON document per user holds the selected [`PrivacyMode`] and
//! the [`CryptoParams`]. The derived key is never stored here.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::StoragePaths;
use crate::error::EngineResult;
use crate::models::PrivacyMode;
use crate::privacy::crypto::CryptoParams;

/// Persisted preference document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPrefs {
    #[serde(default)]
    pub mode: PrivacyMode,
    #[serde(default)]
    pub crypto_params: Option<CryptoParams>,
}

/// File-backed store for [`UserPrefs`].
#[derive(Debug, Clone)]
pub struct PreferenceStore {
    paths: StoragePaths,
}

impl PreferenceStore {
    pub fn new(paths: StoragePaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    /// Preferences of a user; defaults when nothing was saved yet.
    ///
    /// Unreadable documents and structurally invalid params fall back to
    /// defaults so a damaged file can't lock the user out of cloud mode.
    pub fn load(&self, user_id: &str) -> EngineResult<UserPrefs> {
        let path = self.paths.user_prefs(user_id);
        let mut prefs = match read_json::<UserPrefs>(&path) {
            Ok(prefs) => prefs,
            Err(ReadError::Missing) => return Ok(UserPrefs::default()),
            Err(ReadError::Io(e)) => return Err(e.into()),
            Err(ReadError::Json(e)) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "Ignoring unreadable preference file"
                );
                return Ok(UserPrefs::default());
            }
        };
        if prefs.crypto_params.as_ref().is_some_and(|p| !p.is_valid()) {
            tracing::warn!(user_id = %user_id, "Ignoring invalid stored crypto params");
            prefs.crypto_params = None;
        }
        Ok(prefs)
    }

    pub fn save(&self, user_id: &str, prefs: &UserPrefs) -> EngineResult<()> {
        write_json(&self.paths.user_prefs(user_id), prefs)
    }

    pub fn set_mode(&self, user_id: &str, mode: PrivacyMode) -> EngineResult<()> {
        let mut prefs = self.load(user_id)?;
        prefs.mode = mode;
        self.save(user_id, &prefs)
    }

    /// Store or remove the crypto params.
    pub fn set_crypto_params(
        &self,
        user_id: &str,
        params: Option<&CryptoParams>,
    ) -> EngineResult<()> {
        let mut prefs = self.load(user_id)?;
        prefs.crypto_params = params.cloned();
        self.save(user_id, &prefs)
    }
}

enum ReadError {
    Missing,
    Io(io::Error),
    Json(serde_json::Error),
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ReadError> {
    let file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ReadError::Missing,
        _ => ReadError::Io(e),
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(ReadError::Json)
}

/// Write a JSON file (atomic write via rename).
fn write_json<T: Serialize>(path: &Path, value: &T) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("tmp");
    {
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.flush()?;
    }

    fs::rename(&temp_path, path)?;
    Ok(())
}
