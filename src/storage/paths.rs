// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Path constants and utilities for the on-device data directory.

use std::path::{Path, PathBuf};

use base64ct::{Base64UrlUnpadded, Encoding};

/// Default data directory when `DATA_DIR` is not set.
pub const DATA_ROOT: &str = "./data";

/// File name of the embedded local-mode database.
pub const LOCAL_DB_FILE: &str = "local.redb";

/// Storage path utilities for the data directory.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self::new(DATA_ROOT)
    }
}

impl StoragePaths {
    /// Create a new StoragePaths with a custom root (useful for testing).
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local-mode database file.
    pub fn local_db(&self) -> PathBuf {
        self.root.join(LOCAL_DB_FILE)
    }

    // ========== Preference Paths ==========

    /// Directory holding per-user mode and crypto params.
    pub fn prefs_dir(&self) -> PathBuf {
        self.root.join("prefs")
    }

    /// Preference document of one user.
    ///
    /// User ids are opaque, so the file stem is their URL-safe base64.
    pub fn user_prefs(&self, user_id: &str) -> PathBuf {
        let stem = Base64UrlUnpadded::encode_string(user_id.as_bytes());
        self.prefs_dir().join(format!("{stem}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_use_data_root() {
        let paths = StoragePaths::default();
        assert_eq!(paths.root(), Path::new("./data"));
        assert_eq!(paths.local_db(), PathBuf::from("./data/local.redb"));
    }

    #[test]
    fn user_prefs_are_filesystem_safe() {
        let paths = StoragePaths::new("/tmp/test-data");
        let p = paths.user_prefs("../../etc/passwd");
        assert_eq!(p.parent().unwrap(), Path::new("/tmp/test-data/prefs"));
        let name = p.file_name().unwrap().to_str().unwrap();
        assert!(!name.contains('/'));
        assert!(name.ends_with(".json"));
    }

    #[test]
    fn distinct_users_get_distinct_files() {
        let paths = StoragePaths::new("/tmp/test-data");
        assert_ne!(paths.user_prefs("user-a"), paths.user_prefs("user-b"));
        assert_eq!(paths.user_prefs("user-a"), paths.user_prefs("user-a"));
    }
}
