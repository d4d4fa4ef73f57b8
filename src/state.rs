// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::privacy::PrivacyController;
use crate::storage::{LocalStore, PreferenceStore, SessionKeyCache};

/// Process-wide handles shared by every user session.
#[derive(Clone)]
pub struct VaultState {
    pub config: EngineConfig,
    pub local: Arc<LocalStore>,
    pub prefs: PreferenceStore,
    pub keys: Arc<SessionKeyCache>,
}

impl VaultState {
    pub fn open(config: EngineConfig) -> EngineResult<Self> {
        let paths = config.storage_paths();
        let local = LocalStore::open(&paths.local_db())?;
        let keys = SessionKeyCache::new(config.session_cache_capacity);
        tracing::info!(
            data_dir = %paths.root().display(),
            cache_capacity = config.session_cache_capacity,
            "Vault state opened"
        );
        Ok(Self {
            prefs: PreferenceStore::new(paths),
            local: Arc::new(local),
            keys: Arc::new(keys),
            config,
        })
    }

    /// Privacy controller for one user, sharing this state's key cache.
    pub fn controller(&self, user_id: &str) -> EngineResult<PrivacyController> {
        Ok(
            PrivacyController::open(user_id, self.prefs.clone(), self.keys.clone())?
                .with_iterations(self.config.pbkdf2_iterations),
        )
    }
}
