// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Per-user privacy state: mode, crypto params and unlock state.
//!
//! A [`PrivacyController`] is built for one user session and passed to
//! whatever needs the mode or the key. It never migrates data itself; see
//! [`crate::migration`] for that.

use std::sync::Arc;

use super::crypto::{derive_key, CryptoParams, SymmetricKey, DEFAULT_ITERATIONS};
use crate::error::{EngineError, EngineResult};
use crate::models::PrivacyMode;
use crate::storage::{PreferenceStore, SessionKeyCache};

pub struct PrivacyController {
    user_id: String,
    mode: PrivacyMode,
    crypto_params: Option<CryptoParams>,
    key: Option<SymmetricKey>,
    prefs: PreferenceStore,
    keys: Arc<SessionKeyCache>,
    /// Iterations for params generated by this controller
    iterations: u32,
}

impl std::fmt::Debug for PrivacyController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivacyController")
            .field("user_id", &self.user_id)
            .field("mode", &self.mode)
            .field("has_params", &self.crypto_params.is_some())
            .field("is_unlocked", &self.is_unlocked())
            .finish()
    }
}

impl PrivacyController {
    /// Load the persisted mode and params for `user_id`.
    ///
    /// A cached session key is picked up only in encrypted mode.
    pub fn open(
        user_id: impl Into<String>,
        prefs: PreferenceStore,
        keys: Arc<SessionKeyCache>,
    ) -> EngineResult<Self> {
        let user_id = user_id.into();
        let stored = prefs.load(&user_id)?;
        let key = match stored.mode {
            PrivacyMode::Encrypted => keys.load(&user_id),
            _ => None,
        };
        Ok(Self {
            user_id,
            mode: stored.mode,
            crypto_params: stored.crypto_params,
            key,
            prefs,
            keys,
            iterations: DEFAULT_ITERATIONS,
        })
    }

    /// Override the PBKDF2 iteration count for newly generated params.
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn mode(&self) -> PrivacyMode {
        self.mode
    }

    pub fn crypto_params(&self) -> Option<&CryptoParams> {
        self.crypto_params.as_ref()
    }

    pub fn key(&self) -> Option<&SymmetricKey> {
        self.key.as_ref()
    }

    pub fn is_unlocked(&self) -> bool {
        self.key.is_some()
    }

    /// Persist a new mode. Leaving encrypted mode forgets the session key.
    ///
    /// Existing data is not touched.
    pub fn set_mode(&mut self, next: PrivacyMode) -> EngineResult<()> {
        self.prefs.set_mode(&self.user_id, next)?;
        let previous = std::mem::replace(&mut self.mode, next);
        if next != PrivacyMode::Encrypted {
            self.forget_key();
        }
        tracing::info!(
            user_id = %self.user_id,
            from = %previous,
            to = %next,
            "Privacy mode changed"
        );
        Ok(())
    }

    /// Persist (or remove) crypto params. Always forgets the session key.
    ///
    /// Ciphertext written under previous params stays undecryptable with
    /// keys derived from the new ones.
    pub fn set_crypto_params(&mut self, params: Option<CryptoParams>) -> EngineResult<()> {
        self.prefs.set_crypto_params(&self.user_id, params.as_ref())?;
        self.crypto_params = params;
        self.forget_key();
        Ok(())
    }

    /// Derive and cache the key for `passphrase`.
    ///
    /// Generates params first if none exist. The passphrase is not checked
    /// against existing data; a wrong one only shows up as
    /// [`EngineError::DecryptionFailed`] on the first decrypt.
    pub fn unlock_with_passphrase(&mut self, passphrase: &str) -> EngineResult<()> {
        if self.mode != PrivacyMode::Encrypted {
            return Err(EngineError::ModeMismatch {
                expected: PrivacyMode::Encrypted,
                actual: self.mode,
            });
        }
        let (key, _) = self.prepare_key(passphrase)?;
        self.remember_key(key);
        tracing::info!(user_id = %self.user_id, "Encryption unlocked");
        Ok(())
    }

    /// Forget the key; the mode stays.
    pub fn lock(&mut self) {
        self.forget_key();
        tracing::info!(user_id = %self.user_id, "Encryption locked");
    }

    /// The session key, or [`EngineError::Locked`].
    pub fn require_key(&self) -> EngineResult<&SymmetricKey> {
        self.key.as_ref().ok_or(EngineError::Locked)
    }

    /// Fresh params for re-keying; nothing is persisted.
    pub fn suggested_new_params(&self) -> EngineResult<CryptoParams> {
        CryptoParams::generate_with_iterations(self.iterations)
    }

    /// Adopt params recovered from existing ciphertext when none are stored.
    ///
    /// Returns whether anything changed.
    pub(crate) fn adopt_params_if_missing(&mut self, params: CryptoParams) -> EngineResult<bool> {
        if self.crypto_params.is_some() {
            return Ok(false);
        }
        self.prefs.set_crypto_params(&self.user_id, Some(&params))?;
        self.crypto_params = Some(params);
        tracing::info!(user_id = %self.user_id, "Crypto params recovered from ciphertext");
        Ok(true)
    }

    /// Params (generated and persisted if missing) and the key derived
    /// from `passphrase` under them. Mode is not checked.
    pub(crate) fn prepare_key(
        &mut self,
        passphrase: &str,
    ) -> EngineResult<(SymmetricKey, CryptoParams)> {
        let params = match &self.crypto_params {
            Some(params) => params.clone(),
            None => {
                let params = CryptoParams::generate_with_iterations(self.iterations)?;
                self.prefs.set_crypto_params(&self.user_id, Some(&params))?;
                self.crypto_params = Some(params.clone());
                params
            }
        };
        let key = derive_key(passphrase, &params)?;
        Ok((key, params))
    }

    pub(crate) fn remember_key(&mut self, key: SymmetricKey) {
        self.keys.save(&self.user_id, &key);
        self.key = Some(key);
    }

    fn forget_key(&mut self) {
        self.keys.clear(&self.user_id);
        self.key = None;
    }
}
