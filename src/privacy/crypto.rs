// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! AES-256-GCM primitives with PBKDF2-HMAC-SHA256 key derivation (ring).
//!
//! Ciphertexts use the WebCrypto layout `ct || tag` so values written by the
//! browser client and by this crate are interchangeable.

use std::fmt;
use std::num::NonZeroU32;

use base64ct::{Base64, Encoding};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::error::{EngineError, EngineResult};

pub const PARAMS_VERSION: u32 = 1;
pub const BLOB_VERSION: u32 = 1;
pub const ALGORITHM: &str = "AES-GCM";

/// Iteration count for newly generated params.
pub const DEFAULT_ITERATIONS: u32 = 310_000;

pub const SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

/// Key-derivation parameters, stored next to (never inside) the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CryptoParams {
    pub version: u32,
    pub salt_b64: String,
    pub iterations: u32,
}

impl CryptoParams {
    /// Fresh params with a random 16-byte salt.
    pub fn generate() -> EngineResult<Self> {
        Self::generate_with_iterations(DEFAULT_ITERATIONS)
    }

    pub fn generate_with_iterations(iterations: u32) -> EngineResult<Self> {
        let mut salt = [0u8; SALT_LEN];
        SystemRandom::new()
            .fill(&mut salt)
            .map_err(|_| EngineError::InvalidCryptoParams("salt generation failed".into()))?;
        Ok(Self {
            version: PARAMS_VERSION,
            salt_b64: Base64::encode_string(&salt),
            iterations,
        })
    }

    /// Structural check used when loading persisted params.
    pub fn is_valid(&self) -> bool {
        self.version == PARAMS_VERSION
            && self.iterations > 0
            && Base64::decode_vec(&self.salt_b64).is_ok()
    }
}

/// One encrypted value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedBlob {
    pub v: u32,
    pub alg: String,
    pub iv_b64: String,
    pub ct_b64: String,
}

/// Derived AES-256-GCM key.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SymmetricKey").field(&"[REDACTED]").finish()
    }
}

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw key material as standard base64, for the session cache only.
    pub fn export_b64(&self) -> String {
        Base64::encode_string(&self.0)
    }

    pub fn import_b64(token: &str) -> EngineResult<Self> {
        let raw = Base64::decode_vec(token.trim())
            .map_err(|_| EngineError::InvalidCryptoParams("key token is not base64".into()))?;
        let bytes: [u8; KEY_LEN] = raw
            .try_into()
            .map_err(|_| EngineError::InvalidCryptoParams("key token has wrong length".into()))?;
        Ok(Self(bytes))
    }

    fn aead_key(&self) -> Option<LessSafeKey> {
        UnboundKey::new(&AES_256_GCM, &self.0)
            .ok()
            .map(LessSafeKey::new)
    }
}

/// PBKDF2-HMAC-SHA256 over the NFKC-normalized passphrase.
pub fn derive_key(passphrase: &str, params: &CryptoParams) -> EngineResult<SymmetricKey> {
    let iterations = NonZeroU32::new(params.iterations)
        .ok_or_else(|| EngineError::InvalidCryptoParams("iterations must be positive".into()))?;
    let salt = Base64::decode_vec(&params.salt_b64)
        .map_err(|_| EngineError::InvalidCryptoParams("salt is not base64".into()))?;

    let normalized: String = passphrase.nfkc().collect();
    let mut out = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        &salt,
        normalized.as_bytes(),
        &mut out,
    );
    Ok(SymmetricKey(out))
}

/// Encrypt UTF-8 text under a fresh random 96-bit IV.
pub fn encrypt(key: &SymmetricKey, plaintext: &str) -> EngineResult<EncryptedBlob> {
    let aead = key.aead_key().ok_or(EngineError::EncryptionFailed)?;

    let mut iv = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut iv)
        .map_err(|_| EngineError::EncryptionFailed)?;

    let mut in_out = plaintext.as_bytes().to_vec();
    aead.seal_in_place_append_tag(Nonce::assume_unique_for_key(iv), Aad::empty(), &mut in_out)
        .map_err(|_| EngineError::EncryptionFailed)?;

    Ok(EncryptedBlob {
        v: BLOB_VERSION,
        alg: ALGORITHM.to_string(),
        iv_b64: Base64::encode_string(&iv),
        ct_b64: Base64::encode_string(&in_out),
    })
}

/// Decrypt a blob. Every failure is [`EngineError::DecryptionFailed`].
pub fn decrypt(key: &SymmetricKey, blob: &EncryptedBlob) -> EngineResult<String> {
    if blob.v != BLOB_VERSION || blob.alg != ALGORITHM {
        return Err(EngineError::DecryptionFailed);
    }
    let aead = key.aead_key().ok_or(EngineError::DecryptionFailed)?;
    let iv = Base64::decode_vec(&blob.iv_b64).map_err(|_| EngineError::DecryptionFailed)?;
    let nonce =
        Nonce::try_assume_unique_for_key(&iv).map_err(|_| EngineError::DecryptionFailed)?;
    let mut in_out = Base64::decode_vec(&blob.ct_b64).map_err(|_| EngineError::DecryptionFailed)?;

    let plaintext = aead
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| EngineError::DecryptionFailed)?;
    String::from_utf8(plaintext.to_vec()).map_err(|_| EngineError::DecryptionFailed)
}
