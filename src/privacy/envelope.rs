// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Self-describing encrypted strings.
//!
//! Format: `enc:v1:` followed by standard padded base64 of
//! `{"p":{"version":1,"saltB64":"..","iterations":N},"b":{"v":1,"alg":"AES-GCM","ivB64":"..","ctB64":".."}}`.
//! Anything that does not decode to exactly that shape is treated as plain
//! text.

use base64ct::{Base64, Encoding};
use serde::{Deserialize, Serialize};

use super::crypto::{
    decrypt, encrypt, CryptoParams, EncryptedBlob, SymmetricKey, ALGORITHM, BLOB_VERSION,
    PARAMS_VERSION,
};
use crate::error::{EngineError, EngineResult};

pub const ENCRYPTED_PREFIX: &str = "enc:v1:";

/// Decoded envelope: params the key was derived with, plus the blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub p: CryptoParams,
    pub b: EncryptedBlob,
}

/// Prefix check only; see [`decode_encrypted_string`] for the full parse.
pub fn is_encrypted_string(value: &str) -> bool {
    value.starts_with(ENCRYPTED_PREFIX)
}

pub fn encode_encrypted_string(
    params: &CryptoParams,
    blob: &EncryptedBlob,
) -> EngineResult<String> {
    #[derive(Serialize)]
    struct Envelope<'a> {
        p: &'a CryptoParams,
        b: &'a EncryptedBlob,
    }
    let json = serde_json::to_vec(&Envelope { p: params, b: blob })?;
    Ok(format!("{ENCRYPTED_PREFIX}{}", Base64::encode_string(&json)))
}

/// Total parse: `None` for anything that is not a well-formed v1 envelope.
pub fn decode_encrypted_string(value: &str) -> Option<EncryptedPayload> {
    let b64 = value.strip_prefix(ENCRYPTED_PREFIX)?;
    let bytes = Base64::decode_vec(b64).ok()?;
    let payload: EncryptedPayload = serde_json::from_slice(&bytes).ok()?;
    let schema_ok = payload.p.version == PARAMS_VERSION
        && payload.b.v == BLOB_VERSION
        && payload.b.alg == ALGORITHM;
    schema_ok.then_some(payload)
}

/// Encrypt `plaintext` and wrap it with `params` in one step.
pub fn encrypt_to_string(
    key: &SymmetricKey,
    params: &CryptoParams,
    plaintext: &str,
) -> EngineResult<String> {
    let blob = encrypt(key, plaintext)?;
    encode_encrypted_string(params, &blob)
}

/// Decrypt an encrypted string. Malformed envelopes fail like a wrong key.
pub fn decrypt_string(key: &SymmetricKey, value: &str) -> EngineResult<String> {
    let payload = decode_encrypted_string(value).ok_or(EngineError::DecryptionFailed)?;
    decrypt(key, &payload.b)
}
