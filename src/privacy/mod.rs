// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Privacy Module
//!
//! Client-side encryption of category titles and event notes, and the
//! per-user mode state that decides where data lives.
//!
//! - [`crypto`]: key derivation and AES-GCM
//! - [`envelope`]: the `enc:v1:` string format
//! - [`decryptors`]: field helpers for display
//! - [`controller`]: [`PrivacyController`]

pub mod controller;
pub mod crypto;
pub mod decryptors;
pub mod envelope;

pub use controller::PrivacyController;
pub use crypto::{decrypt, derive_key, encrypt, CryptoParams, EncryptedBlob, SymmetricKey};
pub use decryptors::{decrypt_category_title, decrypt_event_note, recover_params};
pub use envelope::{
    decode_encrypted_string, decrypt_string, encode_encrypted_string, encrypt_to_string,
    is_encrypted_string, EncryptedPayload, ENCRYPTED_PREFIX,
};
