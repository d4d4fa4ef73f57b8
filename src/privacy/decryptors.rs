// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Field-level helpers for reading possibly-encrypted category/event text.

use super::crypto::{decrypt, CryptoParams, SymmetricKey};
use super::envelope::decode_encrypted_string;
use crate::models::{EventData, EventNote};

/// Display title of a category.
///
/// Plain titles come back trimmed; encrypted ones are decrypted. `None` when
/// decryption fails.
pub fn decrypt_category_title(key: &SymmetricKey, title: &str) -> Option<String> {
    match decode_encrypted_string(title) {
        None => Some(title.trim().to_string()),
        Some(payload) => decrypt(key, &payload.b).ok().map(|s| s.trim().to_string()),
    }
}

/// Display note of an event, `None` if there is none or it can't be read.
pub fn decrypt_event_note(key: &SymmetricKey, data: &EventData) -> Option<String> {
    match data.note.as_ref()? {
        EventNote::Plain(text) => {
            let clean = text.trim();
            (!clean.is_empty()).then(|| clean.to_string())
        }
        EventNote::Encrypted(enc) => {
            let payload = decode_encrypted_string(enc)?;
            decrypt(key, &payload.b).ok().map(|s| s.trim().to_string())
        }
    }
}

/// Params embedded in the first well-formed encrypted value, if any.
pub fn recover_params<'a>(values: impl IntoIterator<Item = &'a str>) -> Option<CryptoParams> {
    values
        .into_iter()
        .find_map(decode_encrypted_string)
        .map(|payload| payload.p)
}
