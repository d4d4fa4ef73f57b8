// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Device Storage Module
//!
//! Everything this crate keeps on the device itself.
//!
//! ## Storage Layout
//!
//! ```text
//! {DATA_DIR}/
//!   local.redb            # Local-mode categories and events
//!   prefs/
//!     {user_b64url}.json  # Privacy mode + crypto params per user
//! ```
//!
//! Derived keys never touch this directory; they live in the in-memory
//! [`SessionKeyCache`] only.

pub mod local_db;
pub mod ownership;
pub mod paths;
pub mod prefs;
pub mod session;

pub use local_db::{ChangeKind, LocalSnapshot, LocalStore, StoreChange};
pub use ownership::{OwnedResource, OwnershipCheck};
pub use paths::StoragePaths;
pub use prefs::{PreferenceStore, UserPrefs};
pub use session::SessionKeyCache;
