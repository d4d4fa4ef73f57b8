// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Ownership enforcement for category and event access.
//!
//! Every read and write is scoped to one user id. A record owned by someone
//! else is reported as missing, never as forbidden.

use crate::error::{EngineError, EngineResult};

/// Trait for resources that have an owner.
pub trait OwnedResource {
    /// Get the owner's user ID.
    fn owner_user_id(&self) -> &str;
}

impl<T: OwnedResource + ?Sized> OwnedResource for &T {
    fn owner_user_id(&self) -> &str {
        (**self).owner_user_id()
    }
}

/// Extension trait turning a lookup into an owner-checked lookup.
pub trait OwnershipCheck<T> {
    /// Return the resource if `user_id` owns it, `NotFound(what)` otherwise.
    fn owned_by(self, user_id: &str, what: impl FnOnce() -> String) -> EngineResult<T>;
}

impl<T: OwnedResource> OwnershipCheck<T> for Option<T> {
    fn owned_by(self, user_id: &str, what: impl FnOnce() -> String) -> EngineResult<T> {
        match self {
            Some(resource) if resource.owner_user_id() == user_id => Ok(resource),
            _ => Err(EngineError::NotFound(what())),
        }
    }
}
