// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Remote Store
//!
//! The server-held side of a user's data, as seen by this crate. Transport
//! and authentication live elsewhere; anything that can answer these calls
//! for an already-authenticated user can back cloud and encrypted mode.
//!
//! - [`memory`]: in-process implementation, series through the shared engine
//! - [`public`]: read-only allow-listed view over any [`RemoteStore`]

pub mod memory;
pub mod public;

use std::collections::HashSet;
use std::future::Future;

use chrono::TimeDelta;

use crate::aggregation::Bucket;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    Category, CategoryDraft, Event, EventPage, EventUpdate, NewEvent, SeriesQuery, MAX_EVENT_PAGE,
};

pub use memory::InMemoryRemote;
pub use public::PublicDashboard;

/// Category/event CRUD and chart queries against the server.
///
/// Every call is scoped to `user_id`; rows owned by someone else behave as
/// missing ([`crate::error::EngineError::NotFound`]).
pub trait RemoteStore: Send + Sync {
    /// Non-archived categories in listing order.
    fn list_categories(
        &self,
        user_id: &str,
    ) -> impl Future<Output = EngineResult<Vec<Category>>> + Send;

    fn get_category(
        &self,
        user_id: &str,
        category_id: &str,
    ) -> impl Future<Output = EngineResult<Category>> + Send;

    fn create_category(
        &self,
        user_id: &str,
        draft: &CategoryDraft,
    ) -> impl Future<Output = EngineResult<Category>> + Send;

    fn update_category(
        &self,
        user_id: &str,
        category_id: &str,
        draft: &CategoryDraft,
    ) -> impl Future<Output = EngineResult<Category>> + Send;

    /// Deletes the category and all of its events.
    fn delete_category(
        &self,
        user_id: &str,
        category_id: &str,
    ) -> impl Future<Output = EngineResult<()>> + Send;

    /// Newest-first page; `before` is exclusive on `occurredAt`.
    fn list_events(
        &self,
        user_id: &str,
        category_id: &str,
        page: EventPage,
    ) -> impl Future<Output = EngineResult<Vec<Event>>> + Send;

    fn create_event(
        &self,
        user_id: &str,
        input: &NewEvent,
    ) -> impl Future<Output = EngineResult<Event>> + Send;

    fn update_event(
        &self,
        user_id: &str,
        event_id: &str,
        update: &EventUpdate,
    ) -> impl Future<Output = EngineResult<Event>> + Send;

    fn delete_event(
        &self,
        user_id: &str,
        event_id: &str,
    ) -> impl Future<Output = EngineResult<()>> + Send;

    fn bar_series(
        &self,
        user_id: &str,
        category_id: &str,
        query: SeriesQuery,
    ) -> impl Future<Output = EngineResult<Vec<Bucket>>> + Send;

    fn line_series(
        &self,
        user_id: &str,
        category_id: &str,
        query: SeriesQuery,
    ) -> impl Future<Output = EngineResult<Vec<Bucket>>> + Send;
}

/// Page through every event of a category, newest first.
///
/// Each page after the first starts one microsecond above the oldest
/// timestamp seen so far, so rows sharing that timestamp are not skipped;
/// duplicates are dropped by id.
///
/// A full page on a single instant can't be paged past with a time cursor.
/// That is an error rather than a short result, since callers may delete
/// what they downloaded.
pub async fn collect_all_events<R: RemoteStore + ?Sized>(
    remote: &R,
    user_id: &str,
    category_id: &str,
) -> EngineResult<Vec<Event>> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut page = EventPage::first(MAX_EVENT_PAGE);

    loop {
        let rows = remote.list_events(user_id, category_id, page).await?;
        let full = rows.len() >= MAX_EVENT_PAGE;
        let oldest = rows.last().map(|e| e.occurred_at);

        let mut fresh = 0usize;
        for event in rows {
            if seen.insert(event.id.clone()) {
                out.push(event);
                fresh += 1;
            }
        }

        match oldest {
            Some(oldest) if full && fresh > 0 => {
                page = EventPage::before(MAX_EVENT_PAGE, oldest + TimeDelta::microseconds(1));
            }
            Some(oldest) if full => {
                tracing::warn!(
                    user_id = %user_id,
                    category_id = %category_id,
                    collected = out.len(),
                    "Event paging stalled on a shared timestamp"
                );
                return Err(EngineError::Remote(format!(
                    "cannot page past {MAX_EVENT_PAGE} events at {}",
                    oldest.to_rfc3339()
                )));
            }
            _ => break,
        }
    }

    Ok(out)
}
