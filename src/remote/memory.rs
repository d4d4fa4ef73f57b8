// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-process [`RemoteStore`].
//!
//! Holds rows in memory behind a tokio `RwLock` and answers chart queries
//! with the same engine the local store uses. The clock is UTC unless a
//! fixed "now" is pinned.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::RemoteStore;
use crate::aggregation::{aggregate_in, Bucket, BucketWindow, Sample};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    order_categories, resolve_slug, BucketAggregation, Category, CategoryDraft, Event, EventPage,
    EventUpdate, NewEvent, SeriesQuery,
};
use crate::storage::OwnershipCheck;

#[derive(Debug, Default)]
struct RemoteData {
    categories: BTreeMap<String, Category>,
    events: BTreeMap<String, Event>,
}

impl RemoteData {
    fn owned_category(&self, user_id: &str, category_id: &str) -> EngineResult<&Category> {
        self.categories
            .get(category_id)
            .owned_by(user_id, || format!("Category {category_id}"))
    }

    fn visible_category(&self, user_id: &str, category_id: &str) -> EngineResult<&Category> {
        let category = self.owned_category(user_id, category_id)?;
        if category.is_archived() {
            return Err(EngineError::not_found(format!("Category {category_id}")));
        }
        Ok(category)
    }

    /// Slugs of the user's non-archived categories, minus `except_id`.
    fn active_slugs(
        &self,
        user_id: &str,
        except_id: Option<&str>,
    ) -> std::collections::HashSet<String> {
        self.categories
            .values()
            .filter(|c| c.user_id == user_id && !c.is_archived())
            .filter(|c| Some(c.id.as_str()) != except_id)
            .map(|c| c.slug.clone())
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRemote {
    data: RwLock<RemoteData>,
    now: Option<DateTime<Utc>>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every time-dependent call as if it were `now`.
    pub fn with_now(now: DateTime<Utc>) -> Self {
        Self {
            data: RwLock::default(),
            now: Some(now),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    /// Number of events the user has, archived categories included.
    pub async fn event_count(&self, user_id: &str) -> usize {
        let data = self.data.read().await;
        data.events.values().filter(|e| e.user_id == user_id).count()
    }

    async fn series(
        &self,
        user_id: &str,
        category_id: &str,
        query: SeriesQuery,
        pick: fn(&SeriesQuery, &Category) -> BucketAggregation,
    ) -> EngineResult<Vec<Bucket>> {
        let data = self.data.read().await;
        let category = data.visible_category(user_id, category_id)?;
        let aggregation = pick(&query, category);
        let window = BucketWindow::new(query.period, query.offset, &self.now());
        let samples: Vec<Sample> = data
            .events
            .values()
            .filter(|e| e.category_id == category.id && window.contains(e.occurred_at))
            .map(Sample::from)
            .collect();
        Ok(aggregate_in(&window, &samples, aggregation))
    }
}

impl RemoteStore for InMemoryRemote {
    async fn list_categories(&self, user_id: &str) -> EngineResult<Vec<Category>> {
        let data = self.data.read().await;
        let mut list: Vec<Category> = data
            .categories
            .values()
            .filter(|c| c.user_id == user_id && !c.is_archived())
            .cloned()
            .collect();
        order_categories(&mut list);
        Ok(list)
    }

    async fn get_category(&self, user_id: &str, category_id: &str) -> EngineResult<Category> {
        let data = self.data.read().await;
        data.owned_category(user_id, category_id).cloned()
    }

    async fn create_category(
        &self,
        user_id: &str,
        draft: &CategoryDraft,
    ) -> EngineResult<Category> {
        let mut data = self.data.write().await;
        let slug = resolve_slug(draft, &data.active_slugs(user_id, None))?;
        let category = draft.build(Uuid::new_v4().to_string(), user_id, slug, self.now())?;
        data.categories.insert(category.id.clone(), category.clone());
        Ok(category)
    }

    async fn update_category(
        &self,
        user_id: &str,
        category_id: &str,
        draft: &CategoryDraft,
    ) -> EngineResult<Category> {
        let mut data = self.data.write().await;
        let mut category = data.owned_category(user_id, category_id)?.clone();
        draft.apply_to(&mut category, self.now())?;
        if let Some(slug) = draft.requested_slug().filter(|s| *s != category.slug) {
            if data.active_slugs(user_id, Some(category_id)).contains(&slug) {
                return Err(EngineError::SlugConflict(slug));
            }
            category.slug = slug;
        }
        data.categories.insert(category.id.clone(), category.clone());
        Ok(category)
    }

    async fn delete_category(&self, user_id: &str, category_id: &str) -> EngineResult<()> {
        let mut data = self.data.write().await;
        let category = data.owned_category(user_id, category_id)?;
        if category.is_system {
            return Err(EngineError::ProtectedCategory(category_id.to_string()));
        }
        data.categories.remove(category_id);
        data.events.retain(|_, e| e.category_id != category_id);
        Ok(())
    }

    async fn list_events(
        &self,
        user_id: &str,
        category_id: &str,
        page: EventPage,
    ) -> EngineResult<Vec<Event>> {
        let data = self.data.read().await;
        data.owned_category(user_id, category_id)?;
        let mut rows: Vec<&Event> = data
            .events
            .values()
            .filter(|e| e.category_id == category_id)
            .filter(|e| page.before.is_none_or(|before| e.occurred_at < before))
            .collect();
        rows.sort_by(|a, b| (b.occurred_at, &b.id).cmp(&(a.occurred_at, &a.id)));
        Ok(rows.into_iter().take(page.limit()).cloned().collect())
    }

    async fn create_event(&self, user_id: &str, input: &NewEvent) -> EngineResult<Event> {
        let mut data = self.data.write().await;
        data.owned_category(user_id, &input.category_id)?;
        let event = input.build(Uuid::new_v4().to_string(), user_id, &self.now())?;
        data.events.insert(event.id.clone(), event.clone());
        Ok(event)
    }

    async fn update_event(
        &self,
        user_id: &str,
        event_id: &str,
        update: &EventUpdate,
    ) -> EngineResult<Event> {
        let mut data = self.data.write().await;
        let mut event = data
            .events
            .get(event_id)
            .owned_by(user_id, || format!("Event {event_id}"))?
            .clone();
        update.apply_to(&mut event, &self.now())?;
        data.events.insert(event.id.clone(), event.clone());
        Ok(event)
    }

    async fn delete_event(&self, user_id: &str, event_id: &str) -> EngineResult<()> {
        let mut data = self.data.write().await;
        data.events
            .get(event_id)
            .owned_by(user_id, || format!("Event {event_id}"))?;
        data.events.remove(event_id);
        Ok(())
    }

    async fn bar_series(
        &self,
        user_id: &str,
        category_id: &str,
        query: SeriesQuery,
    ) -> EngineResult<Vec<Bucket>> {
        self.series(user_id, category_id, query, SeriesQuery::bar_aggregation)
            .await
    }

    async fn line_series(
        &self,
        user_id: &str,
        category_id: &str,
        query: SeriesQuery,
    ) -> EngineResult<Vec<Bucket>> {
        self.series(user_id, category_id, query, SeriesQuery::line_aggregation)
            .await
    }
}
