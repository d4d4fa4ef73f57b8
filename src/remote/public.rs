// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Read-only view of one user's shared categories.
//!
//! Only ids on the allow-list are visible; anything else, including
//! archived categories, is `NotFound`. Series are computed here from raw
//! paginated rows with the shared engine, so they match what the owner
//! sees.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{collect_all_events, RemoteStore};
use crate::aggregation::{aggregate, category_stats, Bucket, CategoryStats, Sample};
use crate::error::{EngineError, EngineResult};
use crate::models::{BucketAggregation, Category, SeriesQuery};

pub struct PublicDashboard<R> {
    remote: Arc<R>,
    owner_id: String,
    allowed: Vec<String>,
    now: Option<DateTime<Utc>>,
}

impl<R: RemoteStore> PublicDashboard<R> {
    /// Duplicate and blank ids are dropped; the first occurrence keeps its
    /// position.
    pub fn new(
        remote: Arc<R>,
        owner_id: impl Into<String>,
        allowed: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut ids: Vec<String> = Vec::new();
        for id in allowed {
            let id = id.trim().to_string();
            if !id.is_empty() && !ids.contains(&id) {
                ids.push(id);
            }
        }
        Self {
            remote,
            owner_id: owner_id.into(),
            allowed: ids,
            now: None,
        }
    }

    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }

    async fn category(&self, category_id: &str) -> EngineResult<Category> {
        let missing = || EngineError::not_found(format!("Category {category_id}"));
        if !self.allowed.iter().any(|id| id == category_id) {
            return Err(missing());
        }
        let category = self.remote.get_category(&self.owner_id, category_id).await?;
        if category.is_archived() {
            return Err(missing());
        }
        Ok(category)
    }

    /// Shared categories with stats, in allow-list order.
    pub async fn overview(&self) -> EngineResult<Vec<(Category, CategoryStats)>> {
        let now = self.now();
        let mut rows = Vec::with_capacity(self.allowed.len());
        for id in &self.allowed {
            let category = match self.category(id).await {
                Ok(category) => category,
                Err(EngineError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            let events = collect_all_events(self.remote.as_ref(), &self.owner_id, id).await?;
            let stats = category_stats(&category, &events, &now);
            rows.push((category, stats));
        }
        Ok(rows)
    }

    pub async fn bar_series(
        &self,
        category_id: &str,
        query: SeriesQuery,
    ) -> EngineResult<Vec<Bucket>> {
        let category = self.category(category_id).await?;
        let aggregation = query.bar_aggregation(&category);
        self.series(&category, query, aggregation).await
    }

    pub async fn line_series(
        &self,
        category_id: &str,
        query: SeriesQuery,
    ) -> EngineResult<Vec<Bucket>> {
        let category = self.category(category_id).await?;
        let aggregation = query.line_aggregation(&category);
        self.series(&category, query, aggregation).await
    }

    async fn series(
        &self,
        category: &Category,
        query: SeriesQuery,
        aggregation: BucketAggregation,
    ) -> EngineResult<Vec<Bucket>> {
        let events =
            collect_all_events(self.remote.as_ref(), &self.owner_id, &category.id).await?;
        let samples: Vec<Sample> = events.iter().map(Sample::from).collect();
        Ok(aggregate(&samples, query.period, query.offset, aggregation, &self.now()))
    }
}
