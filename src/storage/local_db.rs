// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Device-local category/event store backed by redb (pure Rust, ACID).
//!
//! Used when a user is in `local` mode. It answers the same queries as the
//! remote store and computes series with the shared aggregation engine.
//!
//! ## Table Layout
//!
//! - `categories`: category id → serialized [`Category`]
//! - `events`: event id → serialized [`Event`]
//! - `category_owner_index`: `owner|category` → slug
//! - `event_owner_index`: `owner|event` → category id
//! - `event_time_index`: `owner|category|occurredAt_be|event` → event id
//!
//! Every mutating call runs in one write transaction and, once committed,
//! publishes a [`StoreChange`].

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::ownership::OwnershipCheck;
use crate::aggregation::{
    aggregate_in, category_stats, sort_overview, Bucket, BucketWindow, CategoryStats, Sample,
};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    order_categories, resolve_slug, BucketAggregation, Category, CategoryDraft, Event, EventPage,
    EventUpdate, NewEvent, Period, SeriesQuery,
};

// =============================================================================
// Table Definitions
// =============================================================================

const CATEGORIES: TableDefinition<&str, &[u8]> = TableDefinition::new("categories");

const EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("events");

/// Key format: `owner|category_id`, value: slug.
const CATEGORY_OWNER_INDEX: TableDefinition<&[u8], &str> =
    TableDefinition::new("category_owner_index");

/// Key format: `owner|event_id`, value: category id.
const EVENT_OWNER_INDEX: TableDefinition<&[u8], &str> = TableDefinition::new("event_owner_index");

/// Key format: `owner|category_id|occurred_at_be|event_id`, value: event id.
/// Ascending key order is ascending `occurredAt`, then event id.
const EVENT_TIME_INDEX: TableDefinition<&[u8], &str> = TableDefinition::new("event_time_index");

const CHANGE_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// Change notifications
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Categories,
    Events,
    /// Whole-dataset replacement
    All,
}

/// Published after every committed mutation so open views can refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub user_id: String,
    pub kind: ChangeKind,
}

/// Everything one user has in the local store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSnapshot {
    pub categories: Vec<Category>,
    pub events: Vec<Event>,
}

// =============================================================================
// Index Key Helpers
// =============================================================================

/// Order-preserving encoding of a timestamp (sign bit flipped, big-endian).
fn time_bytes(at: DateTime<Utc>) -> [u8; 8] {
    ((at.timestamp_micros() as u64) ^ (1 << 63)).to_be_bytes()
}

fn check_id(kind: &str, id: &str) -> EngineResult<()> {
    if id.is_empty() || id.contains('|') {
        return Err(EngineError::invalid(format!("invalid {kind} id")));
    }
    Ok(())
}

/// `a|b|…|` for each part in order.
fn make_prefix(parts: &[&str]) -> Vec<u8> {
    let mut key = Vec::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for part in parts {
        key.extend_from_slice(part.as_bytes());
        key.push(b'|');
    }
    key
}

/// Upper bound for scanning everything under `prefix`.
fn make_prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = Vec::with_capacity(prefix.len() + 20);
    end.extend_from_slice(prefix);
    // UTF-8 ids never contain 0xFF, timestamps need 8 bytes
    end.extend_from_slice(&[0xFF; 20]);
    end
}

fn owner_key(user_id: &str, id: &str) -> Vec<u8> {
    let mut key = make_prefix(&[user_id]);
    key.extend_from_slice(id.as_bytes());
    key
}

fn time_prefix(user_id: &str, category_id: &str) -> Vec<u8> {
    make_prefix(&[user_id, category_id])
}

fn time_bound(user_id: &str, category_id: &str, at: DateTime<Utc>) -> Vec<u8> {
    let mut key = time_prefix(user_id, category_id);
    key.extend_from_slice(&time_bytes(at));
    key
}

fn time_key(event: &Event) -> Vec<u8> {
    let mut key = time_bound(&event.user_id, &event.category_id, event.occurred_at);
    key.push(b'|');
    key.extend_from_slice(event.id.as_bytes());
    key
}

// =============================================================================
// Table Helpers
// =============================================================================

fn read_record<T: serde::de::DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    id: &str,
) -> EngineResult<Option<T>> {
    match table.get(id)? {
        Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
        None => Ok(None),
    }
}

/// Id suffixes of every index key under `prefix`.
fn ids_under(
    index: &impl ReadableTable<&'static [u8], &'static str>,
    prefix: &[u8],
) -> EngineResult<Vec<String>> {
    let end = make_prefix_end(prefix);
    let mut ids = Vec::new();
    for entry in index.range(prefix..end.as_slice())? {
        let (key, _) = entry?;
        if let Some(rest) = key.value().get(prefix.len()..) {
            if let Ok(id) = std::str::from_utf8(rest) {
                ids.push(id.to_string());
            }
        }
    }
    Ok(ids)
}

/// Index values (record ids) under `prefix`.
fn values_under(
    index: &impl ReadableTable<&'static [u8], &'static str>,
    prefix: &[u8],
) -> EngineResult<Vec<String>> {
    let end = make_prefix_end(prefix);
    let mut values = Vec::new();
    for entry in index.range(prefix..end.as_slice())? {
        let (_, value) = entry?;
        values.push(value.value().to_string());
    }
    Ok(values)
}

/// Raw index keys under `prefix` (for deletion).
fn keys_under(
    index: &impl ReadableTable<&'static [u8], &'static str>,
    prefix: &[u8],
) -> EngineResult<Vec<Vec<u8>>> {
    let end = make_prefix_end(prefix);
    let mut keys = Vec::new();
    for entry in index.range(prefix..end.as_slice())? {
        let (key, _) = entry?;
        keys.push(key.value().to_vec());
    }
    Ok(keys)
}

fn load_categories(
    categories: &impl ReadableTable<&'static str, &'static [u8]>,
    owner_index: &impl ReadableTable<&'static [u8], &'static str>,
    user_id: &str,
) -> EngineResult<Vec<Category>> {
    let mut out = Vec::new();
    for id in ids_under(owner_index, &make_prefix(&[user_id]))? {
        if let Some(category) = read_record::<Category>(categories, &id)? {
            out.push(category);
        }
    }
    Ok(out)
}

fn active_slugs(categories: &[Category], except_id: Option<&str>) -> HashSet<String> {
    categories
        .iter()
        .filter(|c| !c.is_archived() && Some(c.id.as_str()) != except_id)
        .map(|c| c.slug.clone())
        .collect()
}

fn put_category(
    categories: &mut Table<&'static str, &'static [u8]>,
    owner_index: &mut Table<&'static [u8], &'static str>,
    category: &Category,
) -> EngineResult<()> {
    let json = serde_json::to_vec(category)?;
    categories.insert(category.id.as_str(), json.as_slice())?;
    let key = owner_key(&category.user_id, &category.id);
    owner_index.insert(key.as_slice(), category.slug.as_str())?;
    Ok(())
}

struct EventTables<'txn> {
    events: Table<'txn, &'static str, &'static [u8]>,
    owner_index: Table<'txn, &'static [u8], &'static str>,
    time_index: Table<'txn, &'static [u8], &'static str>,
}

impl<'txn> EventTables<'txn> {
    fn open(txn: &'txn redb::WriteTransaction) -> EngineResult<Self> {
        Ok(Self {
            events: txn.open_table(EVENTS)?,
            owner_index: txn.open_table(EVENT_OWNER_INDEX)?,
            time_index: txn.open_table(EVENT_TIME_INDEX)?,
        })
    }

    fn put(&mut self, event: &Event) -> EngineResult<()> {
        let json = serde_json::to_vec(event)?;
        self.events.insert(event.id.as_str(), json.as_slice())?;
        let owner = owner_key(&event.user_id, &event.id);
        self.owner_index.insert(owner.as_slice(), event.category_id.as_str())?;
        let time = time_key(event);
        self.time_index.insert(time.as_slice(), event.id.as_str())?;
        Ok(())
    }

    fn remove(&mut self, event: &Event) -> EngineResult<()> {
        self.events.remove(event.id.as_str())?;
        let owner = owner_key(&event.user_id, &event.id);
        self.owner_index.remove(owner.as_slice())?;
        let time = time_key(event);
        self.time_index.remove(time.as_slice())?;
        Ok(())
    }

    fn get_owned(&self, user_id: &str, event_id: &str) -> EngineResult<Event> {
        read_record::<Event>(&self.events, event_id)?
            .owned_by(user_id, || format!("Event {event_id}"))
    }
}

// =============================================================================
// LocalStore
// =============================================================================

/// Embedded per-user store for local mode.
pub struct LocalStore {
    db: Database,
    changes: broadcast::Sender<StoreChange>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("subscribers", &self.changes.receiver_count())
            .finish()
    }
}

impl LocalStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(CATEGORIES)?;
            let _ = write_txn.open_table(EVENTS)?;
            let _ = write_txn.open_table(CATEGORY_OWNER_INDEX)?;
            let _ = write_txn.open_table(EVENT_OWNER_INDEX)?;
            let _ = write_txn.open_table(EVENT_TIME_INDEX)?;
        }
        write_txn.commit()?;

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        tracing::debug!(path = %path.display(), "Local store opened");
        Ok(Self { db, changes })
    }

    /// Receive a [`StoreChange`] for every committed mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn notify(&self, user_id: &str, kind: ChangeKind) {
        // No receivers is fine.
        let _ = self.changes.send(StoreChange {
            user_id: user_id.to_string(),
            kind,
        });
    }

    /// Verify every table can be opened for reading.
    pub fn health_check(&self) -> EngineResult<()> {
        let read_txn = self.db.begin_read()?;
        let _ = read_txn.open_table(CATEGORIES)?;
        let _ = read_txn.open_table(EVENTS)?;
        let _ = read_txn.open_table(CATEGORY_OWNER_INDEX)?;
        let _ = read_txn.open_table(EVENT_OWNER_INDEX)?;
        let _ = read_txn.open_table(EVENT_TIME_INDEX)?;
        Ok(())
    }

    // =========================================================================
    // Categories
    // =========================================================================

    /// Non-archived categories: custom order first, then oldest first.
    pub fn list_categories(&self, user_id: &str) -> EngineResult<Vec<Category>> {
        check_id("user", user_id)?;
        let read_txn = self.db.begin_read()?;
        let categories = read_txn.open_table(CATEGORIES)?;
        let owner_index = read_txn.open_table(CATEGORY_OWNER_INDEX)?;

        let mut list: Vec<Category> = load_categories(&categories, &owner_index, user_id)?
            .into_iter()
            .filter(|c| !c.is_archived())
            .collect();
        order_categories(&mut list);
        Ok(list)
    }

    pub fn get_category(&self, user_id: &str, category_id: &str) -> EngineResult<Category> {
        let read_txn = self.db.begin_read()?;
        let categories = read_txn.open_table(CATEGORIES)?;
        read_record::<Category>(&categories, category_id)?
            .owned_by(user_id, || format!("Category {category_id}"))
    }

    /// Create a category. Derived slugs get `-2`, `-3`, … on collision; an
    /// explicitly requested slug that is taken fails with `SlugConflict`.
    pub fn create_category(&self, user_id: &str, draft: &CategoryDraft) -> EngineResult<Category> {
        check_id("user", user_id)?;
        let write_txn = self.db.begin_write()?;
        let category = {
            let mut categories = write_txn.open_table(CATEGORIES)?;
            let mut owner_index = write_txn.open_table(CATEGORY_OWNER_INDEX)?;

            let existing = load_categories(&categories, &owner_index, user_id)?;
            let slug = resolve_slug(draft, &active_slugs(&existing, None))?;
            let category = draft.build(Uuid::new_v4().to_string(), user_id, slug, Utc::now())?;
            put_category(&mut categories, &mut owner_index, &category)?;
            category
        };
        write_txn.commit()?;

        tracing::debug!(user_id = %user_id, category_id = %category.id, "Local category created");
        self.notify(user_id, ChangeKind::Categories);
        Ok(category)
    }

    /// Apply an edit. The slug changes only when the draft asks for one.
    pub fn update_category(
        &self,
        user_id: &str,
        category_id: &str,
        draft: &CategoryDraft,
    ) -> EngineResult<Category> {
        let write_txn = self.db.begin_write()?;
        let category = {
            let mut categories = write_txn.open_table(CATEGORIES)?;
            let mut owner_index = write_txn.open_table(CATEGORY_OWNER_INDEX)?;

            let mut category = read_record::<Category>(&categories, category_id)?
                .owned_by(user_id, || format!("Category {category_id}"))?;
            draft.apply_to(&mut category, Utc::now())?;

            if let Some(slug) = draft.requested_slug().filter(|s| *s != category.slug) {
                let existing = load_categories(&categories, &owner_index, user_id)?;
                if active_slugs(&existing, Some(category_id)).contains(&slug) {
                    return Err(EngineError::SlugConflict(slug));
                }
                category.slug = slug;
            }

            put_category(&mut categories, &mut owner_index, &category)?;
            category
        };
        write_txn.commit()?;

        self.notify(user_id, ChangeKind::Categories);
        Ok(category)
    }

    /// Delete a category together with all of its events.
    pub fn delete_category(&self, user_id: &str, category_id: &str) -> EngineResult<()> {
        check_id("category", category_id)?;
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut categories = write_txn.open_table(CATEGORIES)?;
            let mut owner_index = write_txn.open_table(CATEGORY_OWNER_INDEX)?;
            let mut tables = EventTables::open(&write_txn)?;

            let category = read_record::<Category>(&categories, category_id)?
                .owned_by(user_id, || format!("Category {category_id}"))?;
            if category.is_system {
                return Err(EngineError::ProtectedCategory(category_id.to_string()));
            }

            let event_ids = values_under(&tables.time_index, &time_prefix(user_id, category_id))?;
            let mut removed = 0usize;
            for event_id in event_ids {
                if let Some(event) = read_record::<Event>(&tables.events, &event_id)? {
                    tables.remove(&event)?;
                    removed += 1;
                }
            }

            categories.remove(category_id)?;
            let key = owner_key(user_id, category_id);
            owner_index.remove(key.as_slice())?;
            removed
        };
        write_txn.commit()?;

        tracing::debug!(
            user_id = %user_id,
            category_id = %category_id,
            events = removed,
            "Local category deleted"
        );
        self.notify(user_id, ChangeKind::All);
        Ok(())
    }

    /// Persist a custom order. Unknown or foreign ids are ignored.
    pub fn set_category_order(&self, user_id: &str, ordered_ids: &[String]) -> EngineResult<()> {
        let now = Utc::now();
        let write_txn = self.db.begin_write()?;
        {
            let mut categories = write_txn.open_table(CATEGORIES)?;
            let mut owner_index = write_txn.open_table(CATEGORY_OWNER_INDEX)?;
            for (position, id) in ordered_ids.iter().enumerate() {
                let Ok(mut category) = read_record::<Category>(&categories, id)?
                    .owned_by(user_id, String::new)
                else {
                    continue;
                };
                category.sort_order = Some(position as u32);
                category.updated_at = now;
                put_category(&mut categories, &mut owner_index, &category)?;
            }
        }
        write_txn.commit()?;
        self.notify(user_id, ChangeKind::Categories);
        Ok(())
    }

    /// Drop the custom order of every category of the user.
    pub fn reset_category_order(&self, user_id: &str) -> EngineResult<()> {
        let now = Utc::now();
        let write_txn = self.db.begin_write()?;
        {
            let mut categories = write_txn.open_table(CATEGORIES)?;
            let mut owner_index = write_txn.open_table(CATEGORY_OWNER_INDEX)?;
            for mut category in load_categories(&categories, &owner_index, user_id)? {
                category.sort_order = None;
                category.updated_at = now;
                put_category(&mut categories, &mut owner_index, &category)?;
            }
        }
        write_txn.commit()?;
        self.notify(user_id, ChangeKind::Categories);
        Ok(())
    }

    /// Overview rows: every visible category with its current stats.
    pub fn categories_with_stats<Tz: TimeZone>(
        &self,
        user_id: &str,
        now: &DateTime<Tz>,
    ) -> EngineResult<Vec<(Category, CategoryStats)>> {
        let snapshot = self.export(user_id)?;
        let mut rows: Vec<(Category, CategoryStats)> = snapshot
            .categories
            .into_iter()
            .filter(|c| !c.is_archived())
            .map(|c| {
                let stats = category_stats(&c, &snapshot.events, now);
                (c, stats)
            })
            .collect();
        sort_overview(&mut rows);
        Ok(rows)
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Newest-first page of a category's events.
    ///
    /// Ordered by `occurredAt` then id, both descending; `before` is an
    /// exclusive bound on `occurredAt`.
    pub fn list_events(
        &self,
        user_id: &str,
        category_id: &str,
        page: EventPage,
    ) -> EngineResult<Vec<Event>> {
        check_id("category", category_id)?;
        let read_txn = self.db.begin_read()?;
        let categories = read_txn.open_table(CATEGORIES)?;
        read_record::<Category>(&categories, category_id)?
            .owned_by(user_id, || format!("Category {category_id}"))?;

        let time_index = read_txn.open_table(EVENT_TIME_INDEX)?;
        let events = read_txn.open_table(EVENTS)?;

        let start = time_prefix(user_id, category_id);
        let end = match page.before {
            Some(before) => time_bound(user_id, category_id, before),
            None => make_prefix_end(&start),
        };

        let limit = page.limit();
        let mut out = Vec::with_capacity(limit);
        for entry in time_index.range(start.as_slice()..end.as_slice())?.rev() {
            let (_, event_id) = entry?;
            if let Some(event) = read_record::<Event>(&events, event_id.value())? {
                out.push(event);
            }
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    pub fn get_event(&self, user_id: &str, event_id: &str) -> EngineResult<Event> {
        let read_txn = self.db.begin_read()?;
        let events = read_txn.open_table(EVENTS)?;
        read_record::<Event>(&events, event_id)?.owned_by(user_id, || format!("Event {event_id}"))
    }

    /// Log an event. Days after `now`'s local day are rejected.
    pub fn create_event<Tz: TimeZone>(
        &self,
        user_id: &str,
        input: &NewEvent,
        now: &DateTime<Tz>,
    ) -> EngineResult<Event> {
        check_id("user", user_id)?;
        let write_txn = self.db.begin_write()?;
        let event = {
            let categories = write_txn.open_table(CATEGORIES)?;
            read_record::<Category>(&categories, &input.category_id)?
                .owned_by(user_id, || format!("Category {}", input.category_id))?;

            let event = input.build(Uuid::new_v4().to_string(), user_id, now)?;
            let mut tables = EventTables::open(&write_txn)?;
            tables.put(&event)?;
            event
        };
        write_txn.commit()?;

        self.notify(user_id, ChangeKind::Events);
        Ok(event)
    }

    pub fn update_event<Tz: TimeZone>(
        &self,
        user_id: &str,
        event_id: &str,
        update: &EventUpdate,
        now: &DateTime<Tz>,
    ) -> EngineResult<Event> {
        let write_txn = self.db.begin_write()?;
        let event = {
            let mut tables = EventTables::open(&write_txn)?;
            let existing = tables.get_owned(user_id, event_id)?;
            let mut event = existing.clone();
            update.apply_to(&mut event, now)?;
            // The time index key moves with occurredAt.
            tables.remove(&existing)?;
            tables.put(&event)?;
            event
        };
        write_txn.commit()?;

        self.notify(user_id, ChangeKind::Events);
        Ok(event)
    }

    pub fn delete_event(&self, user_id: &str, event_id: &str) -> EngineResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut tables = EventTables::open(&write_txn)?;
            let existing = tables.get_owned(user_id, event_id)?;
            tables.remove(&existing)?;
        }
        write_txn.commit()?;

        self.notify(user_id, ChangeKind::Events);
        Ok(())
    }

    // =========================================================================
    // Series
    // =========================================================================

    /// Bar chart: `sum` unless the query or category asks for `avg`.
    pub fn bar_series<Tz: TimeZone>(
        &self,
        user_id: &str,
        category_id: &str,
        query: SeriesQuery,
        now: &DateTime<Tz>,
    ) -> EngineResult<Vec<Bucket>> {
        let category = self.get_visible_category(user_id, category_id)?;
        self.series(&category, query.period, query.offset, query.bar_aggregation(&category), now)
    }

    /// Line chart: `last` unless the query or category says otherwise.
    pub fn line_series<Tz: TimeZone>(
        &self,
        user_id: &str,
        category_id: &str,
        query: SeriesQuery,
        now: &DateTime<Tz>,
    ) -> EngineResult<Vec<Bucket>> {
        let category = self.get_visible_category(user_id, category_id)?;
        self.series(&category, query.period, query.offset, query.line_aggregation(&category), now)
    }

    fn get_visible_category(&self, user_id: &str, category_id: &str) -> EngineResult<Category> {
        let category = self.get_category(user_id, category_id)?;
        if category.is_archived() {
            return Err(EngineError::not_found(format!("Category {category_id}")));
        }
        Ok(category)
    }

    /// Range-scan the time index over the chart window, then aggregate.
    fn series<Tz: TimeZone>(
        &self,
        category: &Category,
        period: Period,
        offset: i32,
        aggregation: BucketAggregation,
        now: &DateTime<Tz>,
    ) -> EngineResult<Vec<Bucket>> {
        check_id("category", &category.id)?;
        let window = BucketWindow::new(period, offset, now);
        let start = time_bound(&category.user_id, &category.id, window.start());
        let end = time_bound(&category.user_id, &category.id, window.end());

        let read_txn = self.db.begin_read()?;
        let time_index = read_txn.open_table(EVENT_TIME_INDEX)?;
        let events = read_txn.open_table(EVENTS)?;

        let mut samples = Vec::new();
        for entry in time_index.range(start.as_slice()..end.as_slice())? {
            let (_, event_id) = entry?;
            if let Some(event) = read_record::<Event>(&events, event_id.value())? {
                samples.push(Sample::from(&event));
            }
        }
        Ok(aggregate_in(&window, &samples, aggregation))
    }

    // =========================================================================
    // Bulk
    // =========================================================================

    /// Every category (archived included) and event of the user.
    pub fn export(&self, user_id: &str) -> EngineResult<LocalSnapshot> {
        check_id("user", user_id)?;
        let read_txn = self.db.begin_read()?;
        let categories = read_txn.open_table(CATEGORIES)?;
        let category_index = read_txn.open_table(CATEGORY_OWNER_INDEX)?;
        let events = read_txn.open_table(EVENTS)?;
        let event_index = read_txn.open_table(EVENT_OWNER_INDEX)?;

        let mut snapshot = LocalSnapshot {
            categories: load_categories(&categories, &category_index, user_id)?,
            events: Vec::new(),
        };
        for id in ids_under(&event_index, &make_prefix(&[user_id]))? {
            if let Some(event) = read_record::<Event>(&events, &id)? {
                snapshot.events.push(event);
            }
        }
        snapshot.categories.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        snapshot
            .events
            .sort_by(|a, b| (a.occurred_at, &a.id).cmp(&(b.occurred_at, &b.id)));
        Ok(snapshot)
    }

    /// Replace all of the user's data in one transaction.
    ///
    /// Rows are re-owned by `user_id` regardless of what they carry.
    pub fn replace_all(&self, user_id: &str, snapshot: &LocalSnapshot) -> EngineResult<()> {
        check_id("user", user_id)?;
        for category in &snapshot.categories {
            check_id("category", &category.id)?;
        }
        for event in &snapshot.events {
            check_id("event", &event.id)?;
            check_id("category", &event.category_id)?;
        }

        let user_prefix = make_prefix(&[user_id]);
        let write_txn = self.db.begin_write()?;
        {
            let mut categories = write_txn.open_table(CATEGORIES)?;
            let mut category_index = write_txn.open_table(CATEGORY_OWNER_INDEX)?;
            let mut tables = EventTables::open(&write_txn)?;

            for id in ids_under(&category_index, &user_prefix)? {
                categories.remove(id.as_str())?;
            }
            for key in keys_under(&category_index, &user_prefix)? {
                category_index.remove(key.as_slice())?;
            }
            for id in ids_under(&tables.owner_index, &user_prefix)? {
                tables.events.remove(id.as_str())?;
            }
            for key in keys_under(&tables.owner_index, &user_prefix)? {
                tables.owner_index.remove(key.as_slice())?;
            }
            for key in keys_under(&tables.time_index, &user_prefix)? {
                tables.time_index.remove(key.as_slice())?;
            }

            for category in &snapshot.categories {
                let mut category = category.clone();
                category.user_id = user_id.to_string();
                put_category(&mut categories, &mut category_index, &category)?;
            }
            for event in &snapshot.events {
                let mut event = event.clone();
                event.user_id = user_id.to_string();
                tables.put(&event)?;
            }
        }
        write_txn.commit()?;

        tracing::info!(
            user_id = %user_id,
            categories = snapshot.categories.len(),
            events = snapshot.events.len(),
            "Local store replaced"
        );
        self.notify(user_id, ChangeKind::All);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CategoryType, EventNote, NoteChange};
    use chrono::{Duration, NaiveDate};

    fn temp_db() -> (LocalStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = LocalStore::open(&dir.path().join("local.redb")).unwrap();
        (db, dir)
    }

    fn draft(title: &str) -> CategoryDraft {
        CategoryDraft::new(title, CategoryType::Number, "#12ab34")
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn create_and_get_category() {
        let (db, _dir) = temp_db();
        let created = db.create_category("u1", &draft("Push-ups")).unwrap();
        assert_eq!(created.slug, "push-ups");
        assert_eq!(created.accent_hex, "#12AB34");

        let fetched = db.get_category("u1", &created.id).unwrap();
        assert_eq!(fetched, created);
    }

    #[test]
    fn same_title_gets_suffixed_slugs() {
        let (db, _dir) = temp_db();
        let a = db.create_category("u1", &draft("Foo")).unwrap();
        let b = db.create_category("u1", &draft("Foo")).unwrap();
        let c = db.create_category("u1", &draft("Foo")).unwrap();
        assert_eq!((a.slug.as_str(), b.slug.as_str(), c.slug.as_str()), ("foo", "foo-2", "foo-3"));

        // Another owner has its own namespace.
        assert_eq!(db.create_category("u2", &draft("Foo")).unwrap().slug, "foo");
    }

    #[test]
    fn explicit_taken_slug_conflicts() {
        let (db, _dir) = temp_db();
        db.create_category("u1", &draft("Foo")).unwrap();
        let err = db.create_category("u1", &draft("Bar").with_slug("foo")).unwrap_err();
        assert!(matches!(err, EngineError::SlugConflict(s) if s == "foo"));
    }

    #[test]
    fn foreign_records_are_not_found() {
        let (db, _dir) = temp_db();
        let cat = db.create_category("u1", &draft("Foo")).unwrap();
        assert!(matches!(db.get_category("u2", &cat.id), Err(EngineError::NotFound(_))));
        assert!(matches!(db.delete_category("u2", &cat.id), Err(EngineError::NotFound(_))));
        assert!(matches!(
            db.list_events("u2", &cat.id, EventPage::default()),
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            db.create_event("u2", &NewEvent::new(&cat.id, 1.0), &Utc::now()),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn list_excludes_archived_and_respects_order() {
        let (db, _dir) = temp_db();
        let a = db.create_category("u1", &draft("A")).unwrap();
        let b = db.create_category("u1", &draft("B")).unwrap();
        let c = db.create_category("u1", &draft("C")).unwrap();

        let mut snapshot = db.export("u1").unwrap();
        snapshot
            .categories
            .iter_mut()
            .find(|x| x.id == c.id)
            .unwrap()
            .source_archived_at = Some(Utc::now());
        db.replace_all("u1", &snapshot).unwrap();

        let ids: Vec<_> = db.list_categories("u1").unwrap().into_iter().map(|x| x.id).collect();
        assert_eq!(ids, [a.id.clone(), b.id.clone()]);

        db.set_category_order("u1", &[b.id.clone(), a.id.clone()]).unwrap();
        let ids: Vec<_> = db.list_categories("u1").unwrap().into_iter().map(|x| x.id).collect();
        assert_eq!(ids, [b.id.clone(), a.id.clone()]);

        db.reset_category_order("u1").unwrap();
        let list = db.list_categories("u1").unwrap();
        assert!(list.iter().all(|x| x.sort_order.is_none()));
        assert_eq!(list[0].id, a.id);

        // Archived slugs can be reused.
        assert_eq!(db.create_category("u1", &draft("C")).unwrap().slug, "c");
    }

    #[test]
    fn delete_cascades_to_events() {
        let (db, _dir) = temp_db();
        let keep = db.create_category("u1", &draft("Keep")).unwrap();
        let gone = db.create_category("u1", &draft("Gone")).unwrap();
        let now = Utc::now();
        db.create_event("u1", &NewEvent::new(&keep.id, 1.0), &now).unwrap();
        let e = db.create_event("u1", &NewEvent::new(&gone.id, 2.0), &now).unwrap();

        db.delete_category("u1", &gone.id).unwrap();
        assert!(matches!(db.get_category("u1", &gone.id), Err(EngineError::NotFound(_))));
        assert!(matches!(db.get_event("u1", &e.id), Err(EngineError::NotFound(_))));

        let left = db.export("u1").unwrap();
        assert_eq!(left.categories.len(), 1);
        assert_eq!(left.events.len(), 1);
        assert_eq!(left.events[0].category_id, keep.id);
    }

    #[test]
    fn system_categories_cannot_be_deleted() {
        let (db, _dir) = temp_db();
        let mut d = draft("Mood");
        d.is_system = true;
        let cat = db.create_category("u1", &d).unwrap();
        assert!(matches!(
            db.delete_category("u1", &cat.id),
            Err(EngineError::ProtectedCategory(_))
        ));
    }

    #[test]
    fn event_pages_are_newest_first_with_exclusive_cursor() {
        let (db, _dir) = temp_db();
        let cat = db.create_category("u1", &draft("Reps")).unwrap();
        let now = at(2024, 5, 20, 12);
        for i in 0..5 {
            let input = NewEvent::new(&cat.id, i as f64).at(at(2024, 5, 10 + i, 9));
            db.create_event("u1", &input, &now).unwrap();
        }

        let first = db.list_events("u1", &cat.id, EventPage::first(2)).unwrap();
        let amounts: Vec<_> = first.iter().map(|e| e.amount.unwrap()).collect();
        assert_eq!(amounts, [4.0, 3.0]);

        let cursor = first.last().unwrap().occurred_at;
        let second = db.list_events("u1", &cat.id, EventPage::before(2, cursor)).unwrap();
        let amounts: Vec<_> = second.iter().map(|e| e.amount.unwrap()).collect();
        assert_eq!(amounts, [2.0, 1.0]);

        let all = db.list_events("u1", &cat.id, EventPage::default()).unwrap();
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn future_events_are_rejected() {
        let (db, _dir) = temp_db();
        let cat = db.create_category("u1", &draft("Reps")).unwrap();
        let now = at(2024, 5, 20, 12);
        let tomorrow = NaiveDate::from_ymd_opt(2024, 5, 21).unwrap();
        assert!(matches!(
            db.create_event("u1", &NewEvent::new(&cat.id, 1.0).on_day(tomorrow), &now),
            Err(EngineError::FutureDateRejected)
        ));
    }

    #[test]
    fn update_moves_event_in_time_index() {
        let (db, _dir) = temp_db();
        let cat = db.create_category("u1", &draft("Reps")).unwrap();
        let now = at(2024, 5, 20, 12);
        let e = db
            .create_event("u1", &NewEvent::new(&cat.id, 5.0).at(at(2024, 5, 20, 8)), &now)
            .unwrap();

        let update = EventUpdate {
            amount: 7.0,
            occurred_at: at(2024, 5, 1, 8),
            note: NoteChange::Set(EventNote::Plain(" ok ".into())),
        };
        let updated = db.update_event("u1", &e.id, &update, &now).unwrap();
        assert_eq!(updated.occurred_on, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        assert_eq!(updated.data.plain_note(), Some("ok"));

        let page = db
            .list_events("u1", &cat.id, EventPage::before(10, at(2024, 5, 10, 0)))
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].amount, Some(7.0));

        db.delete_event("u1", &e.id).unwrap();
        assert!(db.list_events("u1", &cat.id, EventPage::default()).unwrap().is_empty());
        assert!(matches!(db.delete_event("u1", &e.id), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn weight_weekly_series_from_local_rows() {
        let (db, _dir) = temp_db();
        let weight = db
            .create_category(
                "u1",
                &CategoryDraft::new("Weight", CategoryType::Goal, "#000000")
                    .with_goal_value(85.0)
                    .with_unit("kg"),
            )
            .unwrap();
        let now = at(2024, 1, 10, 12);
        db.create_event("u1", &NewEvent::new(&weight.id, 90.0).at(at(2024, 1, 1, 8)), &now)
            .unwrap();
        db.create_event("u1", &NewEvent::new(&weight.id, 88.0).at(at(2024, 1, 8, 8)), &now)
            .unwrap();

        let buckets = db
            .line_series("u1", &weight.id, SeriesQuery::new(Period::Week), &now)
            .unwrap();
        assert_eq!(buckets.len(), 12);
        let values: Vec<_> = buckets.iter().filter_map(|b| b.value).collect();
        assert_eq!(values, [90.0, 88.0]);
        assert_eq!(buckets[10].start_date, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
    }

    #[test]
    fn bar_series_sums_only_window_rows() {
        let (db, _dir) = temp_db();
        let cat = db.create_category("u1", &draft("Water")).unwrap();
        let now = at(2024, 5, 20, 12);
        for h in [1, 2, 3] {
            db.create_event("u1", &NewEvent::new(&cat.id, 250.0).at(at(2024, 5, 20, h)), &now)
                .unwrap();
        }
        // Outside the 14-day window.
        db.create_event("u1", &NewEvent::new(&cat.id, 999.0).at(now - Duration::days(30)), &now)
            .unwrap();

        let buckets = db.bar_series("u1", &cat.id, SeriesQuery::new(Period::Day), &now).unwrap();
        assert_eq!(buckets.len(), 14);
        assert_eq!(buckets.iter().map(Bucket::total).sum::<f64>(), 750.0);

        let avg = db
            .bar_series(
                "u1",
                &cat.id,
                SeriesQuery::new(Period::Day).with_aggregation(BucketAggregation::Avg),
                &now,
            )
            .unwrap();
        assert_eq!(avg[13].value, Some(250.0));
    }

    #[test]
    fn replace_all_swaps_the_users_data_only() {
        let (db, _dir) = temp_db();
        let mine = db.create_category("u1", &draft("Mine")).unwrap();
        let theirs = db.create_category("u2", &draft("Theirs")).unwrap();
        db.create_event("u1", &NewEvent::new(&mine.id, 1.0), &Utc::now()).unwrap();

        let mut incoming = LocalSnapshot::default();
        let mut cat = mine.clone();
        cat.id = "imported".into();
        cat.user_id = "someone-else".into();
        incoming.categories.push(cat);
        db.replace_all("u1", &incoming).unwrap();

        let after = db.export("u1").unwrap();
        assert_eq!(after.categories.len(), 1);
        assert_eq!(after.categories[0].id, "imported");
        assert_eq!(after.categories[0].user_id, "u1");
        assert!(after.events.is_empty());
        assert!(db.get_category("u2", &theirs.id).is_ok());
    }

    #[test]
    fn mutations_publish_changes() {
        let (db, _dir) = temp_db();
        let mut rx = db.subscribe();
        let cat = db.create_category("u1", &draft("Foo")).unwrap();
        db.create_event("u1", &NewEvent::new(&cat.id, 1.0), &Utc::now()).unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.user_id, "u1");
        assert_eq!(first.kind, ChangeKind::Categories);
        assert_eq!(rx.try_recv().unwrap().kind, ChangeKind::Events);

        // Failed mutations publish nothing.
        let _ = db.create_category("u1", &draft("Bar").with_slug("foo"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn pipe_in_ids_is_rejected() {
        let (db, _dir) = temp_db();
        assert!(matches!(
            db.create_category("u|1", &draft("Foo")),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn time_bytes_preserve_order() {
        let early = time_bytes(at(1969, 1, 1, 0));
        let epoch = time_bytes(at(1970, 1, 1, 0));
        let late = time_bytes(at(2024, 1, 1, 0));
        assert!(early < epoch && epoch < late);
    }

    #[test]
    fn overview_stats_cover_visible_categories() {
        let (db, _dir) = temp_db();
        let cat = db.create_category("u1", &draft("Reps")).unwrap();
        let now = at(2024, 5, 15, 12);
        db.create_event("u1", &NewEvent::new(&cat.id, 10.0).at(at(2024, 5, 15, 8)), &now)
            .unwrap();
        let rows = db.categories_with_stats("u1", &now).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.today_total, 10.0);
    }
}
