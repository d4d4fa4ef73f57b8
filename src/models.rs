// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Data Models
//!
//! Categories, events and the small enums around them. The same types are
//! used for server-held rows (through [`crate::remote::RemoteStore`]) and
//! device-local rows (through [`crate::storage::LocalStore`]), serialized in
//! camelCase so both sides agree on the JSON shape.
//!
//! ## Model Categories
//!
//! - **Categories**: tracked metric definitions ([`Category`], [`CategoryDraft`])
//! - **Events**: logged occurrences ([`Event`], [`NewEvent`], [`EventUpdate`])
//! - **Queries**: paging and chart parameters ([`EventPage`], [`SeriesQuery`])

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::error::{EngineError, EngineResult};
use crate::privacy::envelope::decode_encrypted_string;
use crate::storage::OwnedResource;

/// Default page size for event listings.
pub const DEFAULT_EVENT_PAGE: usize = 50;

/// Hard cap for a single event page.
pub const MAX_EVENT_PAGE: usize = 200;

/// Longest accepted event duration, in minutes.
pub const MAX_DURATION_MINUTES: u32 = 24 * 60;

// =============================================================================
// Enums
// =============================================================================

/// Where a user's categories and events physically live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyMode {
    /// Plaintext rows on the server
    #[default]
    Cloud,
    /// Server rows with client-encrypted titles and notes
    Encrypted,
    /// Rows only in the device-local store
    Local,
}

impl PrivacyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivacyMode::Cloud => "cloud",
            PrivacyMode::Encrypted => "encrypted",
            PrivacyMode::Local => "local",
        }
    }
}

impl fmt::Display for PrivacyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrivacyMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "cloud" => Ok(PrivacyMode::Cloud),
            "encrypted" => Ok(PrivacyMode::Encrypted),
            "local" => Ok(PrivacyMode::Local),
            other => Err(EngineError::invalid(format!("unknown privacy mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CategoryType {
    Number,
    Do,
    Dont,
    Goal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    Bar,
    Line,
}

impl ChartType {
    /// GOAL categories chart as a line, everything else as bars.
    pub fn for_category_type(category_type: CategoryType) -> Self {
        match category_type {
            CategoryType::Goal => ChartType::Line,
            _ => ChartType::Bar,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Day,
    Week,
    Month,
    Year,
}

impl Period {
    /// Number of buckets a chart of this period shows.
    pub fn bucket_count(&self) -> usize {
        match self {
            Period::Day => 14,
            Period::Week => 12,
            Period::Month => 12,
            Period::Year => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketAggregation {
    Sum,
    Avg,
    Last,
}

impl BucketAggregation {
    pub fn default_for(chart_type: ChartType) -> Self {
        match chart_type {
            ChartType::Line => BucketAggregation::Last,
            ChartType::Bar => BucketAggregation::Sum,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalDirection {
    AtLeast,
    AtMost,
    Target,
}

// =============================================================================
// Category
// =============================================================================

/// A tracked metric definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    /// Unique category identifier (UUID)
    pub id: String,
    /// Owner user ID
    pub user_id: String,
    /// Plain title or an `enc:v1:` encrypted string
    pub title: String,
    /// URL-safe name, unique per owner among non-archived categories
    pub slug: String,
    pub category_type: CategoryType,
    pub chart_type: ChartType,
    /// Bucket period; `None` for line charts
    pub period: Option<Period>,
    pub unit: Option<String>,
    pub bucket_aggregation: Option<BucketAggregation>,
    pub goal_direction: Option<GoalDirection>,
    /// Per-period goal for bar charts
    pub goal_weekly: Option<f64>,
    /// Target value for line charts
    pub goal_value: Option<f64>,
    /// `#RRGGBB`, upper-case
    pub accent_hex: String,
    pub emoji: Option<String>,
    /// System categories can't be deleted
    #[serde(default)]
    pub is_system: bool,
    /// Custom position in the category list
    #[serde(default)]
    pub sort_order: Option<u32>,
    /// Soft-delete marker; archived categories are hidden everywhere
    #[serde(default)]
    pub source_archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Category {
    pub fn is_archived(&self) -> bool {
        self.source_archived_at.is_some()
    }

    /// True only for a well-formed envelope; a plain title that merely
    /// starts with the prefix is still plain.
    pub fn has_encrypted_title(&self) -> bool {
        decode_encrypted_string(&self.title).is_some()
    }

    /// Aggregation actually applied to this category's buckets.
    pub fn effective_aggregation(&self) -> BucketAggregation {
        self.bucket_aggregation
            .unwrap_or_else(|| BucketAggregation::default_for(self.chart_type))
    }

    /// Period used for "current period" stats; line charts fall back to weeks.
    pub fn effective_period(&self) -> Period {
        self.period.unwrap_or(Period::Week)
    }
}

impl OwnedResource for Category {
    fn owner_user_id(&self) -> &str {
        &self.user_id
    }
}

/// Listing order: custom order first, then oldest first.
pub fn order_categories(categories: &mut [Category]) {
    categories.sort_by(|a, b| {
        (a.sort_order.is_none(), a.sort_order, a.created_at, &a.id).cmp(&(
            b.sort_order.is_none(),
            b.sort_order,
            b.created_at,
            &b.id,
        ))
    });
}

/// Input for creating or editing a category.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryDraft {
    pub title: String,
    /// Explicit slug; taken slugs are rejected instead of suffixed
    pub slug: Option<String>,
    pub category_type: CategoryType,
    pub chart_type: Option<ChartType>,
    pub period: Option<Period>,
    pub unit: Option<String>,
    pub goal: Option<f64>,
    pub goal_value: Option<f64>,
    pub accent_hex: String,
    pub emoji: Option<String>,
    pub bucket_aggregation: Option<BucketAggregation>,
    pub goal_direction: Option<GoalDirection>,
    pub is_system: bool,
}

impl CategoryDraft {
    pub fn new(
        title: impl Into<String>,
        category_type: CategoryType,
        accent_hex: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            slug: None,
            category_type,
            chart_type: None,
            period: None,
            unit: None,
            goal: None,
            goal_value: None,
            accent_hex: accent_hex.into(),
            emoji: None,
            bucket_aggregation: None,
            goal_direction: None,
            is_system: false,
        }
    }

    /// Draft that reproduces an existing category (used to rewrite titles).
    pub fn from_category(category: &Category) -> Self {
        Self {
            title: category.title.clone(),
            slug: Some(category.slug.clone()),
            category_type: category.category_type,
            chart_type: Some(category.chart_type),
            period: category.period,
            unit: category.unit.clone(),
            goal: category.goal_weekly,
            goal_value: category.goal_value,
            accent_hex: category.accent_hex.clone(),
            emoji: category.emoji.clone(),
            bucket_aggregation: category.bucket_aggregation,
            goal_direction: category.goal_direction,
            is_system: category.is_system,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_period(mut self, period: Period) -> Self {
        self.period = Some(period);
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_goal_value(mut self, goal_value: f64) -> Self {
        self.goal_value = Some(goal_value);
        self
    }

    pub fn with_slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = Some(slug.into());
        self
    }

    /// Explicit slug requested by the caller, trimmed; empty means "derive".
    pub fn requested_slug(&self) -> Option<String> {
        self.slug
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    /// Build a new category row from this draft.
    pub fn build(
        &self,
        id: String,
        user_id: &str,
        slug: String,
        now: DateTime<Utc>,
    ) -> EngineResult<Category> {
        let title = clean_title(&self.title)?;
        let accent_hex = normalize_hex(&self.accent_hex)?;
        let chart_type = self
            .chart_type
            .unwrap_or_else(|| ChartType::for_category_type(self.category_type));
        let is_bar = chart_type == ChartType::Bar;
        Ok(Category {
            id,
            user_id: user_id.to_string(),
            title,
            slug,
            category_type: self.category_type,
            chart_type,
            period: is_bar.then(|| self.period.unwrap_or(Period::Week)),
            unit: non_empty(self.unit.as_deref()),
            bucket_aggregation: self.bucket_aggregation,
            goal_direction: self.goal_direction,
            goal_weekly: if is_bar { self.goal } else { None },
            goal_value: if is_bar { None } else { self.goal_value },
            accent_hex,
            emoji: non_empty(self.emoji.as_deref()),
            is_system: self.is_system,
            sort_order: None,
            source_archived_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Apply an edit to an existing row. Slug, ownership, system flag and
    /// ordering stay untouched; unset aggregation/direction keep old values.
    pub fn apply_to(&self, category: &mut Category, now: DateTime<Utc>) -> EngineResult<()> {
        let title = clean_title(&self.title)?;
        let accent_hex = normalize_hex(&self.accent_hex)?;
        let chart_type = self
            .chart_type
            .unwrap_or_else(|| ChartType::for_category_type(self.category_type));
        let is_bar = chart_type == ChartType::Bar;

        category.title = title;
        category.category_type = self.category_type;
        category.chart_type = chart_type;
        category.period = is_bar.then(|| self.period.unwrap_or(Period::Week));
        category.unit = non_empty(self.unit.as_deref());
        category.accent_hex = accent_hex;
        category.emoji = non_empty(self.emoji.as_deref());
        category.bucket_aggregation = self.bucket_aggregation.or(category.bucket_aggregation);
        category.goal_direction = self.goal_direction.or(category.goal_direction);
        category.goal_weekly = if is_bar { self.goal } else { None };
        category.goal_value = if is_bar { None } else { self.goal_value };
        category.updated_at = now;
        Ok(())
    }
}

fn clean_title(title: &str) -> EngineResult<String> {
    let clean = title.trim();
    if clean.is_empty() {
        return Err(EngineError::invalid("Title is required."));
    }
    Ok(clean.to_string())
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(str::to_string)
}

/// Validate `#RRGGBB` and return it upper-cased.
pub fn normalize_hex(value: &str) -> EngineResult<String> {
    let v = value.trim();
    let digits = v.strip_prefix('#').ok_or(EngineError::InvalidHexColor)?;
    if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(EngineError::InvalidHexColor);
    }
    Ok(format!("#{}", digits.to_ascii_uppercase()))
}

/// URL-safe slug for a title: lower-case ASCII letters, digits and dashes.
pub fn slugify(title: &str) -> String {
    let folded: String = title
        .trim()
        .to_lowercase()
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect();

    let mut slug = String::with_capacity(folded.len());
    let mut pending_dash = false;
    for c in folded.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }

    if slug.is_empty() {
        "category".to_string()
    } else {
        slug
    }
}

/// First of `base`, `base-2`, `base-3`, … not present in `used`.
pub fn unique_slug(base: &str, used: &HashSet<String>) -> String {
    if !used.contains(base) {
        return base.to_string();
    }
    let mut n = 2u32;
    loop {
        let candidate = format!("{base}-{n}");
        if !used.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Pick the slug for a new category among the owner's `used` slugs.
pub fn resolve_slug(draft: &CategoryDraft, used: &HashSet<String>) -> EngineResult<String> {
    match draft.requested_slug() {
        Some(slug) if used.contains(&slug) => Err(EngineError::SlugConflict(slug)),
        Some(slug) => Ok(slug),
        None => Ok(unique_slug(&slugify(&draft.title), used)),
    }
}

// =============================================================================
// Event
// =============================================================================

/// A note attached to an event: plain text or an encrypted string, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventNote {
    Plain(String),
    Encrypted(String),
}

impl EventNote {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, EventNote::Encrypted(_))
    }
}

/// Structured event fields: numbers or short strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

/// Small structured payload carried by an event.
///
/// Serialized with separate `note` / `noteEnc` keys; at most one is set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "RawEventData", into = "RawEventData")]
pub struct EventData {
    pub note: Option<EventNote>,
    pub fields: BTreeMap<String, FieldValue>,
    /// Minutes
    pub duration: Option<u32>,
}

impl EventData {
    pub fn plain_note(&self) -> Option<&str> {
        match &self.note {
            Some(EventNote::Plain(text)) => Some(text),
            _ => None,
        }
    }

    pub fn encrypted_note(&self) -> Option<&str> {
        match &self.note {
            Some(EventNote::Encrypted(enc)) => Some(enc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEventData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    note_enc: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    fields: BTreeMap<String, FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration: Option<u32>,
}

impl From<RawEventData> for EventData {
    fn from(raw: RawEventData) -> Self {
        // An encrypted note wins over a stale plaintext copy.
        let note = match (raw.note_enc, raw.note) {
            (Some(enc), _) if !enc.is_empty() => Some(EventNote::Encrypted(enc)),
            (_, Some(plain)) if !plain.trim().is_empty() => {
                Some(EventNote::Plain(plain.trim().to_string()))
            }
            _ => None,
        };
        Self {
            note,
            fields: raw.fields,
            duration: raw.duration,
        }
    }
}

impl From<EventData> for RawEventData {
    fn from(data: EventData) -> Self {
        let (note, note_enc) = match data.note {
            Some(EventNote::Plain(text)) => (Some(text), None),
            Some(EventNote::Encrypted(enc)) => (None, Some(enc)),
            None => (None, None),
        };
        Self {
            note,
            note_enc,
            fields: data.fields,
            duration: data.duration,
        }
    }
}

/// One logged occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub user_id: String,
    pub category_id: String,
    pub amount: Option<f64>,
    pub occurred_at: DateTime<Utc>,
    /// Local calendar day of `occurred_at`
    pub occurred_on: NaiveDate,
    pub raw_text: Option<String>,
    #[serde(default)]
    pub data: EventData,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OwnedResource for Event {
    fn owner_user_id(&self) -> &str {
        &self.user_id
    }
}

/// When a new event happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventTime {
    /// Right now
    #[default]
    Now,
    /// Some earlier local day, at the current local time of day
    OnDay(NaiveDate),
    /// A precise instant
    At(DateTime<Utc>),
}

/// Input for logging an event.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub category_id: String,
    pub amount: f64,
    pub when: EventTime,
    pub note: Option<EventNote>,
    pub fields: BTreeMap<String, FieldValue>,
    /// Minutes; non-positive or non-finite values are dropped
    pub duration: Option<f64>,
    pub raw_text: Option<String>,
}

impl NewEvent {
    pub fn new(category_id: impl Into<String>, amount: f64) -> Self {
        Self {
            category_id: category_id.into(),
            amount,
            when: EventTime::Now,
            note: None,
            fields: BTreeMap::new(),
            duration: None,
            raw_text: None,
        }
    }

    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.when = EventTime::At(occurred_at);
        self
    }

    pub fn on_day(mut self, day: NaiveDate) -> Self {
        self.when = EventTime::OnDay(day);
        self
    }

    pub fn with_note(mut self, note: EventNote) -> Self {
        self.note = Some(note);
        self
    }

    /// Sanitized payload for storage.
    pub fn data(&self) -> EventData {
        EventData {
            note: clean_note(self.note.clone()),
            fields: sanitize_fields(&self.fields),
            duration: clamp_duration(self.duration),
        }
    }

    /// Build the stored row, resolving and validating the timestamps.
    pub fn build<Tz: TimeZone>(
        &self,
        id: String,
        user_id: &str,
        now: &DateTime<Tz>,
    ) -> EngineResult<Event> {
        if !self.amount.is_finite() {
            return Err(EngineError::invalid("Amount must be a number."));
        }
        let (occurred_at, occurred_on) = resolve_event_time(self.when, now)?;
        let created = now.with_timezone(&Utc);
        Ok(Event {
            id,
            user_id: user_id.to_string(),
            category_id: self.category_id.clone(),
            amount: Some(self.amount),
            occurred_at,
            occurred_on,
            raw_text: self.raw_text.clone(),
            data: self.data(),
            created_at: created,
            updated_at: created,
        })
    }
}

/// What an event edit does to the note.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NoteChange {
    #[default]
    Keep,
    Clear,
    Set(EventNote),
}

/// Manual edit of an event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventUpdate {
    pub amount: f64,
    pub occurred_at: DateTime<Utc>,
    pub note: NoteChange,
}

impl EventUpdate {
    /// Edit that keeps amount and time and only touches the note.
    pub fn note_only(event: &Event, note: NoteChange) -> Self {
        Self {
            amount: event.amount.unwrap_or(0.0),
            occurred_at: event.occurred_at,
            note,
        }
    }

    pub fn apply_to<Tz: TimeZone>(
        &self,
        event: &mut Event,
        now: &DateTime<Tz>,
    ) -> EngineResult<()> {
        if !self.amount.is_finite() {
            return Err(EngineError::invalid("Amount must be a number."));
        }
        let (occurred_at, occurred_on) = resolve_event_time(EventTime::At(self.occurred_at), now)?;
        event.amount = Some(self.amount);
        event.occurred_at = occurred_at;
        event.occurred_on = occurred_on;
        match &self.note {
            NoteChange::Keep => {}
            NoteChange::Clear => event.data.note = None,
            NoteChange::Set(note) => event.data.note = clean_note(Some(note.clone())),
        }
        event.updated_at = now.with_timezone(&Utc);
        Ok(())
    }
}

fn clean_note(note: Option<EventNote>) -> Option<EventNote> {
    match note? {
        EventNote::Plain(text) => {
            let clean = text.trim();
            (!clean.is_empty()).then(|| EventNote::Plain(clean.to_string()))
        }
        EventNote::Encrypted(enc) => (!enc.is_empty()).then_some(EventNote::Encrypted(enc)),
    }
}

/// Trim keys, drop empty strings and non-finite numbers.
pub fn sanitize_fields(fields: &BTreeMap<String, FieldValue>) -> BTreeMap<String, FieldValue> {
    fields
        .iter()
        .filter_map(|(key, value)| {
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            let value = match value {
                FieldValue::Number(n) if n.is_finite() => FieldValue::Number(*n),
                FieldValue::Text(s) if !s.trim().is_empty() => {
                    FieldValue::Text(s.trim().to_string())
                }
                _ => return None,
            };
            Some((key.to_string(), value))
        })
        .collect()
}

/// Round to whole minutes and cap at one day.
pub fn clamp_duration(duration: Option<f64>) -> Option<u32> {
    let minutes = duration.filter(|d| d.is_finite() && *d > 0.0)?;
    Some(minutes.min(f64::from(MAX_DURATION_MINUTES)).round() as u32)
}

/// Resolve `(occurredAt, occurredOn)` in the caller's time zone.
///
/// Past days keep the current local hour and minute; future days fail with
/// [`EngineError::FutureDateRejected`].
pub fn resolve_event_time<Tz: TimeZone>(
    when: EventTime,
    now: &DateTime<Tz>,
) -> EngineResult<(DateTime<Utc>, NaiveDate)> {
    let tz = now.timezone();
    let today = now.date_naive();
    match when {
        EventTime::Now => Ok((now.with_timezone(&Utc), today)),
        EventTime::OnDay(day) if day == today => Ok((now.with_timezone(&Utc), today)),
        EventTime::OnDay(day) if day > today => Err(EngineError::FutureDateRejected),
        EventTime::OnDay(day) => {
            let time = now
                .time()
                .with_second(0)
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or_default();
            let at = tz
                .from_local_datetime(&day.and_time(time))
                .earliest()
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|| crate::aggregation::local_midnight(&tz, day));
            Ok((at, day))
        }
        EventTime::At(at) => {
            let on = at.with_timezone(&tz).date_naive();
            if on > today {
                return Err(EngineError::FutureDateRejected);
            }
            Ok((at, on))
        }
    }
}

// =============================================================================
// Queries
// =============================================================================

/// Cursor page over a category's events, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventPage {
    pub take: Option<usize>,
    /// Exclusive upper bound on `occurred_at`
    pub before: Option<DateTime<Utc>>,
}

impl EventPage {
    pub fn first(take: usize) -> Self {
        Self {
            take: Some(take),
            before: None,
        }
    }

    pub fn before(take: usize, before: DateTime<Utc>) -> Self {
        Self {
            take: Some(take),
            before: Some(before),
        }
    }

    pub fn limit(&self) -> usize {
        self.take
            .unwrap_or(DEFAULT_EVENT_PAGE)
            .clamp(1, MAX_EVENT_PAGE)
    }
}

/// Chart request for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesQuery {
    pub period: Period,
    /// `0` is the period containing now, negative values go back in time
    pub offset: i32,
    /// Overrides the category's own aggregation
    pub aggregation: Option<BucketAggregation>,
}

impl SeriesQuery {
    pub fn new(period: Period) -> Self {
        Self {
            period,
            offset: 0,
            aggregation: None,
        }
    }

    pub fn with_offset(mut self, offset: i32) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_aggregation(mut self, aggregation: BucketAggregation) -> Self {
        self.aggregation = Some(aggregation);
        self
    }

    /// Bar charts only sum or average.
    pub fn bar_aggregation(&self, category: &Category) -> BucketAggregation {
        match self.aggregation.or(category.bucket_aggregation) {
            Some(BucketAggregation::Avg) => BucketAggregation::Avg,
            _ => BucketAggregation::Sum,
        }
    }

    /// Line charts default to the latest value per bucket.
    pub fn line_aggregation(&self, category: &Category) -> BucketAggregation {
        self.aggregation
            .or(category.bucket_aggregation)
            .unwrap_or(BucketAggregation::Last)
    }
}
