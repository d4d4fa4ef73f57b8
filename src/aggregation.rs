// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Time-bucket aggregation shared by every store.
//!
//! The remote adapter, the public dashboard and the local store all fetch
//! `(occurredAt, amount)` samples for one category and hand them to
//! [`aggregate`]. Nothing in here does I/O.
//!
//! Buckets are aligned to the caller's local calendar: days start at local
//! midnight, weeks on Monday, months on the 1st and years on January 1st.

use std::cmp::Ordering;

use chrono::{
    DateTime, Datelike, Days, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc,
};
use serde::{Deserialize, Serialize};

use crate::models::{
    BucketAggregation, Category, CategoryType, ChartType, Event, GoalDirection, Period,
};

const MONTH_LABELS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// One input record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub occurred_at: DateTime<Utc>,
    pub amount: Option<f64>,
}

impl Sample {
    pub fn new(occurred_at: DateTime<Utc>, amount: f64) -> Self {
        Self {
            occurred_at,
            amount: Some(amount),
        }
    }
}

impl From<&Event> for Sample {
    fn from(event: &Event) -> Self {
        Self {
            occurred_at: event.occurred_at,
            amount: event.amount,
        }
    }
}

/// One chart slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub label: String,
    pub start_date: NaiveDate,
    /// `None` only for an empty `last` bucket
    pub value: Option<f64>,
}

impl Bucket {
    /// Bar-chart height: the value, with empty buckets at zero.
    pub fn total(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

// =============================================================================
// Calendar helpers
// =============================================================================

/// UTC instant of local midnight on `day`.
///
/// Where a DST gap swallows midnight, the first valid local instant of the
/// day is used instead.
pub fn local_midnight<Tz: TimeZone>(tz: &Tz, day: NaiveDate) -> DateTime<Utc> {
    let midnight = day.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&midnight)
        .earliest()
        .or_else(|| {
            tz.from_local_datetime(&(midnight + TimeDelta::hours(1)))
                .earliest()
        })
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
}

fn add_days(day: NaiveDate, n: i64) -> NaiveDate {
    let shifted = if n >= 0 {
        day.checked_add_days(Days::new(n.unsigned_abs()))
    } else {
        day.checked_sub_days(Days::new(n.unsigned_abs()))
    };
    shifted.unwrap_or(day)
}

/// First day of the month `months` away from `day`'s month.
fn shift_months(day: NaiveDate, months: i64) -> NaiveDate {
    let total = i64::from(day.year()) * 12 + i64::from(day.month0()) + months;
    let year = i32::try_from(total.div_euclid(12)).unwrap_or(day.year());
    let month = total.rem_euclid(12) as u32 + 1;
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(day)
}

fn start_of_year(year: i32, fallback: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, 1, 1).unwrap_or(fallback)
}

fn start_of_week(day: NaiveDate) -> NaiveDate {
    add_days(day, -i64::from(day.weekday().num_days_from_monday()))
}

/// Start day of the bucket containing `day`.
pub fn bucket_start(period: Period, day: NaiveDate) -> NaiveDate {
    match period {
        Period::Day => day,
        Period::Week => start_of_week(day),
        Period::Month => shift_months(day, 0),
        Period::Year => start_of_year(day.year(), day),
    }
}

fn next_bucket_start(period: Period, start: NaiveDate) -> NaiveDate {
    match period {
        Period::Day => add_days(start, 1),
        Period::Week => add_days(start, 7),
        Period::Month => shift_months(start, 1),
        Period::Year => start_of_year(start.year() + 1, start),
    }
}

/// `today` moved by `offset` whole periods.
fn anchor_day(period: Period, offset: i32, today: NaiveDate) -> NaiveDate {
    let offset = i64::from(offset);
    match period {
        Period::Day => add_days(today, offset),
        Period::Week => add_days(today, offset * 7),
        Period::Month => shift_months(today, offset),
        Period::Year => start_of_year(today.year() + offset as i32, today),
    }
}

fn first_bucket_day(period: Period, anchor: NaiveDate, count: usize) -> NaiveDate {
    let back = count.saturating_sub(1) as i64;
    match period {
        Period::Day => add_days(anchor, -back),
        Period::Week => start_of_week(add_days(anchor, -7 * back)),
        Period::Month => shift_months(anchor, -back),
        Period::Year => start_of_year(anchor.year() - back as i32, anchor),
    }
}

pub fn bucket_label(period: Period, start: NaiveDate) -> String {
    match period {
        Period::Day | Period::Week => start.format("%d.%m.").to_string(),
        Period::Month => MONTH_LABELS[start.month0() as usize].to_string(),
        Period::Year => start.year().to_string(),
    }
}

// =============================================================================
// Window
// =============================================================================

/// The consecutive buckets a chart covers, with their UTC boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketWindow {
    period: Period,
    /// `count + 1` local start days; the last one is the exclusive end
    days: Vec<NaiveDate>,
    bounds: Vec<DateTime<Utc>>,
}

impl BucketWindow {
    /// Chart window: `period.bucket_count()` buckets ending with the bucket
    /// `offset` periods before the one containing `now`. Positive offsets
    /// are treated as `0`.
    pub fn new<Tz: TimeZone>(period: Period, offset: i32, now: &DateTime<Tz>) -> Self {
        Self::with_count(period, offset, period.bucket_count(), now)
    }

    /// Same as [`BucketWindow::new`] with an explicit bucket count.
    pub fn with_count<Tz: TimeZone>(
        period: Period,
        offset: i32,
        count: usize,
        now: &DateTime<Tz>,
    ) -> Self {
        let count = count.max(1);
        let tz = now.timezone();
        let anchor = anchor_day(period, offset.min(0), now.date_naive());

        let mut days = Vec::with_capacity(count + 1);
        let mut day = first_bucket_day(period, anchor, count);
        days.push(day);
        for _ in 0..count {
            day = next_bucket_start(period, day);
            days.push(day);
        }
        let bounds = days.iter().map(|d| local_midnight(&tz, *d)).collect();

        Self {
            period,
            days,
            bounds,
        }
    }

    pub fn period(&self) -> Period {
        self.period
    }

    pub fn len(&self) -> usize {
        self.days.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inclusive start of the first bucket.
    pub fn start(&self) -> DateTime<Utc> {
        self.bounds[0]
    }

    /// Exclusive end of the last bucket.
    pub fn end(&self) -> DateTime<Utc> {
        self.bounds[self.bounds.len() - 1]
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start() && at < self.end()
    }

    /// Index of the half-open bucket containing `at`.
    pub fn bucket_index(&self, at: DateTime<Utc>) -> Option<usize> {
        if !self.contains(at) {
            return None;
        }
        Some(self.bounds.partition_point(|b| *b <= at) - 1)
    }

    pub fn start_days(&self) -> &[NaiveDate] {
        &self.days[..self.len()]
    }
}

/// `[start, end)` of the chart window, for range scans before [`aggregate`].
pub fn window<Tz: TimeZone>(
    period: Period,
    offset: i32,
    now: &DateTime<Tz>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let w = BucketWindow::new(period, offset, now);
    (w.start(), w.end())
}

// =============================================================================
// Aggregation
// =============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct Accumulator {
    sum: f64,
    count: usize,
    last: Option<(DateTime<Utc>, f64)>,
}

impl Accumulator {
    fn push(&mut self, at: DateTime<Utc>, amount: f64) {
        self.sum += amount;
        self.count += 1;
        // Later input wins ties on equal timestamps.
        match self.last {
            Some((t, _)) if t > at => {}
            _ => self.last = Some((at, amount)),
        }
    }

    fn value(&self, aggregation: BucketAggregation) -> Option<f64> {
        match aggregation {
            BucketAggregation::Sum => Some(self.sum),
            BucketAggregation::Avg if self.count == 0 => Some(0.0),
            BucketAggregation::Avg => Some(self.sum / self.count as f64),
            BucketAggregation::Last => self.last.map(|(_, v)| v),
        }
    }
}

/// Bucket `samples` for a chart of `period` at `offset`, seen from `now`.
///
/// Samples outside the window, without an amount, or with a non-finite
/// amount are skipped. Input order doesn't matter.
pub fn aggregate<Tz: TimeZone>(
    samples: &[Sample],
    period: Period,
    offset: i32,
    aggregation: BucketAggregation,
    now: &DateTime<Tz>,
) -> Vec<Bucket> {
    aggregate_in(&BucketWindow::new(period, offset, now), samples, aggregation)
}

/// [`aggregate`] over a precomputed window.
pub fn aggregate_in(
    window: &BucketWindow,
    samples: &[Sample],
    aggregation: BucketAggregation,
) -> Vec<Bucket> {
    let mut acc = vec![Accumulator::default(); window.len()];
    for sample in samples {
        let Some(amount) = sample.amount.filter(|a| a.is_finite()) else {
            continue;
        };
        if let Some(i) = window.bucket_index(sample.occurred_at) {
            acc[i].push(sample.occurred_at, amount);
        }
    }

    window
        .start_days()
        .iter()
        .zip(acc)
        .map(|(day, a)| Bucket {
            label: bucket_label(window.period(), *day),
            start_date: *day,
            value: a.value(aggregation),
        })
        .collect()
}

// =============================================================================
// Category stats
// =============================================================================

/// Headline numbers for one category's overview card.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryStats {
    pub category_id: String,
    pub today_count: usize,
    pub today_total: f64,
    /// Count in the category's own current period (week for line charts)
    pub period_count: usize,
    pub period_total: f64,
    pub year_count: usize,
    pub year_total: f64,
    /// Amount of the latest event
    pub last_value: Option<f64>,
    pub last_occurred_at: Option<DateTime<Utc>>,
}

/// Totals for the current day, the category's current period and the
/// current year. `avg` categories report means, everything else sums.
pub fn category_stats<Tz: TimeZone>(
    category: &Category,
    events: &[Event],
    now: &DateTime<Tz>,
) -> CategoryStats {
    let day = BucketWindow::with_count(Period::Day, 0, 1, now);
    let period = BucketWindow::with_count(category.effective_period(), 0, 1, now);
    let year = BucketWindow::with_count(Period::Year, 0, 1, now);

    let mut acc = [Accumulator::default(); 3];
    let mut latest: Option<(&Event, f64)> = None;

    for event in events.iter().filter(|e| e.category_id == category.id) {
        let Some(amount) = event.amount.filter(|a| a.is_finite()) else {
            continue;
        };
        for (slot, w) in [&day, &period, &year].into_iter().enumerate() {
            if w.contains(event.occurred_at) {
                acc[slot].push(event.occurred_at, amount);
            }
        }
        let newer = match latest {
            None => true,
            Some((prev, _)) => match event.occurred_at.cmp(&prev.occurred_at) {
                Ordering::Greater => true,
                Ordering::Equal => event.id > prev.id,
                Ordering::Less => false,
            },
        };
        if newer {
            latest = Some((event, amount));
        }
    }

    let total = |a: &Accumulator| match category.effective_aggregation() {
        BucketAggregation::Avg => a.value(BucketAggregation::Avg).unwrap_or(0.0),
        _ => a.sum,
    };

    CategoryStats {
        category_id: category.id.clone(),
        today_count: acc[0].count,
        today_total: total(&acc[0]),
        period_count: acc[1].count,
        period_total: total(&acc[1]),
        year_count: acc[2].count,
        year_total: total(&acc[2]),
        last_value: latest.map(|(_, v)| v),
        last_occurred_at: latest.map(|(e, _)| e.occurred_at),
    }
}

/// Configured goal direction, or the default for the category.
///
/// Weight-like and DONT categories aim low, everything else aims high.
pub fn goal_direction(category: &Category) -> GoalDirection {
    category.goal_direction.unwrap_or_else(|| {
        if category.slug.eq_ignore_ascii_case("weight")
            || category.category_type == CategoryType::Dont
        {
            GoalDirection::AtMost
        } else {
            GoalDirection::AtLeast
        }
    })
}

/// Whether the category currently meets its goal.
///
/// Line charts compare the last value with `goalValue` (targets allow
/// `max(0.1, 1%)`); bar charts compare the current period total with
/// `goalWeekly` (targets allow `max(1, 2%)`).
pub fn is_goal_reached(category: &Category, stats: &CategoryStats) -> bool {
    let (value, goal, min_tol, rel_tol) = match category.chart_type {
        ChartType::Line => match (stats.last_value, category.goal_value) {
            (Some(v), Some(g)) => (v, g, 0.1, 0.01),
            _ => return false,
        },
        ChartType::Bar => match category.goal_weekly {
            Some(g) if g > 0.0 => (stats.period_total, g, 1.0, 0.02),
            _ => return false,
        },
    };
    match goal_direction(category) {
        GoalDirection::AtMost => value <= goal,
        GoalDirection::AtLeast => value >= goal,
        GoalDirection::Target => (value - goal).abs() <= f64::max(min_tol, goal.abs() * rel_tol),
    }
}

fn overview_rank(category: &Category) -> u8 {
    match category.chart_type {
        ChartType::Line => 2,
        ChartType::Bar if category.goal_weekly.is_some_and(|g| g > 0.0) => 0,
        ChartType::Bar => 1,
    }
}

fn auto_compare(a: &(Category, CategoryStats), b: &(Category, CategoryStats)) -> Ordering {
    let reached_a = is_goal_reached(&a.0, &a.1);
    let reached_b = is_goal_reached(&b.0, &b.1);
    reached_a
        .cmp(&reached_b)
        .then_with(|| b.1.last_occurred_at.cmp(&a.1.last_occurred_at))
        .then_with(|| overview_rank(&a.0).cmp(&overview_rank(&b.0)))
        .then_with(|| a.0.title.cmp(&b.0.title))
}

/// Overview ordering.
///
/// With any custom `sortOrder` set, ordered categories come first by
/// position. Otherwise open goals come first, then most recently logged.
pub fn sort_overview(rows: &mut [(Category, CategoryStats)]) {
    let custom = rows.iter().any(|(c, _)| c.sort_order.is_some());
    rows.sort_by(|a, b| {
        if custom {
            match (a.0.sort_order, b.0.sort_order) {
                (Some(x), Some(y)) if x != y => return x.cmp(&y),
                (Some(_), None) => return Ordering::Less,
                (None, Some(_)) => return Ordering::Greater,
                _ => {}
            }
        }
        auto_compare(a, b)
    });
}
