// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Mode Migration
//!
//! Moves all of a user's categories and events when the privacy mode
//! changes.
//!
//! | from → to              | category title              | event note                    |
//! |------------------------|-----------------------------|-------------------------------|
//! | cloud → encrypted      | encrypt unless ciphertext   | encrypt non-empty plain notes |
//! | encrypted → cloud      | decrypt unless plaintext    | decrypt encrypted notes       |
//! | cloud/encrypted → local| copy into the local store, then delete server rows      |
//! | local → cloud/encrypted| create server rows, encrypting for encrypted            |
//!
//! Records are processed one at a time and there is no transaction around
//! the whole run. The first failing record stops the run with
//! [`EngineError::MigrationPartialFailure`]; records before it stay
//! migrated. Every step checks whether its record is already in the target
//! shape, so running the same transition again finishes the rest and
//! writes nothing that is already done. The persisted mode changes only
//! after the whole body succeeded.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{EngineError, EngineResult};
use crate::models::{
    Category, CategoryDraft, Event, EventNote, EventTime, EventUpdate, NewEvent, NoteChange,
    PrivacyMode,
};
use crate::privacy::{
    decrypt_string, encrypt_to_string, recover_params, CryptoParams, PrivacyController,
    SymmetricKey,
};
use crate::remote::{collect_all_events, RemoteStore};
use crate::storage::{LocalSnapshot, LocalStore};

// =============================================================================
// Progress
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Idle,
    EncryptingCategories,
    EncryptingNotes,
    DecryptingCategories,
    DecryptingNotes,
    Downloading,
    WipingServer,
    CreatingCategories,
    CreatingEntries,
    Finished,
}

impl MigrationPhase {
    /// Short status line for the UI.
    pub fn label(&self) -> &'static str {
        match self {
            MigrationPhase::Idle => "Waiting…",
            MigrationPhase::EncryptingCategories => "Encrypting categories…",
            MigrationPhase::EncryptingNotes => "Encrypting notes…",
            MigrationPhase::DecryptingCategories => "Decrypting categories…",
            MigrationPhase::DecryptingNotes => "Decrypting notes…",
            MigrationPhase::Downloading => "Downloading your data…",
            MigrationPhase::WipingServer => "Wiping server data…",
            MigrationPhase::CreatingCategories => "Creating categories…",
            MigrationPhase::CreatingEntries => "Creating entries…",
            MigrationPhase::Finished => "Done.",
        }
    }
}

/// Where a running migration is. `completed`/`total` count records of the
/// current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationProgress {
    pub phase: MigrationPhase,
    pub completed: usize,
    pub total: usize,
}

impl MigrationProgress {
    fn idle() -> Self {
        Self {
            phase: MigrationPhase::Idle,
            completed: 0,
            total: 0,
        }
    }
}

/// What a finished run wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub from: PrivacyMode,
    pub to: PrivacyMode,
    pub categories_written: usize,
    pub events_written: usize,
    pub categories_deleted: usize,
    pub events_deleted: usize,
}

impl MigrationReport {
    fn new(from: PrivacyMode, to: PrivacyMode) -> Self {
        Self {
            from,
            to,
            categories_written: 0,
            events_written: 0,
            categories_deleted: 0,
            events_deleted: 0,
        }
    }

    /// Data writes of any kind, local or remote.
    pub fn writes(&self) -> usize {
        self.categories_written
            + self.events_written
            + self.categories_deleted
            + self.events_deleted
    }
}

// =============================================================================
// Per-user guard
// =============================================================================

/// Rejects a second migration for a user while one is running.
#[derive(Debug, Clone, Default)]
pub struct MigrationGuard {
    active: Arc<Mutex<HashSet<String>>>,
}

impl MigrationGuard {
    pub fn try_acquire(&self, user_id: &str) -> EngineResult<MigrationTicket> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(user_id.to_string()) {
            return Err(EngineError::MigrationInProgress(user_id.to_string()));
        }
        Ok(MigrationTicket {
            user_id: user_id.to_string(),
            active: Arc::clone(&self.active),
        })
    }

    pub fn is_running(&self, user_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(user_id)
    }
}

/// Held for the duration of one migration; releases the user on drop.
#[derive(Debug)]
pub struct MigrationTicket {
    user_id: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl MigrationTicket {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

impl Drop for MigrationTicket {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.user_id);
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct MigrationOrchestrator<R> {
    remote: Arc<R>,
    local: Arc<LocalStore>,
    guard: MigrationGuard,
}

impl<R: RemoteStore> MigrationOrchestrator<R> {
    pub fn new(remote: Arc<R>, local: Arc<LocalStore>) -> Self {
        Self {
            remote,
            local,
            guard: MigrationGuard::default(),
        }
    }

    pub fn guard(&self) -> &MigrationGuard {
        &self.guard
    }

    /// Reserve the user for one migration. Subscribe to
    /// [`Migration::progress`] before running it.
    pub fn begin(&self, user_id: &str) -> EngineResult<Migration<'_, R>> {
        let ticket = self.guard.try_acquire(user_id)?;
        let (progress, _) = watch::channel(MigrationProgress::idle());
        Ok(Migration {
            orchestrator: self,
            ticket,
            progress,
            completed: 0,
            report: None,
        })
    }

    /// Migrate the controller's user from its current mode to `target`.
    pub async fn migrate(
        &self,
        controller: &mut PrivacyController,
        target: PrivacyMode,
        passphrase: Option<&str>,
    ) -> EngineResult<MigrationReport> {
        self.begin(controller.user_id())?
            .run(controller, target, passphrase)
            .await
    }
}

/// One reserved migration run.
pub struct Migration<'a, R> {
    orchestrator: &'a MigrationOrchestrator<R>,
    ticket: MigrationTicket,
    progress: watch::Sender<MigrationProgress>,
    /// Records processed over the whole run
    completed: usize,
    report: Option<MigrationReport>,
}

/// Key material for transitions that read or write ciphertext.
struct Unlocked {
    key: SymmetricKey,
    params: CryptoParams,
}

impl<R: RemoteStore> Migration<'_, R> {
    pub fn progress(&self) -> watch::Receiver<MigrationProgress> {
        self.progress.subscribe()
    }

    /// Migrate from the controller's current mode. Same mode is a no-op.
    pub async fn run(
        self,
        controller: &mut PrivacyController,
        target: PrivacyMode,
        passphrase: Option<&str>,
    ) -> EngineResult<MigrationReport> {
        let from = controller.mode();
        if from == target {
            self.check_user(controller)?;
            self.set_phase(MigrationPhase::Finished, 0);
            return Ok(MigrationReport::new(from, target));
        }
        self.run_transition(controller, from, target, passphrase).await
    }

    /// Run the `from → to` transforms regardless of the controller's
    /// current mode, then persist `to`. Used to resume an interrupted run.
    ///
    /// `passphrase` is needed when either side is `encrypted`, unless the
    /// controller is already unlocked.
    pub async fn run_transition(
        mut self,
        controller: &mut PrivacyController,
        from: PrivacyMode,
        to: PrivacyMode,
        passphrase: Option<&str>,
    ) -> EngineResult<MigrationReport> {
        self.check_user(controller)?;
        if from == to {
            return Err(EngineError::UnsupportedMigration { from, to });
        }
        let user_id = self.ticket.user_id().to_string();
        self.report = Some(MigrationReport::new(from, to));

        // Moving to local copies ciphertext as-is and needs no key.
        let needs_key = matches!(
            (from, to),
            (_, PrivacyMode::Encrypted) | (PrivacyMode::Encrypted, PrivacyMode::Cloud)
        );
        let unlocked = if needs_key {
            self.adopt_existing_params(controller, &user_id, from).await?;
            Some(unlock(controller, passphrase)?)
        } else {
            None
        };

        tracing::info!(user_id = %user_id, from = %from, to = %to, "Privacy migration started");

        let body = match (from, to) {
            (PrivacyMode::Cloud, PrivacyMode::Encrypted) => match &unlocked {
                Some(u) => self.encrypt_remote(&user_id, u).await,
                None => Err(EngineError::Locked),
            },
            (PrivacyMode::Encrypted, PrivacyMode::Cloud) => match &unlocked {
                Some(u) => self.decrypt_remote(&user_id, &u.key).await,
                None => Err(EngineError::Locked),
            },
            (_, PrivacyMode::Local) => self.remote_to_local(&user_id).await,
            (PrivacyMode::Local, _) => self.local_to_remote(&user_id, unlocked.as_ref()).await,
            _ => Err(EngineError::UnsupportedMigration { from, to }),
        };

        if let Err(err) = body {
            tracing::warn!(
                user_id = %user_id,
                from = %from,
                to = %to,
                completed = self.completed,
                error = %err,
                "Privacy migration stopped"
            );
            return Err(EngineError::MigrationPartialFailure {
                completed: self.completed,
                source: Box::new(err),
            });
        }

        controller.set_mode(to)?;
        if let (PrivacyMode::Encrypted, Some(u)) = (to, unlocked) {
            controller.remember_key(u.key);
        }
        self.set_phase(MigrationPhase::Finished, 0);

        let report = self
            .report
            .take()
            .unwrap_or_else(|| MigrationReport::new(from, to));
        tracing::info!(
            user_id = %user_id,
            from = %from,
            to = %to,
            categories = report.categories_written,
            events = report.events_written,
            deleted = report.categories_deleted,
            "Privacy migration finished"
        );
        Ok(report)
    }

    fn check_user(&self, controller: &PrivacyController) -> EngineResult<()> {
        if controller.user_id() != self.ticket.user_id() {
            return Err(EngineError::invalid("migration reserved for another user"));
        }
        Ok(())
    }

    // =========================================================================
    // Progress bookkeeping
    // =========================================================================

    fn set_phase(&self, phase: MigrationPhase, total: usize) {
        self.progress.send_replace(MigrationProgress {
            phase,
            completed: 0,
            total,
        });
    }

    fn step(&mut self) {
        self.completed += 1;
        self.progress.send_modify(|p| p.completed += 1);
    }

    fn record(&mut self, update: impl FnOnce(&mut MigrationReport)) {
        if let Some(report) = self.report.as_mut() {
            update(report);
        }
    }

    // =========================================================================
    // Crypto params
    // =========================================================================

    /// Pick up params from existing ciphertext in the source store when the
    /// controller has none.
    async fn adopt_existing_params(
        &self,
        controller: &mut PrivacyController,
        user_id: &str,
        from: PrivacyMode,
    ) -> EngineResult<()> {
        if controller.crypto_params().is_some() {
            return Ok(());
        }
        let found = match from {
            PrivacyMode::Local => {
                let snapshot = self.orchestrator.local.export(user_id)?;
                params_in(&snapshot.categories, &snapshot.events)
            }
            _ => {
                let remote = self.orchestrator.remote.as_ref();
                let categories = remote.list_categories(user_id).await?;
                match recover_params(categories.iter().map(|c| c.title.as_str())) {
                    Some(params) => Some(params),
                    None => {
                        let events = remote_events(remote, user_id, &categories).await?;
                        params_in(&[], &events)
                    }
                }
            }
        };
        if let Some(params) = found {
            controller.adopt_params_if_missing(params)?;
        }
        Ok(())
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    async fn encrypt_remote(&mut self, user_id: &str, unlocked: &Unlocked) -> EngineResult<()> {
        let orchestrator = self.orchestrator;
        let remote = orchestrator.remote.as_ref();
        let categories = remote.list_categories(user_id).await?;

        self.set_phase(MigrationPhase::EncryptingCategories, categories.len());
        for category in &categories {
            if !category.has_encrypted_title() {
                let title = encrypt_to_string(&unlocked.key, &unlocked.params, &category.title)?;
                let draft = CategoryDraft::from_category(category).with_title(title);
                remote.update_category(user_id, &category.id, &draft).await?;
                self.record(|r| r.categories_written += 1);
            }
            self.step();
        }

        let events = remote_events(remote, user_id, &categories).await?;
        self.set_phase(MigrationPhase::EncryptingNotes, events.len());
        for event in &events {
            if let Some(note) = event.data.plain_note().filter(|n| !n.trim().is_empty()) {
                let enc = encrypt_to_string(&unlocked.key, &unlocked.params, note.trim())?;
                let update =
                    EventUpdate::note_only(event, NoteChange::Set(EventNote::Encrypted(enc)));
                remote.update_event(user_id, &event.id, &update).await?;
                self.record(|r| r.events_written += 1);
            }
            self.step();
        }
        Ok(())
    }

    async fn decrypt_remote(&mut self, user_id: &str, key: &SymmetricKey) -> EngineResult<()> {
        let orchestrator = self.orchestrator;
        let remote = orchestrator.remote.as_ref();
        let categories = remote.list_categories(user_id).await?;

        self.set_phase(MigrationPhase::DecryptingCategories, categories.len());
        for category in &categories {
            if category.has_encrypted_title() {
                let title = decrypt_string(key, &category.title)?;
                let draft = CategoryDraft::from_category(category).with_title(title);
                remote.update_category(user_id, &category.id, &draft).await?;
                self.record(|r| r.categories_written += 1);
            }
            self.step();
        }

        let events = remote_events(remote, user_id, &categories).await?;
        self.set_phase(MigrationPhase::DecryptingNotes, events.len());
        for event in &events {
            if let Some(enc) = event.data.encrypted_note() {
                let plain = decrypt_string(key, enc)?;
                let change = match plain.trim() {
                    "" => NoteChange::Clear,
                    text => NoteChange::Set(EventNote::Plain(text.to_string())),
                };
                remote
                    .update_event(user_id, &event.id, &EventUpdate::note_only(event, change))
                    .await?;
                self.record(|r| r.events_written += 1);
            }
            self.step();
        }
        Ok(())
    }

    /// Copy everything into the local store, then empty the server.
    ///
    /// Categories already in the local store keep their local row;
    /// downloaded events replace local events with the same id. System
    /// categories can't be deleted on the server, so only their events are
    /// removed.
    async fn remote_to_local(&mut self, user_id: &str) -> EngineResult<()> {
        let orchestrator = self.orchestrator;
        let remote = orchestrator.remote.as_ref();
        let local = orchestrator.local.as_ref();
        let categories = remote.list_categories(user_id).await?;

        self.set_phase(MigrationPhase::Downloading, categories.len());
        let mut downloaded = Vec::new();
        for category in &categories {
            downloaded.extend(collect_all_events(remote, user_id, &category.id).await?);
            self.step();
        }

        let base = local.export(user_id)?;
        let fresh: Vec<Category> = {
            let known: HashSet<&str> = base.categories.iter().map(|c| c.id.as_str()).collect();
            categories
                .iter()
                .filter(|c| !known.contains(c.id.as_str()))
                .cloned()
                .collect()
        };
        if !fresh.is_empty() || !downloaded.is_empty() {
            let merged = merge_snapshot(base, &fresh, &downloaded);
            local.replace_all(user_id, &merged)?;
            self.record(|r| {
                r.categories_written += fresh.len();
                r.events_written += downloaded.len();
            });
        }

        self.set_phase(MigrationPhase::WipingServer, categories.len());
        for category in &categories {
            if category.is_system {
                let events: Vec<&Event> = downloaded
                    .iter()
                    .filter(|e| e.category_id == category.id)
                    .collect();
                for event in events {
                    remote.delete_event(user_id, &event.id).await?;
                    self.record(|r| r.events_deleted += 1);
                }
            } else {
                remote.delete_category(user_id, &category.id).await?;
                self.record(|r| r.categories_deleted += 1);
            }
            self.step();
        }
        Ok(())
    }

    /// Upload local rows. Categories whose slug already exists on the server
    /// are reused, and events already present there (same time and amount)
    /// are skipped. The local copy stays in place.
    async fn local_to_remote(
        &mut self,
        user_id: &str,
        unlocked: Option<&Unlocked>,
    ) -> EngineResult<()> {
        let orchestrator = self.orchestrator;
        let remote = orchestrator.remote.as_ref();
        let snapshot = orchestrator.local.export(user_id)?;
        let categories: Vec<&Category> =
            snapshot.categories.iter().filter(|c| !c.is_archived()).collect();

        let existing: HashMap<String, Category> = remote
            .list_categories(user_id)
            .await?
            .into_iter()
            .map(|c| (c.slug.clone(), c))
            .collect();

        self.set_phase(MigrationPhase::CreatingCategories, categories.len());
        let mut id_map: HashMap<&str, String> = HashMap::new();
        let mut seen: HashMap<String, HashSet<(DateTime<Utc>, u64)>> = HashMap::new();
        for &category in &categories {
            if let Some(found) = existing.get(&category.slug) {
                let events = collect_all_events(remote, user_id, &found.id).await?;
                seen.insert(found.id.clone(), events.iter().map(event_fingerprint).collect());
                id_map.insert(category.id.as_str(), found.id.clone());
            } else {
                let title = match unlocked {
                    Some(u) if !category.has_encrypted_title() => {
                        encrypt_to_string(&u.key, &u.params, &category.title)?
                    }
                    _ => category.title.clone(),
                };
                let draft = CategoryDraft::from_category(category).with_title(title);
                let created = remote.create_category(user_id, &draft).await?;
                self.record(|r| r.categories_written += 1);
                id_map.insert(category.id.as_str(), created.id);
            }
            self.step();
        }

        let events: Vec<&Event> = snapshot
            .events
            .iter()
            .filter(|e| id_map.contains_key(e.category_id.as_str()))
            .collect();
        self.set_phase(MigrationPhase::CreatingEntries, events.len());
        for event in events {
            let Some(target_id) = id_map.get(event.category_id.as_str()) else {
                continue;
            };
            let duplicate = seen
                .get(target_id)
                .is_some_and(|s| s.contains(&event_fingerprint(event)));
            if !duplicate {
                let input = upload_event(event, target_id, unlocked)?;
                remote.create_event(user_id, &input).await?;
                self.record(|r| r.events_written += 1);
            }
            self.step();
        }
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Key for the transition: derived from `passphrase` when given, otherwise
/// the controller's session key.
fn unlock(controller: &mut PrivacyController, passphrase: Option<&str>) -> EngineResult<Unlocked> {
    match passphrase.map(str::trim) {
        Some("") => Err(EngineError::invalid("Enter your passphrase.")),
        Some(passphrase) => {
            let (key, params) = controller.prepare_key(passphrase)?;
            Ok(Unlocked { key, params })
        }
        None => {
            let key = controller.require_key()?.clone();
            let params = controller.crypto_params().cloned().ok_or(EngineError::Locked)?;
            Ok(Unlocked { key, params })
        }
    }
}

async fn remote_events<R: RemoteStore + ?Sized>(
    remote: &R,
    user_id: &str,
    categories: &[Category],
) -> EngineResult<Vec<Event>> {
    let mut events = Vec::new();
    for category in categories {
        events.extend(collect_all_events(remote, user_id, &category.id).await?);
    }
    Ok(events)
}

fn params_in(categories: &[Category], events: &[Event]) -> Option<CryptoParams> {
    let titles = categories.iter().map(|c| c.title.as_str());
    let notes = events.iter().filter_map(|e| e.data.encrypted_note());
    recover_params(titles.chain(notes))
}

fn merge_snapshot(
    mut base: LocalSnapshot,
    categories: &[Category],
    events: &[Event],
) -> LocalSnapshot {
    let incoming: HashSet<&str> = categories.iter().map(|c| c.id.as_str()).collect();
    base.categories.retain(|c| !incoming.contains(c.id.as_str()));
    base.categories.extend(categories.iter().cloned());

    let incoming: HashSet<&str> = events.iter().map(|e| e.id.as_str()).collect();
    base.events.retain(|e| !incoming.contains(e.id.as_str()));
    base.events.extend(events.iter().cloned());
    base
}

fn event_fingerprint(event: &Event) -> (DateTime<Utc>, u64) {
    (event.occurred_at, event.amount.unwrap_or(0.0).to_bits())
}

/// Server-side copy of a local event, with its note encrypted when a key
/// is given.
fn upload_event(
    event: &Event,
    category_id: &str,
    unlocked: Option<&Unlocked>,
) -> EngineResult<NewEvent> {
    let note = match (&event.data.note, unlocked) {
        (Some(EventNote::Plain(text)), Some(u)) => Some(EventNote::Encrypted(encrypt_to_string(
            &u.key, &u.params, text,
        )?)),
        (note, _) => note.clone(),
    };
    Ok(NewEvent {
        category_id: category_id.to_string(),
        amount: event.amount.unwrap_or(0.0),
        when: EventTime::At(event.occurred_at),
        note,
        fields: event.data.fields.clone(),
        duration: event.data.duration.map(f64::from),
        raw_text: event.raw_text.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{TimeDelta, TimeZone};
    use tokio::sync::Notify;

    use crate::aggregation::Bucket;
    use crate::models::{CategoryType, EventPage, Period, SeriesQuery, MAX_EVENT_PAGE};
    use crate::privacy::{decrypt_category_title, decrypt_event_note, derive_key};
    use crate::remote::InMemoryRemote;
    use crate::storage::{PreferenceStore, SessionKeyCache, StoragePaths};

    const PASSPHRASE: &str = "correct horse";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 18, 12, 0, 0).unwrap()
    }

    /// Delegates to an [`InMemoryRemote`] but fails writes once its budget
    /// is used up.
    struct FlakyRemote {
        inner: InMemoryRemote,
        writes_left: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl FlakyRemote {
        fn new(inner: InMemoryRemote) -> Self {
            Self {
                inner,
                writes_left: AtomicUsize::new(usize::MAX),
                gate: None,
            }
        }

        fn allow_writes(&self, n: usize) {
            self.writes_left.store(n, Ordering::SeqCst);
        }

        async fn spend(&self) -> EngineResult<()> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let left = self.writes_left.load(Ordering::SeqCst);
            if left == 0 {
                return Err(EngineError::Remote("connection reset".into()));
            }
            if left != usize::MAX {
                self.writes_left.store(left - 1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    impl RemoteStore for FlakyRemote {
        async fn list_categories(&self, user_id: &str) -> EngineResult<Vec<Category>> {
            self.inner.list_categories(user_id).await
        }

        async fn get_category(&self, user_id: &str, category_id: &str) -> EngineResult<Category> {
            self.inner.get_category(user_id, category_id).await
        }

        async fn create_category(
            &self,
            user_id: &str,
            draft: &CategoryDraft,
        ) -> EngineResult<Category> {
            self.spend().await?;
            self.inner.create_category(user_id, draft).await
        }

        async fn update_category(
            &self,
            user_id: &str,
            category_id: &str,
            draft: &CategoryDraft,
        ) -> EngineResult<Category> {
            self.spend().await?;
            self.inner.update_category(user_id, category_id, draft).await
        }

        async fn delete_category(&self, user_id: &str, category_id: &str) -> EngineResult<()> {
            self.spend().await?;
            self.inner.delete_category(user_id, category_id).await
        }

        async fn list_events(
            &self,
            user_id: &str,
            category_id: &str,
            page: EventPage,
        ) -> EngineResult<Vec<Event>> {
            self.inner.list_events(user_id, category_id, page).await
        }

        async fn create_event(&self, user_id: &str, input: &NewEvent) -> EngineResult<Event> {
            self.spend().await?;
            self.inner.create_event(user_id, input).await
        }

        async fn update_event(
            &self,
            user_id: &str,
            event_id: &str,
            update: &EventUpdate,
        ) -> EngineResult<Event> {
            self.spend().await?;
            self.inner.update_event(user_id, event_id, update).await
        }

        async fn delete_event(&self, user_id: &str, event_id: &str) -> EngineResult<()> {
            self.spend().await?;
            self.inner.delete_event(user_id, event_id).await
        }

        async fn bar_series(
            &self,
            user_id: &str,
            category_id: &str,
            query: SeriesQuery,
        ) -> EngineResult<Vec<Bucket>> {
            self.inner.bar_series(user_id, category_id, query).await
        }

        async fn line_series(
            &self,
            user_id: &str,
            category_id: &str,
            query: SeriesQuery,
        ) -> EngineResult<Vec<Bucket>> {
            self.inner.line_series(user_id, category_id, query).await
        }
    }

    struct Harness {
        remote: Arc<FlakyRemote>,
        local: Arc<LocalStore>,
        orchestrator: MigrationOrchestrator<FlakyRemote>,
        prefs: PreferenceStore,
        keys: Arc<SessionKeyCache>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_remote(FlakyRemote::new(InMemoryRemote::with_now(now())))
        }

        fn with_remote(remote: FlakyRemote) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let paths = StoragePaths::new(dir.path());
            let local = Arc::new(LocalStore::open(&paths.local_db()).unwrap());
            let remote = Arc::new(remote);
            Self {
                orchestrator: MigrationOrchestrator::new(remote.clone(), local.clone()),
                remote,
                local,
                prefs: PreferenceStore::new(paths),
                keys: Arc::new(SessionKeyCache::new(8)),
                _dir: dir,
            }
        }

        fn controller(&self) -> PrivacyController {
            PrivacyController::open("u1", self.prefs.clone(), self.keys.clone())
                .unwrap()
                .with_iterations(1_000)
        }

        /// Weight (line) with two noted events, Water (bar) with three.
        async fn seed_remote(&self) -> (Category, Category) {
            let remote = &self.remote.inner;
            let weight = CategoryDraft::new("Weight", CategoryType::Goal, "#0EA5E9");
            let weight = remote.create_category("u1", &weight).await.unwrap();
            let water = CategoryDraft::new("Water", CategoryType::Number, "#22C55E");
            let water = remote.create_category("u1", &water).await.unwrap();
            for (days, kg, note) in [(2, 82.0, "felt good"), (1, 81.2, "")] {
                let input = NewEvent::new(&weight.id, kg)
                    .at(now() - TimeDelta::days(days))
                    .with_note(EventNote::Plain(note.into()));
                remote.create_event("u1", &input).await.unwrap();
            }
            for hours in 1..=3 {
                let input = NewEvent::new(&water.id, 0.5).at(now() - TimeDelta::hours(hours));
                remote.create_event("u1", &input).await.unwrap();
            }
            (weight, water)
        }

        async fn remote_events(&self, category_id: &str) -> Vec<Event> {
            collect_all_events(self.remote.as_ref(), "u1", category_id)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn cloud_to_encrypted_with_correct_horse() {
        let h = Harness::new();
        let (weight, _) = h.seed_remote().await;
        let mut ctl = h.controller();

        let report = h
            .orchestrator
            .migrate(&mut ctl, PrivacyMode::Encrypted, Some(PASSPHRASE))
            .await
            .unwrap();
        assert_eq!(report.categories_written, 2);
        // The empty note stays empty.
        assert_eq!(report.events_written, 1);
        assert_eq!(ctl.mode(), PrivacyMode::Encrypted);
        assert!(ctl.is_unlocked());

        let stored = h.remote.get_category("u1", &weight.id).await.unwrap();
        assert!(stored.title.starts_with("enc:v1:"));

        let params = ctl.crypto_params().cloned().unwrap();
        let right = derive_key(PASSPHRASE, &params).unwrap();
        assert_eq!(decrypt_category_title(&right, &stored.title).as_deref(), Some("Weight"));

        let wrong = derive_key("battery staple", &params).unwrap();
        assert!(matches!(
            decrypt_string(&wrong, &stored.title),
            Err(EngineError::DecryptionFailed)
        ));

        let notes: Vec<Option<String>> = h
            .remote_events(&weight.id)
            .await
            .iter()
            .map(|e| decrypt_event_note(&right, &e.data))
            .collect();
        assert!(notes.contains(&Some("felt good".to_string())));
        assert!(h
            .remote_events(&weight.id)
            .await
            .iter()
            .all(|e| e.data.plain_note().is_none()));
    }

    #[tokio::test]
    async fn prefixed_plain_titles_are_still_encrypted() {
        let h = Harness::new();
        let draft = CategoryDraft::new("enc:v1:draft ideas", CategoryType::Do, "#A855F7");
        let odd = h.remote.inner.create_category("u1", &draft).await.unwrap();
        let mut ctl = h.controller();

        let report = h
            .orchestrator
            .migrate(&mut ctl, PrivacyMode::Encrypted, Some(PASSPHRASE))
            .await
            .unwrap();
        assert_eq!(report.categories_written, 1);

        let stored = h.remote.get_category("u1", &odd.id).await.unwrap();
        assert!(stored.has_encrypted_title());
        let key = ctl.require_key().unwrap();
        assert_eq!(
            decrypt_category_title(key, &stored.title).as_deref(),
            Some("enc:v1:draft ideas")
        );
    }

    #[tokio::test]
    async fn rerunning_a_finished_transition_writes_nothing() {
        let h = Harness::new();
        h.seed_remote().await;
        let mut ctl = h.controller();
        h.orchestrator
            .migrate(&mut ctl, PrivacyMode::Encrypted, Some(PASSPHRASE))
            .await
            .unwrap();

        let again = h
            .orchestrator
            .begin("u1")
            .unwrap()
            .run_transition(&mut ctl, PrivacyMode::Cloud, PrivacyMode::Encrypted, None)
            .await
            .unwrap();
        assert_eq!(again.writes(), 0);

        let same_mode = h
            .orchestrator
            .migrate(&mut ctl, PrivacyMode::Encrypted, None)
            .await
            .unwrap();
        assert_eq!(same_mode.writes(), 0);
    }

    #[tokio::test]
    async fn failure_mid_run_reports_progress_and_resumes() {
        let h = Harness::new();
        h.seed_remote().await;
        let mut ctl = h.controller();

        h.remote.allow_writes(1);
        let err = h
            .orchestrator
            .migrate(&mut ctl, PrivacyMode::Encrypted, Some(PASSPHRASE))
            .await
            .unwrap_err();
        match err {
            EngineError::MigrationPartialFailure { completed, source } => {
                assert_eq!(completed, 1);
                assert!(matches!(*source, EngineError::Remote(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(ctl.mode(), PrivacyMode::Cloud);
        assert!(!h.orchestrator.guard().is_running("u1"));

        h.remote.allow_writes(usize::MAX);
        let report = h
            .orchestrator
            .begin("u1")
            .unwrap()
            .run_transition(&mut ctl, PrivacyMode::Cloud, PrivacyMode::Encrypted, Some(PASSPHRASE))
            .await
            .unwrap();
        // One title was already done.
        assert_eq!(report.categories_written, 1);
        assert_eq!(report.events_written, 1);
        assert_eq!(ctl.mode(), PrivacyMode::Encrypted);

        let titles: Vec<String> = h
            .remote
            .list_categories("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.title)
            .collect();
        assert!(titles.iter().all(|t| t.starts_with("enc:v1:")));
    }

    #[tokio::test]
    async fn progress_is_observable() {
        let h = Harness::new();
        h.seed_remote().await;
        let mut ctl = h.controller();

        let migration = h.orchestrator.begin("u1").unwrap();
        let progress = migration.progress();
        assert_eq!(progress.borrow().phase, MigrationPhase::Idle);
        migration
            .run(&mut ctl, PrivacyMode::Encrypted, Some(PASSPHRASE))
            .await
            .unwrap();
        assert_eq!(progress.borrow().phase, MigrationPhase::Finished);
    }

    #[tokio::test]
    async fn second_migration_for_same_user_is_rejected() {
        let h = Harness::new();
        let first = h.orchestrator.begin("u1").unwrap();
        assert!(matches!(
            h.orchestrator.begin("u1"),
            Err(EngineError::MigrationInProgress(_))
        ));
        // Other users are unaffected.
        assert!(h.orchestrator.begin("u2").is_ok());
        drop(first);
        assert!(h.orchestrator.begin("u1").is_ok());
    }

    #[tokio::test]
    async fn concurrent_migration_waits_on_guard() {
        let gate = Arc::new(Notify::new());
        let mut remote = FlakyRemote::new(InMemoryRemote::with_now(now()));
        remote.gate = Some(gate.clone());
        let h = Harness::with_remote(remote);
        let weight = CategoryDraft::new("Weight", CategoryType::Goal, "#0EA5E9");
        h.remote.inner.create_category("u1", &weight).await.unwrap();

        let mut ctl = h.controller();
        let mut other = h.controller();
        let running = h
            .orchestrator
            .migrate(&mut ctl, PrivacyMode::Encrypted, Some(PASSPHRASE));
        let rejected = async {
            tokio::task::yield_now().await;
            let result = h
                .orchestrator
                .migrate(&mut other, PrivacyMode::Encrypted, Some(PASSPHRASE))
                .await;
            gate.notify_one();
            result
        };
        let (first, second) = tokio::join!(running, rejected);
        assert!(first.is_ok());
        assert!(matches!(second, Err(EngineError::MigrationInProgress(_))));
    }

    #[tokio::test]
    async fn encrypted_to_cloud_restores_plaintext() {
        let h = Harness::new();
        let (weight, _) = h.seed_remote().await;
        let mut ctl = h.controller();
        h.orchestrator
            .migrate(&mut ctl, PrivacyMode::Encrypted, Some(PASSPHRASE))
            .await
            .unwrap();

        let report = h
            .orchestrator
            .migrate(&mut ctl, PrivacyMode::Cloud, None)
            .await
            .unwrap();
        assert_eq!(report.categories_written, 2);
        assert_eq!(ctl.mode(), PrivacyMode::Cloud);
        assert!(!ctl.is_unlocked());

        let stored = h.remote.get_category("u1", &weight.id).await.unwrap();
        assert_eq!(stored.title, "Weight");
        let events = h.remote_events(&weight.id).await;
        let plain: Vec<&str> = events.iter().filter_map(|e| e.data.plain_note()).collect();
        assert_eq!(plain, vec!["felt good"]);
        assert!(events.iter().all(|e| e.data.encrypted_note().is_none()));
    }

    #[tokio::test]
    async fn wrong_passphrase_fails_lazily_and_keeps_mode() {
        let h = Harness::new();
        h.seed_remote().await;
        let mut ctl = h.controller();
        h.orchestrator
            .migrate(&mut ctl, PrivacyMode::Encrypted, Some(PASSPHRASE))
            .await
            .unwrap();
        ctl.lock();

        assert!(matches!(
            h.orchestrator.migrate(&mut ctl, PrivacyMode::Cloud, None).await,
            Err(EngineError::Locked)
        ));

        let err = h
            .orchestrator
            .migrate(&mut ctl, PrivacyMode::Cloud, Some("wrong horse"))
            .await
            .unwrap_err();
        match err {
            EngineError::MigrationPartialFailure { completed, source } => {
                assert_eq!(completed, 0);
                assert!(matches!(*source, EngineError::DecryptionFailed));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(ctl.mode(), PrivacyMode::Encrypted);
    }

    #[tokio::test]
    async fn lost_params_are_recovered_from_ciphertext() {
        let h = Harness::new();
        let (weight, _) = h.seed_remote().await;
        let mut ctl = h.controller();
        h.orchestrator
            .migrate(&mut ctl, PrivacyMode::Encrypted, Some(PASSPHRASE))
            .await
            .unwrap();
        ctl.set_crypto_params(None).unwrap();

        h.orchestrator
            .migrate(&mut ctl, PrivacyMode::Cloud, Some(PASSPHRASE))
            .await
            .unwrap();
        let stored = h.remote.get_category("u1", &weight.id).await.unwrap();
        assert_eq!(stored.title, "Weight");
    }

    #[tokio::test]
    async fn moving_to_local_copies_then_wipes_server() {
        let h = Harness::new();
        let (weight, water) = h.seed_remote().await;
        let before = h
            .remote
            .bar_series("u1", &water.id, SeriesQuery::new(Period::Day))
            .await
            .unwrap();
        let mut ctl = h.controller();

        let report = h
            .orchestrator
            .migrate(&mut ctl, PrivacyMode::Local, None)
            .await
            .unwrap();
        assert_eq!(report.categories_written, 2);
        assert_eq!(report.events_written, 5);
        assert_eq!(report.categories_deleted, 2);
        assert_eq!(ctl.mode(), PrivacyMode::Local);

        assert!(h.remote.list_categories("u1").await.unwrap().is_empty());
        assert_eq!(h.remote.inner.event_count("u1").await, 0);

        let local = h.local.list_categories("u1").unwrap();
        assert_eq!(local.len(), 2);
        assert_eq!(h.local.get_category("u1", &weight.id).unwrap().title, "Weight");
        let after = h
            .local
            .bar_series("u1", &water.id, SeriesQuery::new(Period::Day), &now())
            .unwrap();
        assert_eq!(before, after);

        // Nothing left on the server, nothing to do.
        let again = h
            .orchestrator
            .begin("u1")
            .unwrap()
            .run_transition(&mut ctl, PrivacyMode::Cloud, PrivacyMode::Local, None)
            .await
            .unwrap();
        assert_eq!(again.writes(), 0);
        assert_eq!(h.local.export("u1").unwrap().events.len(), 5);
    }

    #[tokio::test]
    async fn rerun_to_local_keeps_system_category_edits() {
        let h = Harness::new();
        h.seed_remote().await;
        let mut draft = CategoryDraft::new("Notes", CategoryType::Do, "#A855F7");
        draft.is_system = true;
        let notes = h.remote.inner.create_category("u1", &draft).await.unwrap();
        let input = NewEvent::new(&notes.id, 1.0).at(now() - TimeDelta::hours(2));
        h.remote.inner.create_event("u1", &input).await.unwrap();
        let mut ctl = h.controller();

        let report = h
            .orchestrator
            .migrate(&mut ctl, PrivacyMode::Local, None)
            .await
            .unwrap();
        assert_eq!(report.categories_written, 3);
        assert_eq!(report.events_written, 6);
        assert_eq!(report.categories_deleted, 2);
        assert_eq!(report.events_deleted, 1);

        // The system category survives on the server without events.
        let server = h.remote.list_categories("u1").await.unwrap();
        assert_eq!(server.len(), 1);
        assert!(h.remote_events(&notes.id).await.is_empty());

        let local = h.local.get_category("u1", &notes.id).unwrap();
        let edit = CategoryDraft::from_category(&local).with_title("Renamed");
        h.local.update_category("u1", &notes.id, &edit).unwrap();

        let again = h
            .orchestrator
            .begin("u1")
            .unwrap()
            .run_transition(&mut ctl, PrivacyMode::Cloud, PrivacyMode::Local, None)
            .await
            .unwrap();
        assert_eq!(again.writes(), 0);
        assert_eq!(h.local.get_category("u1", &notes.id).unwrap().title, "Renamed");
        assert_eq!(h.local.export("u1").unwrap().events.len(), 6);
    }

    #[tokio::test]
    async fn incomplete_download_leaves_the_server_untouched() {
        let h = Harness::new();
        let (_, water) = h.seed_remote().await;
        let at = now() - TimeDelta::days(3);
        for _ in 0..(MAX_EVENT_PAGE + 50) {
            let input = NewEvent::new(&water.id, 0.25).at(at);
            h.remote.inner.create_event("u1", &input).await.unwrap();
        }
        let stored = h.remote.inner.event_count("u1").await;
        let mut ctl = h.controller();

        let err = h
            .orchestrator
            .migrate(&mut ctl, PrivacyMode::Local, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::MigrationPartialFailure { ref source, .. }
                if matches!(**source, EngineError::Remote(_))
        ));
        assert_eq!(ctl.mode(), PrivacyMode::Cloud);
        assert_eq!(h.remote.inner.event_count("u1").await, stored);
        assert_eq!(h.remote.list_categories("u1").await.unwrap().len(), 2);
        assert!(h.local.export("u1").unwrap().events.is_empty());
    }

    #[tokio::test]
    async fn encrypted_data_moves_to_local_as_is() {
        let h = Harness::new();
        let (weight, _) = h.seed_remote().await;
        let mut ctl = h.controller();
        h.orchestrator
            .migrate(&mut ctl, PrivacyMode::Encrypted, Some(PASSPHRASE))
            .await
            .unwrap();

        h.orchestrator
            .migrate(&mut ctl, PrivacyMode::Local, None)
            .await
            .unwrap();
        assert!(!ctl.is_unlocked());
        let local = h.local.get_category("u1", &weight.id).unwrap();
        assert!(local.has_encrypted_title());
    }

    #[tokio::test]
    async fn local_to_encrypted_uploads_and_resumes_without_duplicates() {
        let h = Harness::new();
        let mut ctl = h.controller();
        ctl.set_mode(PrivacyMode::Local).unwrap();

        let diary = CategoryDraft::new("Diary", CategoryType::Do, "#A855F7");
        let diary = h.local.create_category("u1", &diary).unwrap();
        for days in 1..=3 {
            let input = NewEvent::new(&diary.id, 1.0)
                .at(now() - TimeDelta::days(days))
                .with_note(EventNote::Plain(format!("day {days}")));
            h.local.create_event("u1", &input, &now()).unwrap();
        }

        h.remote.allow_writes(2);
        let err = h
            .orchestrator
            .migrate(&mut ctl, PrivacyMode::Encrypted, Some(PASSPHRASE))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MigrationPartialFailure { completed: 2, .. }));
        assert_eq!(ctl.mode(), PrivacyMode::Local);

        h.remote.allow_writes(usize::MAX);
        let report = h
            .orchestrator
            .begin("u1")
            .unwrap()
            .run_transition(&mut ctl, PrivacyMode::Local, PrivacyMode::Encrypted, Some(PASSPHRASE))
            .await
            .unwrap();
        assert_eq!(report.categories_written, 0);
        assert_eq!(report.events_written, 2);
        assert_eq!(ctl.mode(), PrivacyMode::Encrypted);

        let uploaded = h.remote.list_categories("u1").await.unwrap();
        assert_eq!(uploaded.len(), 1);
        assert!(uploaded[0].has_encrypted_title());
        let key = ctl.require_key().unwrap();
        assert_eq!(decrypt_category_title(key, &uploaded[0].title).as_deref(), Some("Diary"));

        let events = h.remote_events(&uploaded[0].id).await;
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.data.encrypted_note().is_some()));

        // The local copy is left alone.
        assert_eq!(h.local.export("u1").unwrap().events.len(), 3);
    }

    #[tokio::test]
    async fn local_to_cloud_preserves_time_and_fields() {
        let h = Harness::new();
        let mut ctl = h.controller();
        ctl.set_mode(PrivacyMode::Local).unwrap();

        let run = CategoryDraft::new("Running", CategoryType::Number, "#F97316");
        let run = h.local.create_category("u1", &run).unwrap();
        let at = now() - TimeDelta::days(4);
        let mut input = NewEvent::new(&run.id, 5.2).at(at);
        input.duration = Some(31.0);
        h.local.create_event("u1", &input, &now()).unwrap();

        h.orchestrator
            .migrate(&mut ctl, PrivacyMode::Cloud, None)
            .await
            .unwrap();
        assert_eq!(ctl.mode(), PrivacyMode::Cloud);

        let uploaded = h.remote.list_categories("u1").await.unwrap();
        assert_eq!(uploaded[0].title, "Running");
        assert_eq!(uploaded[0].slug, "running");
        let events = h.remote_events(&uploaded[0].id).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].occurred_at, at);
        assert_eq!(events[0].data.duration, Some(31));
    }

    #[tokio::test]
    async fn same_mode_transition_is_unsupported() {
        let h = Harness::new();
        let mut ctl = h.controller();
        let err = h
            .orchestrator
            .begin("u1")
            .unwrap()
            .run_transition(&mut ctl, PrivacyMode::Local, PrivacyMode::Local, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedMigration { .. }));
    }
}
