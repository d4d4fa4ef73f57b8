// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Memoato Vault - Privacy-Mode Data Engine
//!
//! Per-user categories and events in one of three privacy modes: stored on
//! the server in the clear, stored on the server with client-side encrypted
//! text fields, or kept on the device only.
//!
//! ## Modules
//!
//! - `aggregation` - Time-bucket engine shared by every chart source
//! - `config` - Environment configuration
//! - `migration` - Resumable data moves between privacy modes
//! - `privacy` - Key derivation, field envelopes, per-user unlock state
//! - `remote` - Server-side store seam, in-memory backend, public dashboards
//! - `storage` - Device-local store (redb), preferences, session key cache
//! - `telemetry` - Tracing subscriber setup

pub mod aggregation;
pub mod config;
pub mod error;
pub mod migration;
pub mod models;
pub mod privacy;
pub mod remote;
pub mod state;
pub mod storage;
pub mod telemetry;
