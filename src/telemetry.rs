// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Tracing subscriber setup.
//!
//! Filter comes from `RUST_LOG` (default [`DEFAULT_LOG_FILTER`]); output
//! format from [`EngineConfig::log_format`]. Nothing logged by this crate
//! carries passphrases, keys or decrypted text.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{EngineConfig, LogFormat, DEFAULT_LOG_FILTER};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Install the global subscriber.
///
/// Returns `false` if one was already installed (tests, embedding apps).
pub fn init_tracing(config: &EngineConfig) -> bool {
    let registry = tracing_subscriber::registry().with(env_filter());
    let result = match config.log_format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
    };
    result.is_ok()
}
