// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Environment variable names, defaults and the [`EngineConfig`] loaded
//! from them at startup.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Root directory for the local store and preferences | `./data` |
//! | `PBKDF2_ITERATIONS` | Iterations for newly generated crypto params | `310000` |
//! | `SESSION_CACHE_CAPACITY` | Users whose session key is kept in memory | `64` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info` |

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{EngineError, EngineResult};
use crate::privacy::crypto::DEFAULT_ITERATIONS;
use crate::storage::paths::DATA_ROOT;
use crate::storage::session::DEFAULT_SESSION_CAPACITY;
use crate::storage::StoragePaths;

/// Environment variable name for the data directory.
///
/// Holds `local.redb` and the per-user preference files. Derived keys are
/// never written here.
pub const DATA_DIR_ENV: &str = "DATA_DIR";

/// Environment variable name for the PBKDF2 iteration count.
///
/// Only affects params generated from now on; existing params carry their
/// own count.
pub const PBKDF2_ITERATIONS_ENV: &str = "PBKDF2_ITERATIONS";

/// Environment variable name for the session key cache size.
pub const SESSION_CACHE_CAPACITY_ENV: &str = "SESSION_CACHE_CAPACITY";

/// Environment variable name for the log output format.
///
/// # Values
/// - `json`: one JSON object per line
/// - `pretty` (default): human-readable
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Lowest accepted PBKDF2 iteration count.
pub const MIN_PBKDF2_ITERATIONS: u32 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "" => Ok(LogFormat::Pretty),
            other => Err(EngineError::invalid(format!("unknown log format '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub pbkdf2_iterations: u32,
    pub session_cache_capacity: usize,
    pub log_format: LogFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DATA_ROOT),
            pbkdf2_iterations: DEFAULT_ITERATIONS,
            session_cache_capacity: DEFAULT_SESSION_CAPACITY,
            log_format: LogFormat::default(),
        }
    }
}

impl EngineConfig {
    /// Load from the process environment.
    pub fn from_env() -> EngineResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from any name → value lookup. Unset or empty values use the
    /// defaults; values that don't parse are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EngineResult<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(dir) = get(DATA_DIR_ENV) {
            config.data_dir = PathBuf::from(dir.trim());
        }
        if let Some(raw) = get(PBKDF2_ITERATIONS_ENV) {
            config.pbkdf2_iterations = parse_number(PBKDF2_ITERATIONS_ENV, &raw)?;
            if config.pbkdf2_iterations < MIN_PBKDF2_ITERATIONS {
                return Err(EngineError::invalid(format!(
                    "{PBKDF2_ITERATIONS_ENV} must be at least {MIN_PBKDF2_ITERATIONS}"
                )));
            }
        }
        if let Some(raw) = get(SESSION_CACHE_CAPACITY_ENV) {
            config.session_cache_capacity = parse_number(SESSION_CACHE_CAPACITY_ENV, &raw)?;
        }
        if let Some(raw) = get(LOG_FORMAT_ENV) {
            config.log_format = raw.parse()?;
        }
        Ok(config)
    }

    pub fn storage_paths(&self) -> StoragePaths {
        StoragePaths::new(&self.data_dir)
    }
}

fn parse_number<T: FromStr>(name: &str, raw: &str) -> EngineResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| EngineError::invalid(format!("{name} must be a number, got '{raw}'")))
}
