//! Engine configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the engine can run with zero
//! configuration.

use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};

use parley_shared::constants::{
    DELETION_CHECK_DEBOUNCE_MS, MESSAGE_PAGE_SIZE, REMOTE_IN_QUERY_LIMIT, SEEN_BATCH_LIMIT,
    UNSEEN_COUNTER_DEBOUNCE_MS,
};

/// Sync engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Messages requested per local or remote page.
    /// Env: `PARLEY_PAGE_SIZE`
    /// Default: `50`
    pub page_size: usize,

    /// Writes per remote seen-status batch commit (capped at 500).
    /// Env: `PARLEY_SEEN_BATCH_SIZE`
    /// Default: `500`
    pub seen_batch_size: usize,

    /// Ids per remote existence query (capped at 10).
    /// Env: `PARLEY_ID_QUERY_CHUNK`
    /// Default: `10`
    pub id_query_chunk: usize,

    /// Quiet window before pending deletion checks run.
    /// Env: `PARLEY_DELETION_DEBOUNCE_MS`
    /// Default: `2000`
    pub deletion_debounce: Duration,

    /// Quiet window before coalesced unseen-counter deltas are pushed.
    /// Env: `PARLEY_UNSEEN_DEBOUNCE_MS`
    /// Default: `750`
    pub unseen_debounce: Duration,

    /// Offset used to compute the calendar day of a message.
    /// Env: `PARLEY_UTC_OFFSET_MINUTES`
    /// Default: `0`
    pub utc_offset: FixedOffset,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: MESSAGE_PAGE_SIZE,
            seen_batch_size: SEEN_BATCH_LIMIT,
            id_query_chunk: REMOTE_IN_QUERY_LIMIT,
            deletion_debounce: Duration::from_millis(DELETION_CHECK_DEBOUNCE_MS),
            unseen_debounce: Duration::from_millis(UNSEEN_COUNTER_DEBOUNCE_MS),
            utc_offset: utc(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(n) = parse_var::<usize>(&lookup, "PARLEY_PAGE_SIZE") {
            if n > 0 {
                config.page_size = n;
            }
        }

        if let Some(n) = parse_var::<usize>(&lookup, "PARLEY_SEEN_BATCH_SIZE") {
            config.seen_batch_size = n.clamp(1, SEEN_BATCH_LIMIT);
        }

        if let Some(n) = parse_var::<usize>(&lookup, "PARLEY_ID_QUERY_CHUNK") {
            config.id_query_chunk = n.clamp(1, REMOTE_IN_QUERY_LIMIT);
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "PARLEY_DELETION_DEBOUNCE_MS") {
            config.deletion_debounce = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "PARLEY_UNSEEN_DEBOUNCE_MS") {
            config.unseen_debounce = Duration::from_millis(ms);
        }

        if let Some(minutes) = parse_var::<i32>(&lookup, "PARLEY_UTC_OFFSET_MINUTES") {
            match minutes.checked_mul(60).and_then(FixedOffset::east_opt) {
                Some(offset) => config.utc_offset = offset,
                None => tracing::warn!(minutes, "UTC offset out of range, using UTC"),
            }
        }

        config
    }
}

fn utc() -> FixedOffset {
    Utc.fix()
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}
