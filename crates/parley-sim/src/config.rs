//! Simulator configuration loaded from environment variables.
//!
//! All settings have sensible defaults so a session can be replayed with
//! zero configuration.

use std::path::PathBuf;

/// Simulator configuration.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// SQLite file used as the local store. `:memory:` keeps everything in RAM.
    /// Env: `PARLEY_DB_PATH`
    /// Default: the platform data directory.
    pub db_path: Option<PathBuf>,

    /// The user driving the session.
    /// Env: `PARLEY_SIM_USER`
    /// Default: `"alice"`
    pub user: String,

    /// Messages already in the conversation when the session starts.
    /// Env: `PARLEY_SIM_HISTORY`
    /// Default: `120`
    pub history: usize,

    /// How many of the newest history messages the user has not seen.
    /// Env: `PARLEY_SIM_UNSEEN`
    /// Default: `30`
    pub unseen: usize,

    /// Simulate a group conversation instead of a private chat.
    /// Env: `PARLEY_SIM_GROUP` (true/false)
    /// Default: `false`
    pub group: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            user: "alice".to_string(),
            history: 120,
            unseen: 30,
            group: false,
        }
    }
}

impl SimConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup("PARLEY_DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        if let Some(user) = lookup("PARLEY_SIM_USER") {
            if !user.is_empty() {
                config.user = user;
            }
        }

        if let Some(val) = lookup("PARLEY_SIM_HISTORY") {
            match val.parse::<usize>() {
                Ok(n) => config.history = n,
                Err(_) => tracing::warn!(value = %val, "Invalid PARLEY_SIM_HISTORY, using default"),
            }
        }

        if let Some(val) = lookup("PARLEY_SIM_UNSEEN") {
            match val.parse::<usize>() {
                Ok(n) => config.unseen = n,
                Err(_) => tracing::warn!(value = %val, "Invalid PARLEY_SIM_UNSEEN, using default"),
            }
        }

        if let Some(val) = lookup("PARLEY_SIM_GROUP") {
            config.group = val == "true" || val == "1";
        }

        config.unseen = config.unseen.min(config.history);
        config
    }

    pub fn in_memory(&self) -> bool {
        self.db_path
            .as_deref()
            .is_some_and(|p| p.as_os_str() == ":memory:")
    }
}
