//! Tracker configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};

/// Environment variable overriding [`TrackerConfig::db_path`].
pub const DB_PATH_ENV: &str = "TIME_ATTACK_DB";

/// Environment variable overriding [`TrackerConfig::alignment`] (`truncate` or `strict`).
pub const ALIGNMENT_ENV: &str = "TIME_ATTACK_ALIGNMENT";

/// How ghost comparison treats checkpoint sequences of different lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignmentPolicy {
    /// Pair up to the shorter sequence and flag the result as truncated
    #[default]
    Truncate,
    /// Reject sequences of different lengths
    Strict,
}

impl AlignmentPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlignmentPolicy::Truncate => "truncate",
            AlignmentPolicy::Strict => "strict",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "truncate" => Some(AlignmentPolicy::Truncate),
            "strict" => Some(AlignmentPolicy::Strict),
            _ => None,
        }
    }
}

/// Configuration for the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// SQLite database file.
    /// Default: "time_attack.db"
    pub db_path: PathBuf,

    /// Length-mismatch handling for ghost comparison.
    /// Default: Truncate
    pub alignment: AlignmentPolicy,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("time_attack.db"),
            alignment: AlignmentPolicy::Truncate,
        }
    }
}

impl TrackerConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| TrackerError::validation(format!("Invalid tracker config: {}", e)))
    }

    /// Defaults overridden by `TIME_ATTACK_DB` and `TIME_ATTACK_ALIGNMENT`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(
            std::env::var(DB_PATH_ENV).ok(),
            std::env::var(ALIGNMENT_ENV).ok(),
        )?;
        Ok(config)
    }

    fn apply_overrides(&mut self, db_path: Option<String>, alignment: Option<String>) -> Result<()> {
        if let Some(path) = db_path.filter(|p| !p.trim().is_empty()) {
            self.db_path = PathBuf::from(path);
        }
        if let Some(raw) = alignment {
            self.alignment = AlignmentPolicy::parse(&raw).ok_or_else(|| {
                TrackerError::validation(format!(
                    "{} must be 'truncate' or 'strict', got '{}'",
                    ALIGNMENT_ENV, raw
                ))
            })?;
        }
        Ok(())
    }
}
