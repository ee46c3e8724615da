//! # Time Attack
//!
//! Commute timing as a racing-game time attack: define a route as an ordered
//! list of checkpoints, start a timed run, mark each checkpoint as you pass it,
//! and compare every run against your personal best ("ghost").
//!
//! This library provides:
//! - A storage interface ([`RunStore`]) with in-memory and SQLite backends
//! - The run lifecycle controller ([`RunController`]) with crash-safe reattach
//! - Personal-best resolution and live ghost data
//! - Checkpoint-by-checkpoint ghost comparison with summary insights
//! - Per-checkpoint and run-history analytics
//!
//! ## Features
//!
//! - **`persistence`** (default) - Enable the SQLite backend ([`SqliteStore`])
//!
//! ## Quick Start
//!
//! ```rust
//! use time_attack::{MemoryStore, RunController, RunStore};
//!
//! let mut store = MemoryStore::new();
//! let route_id = store
//!     .create_route_with_checkpoints("Home to Office", "", &["Bridge", "Station", "Office"])
//!     .unwrap();
//!
//! let mut controller = RunController::new(store);
//! controller.start(route_id, "light rain").unwrap();
//! let outcome = controller.record_checkpoint().unwrap();
//! assert!(!outcome.completed);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{Entity, OptionExt, Result, TrackerError};

// Configuration
pub mod config;
pub use config::{AlignmentPolicy, TrackerConfig};

// Elapsed-time calculation, clocks and time formatting
pub mod timing;
pub use timing::{
    elapsed_seconds, format_delta, format_delta_minutes, format_time, Clock, ManualClock,
    SystemClock,
};

// Storage interface
pub mod store;
pub use store::RunStore;

// In-process storage backend
pub mod memory;
pub use memory::MemoryStore;

// Embedded SQLite storage backend
#[cfg(feature = "persistence")]
pub mod persistence;
#[cfg(feature = "persistence")]
pub use persistence::SqliteStore;

// Personal-best resolution
pub mod personal_best;
pub use personal_best::{get_live_ghost_data, get_personal_best, select_personal_best};

// Ghost comparison engine
pub mod ghost;
pub use ghost::{
    compare, compare_personal_best, compare_splits, ComparisonInsights, GhostComparison,
    SegmentDelta, Verdict,
};

// Run lifecycle state machine
pub mod lifecycle;
pub use lifecycle::{ActiveRun, CheckpointOutcome, GhostStatus, LiveStatus, RunController};

// Route analytics
pub mod analysis;
pub use analysis::{CheckpointStats, RunHistoryStats};

// ============================================================================
// Core Types
// ============================================================================

pub type RouteId = i64;
pub type CheckpointId = i64;
pub type RunId = i64;

/// A named course made of ordered checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: RouteId,
    /// Unique across all routes
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// An ordered waypoint on a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub route_id: RouteId,
    pub name: String,
    /// Traversal position, unique within the route
    pub sequence: i64,
}

/// One timed attempt at a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub route_id: RouteId,
    pub started_at: DateTime<Utc>,
    /// Set once, on completion
    pub ended_at: Option<DateTime<Utc>>,
    /// Total duration in seconds, set once, on completion
    pub total_seconds: Option<f64>,
    pub notes: String,
    pub is_completed: bool,
    /// Set when the run was cancelled before completion
    pub abandoned_at: Option<DateTime<Utc>>,
}

impl Run {
    /// A run is active while it is neither completed nor abandoned.
    pub fn is_active(&self) -> bool {
        !self.is_completed && self.abandoned_at.is_none()
    }
}

/// A run joined with the name of its route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDetails {
    #[serde(flatten)]
    pub run: Run,
    pub route_name: String,
}

/// A persisted checkpoint event: a run reaching a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointTime {
    pub run_id: RunId,
    pub checkpoint_id: CheckpointId,
    pub reached_at: DateTime<Utc>,
    /// Seconds since the previous event of the same run (or the run start)
    pub segment_seconds: f64,
}

/// A checkpoint time enriched with checkpoint metadata and the running total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSplit {
    pub checkpoint_id: CheckpointId,
    pub name: String,
    pub sequence: i64,
    pub segment_seconds: f64,
    /// Sum of segment times from the run start through this checkpoint
    pub cumulative_seconds: f64,
    pub reached_at: DateTime<Utc>,
}

/// The fastest completed run of a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonalBest {
    pub run_id: RunId,
    pub total_seconds: f64,
    /// Start timestamp of the run
    pub date: DateTime<Utc>,
}
