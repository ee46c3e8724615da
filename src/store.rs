//! # Storage Interface
//!
//! The contract every backend implements. Backends persist four entity kinds
//! (routes, checkpoints, runs, checkpoint times) and answer the queries the
//! lifecycle controller, the personal-best resolver and the ghost comparison
//! engine need.
//!
//! Aggregates (personal best, checkpoint analysis) are provided methods
//! computed in Rust from the primitive queries, so every backend yields the
//! same answer, tie-breaks included.
//!
//! ## Contract
//!
//! - Validation happens before any write; a rejected call leaves no trace.
//! - Deletes cascade and are idempotent: deleting a missing id is `Ok(())`.
//! - At most one active (neither completed nor abandoned) run per route.
//! - Timestamps that mean "now" are supplied by the caller, so the controller
//!   and the store agree on the instant that was persisted.

use chrono::{DateTime, Utc};

use crate::analysis::{self, CheckpointStats};
use crate::error::{Result, TrackerError};
use crate::personal_best::select_personal_best;
use crate::{
    Checkpoint, CheckpointId, CheckpointSplit, PersonalBest, Route, RouteId, Run, RunDetails,
    RunId,
};

/// Storage backend for routes, checkpoints, runs and checkpoint times.
pub trait RunStore {
    // ========================================================================
    // Routes
    // ========================================================================

    /// Create a route. The name must be non-blank and unique.
    fn create_route(&mut self, name: &str, description: &str) -> Result<RouteId>;

    fn get_route(&self, route_id: RouteId) -> Result<Option<Route>>;

    /// All routes ordered by name.
    fn list_routes(&self) -> Result<Vec<Route>>;

    /// Delete a route with its checkpoints, runs and checkpoint times.
    fn delete_route(&mut self, route_id: RouteId) -> Result<()>;

    // ========================================================================
    // Checkpoints
    // ========================================================================

    /// Add a checkpoint at `sequence`, which must be unused within the route.
    ///
    /// While the route has an active run, the checkpoint must either be
    /// appended or go before the last checkpoint that run reached.
    fn add_checkpoint(&mut self, route_id: RouteId, name: &str, sequence: i64)
        -> Result<CheckpointId>;

    /// Checkpoints of a route ordered by sequence position.
    fn list_checkpoints(&self, route_id: RouteId) -> Result<Vec<Checkpoint>>;

    /// Delete a checkpoint and every time recorded against it. Refused with
    /// `InvalidState` while its route has an active run.
    fn delete_checkpoint(&mut self, checkpoint_id: CheckpointId) -> Result<()>;

    // ========================================================================
    // Runs
    // ========================================================================

    /// Create an in-progress run. Fails with `InvalidState` if the route
    /// already has an active run.
    fn start_run(&mut self, route_id: RouteId, notes: &str, started_at: DateTime<Utc>)
        -> Result<RunId>;

    /// Persist a checkpoint event for an active run. The checkpoint must be
    /// the first one positioned after the last checkpoint the run reached.
    fn record_checkpoint_time(
        &mut self,
        run_id: RunId,
        checkpoint_id: CheckpointId,
        segment_seconds: f64,
        reached_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Mark a run completed. End time and total are immutable afterwards.
    fn complete_run(&mut self, run_id: RunId, total_seconds: f64, ended_at: DateTime<Utc>)
        -> Result<()>;

    /// Mark an incomplete run as abandoned. Recorded times are kept.
    fn abandon_run(&mut self, run_id: RunId, abandoned_at: DateTime<Utc>) -> Result<()>;

    /// Delete a run and its checkpoint times.
    fn delete_run(&mut self, run_id: RunId) -> Result<()>;

    fn get_run_details(&self, run_id: RunId) -> Result<Option<RunDetails>>;

    /// Most recently started active run across all routes.
    fn get_latest_active_run(&self) -> Result<Option<Run>>;

    /// Recorded times of a run in checkpoint order, with cumulative totals.
    /// Empty for unknown runs.
    fn get_run_checkpoint_times(&self, run_id: RunId) -> Result<Vec<CheckpointSplit>>;

    /// Completed runs of a route, newest first.
    fn get_run_history(&self, route_id: RouteId) -> Result<Vec<Run>>;

    // ========================================================================
    // Provided operations
    // ========================================================================

    /// Next free sequence position when appending: max + 1, or 1.
    fn next_sequence_position(&self, route_id: RouteId) -> Result<i64> {
        Ok(self
            .list_checkpoints(route_id)?
            .iter()
            .map(|c| c.sequence)
            .max()
            .map_or(1, |max| max + 1))
    }

    /// Create a route with checkpoints at positions 1..=n.
    ///
    /// Every name is validated before the route is written.
    fn create_route_with_checkpoints(
        &mut self,
        name: &str,
        description: &str,
        checkpoint_names: &[&str],
    ) -> Result<RouteId> {
        validate_route_name(name)?;
        for checkpoint_name in checkpoint_names {
            validate_checkpoint_name(checkpoint_name)?;
        }

        let route_id = self.create_route(name, description)?;
        for (position, checkpoint_name) in checkpoint_names.iter().enumerate() {
            self.add_checkpoint(route_id, checkpoint_name, position as i64 + 1)?;
        }
        Ok(route_id)
    }

    /// Fastest completed run of a route.
    fn get_personal_best(&self, route_id: RouteId) -> Result<Option<PersonalBest>> {
        Ok(select_personal_best(&self.get_run_history(route_id)?))
    }

    /// Per-checkpoint segment statistics across completed runs.
    fn get_checkpoint_analysis(&self, route_id: RouteId) -> Result<Vec<CheckpointStats>> {
        let checkpoints = self.list_checkpoints(route_id)?;
        let mut splits = Vec::new();
        for run in self.get_run_history(route_id)? {
            splits.extend(self.get_run_checkpoint_times(run.id)?);
        }
        Ok(analysis::checkpoint_stats(&checkpoints, &splits))
    }
}

// ============================================================================
// Shared helpers for backends
// ============================================================================

/// Trimmed route name, or a validation error if blank.
pub(crate) fn validate_route_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(TrackerError::validation("Route name must not be empty"));
    }
    Ok(trimmed)
}

/// Trimmed checkpoint name, or a validation error if blank.
pub(crate) fn validate_checkpoint_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(TrackerError::validation("Checkpoint name must not be empty"));
    }
    Ok(trimmed)
}

pub(crate) fn validate_segment(segment_seconds: f64) -> Result<()> {
    if !segment_seconds.is_finite() {
        return Err(TrackerError::validation(format!(
            "Segment duration must be finite, got {}",
            segment_seconds
        )));
    }
    Ok(())
}

/// The checkpoint a run records next: the first one positioned after the
/// last checkpoint it reached. `checkpoints` must be in sequence order.
pub(crate) fn next_expected_checkpoint(
    checkpoints: &[Checkpoint],
    last_recorded_sequence: Option<i64>,
) -> Option<&Checkpoint> {
    checkpoints
        .iter()
        .find(|c| last_recorded_sequence.map_or(true, |last| c.sequence > last))
}

/// Checkpoints are recorded in route order, without skipping.
pub(crate) fn check_recording_order(
    run_id: RunId,
    checkpoints: &[Checkpoint],
    last_recorded_sequence: Option<i64>,
    checkpoint_id: CheckpointId,
) -> Result<()> {
    match next_expected_checkpoint(checkpoints, last_recorded_sequence) {
        Some(expected) if expected.id == checkpoint_id => Ok(()),
        Some(expected) => Err(TrackerError::validation(format!(
            "Run {} must reach checkpoint '{}' (position {}) next",
            run_id, expected.name, expected.sequence
        ))),
        None => Err(TrackerError::validation(format!(
            "Run {} has no checkpoint left to reach",
            run_id
        ))),
    }
}

/// While a run is in progress its remaining checkpoints are fixed: a new
/// checkpoint goes after every existing one, or before the last one the
/// run already reached.
pub(crate) fn check_insert_during_run(
    run_id: RunId,
    checkpoints: &[Checkpoint],
    last_recorded_sequence: Option<i64>,
    sequence: i64,
) -> Result<()> {
    let appended = checkpoints.iter().all(|c| sequence > c.sequence);
    let behind = last_recorded_sequence.map_or(false, |last| sequence < last);
    if appended || behind {
        return Ok(());
    }
    Err(TrackerError::invalid_state(format!(
        "Run {} is in progress; a checkpoint at position {} would change its remaining checkpoints",
        run_id, sequence
    )))
}

/// Raw recorded time joined with its checkpoint, before accumulation.
pub(crate) struct SplitRow {
    pub checkpoint_id: CheckpointId,
    pub name: String,
    pub sequence: i64,
    pub segment_seconds: f64,
    pub reached_at: DateTime<Utc>,
}

/// Attach running totals to rows already in checkpoint order.
pub(crate) fn accumulate_splits(rows: Vec<SplitRow>) -> Vec<CheckpointSplit> {
    let mut cumulative = 0.0;
    rows.into_iter()
        .map(|row| {
            cumulative += row.segment_seconds;
            CheckpointSplit {
                checkpoint_id: row.checkpoint_id,
                name: row.name,
                sequence: row.sequence,
                segment_seconds: row.segment_seconds,
                cumulative_seconds: cumulative,
                reached_at: row.reached_at,
            }
        })
        .collect()
}
