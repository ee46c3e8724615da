//! # Run Lifecycle
//!
//! [`RunController`] drives one run at a time through its route's checkpoints:
//!
//! ```text
//! NoActiveRun --start--> InProgress --record (last)--> Completed
//!                            |
//!                            +--cancel--> Cancelled
//! ```
//!
//! The controller owns the storage backend, a [`Clock`], and the in-memory
//! session ([`ActiveRun`]). Every duration is computed from timestamps that
//! were persisted, so a session rebuilt by [`RunController::resume`] after a
//! restart continues exactly where the previous one stopped.
//!
//! The controller never ticks. Callers that show a running timer poll
//! [`RunController::live_status`] on their own cadence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TrackerConfig;
use crate::error::{Entity, OptionExt, Result, TrackerError};
use crate::ghost::{self, GhostComparison};
use crate::personal_best::get_live_ghost_data;
use crate::store::RunStore;
use crate::timing::{elapsed_seconds, Clock, SystemClock};
use crate::{Checkpoint, CheckpointId, CheckpointSplit, RouteId, RunId};

// ============================================================================
// Session state
// ============================================================================

/// In-memory state of the run in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveRun {
    pub run_id: RunId,
    pub route_id: RouteId,
    pub started_at: DateTime<Utc>,
    /// Checkpoints of the route when the session began, in sequence order
    pub checkpoints: Vec<Checkpoint>,
    /// Personal-best splits when the session began
    pub ghost: Option<Vec<CheckpointSplit>>,
    /// Number of checkpoints recorded so far
    pub cursor: usize,
    /// Persisted time of the last checkpoint event, or the run start
    pub last_event_at: DateTime<Utc>,
    /// Sum of recorded segment times
    pub cumulative_seconds: f64,
}

impl ActiveRun {
    pub fn next_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.get(self.cursor)
    }

    /// Ghost cumulative time at checkpoint `index` (0-based).
    fn ghost_cumulative(&self, index: usize) -> Option<f64> {
        self.ghost
            .as_ref()
            .and_then(|splits| splits.get(index))
            .map(|s| s.cumulative_seconds)
    }
}

/// Result of marking a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointOutcome {
    pub run_id: RunId,
    pub checkpoint_id: CheckpointId,
    pub name: String,
    pub segment_seconds: f64,
    pub cumulative_seconds: f64,
    /// Cumulative delta against the ghost at this checkpoint
    pub ghost_delta: Option<f64>,
    /// True when this was the last checkpoint and the run is now completed
    pub completed: bool,
    /// Total duration, set when `completed`
    pub total_seconds: Option<f64>,
}

/// Ghost part of [`LiveStatus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GhostStatus {
    /// Ghost cumulative time at the last recorded checkpoint (0 before the first)
    pub ghost_cumulative_seconds: f64,
    /// Elapsed time minus `ghost_cumulative_seconds`
    pub live_delta: f64,
    /// Cumulative delta at the last recorded checkpoint
    pub split_delta: Option<f64>,
    /// Ghost cumulative time at the next checkpoint
    pub time_to_beat: Option<f64>,
}

/// Snapshot of the run in progress, computed on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveStatus {
    pub run_id: RunId,
    pub route_id: RouteId,
    pub elapsed_seconds: f64,
    /// Time since the last checkpoint event (or the start)
    pub segment_elapsed_seconds: f64,
    pub recorded: usize,
    pub total_checkpoints: usize,
    pub next_checkpoint: Option<String>,
    pub ghost: Option<GhostStatus>,
}

impl LiveStatus {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Run lifecycle state machine over a storage backend.
pub struct RunController<S: RunStore, C: Clock = SystemClock> {
    store: S,
    clock: C,
    config: TrackerConfig,
    active: Option<ActiveRun>,
}

impl<S: RunStore> RunController<S, SystemClock> {
    /// Controller reading the wall clock, with default configuration.
    pub fn new(store: S) -> Self {
        Self::with_clock(store, SystemClock)
    }
}

impl<S: RunStore, C: Clock> RunController<S, C> {
    pub fn with_clock(store: S, clock: C) -> Self {
        Self {
            store,
            clock,
            config: TrackerConfig::default(),
            active: None,
        }
    }

    pub fn with_config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Give up the controller and return its backend.
    pub fn into_store(self) -> S {
        self.store
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn active(&self) -> Option<&ActiveRun> {
        self.active.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// Start a run on a route.
    ///
    /// The route's checkpoints and the personal-best splits are snapshotted
    /// for the whole run. Fails without writing anything when a run is
    /// already in progress, the route does not exist, or it has no checkpoints.
    pub fn start(&mut self, route_id: RouteId, notes: &str) -> Result<RunId> {
        if let Some(active) = &self.active {
            return Err(TrackerError::invalid_state(format!(
                "Run {} is already in progress",
                active.run_id
            )));
        }

        let route = self
            .store
            .get_route(route_id)?
            .ok_or_not_found(Entity::Route, route_id)?;
        let checkpoints = self.store.list_checkpoints(route_id)?;
        if checkpoints.is_empty() {
            return Err(TrackerError::validation(format!(
                "Route '{}' has no checkpoints",
                route.name
            )));
        }
        let ghost = get_live_ghost_data(&self.store, route_id)?;

        let started_at = self.clock.now();
        let run_id = self.store.start_run(route_id, notes, started_at)?;
        log::info!(
            "[RunController] Started run {} on route {} ({} checkpoints, ghost: {})",
            run_id,
            route_id,
            checkpoints.len(),
            ghost.is_some()
        );

        self.active = Some(ActiveRun {
            run_id,
            route_id,
            started_at,
            checkpoints,
            ghost,
            cursor: 0,
            last_event_at: started_at,
            cumulative_seconds: 0.0,
        });
        Ok(run_id)
    }

    /// Mark the next checkpoint as reached now.
    ///
    /// Reaching the last checkpoint completes the run and ends the session.
    /// If completing failed, calling this again retries the completion and
    /// reports the last checkpoint once more.
    pub fn record_checkpoint(&mut self) -> Result<CheckpointOutcome> {
        let now = self.clock.now();
        let active = self
            .active
            .as_mut()
            .ok_or_invalid_state("No run in progress")?;
        let checkpoint = match active.checkpoints.get(active.cursor) {
            Some(checkpoint) => checkpoint.clone(),
            None => return self.retry_completion(),
        };

        let segment = elapsed_seconds(&active.last_event_at, &now);
        if segment < 0.0 {
            log::warn!(
                "[RunController] Clock went backwards: run {} segment {:.3}s",
                active.run_id,
                segment
            );
        }
        self.store
            .record_checkpoint_time(active.run_id, checkpoint.id, segment, now)?;

        let index = active.cursor;
        active.cursor += 1;
        active.last_event_at = now;
        active.cumulative_seconds += segment;

        let run_id = active.run_id;
        let cumulative = active.cumulative_seconds;
        let ghost_delta = active.ghost_cumulative(index).map(|g| cumulative - g);
        let finished = active.cursor == active.checkpoints.len();

        log::info!(
            "[RunController] Run {} reached '{}' ({}/{}) segment {:.3}s",
            run_id,
            checkpoint.name,
            index + 1,
            active.checkpoints.len(),
            segment
        );

        let mut outcome = CheckpointOutcome {
            run_id,
            checkpoint_id: checkpoint.id,
            name: checkpoint.name,
            segment_seconds: segment,
            cumulative_seconds: cumulative,
            ghost_delta,
            completed: false,
            total_seconds: None,
        };

        if finished {
            outcome.total_seconds = Some(self.complete_active()?);
            outcome.completed = true;
        }
        Ok(outcome)
    }

    /// Complete the tracked session at its last checkpoint event. The
    /// session is only cleared once storage accepted the completion.
    fn complete_active(&mut self) -> Result<f64> {
        let active = self
            .active
            .as_ref()
            .ok_or_invalid_state("No run in progress")?;
        let run_id = active.run_id;
        let ended_at = active.last_event_at;
        let total = elapsed_seconds(&active.started_at, &ended_at);

        self.store.complete_run(run_id, total, ended_at)?;
        self.active = None;
        log::info!("[RunController] Completed run {} in {:.3}s", run_id, total);
        Ok(total)
    }

    /// Every checkpoint is recorded but completion did not go through.
    fn retry_completion(&mut self) -> Result<CheckpointOutcome> {
        let active = self
            .active
            .as_ref()
            .ok_or_invalid_state("No run in progress")?;
        let run_id = active.run_id;
        let ghost_delta = active
            .cursor
            .checked_sub(1)
            .and_then(|index| active.ghost_cumulative(index))
            .map(|g| active.cumulative_seconds - g);
        let last = self
            .store
            .get_run_checkpoint_times(run_id)?
            .pop()
            .ok_or_invalid_state(&format!("Run {} has no recorded checkpoint", run_id))?;

        log::info!("[RunController] Retrying completion of run {}", run_id);
        let total = self.complete_active()?;
        Ok(CheckpointOutcome {
            run_id,
            checkpoint_id: last.checkpoint_id,
            name: last.name,
            segment_seconds: last.segment_seconds,
            cumulative_seconds: last.cumulative_seconds,
            ghost_delta,
            completed: true,
            total_seconds: Some(total),
        })
    }

    /// Abandon the run in progress. Recorded times are kept.
    ///
    /// Never fails: without a session this is a no-op returning `None`, and a
    /// storage failure while marking the run is only logged.
    pub fn cancel(&mut self) -> Option<RunId> {
        let active = self.active.take()?;
        if let Err(e) = self.store.abandon_run(active.run_id, self.clock.now()) {
            log::warn!(
                "[RunController] Failed to mark run {} abandoned: {}",
                active.run_id,
                e
            );
        }
        log::info!(
            "[RunController] Cancelled run {} after {}/{} checkpoints",
            active.run_id,
            active.cursor,
            active.checkpoints.len()
        );
        Some(active.run_id)
    }

    /// Reattach to the most recent active run in storage.
    ///
    /// Returns the id of the tracked run. When a session is already tracked
    /// it is kept as is, unless every checkpoint of it is recorded, in which
    /// case its completion is retried. A stored run that already has a time
    /// for every checkpoint is completed at its last recorded time instead of
    /// being reattached.
    ///
    /// The rebuilt session holds the checkpoints the run reached plus those
    /// positioned after the last one reached. Checkpoints inserted behind
    /// the run while it was in progress are not part of it.
    pub fn resume(&mut self) -> Result<Option<RunId>> {
        if let Some(active) = &self.active {
            if active.next_checkpoint().is_some() {
                return Ok(Some(active.run_id));
            }
            self.complete_active()?;
            return Ok(None);
        }

        let run = match self.store.get_latest_active_run()? {
            Some(run) => run,
            None => return Ok(None),
        };
        let recorded = self.store.get_run_checkpoint_times(run.id)?;
        let last_sequence = recorded.last().map(|s| s.sequence);
        let checkpoints: Vec<Checkpoint> = self
            .store
            .list_checkpoints(run.route_id)?
            .into_iter()
            .filter(|c| {
                last_sequence.map_or(true, |last| c.sequence > last)
                    || recorded.iter().any(|s| s.checkpoint_id == c.id)
            })
            .collect();

        if checkpoints.is_empty() {
            log::warn!(
                "[RunController] Route {} of run {} has no checkpoints, abandoning it",
                run.route_id,
                run.id
            );
            self.store.abandon_run(run.id, self.clock.now())?;
            return Ok(None);
        }

        let last_event_at = recorded.last().map_or(run.started_at, |s| s.reached_at);
        let cumulative = recorded.last().map_or(0.0, |s| s.cumulative_seconds);

        if recorded.len() >= checkpoints.len() {
            let total = elapsed_seconds(&run.started_at, &last_event_at);
            self.store.complete_run(run.id, total, last_event_at)?;
            log::info!(
                "[RunController] Run {} had every checkpoint recorded, completed in {:.3}s",
                run.id,
                total
            );
            return Ok(None);
        }

        let ghost = get_live_ghost_data(&self.store, run.route_id)?;
        log::info!(
            "[RunController] Reattached run {} at checkpoint {}/{}",
            run.id,
            recorded.len(),
            checkpoints.len()
        );

        self.active = Some(ActiveRun {
            run_id: run.id,
            route_id: run.route_id,
            started_at: run.started_at,
            checkpoints,
            ghost,
            cursor: recorded.len(),
            last_event_at,
            cumulative_seconds: cumulative,
        });
        Ok(Some(run.id))
    }

    /// Elapsed times and ghost deltas of the run in progress, as of now.
    pub fn live_status(&self) -> Option<LiveStatus> {
        let active = self.active.as_ref()?;
        let now = self.clock.now();
        let elapsed = elapsed_seconds(&active.started_at, &now);

        let ghost = active.ghost.as_ref().and_then(|_| {
            let ghost_cumulative = match active.cursor {
                0 => 0.0,
                n => active.ghost_cumulative(n - 1)?,
            };
            Some(GhostStatus {
                ghost_cumulative_seconds: ghost_cumulative,
                live_delta: elapsed - ghost_cumulative,
                split_delta: active
                    .cursor
                    .checked_sub(1)
                    .map(|_| active.cumulative_seconds - ghost_cumulative),
                time_to_beat: active.ghost_cumulative(active.cursor),
            })
        });

        Some(LiveStatus {
            run_id: active.run_id,
            route_id: active.route_id,
            elapsed_seconds: elapsed,
            segment_elapsed_seconds: elapsed_seconds(&active.last_event_at, &now),
            recorded: active.cursor,
            total_checkpoints: active.checkpoints.len(),
            next_checkpoint: active.next_checkpoint().map(|c| c.name.clone()),
            ghost,
        })
    }

    /// Compare a stored run against its route's personal best using the
    /// configured alignment policy.
    pub fn compare_personal_best(&self, run_id: RunId) -> Result<Option<GhostComparison>> {
        ghost::compare_personal_best(&self.store, run_id, self.config.alignment)
    }
}
