//! # Memory Store
//!
//! In-process implementation of [`RunStore`]. Nothing survives the process;
//! useful for tests, demos and embedding where persistence is handled
//! elsewhere. Enforces the same validation and cascade rules as the SQLite
//! backend.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::{Entity, OptionExt, Result, TrackerError};
use crate::store::{
    accumulate_splits, check_insert_during_run, check_recording_order, validate_checkpoint_name,
    validate_route_name, validate_segment, RunStore, SplitRow,
};
use crate::{
    Checkpoint, CheckpointId, CheckpointSplit, CheckpointTime, Route, RouteId, Run, RunDetails,
    RunId,
};

/// In-memory storage backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    routes: BTreeMap<RouteId, Route>,
    checkpoints: BTreeMap<CheckpointId, Checkpoint>,
    runs: BTreeMap<RunId, Run>,
    times: Vec<CheckpointTime>,

    // Autoincrement counters, never reused
    next_route_id: RouteId,
    next_checkpoint_id: CheckpointId,
    next_run_id: RunId,
}

fn next_id(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn run(&self, run_id: RunId) -> Result<&Run> {
        self.runs.get(&run_id).ok_or_not_found(Entity::Run, run_id)
    }

    fn run_mut(&mut self, run_id: RunId) -> Result<&mut Run> {
        self.runs
            .get_mut(&run_id)
            .ok_or_not_found(Entity::Run, run_id)
    }

    fn active_run_id(&self, route_id: RouteId) -> Option<RunId> {
        self.runs
            .values()
            .find(|run| run.route_id == route_id && run.is_active())
            .map(|run| run.id)
    }

    /// Highest position among the checkpoints a run has reached.
    fn last_recorded_sequence(&self, run_id: RunId) -> Option<i64> {
        self.times
            .iter()
            .filter(|t| t.run_id == run_id)
            .filter_map(|t| self.checkpoints.get(&t.checkpoint_id))
            .map(|c| c.sequence)
            .max()
    }
}

impl RunStore for MemoryStore {
    fn create_route(&mut self, name: &str, description: &str) -> Result<RouteId> {
        let name = validate_route_name(name)?;
        if self.routes.values().any(|r| r.name == name) {
            return Err(TrackerError::validation(format!(
                "A route named '{}' already exists",
                name
            )));
        }

        let id = next_id(&mut self.next_route_id);
        self.routes.insert(
            id,
            Route {
                id,
                name: name.to_string(),
                description: description.to_string(),
                created_at: Utc::now(),
            },
        );
        log::info!("[MemoryStore] Created route {} '{}'", id, name);
        Ok(id)
    }

    fn get_route(&self, route_id: RouteId) -> Result<Option<Route>> {
        Ok(self.routes.get(&route_id).cloned())
    }

    fn list_routes(&self) -> Result<Vec<Route>> {
        let mut routes: Vec<Route> = self.routes.values().cloned().collect();
        routes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(routes)
    }

    fn delete_route(&mut self, route_id: RouteId) -> Result<()> {
        let run_ids: Vec<RunId> = self
            .runs
            .values()
            .filter(|run| run.route_id == route_id)
            .map(|run| run.id)
            .collect();
        for run_id in run_ids {
            self.delete_run(run_id)?;
        }

        let checkpoint_ids: Vec<CheckpointId> = self
            .checkpoints
            .values()
            .filter(|c| c.route_id == route_id)
            .map(|c| c.id)
            .collect();
        for checkpoint_id in checkpoint_ids {
            self.delete_checkpoint(checkpoint_id)?;
        }

        if self.routes.remove(&route_id).is_some() {
            log::info!("[MemoryStore] Deleted route {}", route_id);
        }
        Ok(())
    }

    fn add_checkpoint(
        &mut self,
        route_id: RouteId,
        name: &str,
        sequence: i64,
    ) -> Result<CheckpointId> {
        let name = validate_checkpoint_name(name)?;
        if !self.routes.contains_key(&route_id) {
            return Err(TrackerError::not_found(Entity::Route, route_id));
        }
        if self
            .checkpoints
            .values()
            .any(|c| c.route_id == route_id && c.sequence == sequence)
        {
            return Err(TrackerError::validation(format!(
                "Route {} already has a checkpoint at position {}",
                route_id, sequence
            )));
        }
        if let Some(run_id) = self.active_run_id(route_id) {
            let checkpoints = self.list_checkpoints(route_id)?;
            check_insert_during_run(
                run_id,
                &checkpoints,
                self.last_recorded_sequence(run_id),
                sequence,
            )?;
        }

        let id = next_id(&mut self.next_checkpoint_id);
        self.checkpoints.insert(
            id,
            Checkpoint {
                id,
                route_id,
                name: name.to_string(),
                sequence,
            },
        );
        Ok(id)
    }

    fn list_checkpoints(&self, route_id: RouteId) -> Result<Vec<Checkpoint>> {
        let mut checkpoints: Vec<Checkpoint> = self
            .checkpoints
            .values()
            .filter(|c| c.route_id == route_id)
            .cloned()
            .collect();
        checkpoints.sort_by_key(|c| c.sequence);
        Ok(checkpoints)
    }

    fn delete_checkpoint(&mut self, checkpoint_id: CheckpointId) -> Result<()> {
        let route_id = match self.checkpoints.get(&checkpoint_id) {
            Some(checkpoint) => checkpoint.route_id,
            None => return Ok(()),
        };
        if let Some(run_id) = self.active_run_id(route_id) {
            return Err(TrackerError::invalid_state(format!(
                "Run {} is in progress on route {}",
                run_id, route_id
            )));
        }

        self.times.retain(|t| t.checkpoint_id != checkpoint_id);
        self.checkpoints.remove(&checkpoint_id);
        Ok(())
    }

    fn start_run(
        &mut self,
        route_id: RouteId,
        notes: &str,
        started_at: DateTime<Utc>,
    ) -> Result<RunId> {
        if !self.routes.contains_key(&route_id) {
            return Err(TrackerError::not_found(Entity::Route, route_id));
        }
        if let Some(active_id) = self.active_run_id(route_id) {
            return Err(TrackerError::invalid_state(format!(
                "Route {} already has run {} in progress",
                route_id, active_id
            )));
        }

        let id = next_id(&mut self.next_run_id);
        self.runs.insert(
            id,
            Run {
                id,
                route_id,
                started_at,
                ended_at: None,
                total_seconds: None,
                notes: notes.to_string(),
                is_completed: false,
                abandoned_at: None,
            },
        );
        Ok(id)
    }

    fn record_checkpoint_time(
        &mut self,
        run_id: RunId,
        checkpoint_id: CheckpointId,
        segment_seconds: f64,
        reached_at: DateTime<Utc>,
    ) -> Result<()> {
        validate_segment(segment_seconds)?;
        let run = self.run(run_id)?;
        if !run.is_active() {
            return Err(TrackerError::invalid_state(format!(
                "Run {} is no longer in progress",
                run_id
            )));
        }
        let checkpoint = self
            .checkpoints
            .get(&checkpoint_id)
            .ok_or_not_found(Entity::Checkpoint, checkpoint_id)?;
        if checkpoint.route_id != run.route_id {
            return Err(TrackerError::validation(format!(
                "Checkpoint {} does not belong to route {}",
                checkpoint_id, run.route_id
            )));
        }
        if self
            .times
            .iter()
            .any(|t| t.run_id == run_id && t.checkpoint_id == checkpoint_id)
        {
            return Err(TrackerError::validation(format!(
                "Run {} already reached checkpoint {}",
                run_id, checkpoint_id
            )));
        }
        let route_id = run.route_id;
        let checkpoints = self.list_checkpoints(route_id)?;
        check_recording_order(
            run_id,
            &checkpoints,
            self.last_recorded_sequence(run_id),
            checkpoint_id,
        )?;

        self.times.push(CheckpointTime {
            run_id,
            checkpoint_id,
            reached_at,
            segment_seconds,
        });
        Ok(())
    }

    fn complete_run(
        &mut self,
        run_id: RunId,
        total_seconds: f64,
        ended_at: DateTime<Utc>,
    ) -> Result<()> {
        validate_segment(total_seconds)?;
        let run = self.run_mut(run_id)?;
        if run.is_completed {
            return Err(TrackerError::invalid_state(format!(
                "Run {} is already completed",
                run_id
            )));
        }
        if run.abandoned_at.is_some() {
            return Err(TrackerError::invalid_state(format!(
                "Run {} was cancelled",
                run_id
            )));
        }

        run.ended_at = Some(ended_at);
        run.total_seconds = Some(total_seconds);
        run.is_completed = true;
        Ok(())
    }

    fn abandon_run(&mut self, run_id: RunId, abandoned_at: DateTime<Utc>) -> Result<()> {
        let run = self.run_mut(run_id)?;
        if run.is_completed {
            return Err(TrackerError::invalid_state(format!(
                "Run {} is already completed",
                run_id
            )));
        }
        if run.abandoned_at.is_none() {
            run.abandoned_at = Some(abandoned_at);
        }
        Ok(())
    }

    fn delete_run(&mut self, run_id: RunId) -> Result<()> {
        self.times.retain(|t| t.run_id != run_id);
        self.runs.remove(&run_id);
        Ok(())
    }

    fn get_run_details(&self, run_id: RunId) -> Result<Option<RunDetails>> {
        Ok(self.runs.get(&run_id).map(|run| RunDetails {
            run: run.clone(),
            route_name: self
                .routes
                .get(&run.route_id)
                .map(|r| r.name.clone())
                .unwrap_or_default(),
        }))
    }

    fn get_latest_active_run(&self) -> Result<Option<Run>> {
        Ok(self
            .runs
            .values()
            .filter(|run| run.is_active())
            .max_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)))
            .cloned())
    }

    fn get_run_checkpoint_times(&self, run_id: RunId) -> Result<Vec<CheckpointSplit>> {
        let mut rows: Vec<SplitRow> = self
            .times
            .iter()
            .filter(|t| t.run_id == run_id)
            .filter_map(|t| {
                let checkpoint = self.checkpoints.get(&t.checkpoint_id)?;
                Some(SplitRow {
                    checkpoint_id: checkpoint.id,
                    name: checkpoint.name.clone(),
                    sequence: checkpoint.sequence,
                    segment_seconds: t.segment_seconds,
                    reached_at: t.reached_at,
                })
            })
            .collect();
        rows.sort_by_key(|row| row.sequence);
        Ok(accumulate_splits(rows))
    }

    fn get_run_history(&self, route_id: RouteId) -> Result<Vec<Run>> {
        let mut history: Vec<Run> = self
            .runs
            .values()
            .filter(|run| run.route_id == route_id && run.is_completed)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        Ok(history)
    }
}
