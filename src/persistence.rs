//! # SQLite Store
//!
//! Embedded [`RunStore`] backed by a single SQLite file.
//!
//! ## Schema
//!
//! Four tables: `routes`, `checkpoints`, `runs`, `checkpoint_times`. Column
//! names match the databases written by earlier versions of the tracker, so
//! an existing `time_attack.db` opens in place; the only addition,
//! `runs.abandoned_at`, is added by [`migrate_add_abandoned_at`].
//!
//! Timestamps are TEXT. New values are written as RFC 3339 UTC with
//! nanosecond precision; zone-less legacy values are read as UTC.
//!
//! ## Integrity
//!
//! - `routes.name` is unique, `(route_id, sequence_order)` is unique.
//! - A partial unique index allows one active run per route.
//! - Cascading deletes run inside a transaction and do not rely on
//!   `PRAGMA foreign_keys`, so a retried delete is always safe.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Result as SqlResult};

use crate::config::TrackerConfig;
use crate::error::{Entity, OptionExt, Result, TrackerError};
use crate::store::{
    accumulate_splits, check_insert_during_run, check_recording_order, validate_checkpoint_name,
    validate_route_name, validate_segment, RunStore, SplitRow,
};
use crate::timing::{parse_timestamp, to_storage_string};
use crate::{
    Checkpoint, CheckpointId, CheckpointSplit, Route, RouteId, Run, RunDetails, RunId,
};

const RUN_COLUMNS: &str = "id, route_id, start_time, end_time, total_time_seconds, notes, \
                           is_completed, abandoned_at";

// ============================================================================
// Row types
// ============================================================================

/// Run row as stored, before timestamp parsing.
struct RunRow {
    id: RunId,
    route_id: RouteId,
    start_time: String,
    end_time: Option<String>,
    total_time_seconds: Option<f64>,
    notes: Option<String>,
    is_completed: bool,
    abandoned_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get(0)?,
            route_id: row.get(1)?,
            start_time: row.get(2)?,
            end_time: row.get(3)?,
            total_time_seconds: row.get(4)?,
            notes: row.get(5)?,
            is_completed: row.get::<_, Option<bool>>(6)?.unwrap_or(false),
            abandoned_at: row.get(7)?,
        })
    }

    fn into_run(self) -> Result<Run> {
        Ok(Run {
            id: self.id,
            route_id: self.route_id,
            started_at: parse_timestamp(&self.start_time)?,
            ended_at: parse_optional(self.end_time.as_deref())?,
            total_seconds: self.total_time_seconds,
            notes: self.notes.unwrap_or_default(),
            is_completed: self.is_completed,
            abandoned_at: parse_optional(self.abandoned_at.as_deref())?,
        })
    }
}

fn parse_optional(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value.map(parse_timestamp).transpose()
}

// ============================================================================
// Schema
// ============================================================================

/// Create the tables if missing.
fn init_schema(conn: &Connection) -> SqlResult<()> {
    conn.execute_batch(
        r#"
        -- Named courses
        CREATE TABLE IF NOT EXISTS routes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            description TEXT,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );

        -- Ordered waypoints of a route
        CREATE TABLE IF NOT EXISTS checkpoints (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            route_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            sequence_order INTEGER NOT NULL,
            FOREIGN KEY (route_id) REFERENCES routes (id) ON DELETE CASCADE,
            UNIQUE(route_id, sequence_order)
        );

        -- Timed attempts
        CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            route_id INTEGER NOT NULL,
            start_time TIMESTAMP NOT NULL,
            end_time TIMESTAMP,
            total_time_seconds REAL,
            notes TEXT,
            is_completed BOOLEAN DEFAULT 0,
            abandoned_at TIMESTAMP,
            FOREIGN KEY (route_id) REFERENCES routes (id) ON DELETE CASCADE
        );

        -- Checkpoint events of a run
        CREATE TABLE IF NOT EXISTS checkpoint_times (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id INTEGER NOT NULL,
            checkpoint_id INTEGER NOT NULL,
            time_reached TIMESTAMP NOT NULL,
            segment_time_seconds REAL NOT NULL,
            FOREIGN KEY (run_id) REFERENCES runs (id) ON DELETE CASCADE,
            FOREIGN KEY (checkpoint_id) REFERENCES checkpoints (id) ON DELETE CASCADE
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_checkpoints_route ON checkpoints(route_id);
        CREATE INDEX IF NOT EXISTS idx_runs_route ON runs(route_id);
        CREATE INDEX IF NOT EXISTS idx_checkpoint_times_run ON checkpoint_times(run_id);

        -- Enable foreign keys
        PRAGMA foreign_keys = ON;
    "#,
    )
}

/// Migration: add `runs.abandoned_at` and the one-active-run-per-route index.
///
/// Databases from earlier versions may hold several incomplete runs per route
/// (cancelled runs were never marked). All but the newest per route are
/// marked abandoned so the unique index can be created.
pub fn migrate_add_abandoned_at(conn: &Connection) -> SqlResult<()> {
    if needs_abandoned_at_migration(conn)? {
        log::info!("[SqliteStore] Running migration: add_abandoned_at");
        conn.execute("ALTER TABLE runs ADD COLUMN abandoned_at TIMESTAMP", [])?;
        let marked = conn.execute(
            "UPDATE runs SET abandoned_at = COALESCE(end_time, start_time)
             WHERE is_completed = 0
               AND id NOT IN (SELECT MAX(id) FROM runs WHERE is_completed = 0 GROUP BY route_id)",
            [],
        )?;
        log::info!(
            "[SqliteStore] Migration add_abandoned_at completed ({} stale runs marked abandoned)",
            marked
        );
    }

    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_one_active_per_route
         ON runs(route_id) WHERE is_completed = 0 AND abandoned_at IS NULL",
        [],
    )?;
    Ok(())
}

/// Check if migration is needed.
pub fn needs_abandoned_at_migration(conn: &Connection) -> SqlResult<bool> {
    let count: i64 = conn
        .prepare("SELECT COUNT(*) FROM pragma_table_info('runs') WHERE name = 'abandoned_at'")?
        .query_row([], |row| row.get(0))?;
    Ok(count == 0)
}

/// A constraint failure on inserting a run means another active run exists.
fn active_run_conflict(route_id: RouteId, err: rusqlite::Error) -> TrackerError {
    match err {
        rusqlite::Error::SqliteFailure(ref e, _) if e.code == ErrorCode::ConstraintViolation => {
            TrackerError::invalid_state(format!(
                "Route {} already has a run in progress",
                route_id
            ))
        }
        _ => err.into(),
    }
}

// ============================================================================
// SQLite Store
// ============================================================================

/// SQLite-backed storage.
pub struct SqliteStore {
    db: Connection,
    db_path: String,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and bring the schema up to date.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        let db = Connection::open(db_path)?;
        Self::from_connection(db, db_path.display().to_string())
    }

    /// Open the database named by the configuration.
    pub fn open(config: &TrackerConfig) -> Result<Self> {
        Self::new(&config.db_path)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, ":memory:".to_string())
    }

    fn from_connection(db: Connection, db_path: String) -> Result<Self> {
        init_schema(&db)?;
        migrate_add_abandoned_at(&db)?;
        log::debug!("[SqliteStore] Opened {}", db_path);
        Ok(Self { db, db_path })
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    fn load_run(&self, run_id: RunId) -> Result<Option<Run>> {
        let sql = format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS);
        self.db
            .query_row(&sql, params![run_id], RunRow::from_row)
            .optional()?
            .map(RunRow::into_run)
            .transpose()
    }

    fn query_runs(&self, sql: &str, route_id: Option<RouteId>) -> Result<Vec<Run>> {
        let mut stmt = self.db.prepare(sql)?;
        let rows = match route_id {
            Some(id) => stmt
                .query_map(params![id], RunRow::from_row)?
                .collect::<SqlResult<Vec<_>>>()?,
            None => stmt
                .query_map([], RunRow::from_row)?
                .collect::<SqlResult<Vec<_>>>()?,
        };
        rows.into_iter().map(RunRow::into_run).collect()
    }

    fn active_run_id(&self, route_id: RouteId) -> Result<Option<RunId>> {
        Ok(self
            .db
            .query_row(
                "SELECT id FROM runs
                 WHERE route_id = ?1 AND is_completed = 0 AND abandoned_at IS NULL",
                params![route_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Highest position among the checkpoints a run has reached.
    fn last_recorded_sequence(&self, run_id: RunId) -> Result<Option<i64>> {
        Ok(self.db.query_row(
            "SELECT MAX(c.sequence_order)
             FROM checkpoint_times ct
             JOIN checkpoints c ON ct.checkpoint_id = c.id
             WHERE ct.run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?)
    }

    fn route_exists(&self, route_id: RouteId) -> Result<bool> {
        Ok(self
            .db
            .query_row(
                "SELECT 1 FROM routes WHERE id = ?1",
                params![route_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }
}

impl RunStore for SqliteStore {
    fn create_route(&mut self, name: &str, description: &str) -> Result<RouteId> {
        let name = validate_route_name(name)?;
        let taken: Option<i64> = self
            .db
            .query_row(
                "SELECT id FROM routes WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(TrackerError::validation(format!(
                "A route named '{}' already exists",
                name
            )));
        }

        self.db.execute(
            "INSERT INTO routes (name, description) VALUES (?1, ?2)",
            params![name, description],
        )?;
        let id = self.db.last_insert_rowid();
        log::info!("[SqliteStore] Created route {} '{}'", id, name);
        Ok(id)
    }

    fn get_route(&self, route_id: RouteId) -> Result<Option<Route>> {
        let row = self
            .db
            .query_row(
                "SELECT id, name, description, created_at FROM routes WHERE id = ?1",
                params![route_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(id, name, description, created_at)| {
            Ok(Route {
                id,
                name,
                description: description.unwrap_or_default(),
                created_at: parse_timestamp(&created_at)?,
            })
        })
        .transpose()
    }

    fn list_routes(&self) -> Result<Vec<Route>> {
        let mut stmt = self
            .db
            .prepare("SELECT id, name, description, created_at FROM routes ORDER BY name")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, name, description, created_at)| {
                Ok(Route {
                    id,
                    name,
                    description: description.unwrap_or_default(),
                    created_at: parse_timestamp(&created_at)?,
                })
            })
            .collect()
    }

    fn delete_route(&mut self, route_id: RouteId) -> Result<()> {
        let tx = self.db.transaction()?;
        tx.execute(
            "DELETE FROM checkpoint_times
             WHERE run_id IN (SELECT id FROM runs WHERE route_id = ?1)
                OR checkpoint_id IN (SELECT id FROM checkpoints WHERE route_id = ?1)",
            params![route_id],
        )?;
        tx.execute("DELETE FROM runs WHERE route_id = ?1", params![route_id])?;
        tx.execute(
            "DELETE FROM checkpoints WHERE route_id = ?1",
            params![route_id],
        )?;
        let removed = tx.execute("DELETE FROM routes WHERE id = ?1", params![route_id])?;
        tx.commit()?;

        if removed > 0 {
            log::info!("[SqliteStore] Deleted route {}", route_id);
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
        if !self.route_exists(route_id)? {
            return Err(TrackerError::not_found(Entity::Route, route_id));
        }
        let taken: Option<i64> = self
            .db
            .query_row(
                "SELECT id FROM checkpoints WHERE route_id = ?1 AND sequence_order = ?2",
                params![route_id, sequence],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(TrackerError::validation(format!(
                "Route {} already has a checkpoint at position {}",
                route_id, sequence
            )));
        }
        if let Some(run_id) = self.active_run_id(route_id)? {
            let checkpoints = self.list_checkpoints(route_id)?;
            check_insert_during_run(
                run_id,
                &checkpoints,
                self.last_recorded_sequence(run_id)?,
                sequence,
            )?;
        }

        self.db.execute(
            "INSERT INTO checkpoints (route_id, name, sequence_order) VALUES (?1, ?2, ?3)",
            params![route_id, name, sequence],
        )?;
        Ok(self.db.last_insert_rowid())
    }

    fn list_checkpoints(&self, route_id: RouteId) -> Result<Vec<Checkpoint>> {
        let mut stmt = self.db.prepare(
            "SELECT id, route_id, name, sequence_order FROM checkpoints
             WHERE route_id = ?1 ORDER BY sequence_order",
        )?;
        let checkpoints = stmt
            .query_map(params![route_id], |row| {
                Ok(Checkpoint {
                    id: row.get(0)?,
                    route_id: row.get(1)?,
                    name: row.get(2)?,
                    sequence: row.get(3)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(checkpoints)
    }

    fn delete_checkpoint(&mut self, checkpoint_id: CheckpointId) -> Result<()> {
        let route_id: Option<RouteId> = self
            .db
            .query_row(
                "SELECT route_id FROM checkpoints WHERE id = ?1",
                params![checkpoint_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(route_id) = route_id {
            if let Some(run_id) = self.active_run_id(route_id)? {
                return Err(TrackerError::invalid_state(format!(
                    "Run {} is in progress on route {}",
                    run_id, route_id
                )));
            }
        }

        let tx = self.db.transaction()?;
        tx.execute(
            "DELETE FROM checkpoint_times WHERE checkpoint_id = ?1",
            params![checkpoint_id],
        )?;
        tx.execute(
            "DELETE FROM checkpoints WHERE id = ?1",
            params![checkpoint_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn start_run(
        &mut self,
        route_id: RouteId,
        notes: &str,
        started_at: DateTime<Utc>,
    ) -> Result<RunId> {
        if !self.route_exists(route_id)? {
            return Err(TrackerError::not_found(Entity::Route, route_id));
        }
        if let Some(active_id) = self.active_run_id(route_id)? {
            return Err(TrackerError::invalid_state(format!(
                "Route {} already has run {} in progress",
                route_id, active_id
            )));
        }

        // The partial unique index catches a run started through another connection
        self.db
            .execute(
                "INSERT INTO runs (route_id, start_time, notes, is_completed) VALUES (?1, ?2, ?3, 0)",
                params![route_id, to_storage_string(&started_at), notes],
            )
            .map_err(|e| active_run_conflict(route_id, e))?;
        Ok(self.db.last_insert_rowid())
    }

    fn record_checkpoint_time(
        &mut self,
        run_id: RunId,
        checkpoint_id: CheckpointId,
        segment_seconds: f64,
        reached_at: DateTime<Utc>,
    ) -> Result<()> {
        validate_segment(segment_seconds)?;
        let run = self.load_run(run_id)?.ok_or_not_found(Entity::Run, run_id)?;
        if !run.is_active() {
            return Err(TrackerError::invalid_state(format!(
                "Run {} is no longer in progress",
                run_id
            )));
        }

        let checkpoint_route: RouteId = self
            .db
            .query_row(
                "SELECT route_id FROM checkpoints WHERE id = ?1",
                params![checkpoint_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_not_found(Entity::Checkpoint, checkpoint_id)?;
        if checkpoint_route != run.route_id {
            return Err(TrackerError::validation(format!(
                "Checkpoint {} does not belong to route {}",
                checkpoint_id, run.route_id
            )));
        }

        let already: Option<i64> = self
            .db
            .query_row(
                "SELECT id FROM checkpoint_times WHERE run_id = ?1 AND checkpoint_id = ?2",
                params![run_id, checkpoint_id],
                |row| row.get(0),
            )
            .optional()?;
        if already.is_some() {
            return Err(TrackerError::validation(format!(
                "Run {} already reached checkpoint {}",
                run_id, checkpoint_id
            )));
        }
        let checkpoints = self.list_checkpoints(run.route_id)?;
        check_recording_order(
            run_id,
            &checkpoints,
            self.last_recorded_sequence(run_id)?,
            checkpoint_id,
        )?;

        self.db.execute(
            "INSERT INTO checkpoint_times (run_id, checkpoint_id, time_reached, segment_time_seconds)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                run_id,
                checkpoint_id,
                to_storage_string(&reached_at),
                segment_seconds
            ],
        )?;
        Ok(())
    }

    fn complete_run(
        &mut self,
        run_id: RunId,
        total_seconds: f64,
        ended_at: DateTime<Utc>,
    ) -> Result<()> {
        validate_segment(total_seconds)?;
        let run = self.load_run(run_id)?.ok_or_not_found(Entity::Run, run_id)?;
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

        self.db.execute(
            "UPDATE runs SET end_time = ?1, total_time_seconds = ?2, is_completed = 1
             WHERE id = ?3 AND is_completed = 0",
            params![to_storage_string(&ended_at), total_seconds, run_id],
        )?;
        Ok(())
    }

    fn abandon_run(&mut self, run_id: RunId, abandoned_at: DateTime<Utc>) -> Result<()> {
        let run = self.load_run(run_id)?.ok_or_not_found(Entity::Run, run_id)?;
        if run.is_completed {
            return Err(TrackerError::invalid_state(format!(
                "Run {} is already completed",
                run_id
            )));
        }

        self.db.execute(
            "UPDATE runs SET abandoned_at = ?1 WHERE id = ?2 AND abandoned_at IS NULL",
            params![to_storage_string(&abandoned_at), run_id],
        )?;
        Ok(())
    }

    fn delete_run(&mut self, run_id: RunId) -> Result<()> {
        let tx = self.db.transaction()?;
        tx.execute(
            "DELETE FROM checkpoint_times WHERE run_id = ?1",
            params![run_id],
        )?;
        tx.execute("DELETE FROM runs WHERE id = ?1", params![run_id])?;
        tx.commit()?;
        Ok(())
    }

    fn get_run_details(&self, run_id: RunId) -> Result<Option<RunDetails>> {
        let run = match self.load_run(run_id)? {
            Some(run) => run,
            None => return Ok(None),
        };
        let route_name: Option<String> = self
            .db
            .query_row(
                "SELECT name FROM routes WHERE id = ?1",
                params![run.route_id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(Some(RunDetails {
            run,
            route_name: route_name.unwrap_or_default(),
        }))
    }

    fn get_latest_active_run(&self) -> Result<Option<Run>> {
        let sql = format!(
            "SELECT {} FROM runs WHERE is_completed = 0 AND abandoned_at IS NULL",
            RUN_COLUMNS
        );
        // Ordered in Rust: legacy rows mix timestamp layouts, so text order is unreliable
        Ok(self
            .query_runs(&sql, None)?
            .into_iter()
            .max_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id))))
    }

    fn get_run_checkpoint_times(&self, run_id: RunId) -> Result<Vec<CheckpointSplit>> {
        let mut stmt = self.db.prepare(
            "SELECT c.id, c.name, c.sequence_order, ct.segment_time_seconds, ct.time_reached
             FROM checkpoint_times ct
             JOIN checkpoints c ON ct.checkpoint_id = c.id
             WHERE ct.run_id = ?1
             ORDER BY c.sequence_order",
        )?;
        let raw = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        let rows = raw
            .into_iter()
            .map(|(checkpoint_id, name, sequence, segment_seconds, reached)| {
                Ok(SplitRow {
                    checkpoint_id,
                    name,
                    sequence,
                    segment_seconds,
                    reached_at: parse_timestamp(&reached)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(accumulate_splits(rows))
    }

    fn get_run_history(&self, route_id: RouteId) -> Result<Vec<Run>> {
        let sql = format!(
            "SELECT {} FROM runs WHERE route_id = ?1 AND is_completed = 1",
            RUN_COLUMNS
        );
        let mut history = self.query_runs(&sql, Some(route_id))?;
        history.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        log::debug!(
            "[SqliteStore] Route {} has {} completed runs",
            route_id,
            history.len()
        );
        Ok(history)
    }
}
