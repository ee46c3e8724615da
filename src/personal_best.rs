//! Personal-best resolution.
//!
//! The personal best of a route is its completed run with the lowest total
//! duration. Ties go to the earliest start, then the lowest run id, so the
//! answer never depends on backend query order.

use std::cmp::Ordering;

use crate::error::{Entity, OptionExt, Result};
use crate::store::RunStore;
use crate::{CheckpointSplit, PersonalBest, RouteId, Run};

/// Pick the personal best out of a set of runs.
///
/// Incomplete runs and runs without a finite total are ignored.
pub fn select_personal_best(runs: &[Run]) -> Option<PersonalBest> {
    runs.iter()
        .filter(|run| run.is_completed)
        .filter_map(|run| {
            run.total_seconds
                .filter(|total| total.is_finite())
                .map(|total| (run, total))
        })
        .min_by(|(a, a_total), (b, b_total)| rank(a, *a_total, b, *b_total))
        .map(|(run, total)| PersonalBest {
            run_id: run.id,
            total_seconds: total,
            date: run.started_at,
        })
}

fn rank(a: &Run, a_total: f64, b: &Run, b_total: f64) -> Ordering {
    a_total
        .total_cmp(&b_total)
        .then_with(|| a.started_at.cmp(&b.started_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Personal best of a route, or `None` if it has no completed run yet.
pub fn get_personal_best<S: RunStore + ?Sized>(
    store: &S,
    route_id: RouteId,
) -> Result<Option<PersonalBest>> {
    store
        .get_route(route_id)?
        .ok_or_not_found(Entity::Route, route_id)?;
    store.get_personal_best(route_id)
}

/// Checkpoint splits of the personal-best run, used as the live ghost.
///
/// This is a snapshot; it does not follow later changes of the personal best.
pub fn get_live_ghost_data<S: RunStore + ?Sized>(
    store: &S,
    route_id: RouteId,
) -> Result<Option<Vec<CheckpointSplit>>> {
    match get_personal_best(store, route_id)? {
        Some(best) => {
            let splits = store.get_run_checkpoint_times(best.run_id)?;
            log::debug!(
                "[PersonalBest] Ghost for route {} is run {} ({} splits, {:.3}s)",
                route_id,
                best.run_id,
                splits.len(),
                best.total_seconds
            );
            Ok(Some(splits))
        }
        None => Ok(None),
    }
}
