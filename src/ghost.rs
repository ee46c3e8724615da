//! # Ghost Comparison
//!
//! Aligns a run's checkpoint splits against another run (normally the
//! personal best) and computes segment and cumulative deltas.
//!
//! ## Alignment
//! Splits are paired by position, not by checkpoint id: entry *i* of the run
//! is compared with entry *i* of the ghost. Comparisons are therefore only
//! meaningful between runs of the same route. When the sequences differ in
//! length the [`AlignmentPolicy`] decides between truncating to the shorter
//! one (flagged on the result) and rejecting the comparison.
//!
//! ## Sign convention
//! `delta = current - ghost`. Negative means the current run was faster.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::AlignmentPolicy;
use crate::error::{Entity, OptionExt, Result, TrackerError};
use crate::store::RunStore;
use crate::{CheckpointSplit, RunId};

/// One aligned checkpoint of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDelta {
    /// Checkpoint name as recorded by the current run
    pub checkpoint_name: String,
    pub sequence: i64,
    pub current_segment: f64,
    pub ghost_segment: f64,
    pub segment_delta: f64,
    pub current_cumulative: f64,
    pub ghost_cumulative: f64,
    pub cumulative_delta: f64,
}

/// Result of comparing a run against a ghost run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GhostComparison {
    pub run_id: RunId,
    pub ghost_run_id: RunId,
    pub entries: Vec<SegmentDelta>,
    /// Splits recorded by the current run
    pub current_len: usize,
    /// Splits recorded by the ghost run
    pub ghost_len: usize,
    /// True when the sequences differed in length and the tail was dropped
    pub truncated: bool,
}

/// Headline outcome of a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Faster,
    Slower,
    Even,
}

/// Summary of a comparison: best and worst relative segments and the final delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonInsights {
    /// Entry with the lowest segment delta (first one on ties)
    pub best_segment: SegmentDelta,
    /// Entry with the highest segment delta (first one on ties)
    pub worst_segment: SegmentDelta,
    /// Cumulative delta at the last aligned checkpoint
    pub final_delta: f64,
    pub verdict: Verdict,
}

impl ComparisonInsights {
    /// e.g. "finished 1.000s faster than personal best"
    pub fn headline(&self) -> String {
        match self.verdict {
            Verdict::Faster => format!(
                "finished {:.3}s faster than personal best",
                self.final_delta.abs()
            ),
            Verdict::Slower => format!(
                "finished {:.3}s slower than personal best",
                self.final_delta
            ),
            Verdict::Even => "finished level with personal best".to_string(),
        }
    }
}

impl fmt::Display for ComparisonInsights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.headline())
    }
}

impl GhostComparison {
    /// Entry where the current run gained the most time.
    pub fn best_segment(&self) -> Option<&SegmentDelta> {
        let mut best: Option<&SegmentDelta> = None;
        for entry in &self.entries {
            if best.map_or(true, |b| entry.segment_delta < b.segment_delta) {
                best = Some(entry);
            }
        }
        best
    }

    /// Entry where the current run lost the most time.
    pub fn worst_segment(&self) -> Option<&SegmentDelta> {
        let mut worst: Option<&SegmentDelta> = None;
        for entry in &self.entries {
            if worst.map_or(true, |w| entry.segment_delta > w.segment_delta) {
                worst = Some(entry);
            }
        }
        worst
    }

    /// Cumulative delta at the last aligned checkpoint.
    pub fn final_delta(&self) -> Option<f64> {
        self.entries.last().map(|e| e.cumulative_delta)
    }

    /// `None` when nothing could be aligned.
    pub fn insights(&self) -> Option<ComparisonInsights> {
        let final_delta = self.final_delta()?;
        let verdict = if final_delta < 0.0 {
            Verdict::Faster
        } else if final_delta > 0.0 {
            Verdict::Slower
        } else {
            Verdict::Even
        };

        Some(ComparisonInsights {
            best_segment: self.best_segment()?.clone(),
            worst_segment: self.worst_segment()?.clone(),
            final_delta,
            verdict,
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Pair two split sequences positionally and compute deltas.
pub fn compare_splits(
    current: &[CheckpointSplit],
    ghost: &[CheckpointSplit],
    policy: AlignmentPolicy,
) -> Result<Vec<SegmentDelta>> {
    if policy == AlignmentPolicy::Strict && current.len() != ghost.len() {
        return Err(TrackerError::validation(format!(
            "Cannot align {} splits against {} ghost splits",
            current.len(),
            ghost.len()
        )));
    }

    Ok(current
        .iter()
        .zip(ghost)
        .map(|(cur, gh)| SegmentDelta {
            checkpoint_name: cur.name.clone(),
            sequence: cur.sequence,
            current_segment: cur.segment_seconds,
            ghost_segment: gh.segment_seconds,
            segment_delta: cur.segment_seconds - gh.segment_seconds,
            current_cumulative: cur.cumulative_seconds,
            ghost_cumulative: gh.cumulative_seconds,
            cumulative_delta: cur.cumulative_seconds - gh.cumulative_seconds,
        })
        .collect())
}

/// Compare two stored runs checkpoint by checkpoint.
pub fn compare<S: RunStore + ?Sized>(
    store: &S,
    run_id: RunId,
    ghost_run_id: RunId,
    policy: AlignmentPolicy,
) -> Result<GhostComparison> {
    store
        .get_run_details(run_id)?
        .ok_or_not_found(Entity::Run, run_id)?;
    store
        .get_run_details(ghost_run_id)?
        .ok_or_not_found(Entity::Run, ghost_run_id)?;

    let current = store.get_run_checkpoint_times(run_id)?;
    let ghost = store.get_run_checkpoint_times(ghost_run_id)?;
    let entries = compare_splits(&current, &ghost, policy)?;

    let truncated = current.len() != ghost.len();
    if truncated {
        log::warn!(
            "[Ghost] Run {} has {} splits, ghost run {} has {}; comparing first {}",
            run_id,
            current.len(),
            ghost_run_id,
            ghost.len(),
            entries.len()
        );
    }

    Ok(GhostComparison {
        run_id,
        ghost_run_id,
        entries,
        current_len: current.len(),
        ghost_len: ghost.len(),
        truncated,
    })
}

/// Compare a run against its route's personal best.
///
/// `None` when the route has no personal best yet, or when the run is the
/// personal best itself.
pub fn compare_personal_best<S: RunStore + ?Sized>(
    store: &S,
    run_id: RunId,
    policy: AlignmentPolicy,
) -> Result<Option<GhostComparison>> {
    let details = store
        .get_run_details(run_id)?
        .ok_or_not_found(Entity::Run, run_id)?;

    match store.get_personal_best(details.run.route_id)? {
        Some(best) if best.run_id != run_id => compare(store, run_id, best.run_id, policy).map(Some),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::{record_run, seeded_store};
    use chrono::{TimeZone, Utc};

    fn splits(segments: &[f64]) -> Vec<CheckpointSplit> {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        let mut cumulative = 0.0;
        segments
            .iter()
            .enumerate()
            .map(|(i, &segment)| {
                cumulative += segment;
                CheckpointSplit {
                    checkpoint_id: i as i64 + 1,
                    name: format!("cp{}", i + 1),
                    sequence: i as i64 + 1,
                    segment_seconds: segment,
                    cumulative_seconds: cumulative,
                    reached_at: at,
                }
            })
            .collect()
    }

    #[test]
    fn test_compare_splits_deltas() {
        let entries = compare_splits(
            &splits(&[28.0, 42.0, 29.0]),
            &splits(&[30.0, 40.0, 30.0]),
            AlignmentPolicy::Truncate,
        )
        .unwrap();

        let segment: Vec<f64> = entries.iter().map(|e| e.segment_delta).collect();
        let cumulative: Vec<f64> = entries.iter().map(|e| e.cumulative_delta).collect();
        assert_eq!(segment, vec![-2.0, 2.0, -1.0]);
        assert_eq!(cumulative, vec![-2.0, 0.0, -1.0]);
    }

    #[test]
    fn test_length_mismatch() {
        let current = splits(&[10.0]);
        let ghost = splits(&[9.0, 9.0, 9.0]);

        let entries = compare_splits(&current, &ghost, AlignmentPolicy::Truncate).unwrap();
        assert_eq!(entries.len(), 1);

        let err = compare_splits(&current, &ghost, AlignmentPolicy::Strict);
        assert!(matches!(err, Err(TrackerError::Validation { .. })));
    }

    #[test]
    fn test_insights() {
        let comparison = GhostComparison {
            run_id: 2,
            ghost_run_id: 1,
            entries: compare_splits(
                &splits(&[28.0, 42.0, 29.0]),
                &splits(&[30.0, 40.0, 30.0]),
                AlignmentPolicy::Strict,
            )
            .unwrap(),
            current_len: 3,
            ghost_len: 3,
            truncated: false,
        };

        let insights = comparison.insights().unwrap();
        assert_eq!(insights.best_segment.checkpoint_name, "cp1");
        assert_eq!(insights.worst_segment.checkpoint_name, "cp2");
        assert_eq!(insights.final_delta, -1.0);
        assert_eq!(insights.verdict, Verdict::Faster);
        assert_eq!(
            insights.headline(),
            "finished 1.000s faster than personal best"
        );
    }

    #[test]
    fn test_insights_ties_take_first() {
        let entries = compare_splits(
            &splits(&[10.0, 10.0]),
            &splits(&[10.0, 10.0]),
            AlignmentPolicy::Strict,
        )
        .unwrap();
        let comparison = GhostComparison {
            run_id: 1,
            ghost_run_id: 1,
            entries,
            current_len: 2,
            ghost_len: 2,
            truncated: false,
        };
        let insights = comparison.insights().unwrap();
        assert_eq!(insights.best_segment.sequence, 1);
        assert_eq!(insights.worst_segment.sequence, 1);
        assert_eq!(insights.verdict, Verdict::Even);
    }

    #[test]
    fn test_empty_comparison_has_no_insights() {
        let comparison = GhostComparison {
            run_id: 1,
            ghost_run_id: 2,
            entries: vec![],
            current_len: 0,
            ghost_len: 3,
            truncated: true,
        };
        assert!(comparison.insights().is_none());
    }

    #[test]
    fn test_compare_run_with_itself_is_zero() {
        let (mut store, route_id) = seeded_store(3);
        let run_id = record_run(&mut store, route_id, &[30.0, 40.0, 30.0], 0);

        let comparison = compare(&store, run_id, run_id, AlignmentPolicy::Strict).unwrap();
        assert_eq!(comparison.entries.len(), 3);
        assert!(comparison
            .entries
            .iter()
            .all(|e| e.segment_delta == 0.0 && e.cumulative_delta == 0.0));
    }

    #[test]
    fn test_compare_personal_best() {
        let (mut store, route_id) = seeded_store(3);
        let best = record_run(&mut store, route_id, &[30.0, 40.0, 30.0], 0);
        let second = record_run(&mut store, route_id, &[28.0, 42.0, 29.0], 1);

        // The new run is faster, so it is now the personal best itself
        assert!(compare_personal_best(&store, second, AlignmentPolicy::Strict)
            .unwrap()
            .is_none());

        let comparison = compare_personal_best(&store, best, AlignmentPolicy::Strict)
            .unwrap()
            .unwrap();
        assert_eq!(comparison.ghost_run_id, second);
        assert_eq!(comparison.final_delta(), Some(1.0));
    }

    #[test]
    fn test_compare_unknown_run() {
        let (mut store, route_id) = seeded_store(2);
        let run_id = record_run(&mut store, route_id, &[5.0, 5.0], 0);

        assert!(matches!(
            compare(&store, run_id, 999, AlignmentPolicy::Truncate),
            Err(TrackerError::NotFound {
                entity: Entity::Run,
                id: 999
            })
        ));
        assert!(compare_personal_best(&store, 999, AlignmentPolicy::Truncate).is_err());
    }
}
