//! Route analytics: per-checkpoint segment statistics and run-history totals.

use serde::{Deserialize, Serialize};

use crate::{Checkpoint, CheckpointId, CheckpointSplit, Run};

/// Segment statistics for one checkpoint across completed runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointStats {
    pub checkpoint_id: CheckpointId,
    pub name: String,
    pub sequence: i64,
    /// `None` when no completed run recorded this checkpoint
    pub average_seconds: Option<f64>,
    pub best_seconds: Option<f64>,
    pub worst_seconds: Option<f64>,
    pub count: usize,
}

/// Aggregate of completed-run totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHistoryStats {
    pub count: usize,
    pub average_seconds: Option<f64>,
    pub fastest_seconds: Option<f64>,
    pub slowest_seconds: Option<f64>,
}

impl RunHistoryStats {
    /// Statistics over completed runs with a finite total. Other runs are skipped.
    pub fn from_runs(runs: &[Run]) -> Self {
        let totals: Vec<f64> = runs
            .iter()
            .filter(|r| r.is_completed)
            .filter_map(|r| r.total_seconds)
            .filter(|t| t.is_finite())
            .collect();

        let (average, fastest, slowest) = summarize(&totals);
        Self {
            count: totals.len(),
            average_seconds: average,
            fastest_seconds: fastest,
            slowest_seconds: slowest,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// One entry per checkpoint, in the order given, matched to splits by id.
pub(crate) fn checkpoint_stats(
    checkpoints: &[Checkpoint],
    splits: &[CheckpointSplit],
) -> Vec<CheckpointStats> {
    checkpoints
        .iter()
        .map(|checkpoint| {
            let segments: Vec<f64> = splits
                .iter()
                .filter(|s| s.checkpoint_id == checkpoint.id)
                .map(|s| s.segment_seconds)
                .collect();
            let (average, best, worst) = summarize(&segments);

            CheckpointStats {
                checkpoint_id: checkpoint.id,
                name: checkpoint.name.clone(),
                sequence: checkpoint.sequence,
                average_seconds: average,
                best_seconds: best,
                worst_seconds: worst,
                count: segments.len(),
            }
        })
        .collect()
}

/// (mean, min, max), all `None` for an empty slice.
fn summarize(values: &[f64]) -> (Option<f64>, Option<f64>, Option<f64>) {
    if values.is_empty() {
        return (None, None, None);
    }
    let sum: f64 = values.iter().sum();
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    (Some(sum / values.len() as f64), Some(min), Some(max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::{record_run, seeded_store};
    use crate::store::RunStore;

    #[test]
    fn test_checkpoint_analysis() {
        let (mut store, route_id) = seeded_store(3);
        record_run(&mut store, route_id, &[30.0, 40.0, 30.0], 0);
        record_run(&mut store, route_id, &[28.0, 42.0, 29.0], 1);
        // Incomplete runs do not count
        record_run(&mut store, route_id, &[1.0], 2);

        let stats = store.get_checkpoint_analysis(route_id).unwrap();
        assert_eq!(stats.len(), 3);

        let first = &stats[0];
        assert_eq!(first.name, "cp1");
        assert_eq!(first.count, 2);
        assert_eq!(first.average_seconds, Some(29.0));
        assert_eq!(first.best_seconds, Some(28.0));
        assert_eq!(first.worst_seconds, Some(30.0));

        let sequences: Vec<i64> = stats.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[test]
    fn test_checkpoint_without_data() {
        let (store, route_id) = seeded_store(2);
        let stats = store.get_checkpoint_analysis(route_id).unwrap();

        assert_eq!(stats.len(), 2);
        assert!(stats.iter().all(|s| s.count == 0 && s.average_seconds.is_none()));
    }

    #[test]
    fn test_run_history_stats() {
        let (mut store, route_id) = seeded_store(2);
        record_run(&mut store, route_id, &[50.0, 50.0], 0);
        record_run(&mut store, route_id, &[40.0, 50.0], 1);
        record_run(&mut store, route_id, &[60.0, 50.0], 2);

        let stats = RunHistoryStats::from_runs(&store.get_run_history(route_id).unwrap());
        assert_eq!(stats.count, 3);
        assert_eq!(stats.average_seconds, Some(100.0));
        assert_eq!(stats.fastest_seconds, Some(90.0));
        assert_eq!(stats.slowest_seconds, Some(110.0));
    }

    #[test]
    fn test_run_history_stats_empty() {
        let stats = RunHistoryStats::from_runs(&[]);
        assert_eq!(stats.count, 0);
        assert!(stats.fastest_seconds.is_none());
        assert!(stats.to_json().contains("\"count\":0"));
    }
}
