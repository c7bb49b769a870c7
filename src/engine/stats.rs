use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::pool::{ewma, WorkerPool, WorkerStatus};
use super::serde_helpers::duration_ms;
use super::task::TaskKind;

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    completed: u64,
    failed: u64,
    average: Option<Duration>,
}

impl Counters {
    fn record(&mut self, duration: Duration, success: bool, alpha: f64) {
        if success {
            self.completed += 1;
            self.average = Some(match self.average {
                None => duration,
                Some(avg) => ewma(avg, duration, alpha),
            });
        } else {
            self.failed += 1;
        }
    }
}

#[derive(Debug, Default)]
struct StatsInner {
    overall: Counters,
    per_kind: HashMap<TaskKind, Counters>,
}

/// Read-only view consumed by monitoring front-ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_workers: usize,
    pub busy_workers: usize,
    /// `busy_workers / total_workers`, computed when the snapshot is taken.
    pub current_load: f64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    #[serde(with = "duration_ms")]
    pub average_task_time: Duration,
    pub per_kind: Vec<KindBreakdown>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindBreakdown {
    pub kind: TaskKind,
    pub label: String,
    pub workers: usize,
    pub busy: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    #[serde(with = "duration_ms")]
    pub average_task_time: Duration,
}

/// Rolling completion counters. Latency is an exponentially weighted moving
/// average over successful runs; load is never stored, only derived from the
/// pool on demand.
#[derive(Debug)]
pub struct StatsAggregator {
    inner: RwLock<StatsInner>,
    alpha: f64,
}

impl StatsAggregator {
    pub fn new(alpha: f64) -> Self {
        Self {
            inner: RwLock::new(StatsInner::default()),
            alpha: alpha.clamp(f64::EPSILON, 1.0),
        }
    }

    pub async fn record_completion(&self, kind: TaskKind, duration: Duration, success: bool) {
        let mut inner = self.inner.write().await;
        inner.overall.record(duration, success, self.alpha);
        inner
            .per_kind
            .entry(kind)
            .or_default()
            .record(duration, success, self.alpha);
    }

    /// Smoothed run time for one kind, if it has completed at least once.
    pub async fn kind_average(&self, kind: TaskKind) -> Option<Duration> {
        self.inner.read().await.per_kind.get(&kind).and_then(|c| c.average)
    }

    pub async fn snapshot(&self, pool: &WorkerPool) -> StatsSnapshot {
        let workers = pool.stats();
        let inner = self.inner.read().await;

        let total_workers = workers.len();
        let busy_workers = workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Busy)
            .count();
        let current_load = if total_workers == 0 {
            0.0
        } else {
            busy_workers as f64 / total_workers as f64
        };

        let per_kind = TaskKind::ALL
            .iter()
            .map(|&kind| {
                let of_kind = workers.iter().filter(|w| w.kind == kind);
                let counters = inner.per_kind.get(&kind).copied().unwrap_or_default();
                KindBreakdown {
                    kind,
                    label: kind.info().label.to_string(),
                    workers: of_kind.clone().count(),
                    busy: of_kind.filter(|w| w.status == WorkerStatus::Busy).count(),
                    tasks_completed: counters.completed,
                    tasks_failed: counters.failed,
                    average_task_time: counters.average.unwrap_or_default(),
                }
            })
            .collect();

        StatsSnapshot {
            total_workers,
            busy_workers,
            current_load,
            tasks_completed: inner.overall.completed,
            tasks_failed: inner.overall.failed,
            average_task_time: inner.overall.average.unwrap_or_default(),
            per_kind,
        }
    }
}
