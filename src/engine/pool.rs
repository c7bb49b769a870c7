use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use metrics::gauge;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::serde_helpers::system_time_serde;
use super::task::{TaskKind, WorkerId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("no {0} workers are configured")]
    Unsupported(TaskKind),
    #[error("all {0} workers are busy or unavailable")]
    Unavailable(TaskKind),
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),
}

/// How many workers of one kind the pool starts with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub kind: TaskKind,
    pub count: usize,
    /// These workers can run tasks that require a GPU.
    #[serde(default)]
    pub gpu: bool,
}

impl WorkerSpec {
    pub fn new(kind: TaskKind, count: usize) -> Self {
        Self { kind, count, gpu: false }
    }

    pub fn gpu(mut self) -> Self {
        self.gpu = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    Idle,
    Busy,
    /// Crashed; excluded from acquisition until the owner resets it.
    Unavailable,
}

/// How a bound task ended, as far as the worker's counters are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded(Duration),
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub kind: TaskKind,
    pub gpu: bool,
    pub status: WorkerStatus,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_in_progress: u32,
    pub average_task_time: Option<Duration>,
    #[serde(with = "system_time_serde")]
    pub last_activity_at: SystemTime,
}

impl Worker {
    fn new(id: WorkerId, kind: TaskKind, gpu: bool) -> Self {
        Self {
            id,
            kind,
            gpu,
            status: WorkerStatus::Idle,
            tasks_completed: 0,
            tasks_failed: 0,
            tasks_in_progress: 0,
            average_task_time: None,
            last_activity_at: SystemTime::now(),
        }
    }

    fn eligible(&self, requires_gpu: bool) -> bool {
        self.status != WorkerStatus::Unavailable && (self.gpu || !requires_gpu)
    }
}

/// Fixed set of local execution slots, one task per worker at a time.
///
/// Each worker record sits behind its own map entry lock, so the
/// check-and-claim in [`WorkerPool::acquire`] cannot hand the same idle
/// worker to two callers.
#[derive(Debug)]
pub struct WorkerPool {
    workers: DashMap<WorkerId, Worker>,
    by_kind: HashMap<TaskKind, Vec<WorkerId>>,
    order: Vec<WorkerId>,
    smoothing: f64,
}

impl WorkerPool {
    pub fn new(specs: &[WorkerSpec], smoothing: f64) -> Self {
        let workers = DashMap::new();
        let mut by_kind: HashMap<TaskKind, Vec<WorkerId>> = HashMap::new();
        let mut order = Vec::new();

        for spec in specs {
            for _ in 0..spec.count {
                let ids = by_kind.entry(spec.kind).or_default();
                let id = format!("{}-{}", spec.kind, ids.len());
                workers.insert(id.clone(), Worker::new(id.clone(), spec.kind, spec.gpu));
                ids.push(id.clone());
                order.push(id);
            }
        }

        debug!(workers = order.len(), "worker pool initialised");

        Self {
            workers,
            by_kind,
            order,
            smoothing: smoothing.clamp(f64::EPSILON, 1.0),
        }
    }

    /// Claim an idle worker of `kind`.
    pub fn acquire(&self, kind: TaskKind, requires_gpu: bool) -> Result<WorkerId, PoolError> {
        let ids = self
            .by_kind
            .get(&kind)
            .filter(|ids| !ids.is_empty())
            .ok_or(PoolError::Unsupported(kind))?;

        for id in ids {
            if let Some(mut worker) = self.workers.get_mut(id) {
                if worker.status == WorkerStatus::Idle && worker.eligible(requires_gpu) {
                    worker.status = WorkerStatus::Busy;
                    worker.tasks_in_progress = 1;
                    worker.last_activity_at = SystemTime::now();
                    drop(worker);
                    self.publish_load();
                    return Ok(id.clone());
                }
            }
        }

        Err(PoolError::Unavailable(kind))
    }

    /// Return a worker to the idle set and fold the run into its counters.
    pub fn release(&self, id: &str, outcome: RunOutcome) {
        let Some(mut worker) = self.workers.get_mut(id) else {
            warn!(worker = id, "release for unknown worker ignored");
            return;
        };

        if worker.status != WorkerStatus::Busy {
            warn!(worker = id, status = ?worker.status, "release for a worker that is not busy ignored");
            return;
        }

        worker.status = WorkerStatus::Idle;
        worker.tasks_in_progress = 0;
        worker.last_activity_at = SystemTime::now();

        match outcome {
            RunOutcome::Succeeded(elapsed) => {
                worker.tasks_completed += 1;
                worker.average_task_time = Some(match worker.average_task_time {
                    None => elapsed,
                    Some(avg) => ewma(avg, elapsed, self.smoothing),
                });
            }
            RunOutcome::Failed => worker.tasks_failed += 1,
            RunOutcome::Cancelled => {}
        }

        drop(worker);
        self.publish_load();
    }

    /// Take a worker out of rotation after its executor crashed.
    pub fn mark_crashed(&self, id: &str) {
        if let Some(mut worker) = self.workers.get_mut(id) {
            worker.status = WorkerStatus::Unavailable;
            worker.tasks_in_progress = 0;
            worker.tasks_failed += 1;
            worker.last_activity_at = SystemTime::now();
            warn!(worker = id, "worker marked unavailable after crash");
        }
        self.publish_load();
    }

    /// Bring a crashed worker back. Busy and idle workers are left alone.
    pub fn reset(&self, id: &str) -> Result<(), PoolError> {
        let mut worker = self
            .workers
            .get_mut(id)
            .ok_or_else(|| PoolError::UnknownWorker(id.to_string()))?;

        if worker.status == WorkerStatus::Unavailable {
            worker.status = WorkerStatus::Idle;
            worker.last_activity_at = SystemTime::now();
            debug!(worker = id, "worker reset");
        }
        Ok(())
    }

    /// Whether any usable worker could ever take this kind of task.
    pub fn supports(&self, kind: TaskKind, requires_gpu: bool) -> bool {
        self.by_kind.get(&kind).map_or(false, |ids| {
            ids.iter().any(|id| {
                self.workers
                    .get(id)
                    .map_or(false, |w| w.eligible(requires_gpu))
            })
        })
    }

    /// Shortest expected run time among idle eligible workers; `None` when
    /// every eligible worker is busy.
    pub fn best_idle_estimate(&self, kind: TaskKind, requires_gpu: bool) -> Option<Duration> {
        self.by_kind.get(&kind)?
            .iter()
            .filter_map(|id| self.workers.get(id))
            .filter(|w| w.status == WorkerStatus::Idle && w.eligible(requires_gpu))
            .map(|w| w.average_task_time.unwrap_or_default())
            .min()
    }

    pub fn worker(&self, id: &str) -> Option<Worker> {
        self.workers.get(id).map(|w| w.value().clone())
    }

    /// Per-worker snapshot in construction order.
    pub fn stats(&self) -> Vec<Worker> {
        self.order
            .iter()
            .filter_map(|id| self.workers.get(id).map(|w| w.value().clone()))
            .collect()
    }

    pub fn busy_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Busy)
            .count()
    }

    pub fn total(&self) -> usize {
        self.order.len()
    }

    pub fn kinds(&self) -> impl Iterator<Item = TaskKind> + '_ {
        self.by_kind.keys().copied()
    }

    fn publish_load(&self) {
        gauge!("taskmesh.pool.busy_workers", self.busy_count() as f64);
    }
}

/// Exponentially weighted moving average step.
pub(crate) fn ewma(current: Duration, sample: Duration, alpha: f64) -> Duration {
    let next = alpha * sample.as_nanos() as f64 + (1.0 - alpha) * current.as_nanos() as f64;
    Duration::from_nanos(next.max(0.0).round() as u64)
}
