use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::scheduler::TaskScheduler;
use super::task::{Task, TaskKind, TaskOptions, TaskPriority};
use crate::utils::error::TaskError;

/// One benchmark task description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkSpec {
    pub name: String,
    pub kind: TaskKind,
    pub payload: Value,
    #[serde(default)]
    pub options: TaskOptions,
}

impl BenchmarkSpec {
    pub fn new(name: impl Into<String>, kind: TaskKind, payload: Value) -> Self {
        Self {
            name: name.into(),
            kind,
            payload,
            options: TaskOptions::default().with_priority(TaskPriority::Normal),
        }
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone)]
pub struct BenchmarkResult {
    pub name: String,
    pub kind: TaskKind,
    /// Submit-to-resolution wall time, or the error the handle resolved with.
    pub outcome: Result<Duration, TaskError>,
}

#[derive(Debug, Clone, Default)]
pub struct BenchmarkReport {
    pub results: Vec<BenchmarkResult>,
    pub total: Duration,
}

impl BenchmarkReport {
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.passed()
    }
}

/// Runs benchmark tasks one after another through the live scheduler.
#[derive(Debug, Clone)]
pub struct BenchmarkRunner {
    scheduler: Arc<TaskScheduler>,
}

impl BenchmarkRunner {
    pub fn new(scheduler: Arc<TaskScheduler>) -> Self {
        Self { scheduler }
    }

    /// One representative task per kind.
    pub fn standard_set() -> Vec<BenchmarkSpec> {
        vec![
            BenchmarkSpec::new("matrix-multiply", TaskKind::Compute, json!({ "op": "matmul", "size": 256 })),
            BenchmarkSpec::new(
                "audio-fft",
                TaskKind::Audio,
                json!({ "op": "fft", "samples": 44_100, "window": "hann" }),
            ),
            BenchmarkSpec::new(
                "inference",
                TaskKind::AiInference,
                json!({ "op": "classify", "model": "mobilenet-v2", "batch": 8 }),
            ),
            BenchmarkSpec::new(
                "gpu-reduction",
                TaskKind::GpuCompute,
                json!({ "op": "reduce-sum", "elements": 1_048_576 }),
            )
            .with_options(
                TaskOptions::default()
                    .with_priority(TaskPriority::Normal)
                    .requiring_gpu(),
            ),
            BenchmarkSpec::new(
                "file-hashing",
                TaskKind::FileProcessing,
                json!({ "op": "hash", "bytes": 8 * 1024 * 1024 }),
            ),
            BenchmarkSpec::new("sha256-chain", TaskKind::Crypto, json!({ "op": "sha256", "rounds": 10_000 })),
        ]
    }

    /// Sequential; a failing item is recorded and the run continues.
    pub async fn run(&self, specs: &[BenchmarkSpec]) -> BenchmarkReport {
        let started = Instant::now();
        let mut results = Vec::with_capacity(specs.len());

        for spec in specs {
            let outcome = self.run_one(spec).await;
            match &outcome {
                Ok(elapsed) => info!(benchmark = %spec.name, kind = %spec.kind, elapsed_ms = elapsed.as_millis() as u64, "benchmark passed"),
                Err(e) => warn!(benchmark = %spec.name, kind = %spec.kind, error = %e, "benchmark failed"),
            }
            results.push(BenchmarkResult {
                name: spec.name.clone(),
                kind: spec.kind,
                outcome,
            });
        }

        BenchmarkReport {
            results,
            total: started.elapsed(),
        }
    }

    async fn run_one(&self, spec: &BenchmarkSpec) -> Result<Duration, TaskError> {
        let task = Task::new(spec.kind, spec.payload.clone(), spec.options.clone())?;
        let started = Instant::now();
        let handle = self.scheduler.submit(task)?;
        handle.wait().await?;
        Ok(started.elapsed())
    }
}
