use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::watch;

use super::task::{Task, TaskKind};

/// A domain-level failure reported by whatever ran the payload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ExecutorError {
    pub message: String,
}

impl ExecutorError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self { message: message.into() }
    }
}

/// Cooperative stop request handed to an executor with every task.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Pends forever if the sender
    /// is dropped without requesting it.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Runs a task payload. Implemented by the integration that owns the actual
/// matrix/inference/DSP code; the scheduler treats payload and result as
/// opaque values.
#[async_trait]
pub trait Executor: Send + Sync + std::fmt::Debug {
    async fn execute(&self, task: &Task, cancel: CancelSignal) -> Result<Value, ExecutorError>;
}

/// Stand-in executor for demos and pipeline benchmarks: sleeps for a
/// kind-dependent cost with some jitter and echoes the payload back.
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    scale: f64,
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self { scale: 1.0 }
    }
}

impl SimulatedExecutor {
    /// `scale` multiplies every simulated cost; 0.1 makes runs ten times faster.
    pub fn with_scale(scale: f64) -> Self {
        Self { scale: scale.max(0.0) }
    }

    fn base_cost(kind: TaskKind) -> Duration {
        match kind {
            TaskKind::Compute => Duration::from_millis(40),
            TaskKind::Audio => Duration::from_millis(25),
            TaskKind::AiInference => Duration::from_millis(80),
            TaskKind::GpuCompute => Duration::from_millis(60),
            TaskKind::FileProcessing => Duration::from_millis(30),
            TaskKind::Crypto => Duration::from_millis(20),
        }
    }
}

#[async_trait]
impl Executor for SimulatedExecutor {
    async fn execute(&self, task: &Task, mut cancel: CancelSignal) -> Result<Value, ExecutorError> {
        let base = Self::base_cost(task.kind()).as_millis() as u64;
        let jitter = rand::random::<u64>() % (base / 4 + 1);
        let cost = Duration::from_millis(((base + jitter) as f64 * self.scale) as u64);

        tokio::select! {
            _ = tokio::time::sleep(cost) => {}
            _ = cancel.cancelled() => {
                return Err(ExecutorError::new("cancelled before completion"));
            }
        }

        Ok(json!({
            "kind": task.kind(),
            "simulated_ms": cost.as_millis() as u64,
            "echo": task.payload(),
        }))
    }
}
