pub mod benchmark;
pub mod config;
pub mod distribution;
pub mod executor;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod serde_helpers;
pub mod stats;
pub mod task;

pub use benchmark::{BenchmarkReport, BenchmarkResult, BenchmarkRunner, BenchmarkSpec};
pub use config::{ConfigError, EngineConfig};
pub use distribution::{OffloadError, OffloadTicket, PeerDistributor};
pub use executor::{CancelSignal, Executor, ExecutorError, SimulatedExecutor};
pub use pool::{PoolError, RunOutcome, Worker, WorkerPool, WorkerSpec, WorkerStatus};
pub use queue::{QueueConfig, QueueEntry, TaskQueue};
pub use scheduler::{SchedulerConfig, TaskEvent, TaskHandle, TaskScheduler};
pub use stats::{KindBreakdown, StatsAggregator, StatsSnapshot};
pub use task::{
    Binding, ExecutionStatus, KindInfo, Task, TaskExecution, TaskKind, TaskOptions, TaskOutput, TaskPriority,
    DEFAULT_TASK_TIMEOUT,
};

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::node::{PeerRegistry, PeerTransport};
use crate::utils::error::TaskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Init,
    Running,
    Draining,
    Stopped,
}

/// Main Engine struct
///
/// Owns the worker pool, stats, the dispatch loop and, when peers are
/// configured, the distributor. Must be constructed inside a Tokio runtime.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    pool: Arc<WorkerPool>,
    stats: Arc<StatsAggregator>,
    scheduler: Arc<TaskScheduler>,
    distributor: Option<Arc<PeerDistributor>>,
    state: Arc<RwLock<EngineState>>,
    listeners: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Local-only engine: tasks never leave this host.
    pub fn new(config: EngineConfig, executor: Arc<dyn Executor>) -> Self {
        Self::build(config, executor, None)
    }

    /// Engine that may offload to peers known to `registry` over `transport`.
    pub fn with_peers(
        config: EngineConfig,
        executor: Arc<dyn Executor>,
        registry: Arc<PeerRegistry>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        let distributor = PeerDistributor::new(registry, transport);
        Self::build(config, executor, Some(distributor))
    }

    fn build(config: EngineConfig, executor: Arc<dyn Executor>, distributor: Option<Arc<PeerDistributor>>) -> Self {
        let pool = Arc::new(WorkerPool::new(&config.pool, config.latency_smoothing));
        let stats = Arc::new(StatsAggregator::new(config.latency_smoothing));

        let scheduler = Arc::new(TaskScheduler::new(
            Arc::clone(&pool),
            distributor.clone(),
            Arc::clone(&stats),
            executor,
            config.scheduler_config(),
        ));

        let listeners = distributor
            .as_ref()
            .map(|d| d.spawn_listeners(scheduler.shutdown_handle()))
            .unwrap_or_default();

        info!(
            workers = pool.total(),
            peers_enabled = distributor.is_some(),
            "engine started"
        );

        Self {
            config,
            pool,
            stats,
            scheduler,
            distributor,
            state: Arc::new(RwLock::new(EngineState::Running)),
            listeners,
        }
    }

    /// Validate and enqueue. Options without a timeout get the configured
    /// `default_timeout_ms`.
    pub fn submit_task(&self, kind: TaskKind, payload: Value, mut options: TaskOptions) -> Result<TaskHandle, TaskError> {
        options.timeout.get_or_insert_with(|| self.config.default_timeout());
        let task = Task::new(kind, payload, options)?;
        self.scheduler.submit(task)
    }

    /// Same as [`Engine::submit_task`] with the kind given by its wire name.
    pub fn submit_named(&self, kind: &str, payload: Value, options: TaskOptions) -> Result<TaskHandle, TaskError> {
        self.submit_task(kind.parse()?, payload, options)
    }

    pub async fn get_stats(&self) -> StatsSnapshot {
        self.stats.snapshot(&self.pool).await
    }

    pub async fn cancel_task(&self, id: Uuid) -> bool {
        self.scheduler.cancel(id).await
    }

    pub async fn execution(&self, id: Uuid) -> Option<TaskExecution> {
        self.scheduler.execution(id).await
    }

    pub async fn pending_tasks(&self) -> Vec<Arc<Task>> {
        self.scheduler.pending().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.scheduler.subscribe()
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn peers(&self) -> Option<&Arc<PeerRegistry>> {
        self.distributor.as_ref().map(|d| d.registry())
    }

    pub fn distributor(&self) -> Option<&Arc<PeerDistributor>> {
        self.distributor.as_ref()
    }

    pub fn benchmark_runner(&self) -> BenchmarkRunner {
        BenchmarkRunner::new(Arc::clone(&self.scheduler))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    async fn set_state(&self, new_state: EngineState) {
        let mut state = self.state.write().await;
        info!(from = ?*state, to = ?new_state, "engine state changed");
        *state = new_state;
    }

    /// Stop dispatching. Queued and running tasks resolve `Cancelled`.
    pub async fn shutdown(&self) {
        if self.state().await == EngineState::Stopped {
            return;
        }
        self.set_state(EngineState::Draining).await;
        self.scheduler.shutdown();

        for listener in &self.listeners {
            listener.abort();
        }

        self.set_state(EngineState::Stopped).await;
        info!("engine stopped");
    }
}
