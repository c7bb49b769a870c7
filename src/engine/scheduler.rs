use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashSet;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::distribution::{OffloadError, OffloadTicket, PeerDistributor};
use super::executor::{CancelSignal, Executor};
use super::pool::{PoolError, RunOutcome, WorkerPool};
use super::queue::{QueueConfig, TaskQueue};
use super::stats::StatsAggregator;
use super::task::{Binding, ExecutionStatus, Task, TaskExecution, TaskOutput, WorkerId};
use crate::utils::error::TaskError;

/// Lifecycle notifications for monitoring collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "record")]
pub enum TaskEvent {
    #[serde(rename = "task:queued")]
    Queued(TaskExecution),
    #[serde(rename = "task:started")]
    Started(TaskExecution),
    /// Any terminal state; inspect `status`.
    #[serde(rename = "task:completed")]
    Completed(TaskExecution),
}

impl TaskEvent {
    pub fn execution(&self) -> &TaskExecution {
        match self {
            TaskEvent::Queued(e) | TaskEvent::Started(e) | TaskEvent::Completed(e) => e,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick: Duration,
    pub retention: Duration,
    pub max_queue_size: usize,
    pub event_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(250),
            retention: Duration::from_secs(300),
            max_queue_size: 10_000,
            event_buffer: 1024,
        }
    }
}

type Reply = oneshot::Sender<Result<TaskOutput, TaskError>>;

/// What the caller awaits after a successful submission.
#[derive(Debug)]
pub struct TaskHandle {
    id: Uuid,
    rx: oneshot::Receiver<Result<TaskOutput, TaskError>>,
}

impl TaskHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Suspends until the task is Completed, Failed, TimedOut or Cancelled.
    pub async fn wait(self) -> Result<TaskOutput, TaskError> {
        // a dropped reply means the dispatch loop is gone
        self.rx.await.unwrap_or(Err(TaskError::Cancelled))
    }
}

#[derive(Debug)]
enum Outcome {
    Success(Value),
    Failure(TaskError),
    Crashed(String),
    /// The assignment never reached the peer.
    Undelivered(String),
}

/// Admission state shared by `submit` and the dispatch loop, so a full
/// queue or a reused id is refused before anything is enqueued.
#[derive(Debug)]
struct Admission {
    capacity: usize,
    queued: AtomicUsize,
    /// Every id ever admitted. Ids are never reused, even after eviction.
    seen: DashSet<Uuid>,
}

impl Admission {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queued: AtomicUsize::new(0),
            seen: DashSet::new(),
        }
    }

    fn admit(&self, id: Uuid) -> Result<(), TaskError> {
        self.queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < self.capacity).then_some(n + 1))
            .map_err(|_| TaskError::unavailable(format!("queue is full ({} tasks)", self.capacity)))?;

        if !self.seen.insert(id) {
            self.leave(1);
            return Err(TaskError::validation(format!("task id {} already submitted", id)));
        }
        Ok(())
    }

    /// `n` tasks left the queue.
    fn leave(&self, n: usize) {
        if n > 0 {
            let _ = self
                .queued
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |q| Some(q.saturating_sub(n)));
        }
    }

    /// A task went back into the queue without a new admission.
    fn rejoin(&self) {
        self.queued.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
enum Command {
    Submit { task: Arc<Task>, reply: Reply },
    Cancel { id: Uuid, reply: oneshot::Sender<bool> },
    Finished { id: Uuid, outcome: Outcome },
    Deadline { id: Uuid },
    Inspect { id: Uuid, reply: oneshot::Sender<Option<TaskExecution>> },
    List { reply: oneshot::Sender<Vec<TaskExecution>> },
    Pending { reply: oneshot::Sender<Vec<Arc<Task>>> },
    Acknowledge { id: Uuid, reply: oneshot::Sender<bool> },
    Kick,
}

/// Front door of the dispatch loop.
///
/// Every decision about the queue, the execution table and worker/peer
/// bindings happens on one task fed by a command channel; executors run on
/// their own tasks and report back through the same channel.
#[derive(Debug)]
pub struct TaskScheduler {
    commands: mpsc::UnboundedSender<Command>,
    admission: Arc<Admission>,
    events: broadcast::Sender<TaskEvent>,
    shutdown_tx: watch::Sender<bool>,
}

impl TaskScheduler {
    pub fn new(
        pool: Arc<WorkerPool>,
        distributor: Option<Arc<PeerDistributor>>,
        stats: Arc<StatsAggregator>,
        executor: Arc<dyn Executor>,
        config: SchedulerConfig,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let admission = Arc::new(Admission::new(config.max_queue_size));

        let dispatch = DispatchLoop {
            queue: TaskQueue::new(QueueConfig::new(config.max_queue_size)),
            executions: HashMap::new(),
            running: HashMap::new(),
            waiters: HashMap::new(),
            local_only: HashSet::new(),
            pool,
            distributor,
            stats,
            executor,
            events: events.clone(),
            commands: commands.clone(),
            admission: Arc::clone(&admission),
            retention: config.retention,
        };

        tokio::spawn(dispatch.run(rx, shutdown_rx, config.tick));

        Self {
            commands,
            admission,
            events,
            shutdown_tx,
        }
    }

    /// Enqueue a validated task. Never blocks on the dispatch loop.
    ///
    /// A full queue or an id that was already submitted is refused here,
    /// before the task reaches the queue.
    pub fn submit(&self, task: Task) -> Result<TaskHandle, TaskError> {
        let id = task.id();
        self.admission.admit(id)?;

        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Submit { task: Arc::new(task), reply })
            .is_err()
        {
            self.admission.leave(1);
            return Err(TaskError::unavailable("scheduler is not running"));
        }

        counter!("taskmesh.scheduler.tasks_submitted_total", 1);
        Ok(TaskHandle { id, rx })
    }

    /// Best-effort cancellation. `true` when the request was accepted.
    pub async fn cancel(&self, id: Uuid) -> bool {
        self.request(|reply| Command::Cancel { id, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn execution(&self, id: Uuid) -> Option<TaskExecution> {
        self.request(|reply| Command::Inspect { id, reply })
            .await
            .flatten()
    }

    pub async fn executions(&self) -> Vec<TaskExecution> {
        self.request(|reply| Command::List { reply })
            .await
            .unwrap_or_default()
    }

    /// Queued tasks in dispatch order.
    pub async fn pending(&self) -> Vec<Arc<Task>> {
        self.request(|reply| Command::Pending { reply })
            .await
            .unwrap_or_default()
    }

    /// Drop a terminal record before its retention window runs out.
    pub async fn acknowledge(&self, id: Uuid) -> bool {
        self.request(|reply| Command::Acknowledge { id, reply })
            .await
            .unwrap_or(false)
    }

    /// Re-run dispatch now, e.g. after peer membership changed.
    pub fn kick(&self) {
        let _ = self.commands.send(Command::Kick);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_handle(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(make(reply)).ok()?;
        rx.await.ok()
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[derive(Debug)]
enum Route {
    Worker(WorkerId),
    Peer(OffloadTicket),
    Wait,
    Reject(TaskError),
}

#[derive(Debug)]
struct Running {
    binding: Binding,
    started: Instant,
    cancel_tx: Option<watch::Sender<bool>>,
    abort: AbortHandle,
    timer: JoinHandle<()>,
    cancel_requested: bool,
}

struct DispatchLoop {
    queue: TaskQueue,
    executions: HashMap<Uuid, TaskExecution>,
    running: HashMap<Uuid, Running>,
    waiters: HashMap<Uuid, Reply>,
    /// Tasks whose offload never reached the peer; they only run locally.
    local_only: HashSet<Uuid>,
    pool: Arc<WorkerPool>,
    distributor: Option<Arc<PeerDistributor>>,
    stats: Arc<StatsAggregator>,
    executor: Arc<dyn Executor>,
    events: broadcast::Sender<TaskEvent>,
    commands: mpsc::UnboundedSender<Command>,
    admission: Arc<Admission>,
    retention: Duration,
}

impl DispatchLoop {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Command>,
        mut shutdown_rx: watch::Receiver<bool>,
        tick: Duration,
    ) {
        info!(workers = self.pool.total(), "dispatch loop started");

        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                _ = interval.tick() => self.evict_expired(),
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        self.drain();
                        break;
                    }
                }
            }

            self.dispatch().await;
        }

        info!("dispatch loop stopped");
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Submit { task, reply } => self.enqueue(task, reply),
            Command::Cancel { id, reply } => {
                let accepted = self.cancel(id);
                let _ = reply.send(accepted);
            }
            Command::Finished { id, outcome } => self.complete(id, outcome).await,
            Command::Deadline { id } => self.expire(id).await,
            Command::Inspect { id, reply } => {
                let _ = reply.send(self.executions.get(&id).cloned());
            }
            Command::List { reply } => {
                let _ = reply.send(self.executions.values().cloned().collect());
            }
            Command::Pending { reply } => {
                let _ = reply.send(self.queue.snapshot());
            }
            Command::Acknowledge { id, reply } => {
                let terminal = self.executions.get(&id).map_or(false, |e| e.status.is_terminal());
                let removed = terminal && self.executions.remove(&id).is_some();
                let _ = reply.send(removed);
            }
            Command::Kick => {}
        }
    }

    fn enqueue(&mut self, task: Arc<Task>, reply: Reply) {
        let id = task.id();
        if let Err(e) = self.queue.push(Arc::clone(&task)) {
            self.admission.leave(1);
            warn!(task = %id, error = %e, "submission rejected");
            let _ = reply.send(Err(e));
            return;
        }

        let exec = TaskExecution::queued(task);
        debug!(task = %id, kind = %exec.task.kind(), priority = exec.task.priority(), "task queued");
        self.emit(TaskEvent::Queued(exec.clone()));
        self.executions.insert(id, exec);
        self.waiters.insert(id, reply);
    }

    /// One scheduling cycle over everything queued, in priority/FIFO order.
    async fn dispatch(&mut self) {
        if self.queue.is_empty() {
            return;
        }

        let entries = self.queue.drain_ordered();
        let drained = entries.len();
        let mut deferred = Vec::new();

        for entry in entries {
            let task = Arc::clone(&entry.task);
            match self.route(&task).await {
                Route::Worker(worker_id) => self.start_local(task, worker_id),
                Route::Peer(ticket) => self.start_remote(task, ticket),
                Route::Wait => deferred.push(entry),
                Route::Reject(err) => {
                    warn!(task = %task.id(), kind = %task.kind(), error = %err, "task rejected at dispatch");
                    self.finish(task.id(), ExecutionStatus::Failed, Err(err), Duration::ZERO);
                }
            }
        }

        self.admission.leave(drained - deferred.len());
        self.queue.restore(deferred);
    }

    async fn route(&self, task: &Task) -> Route {
        let kind = task.kind();
        let gpu = task.requires_gpu();

        if !self.pool.supports(kind, gpu) {
            // GPU work may always leave the host; everything else needs `distributed`
            if !(gpu || task.distributed()) {
                return Route::Reject(TaskError::unavailable(format!(
                    "no usable {}{} worker and offload is not permitted",
                    if gpu { "GPU-capable " } else { "" },
                    kind
                )));
            }
            let Some(distributor) = &self.distributor else {
                return Route::Reject(TaskError::unavailable(format!("no usable {} worker and no peers", kind)));
            };
            return match distributor.offload(task) {
                Ok(ticket) => Route::Peer(ticket),
                Err(e) => Route::Reject(e.into()),
            };
        }

        if task.distributed() && !self.local_only.contains(&task.id()) {
            if let Some(ticket) = self.try_faster_peer(task).await {
                return Route::Peer(ticket);
            }
        }

        match self.pool.acquire(kind, gpu) {
            Ok(worker_id) => Route::Worker(worker_id),
            Err(PoolError::Unavailable(_)) => Route::Wait,
            Err(e) => Route::Reject(TaskError::unavailable(e.to_string())),
        }
    }

    /// Offload when an idle peer is expected to finish sooner than the best
    /// idle local worker. With no idle worker, any idle peer wins.
    async fn try_faster_peer(&self, task: &Task) -> Option<OffloadTicket> {
        let distributor = self.distributor.as_ref()?;
        let peer = distributor.select_peer(task.kind(), true)?;

        let local = self.pool.best_idle_estimate(task.kind(), task.requires_gpu());
        let remote = peer.round_trip_estimate + self.stats.kind_average(task.kind()).await.unwrap_or_default();
        if matches!(local, Some(local) if remote >= local) {
            return None;
        }

        match distributor.offload_to(task, &peer) {
            Ok(ticket) => Some(ticket),
            Err(e) => {
                debug!(task = %task.id(), error = %e, "offload failed, falling back to local dispatch");
                None
            }
        }
    }

    fn start_local(&mut self, task: Arc<Task>, worker_id: WorkerId) {
        let id = task.id();
        let (cancel_tx, cancel) = CancelSignal::new();

        let executor = Arc::clone(&self.executor);
        let job_task = Arc::clone(&task);
        let job = tokio::spawn(async move { executor.execute(&job_task, cancel).await });
        let abort = job.abort_handle();

        let commands = self.commands.clone();
        tokio::spawn(async move {
            let outcome = match job.await {
                Ok(Ok(value)) => Outcome::Success(value),
                Ok(Err(e)) => Outcome::Failure(TaskError::Executor(e.message)),
                Err(join) if join.is_panic() => Outcome::Crashed(panic_message(join.into_panic())),
                // aborted after a timeout; the loop already settled the task
                Err(_) => return,
            };
            let _ = commands.send(Command::Finished { id, outcome });
        });

        counter!("taskmesh.scheduler.tasks_dispatched_total", 1, "route" => "local");
        self.mark_running(&task, Binding::Worker(worker_id), Some(cancel_tx), abort);
    }

    fn start_remote(&mut self, task: Arc<Task>, ticket: OffloadTicket) {
        let id = task.id();
        let binding = Binding::Peer(ticket.peer_id.clone());

        let commands = self.commands.clone();
        let watcher = tokio::spawn(async move {
            let outcome = match ticket.result().await {
                Ok(value) => Outcome::Success(value),
                Err(OffloadError::OffloadFailed(reason)) => Outcome::Undelivered(reason),
                Err(e) => Outcome::Failure(e.into()),
            };
            let _ = commands.send(Command::Finished { id, outcome });
        });

        counter!("taskmesh.scheduler.tasks_dispatched_total", 1, "route" => "peer");
        self.mark_running(&task, binding, None, watcher.abort_handle());
    }

    fn mark_running(
        &mut self,
        task: &Task,
        binding: Binding,
        cancel_tx: Option<watch::Sender<bool>>,
        abort: AbortHandle,
    ) {
        let id = task.id();
        let timer = {
            let commands = self.commands.clone();
            let timeout = task.timeout();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = commands.send(Command::Deadline { id });
            })
        };

        if let Some(exec) = self.executions.get_mut(&id) {
            exec.assign(&binding);
            exec.start();
            let snapshot = exec.clone();
            info!(task = %id, kind = %task.kind(), %binding, "task started");
            self.emit(TaskEvent::Started(snapshot));
        }

        self.running.insert(
            id,
            Running {
                binding,
                started: Instant::now(),
                cancel_tx,
                abort,
                timer,
                cancel_requested: false,
            },
        );
    }

    async fn complete(&mut self, id: Uuid, outcome: Outcome) {
        let Some(run) = self.running.remove(&id) else {
            debug!(task = %id, "late executor result discarded");
            return;
        };
        run.timer.abort();

        let elapsed = run.started.elapsed();
        let Some(kind) = self.executions.get(&id).map(|e| e.task.kind()) else {
            return;
        };

        if run.cancel_requested {
            match (&run.binding, &outcome) {
                (Binding::Worker(worker), Outcome::Crashed(_)) => self.pool.mark_crashed(worker),
                (Binding::Worker(worker), _) => self.pool.release(worker, RunOutcome::Cancelled),
                (Binding::Peer(_), _) => {}
            }
            self.finish(id, ExecutionStatus::Cancelled, Err(TaskError::Cancelled), elapsed);
            return;
        }

        match outcome {
            Outcome::Success(value) => {
                if let Binding::Worker(worker) = &run.binding {
                    self.pool.release(worker, RunOutcome::Succeeded(elapsed));
                }
                self.stats.record_completion(kind, elapsed, true).await;
                self.finish(id, ExecutionStatus::Completed, Ok(value), elapsed);
            }
            Outcome::Failure(err) => {
                if let Binding::Worker(worker) = &run.binding {
                    self.pool.release(worker, RunOutcome::Failed);
                }
                self.stats.record_completion(kind, elapsed, false).await;
                self.finish(id, ExecutionStatus::Failed, Err(err), elapsed);
            }
            Outcome::Crashed(message) => {
                error!(task = %id, binding = %run.binding, %message, "executor crashed");
                if let Binding::Worker(worker) = &run.binding {
                    self.pool.mark_crashed(worker);
                }
                self.stats.record_completion(kind, elapsed, false).await;
                self.finish(
                    id,
                    ExecutionStatus::Failed,
                    Err(TaskError::executor(format!("worker crashed: {}", message))),
                    elapsed,
                );
            }
            Outcome::Undelivered(reason) => self.undelivered(id, reason),
        }
    }

    /// The peer never got the task. Local workers take it back when they
    /// can; otherwise it fails like any other unavailable resource.
    fn undelivered(&mut self, id: Uuid, reason: String) {
        let Some(task) = self.executions.get(&id).map(|e| Arc::clone(&e.task)) else {
            return;
        };

        if !self.pool.supports(task.kind(), task.requires_gpu()) {
            warn!(task = %id, %reason, "offload not delivered and no local worker can run the task");
            self.finish(
                id,
                ExecutionStatus::Failed,
                Err(TaskError::unavailable(format!("offload failed: {}", reason))),
                Duration::ZERO,
            );
            return;
        }

        info!(task = %id, %reason, "offload not delivered, task back in the queue");
        self.local_only.insert(id);
        self.queue.readmit(task);
        self.admission.rejoin();
        if let Some(exec) = self.executions.get_mut(&id) {
            exec.requeue();
            let snapshot = exec.clone();
            self.emit(TaskEvent::Queued(snapshot));
        }
    }

    async fn expire(&mut self, id: Uuid) {
        let Some(run) = self.running.remove(&id) else {
            return;
        };
        let Some(task) = self.executions.get(&id).map(|e| Arc::clone(&e.task)) else {
            return;
        };

        if let Some(cancel_tx) = &run.cancel_tx {
            let _ = cancel_tx.send(true);
        }
        run.abort.abort();

        match &run.binding {
            Binding::Worker(worker) => self.pool.release(worker, RunOutcome::Failed),
            Binding::Peer(_) => {
                if let Some(distributor) = &self.distributor {
                    distributor.abandon(id);
                }
            }
        }

        let elapsed = run.started.elapsed();
        let timeout_ms = task.timeout().as_millis() as u64;
        warn!(task = %id, binding = %run.binding, timeout_ms, "task timed out");
        self.stats.record_completion(task.kind(), elapsed, false).await;
        self.finish(id, ExecutionStatus::TimedOut, Err(TaskError::Timeout(task.timeout())), elapsed);
    }

    fn cancel(&mut self, id: Uuid) -> bool {
        if self.queue.remove(id).is_some() {
            self.admission.leave(1);
            info!(task = %id, "queued task cancelled");
            self.finish(id, ExecutionStatus::Cancelled, Err(TaskError::Cancelled), Duration::ZERO);
            return true;
        }

        let Some(run) = self.running.get_mut(&id) else {
            return false;
        };
        if run.cancel_requested {
            return true;
        }
        run.cancel_requested = true;

        // the record turns Cancelled once the executor reports back
        match &run.binding {
            Binding::Worker(_) => {
                if let Some(cancel_tx) = &run.cancel_tx {
                    let _ = cancel_tx.send(true);
                }
            }
            Binding::Peer(_) => {
                if let Some(distributor) = &self.distributor {
                    distributor.abandon(id);
                }
            }
        }

        info!(task = %id, "cancellation requested for running task");
        true
    }

    /// Settle a record, resolve its waiter and announce it.
    fn finish(&mut self, id: Uuid, status: ExecutionStatus, outcome: Result<Value, TaskError>, duration: Duration) {
        self.local_only.remove(&id);
        let Some(exec) = self.executions.get_mut(&id) else {
            return;
        };
        exec.finish(status, outcome.clone());
        let snapshot = exec.clone();

        match status {
            ExecutionStatus::Completed => {
                counter!("taskmesh.scheduler.tasks_completed_total", 1);
                histogram!("taskmesh.scheduler.task_duration_ms", duration.as_secs_f64() * 1000.0);
            }
            ExecutionStatus::Failed => counter!("taskmesh.scheduler.tasks_failed_total", 1),
            ExecutionStatus::TimedOut => counter!("taskmesh.scheduler.tasks_timed_out_total", 1),
            ExecutionStatus::Cancelled => counter!("taskmesh.scheduler.tasks_cancelled_total", 1),
            _ => {}
        }

        if let Some(reply) = self.waiters.remove(&id) {
            let resolved = match (outcome, snapshot.binding()) {
                (Ok(result), Some(binding)) => Ok(TaskOutput {
                    task_id: id,
                    result,
                    binding,
                    duration,
                }),
                (Ok(_), None) => Err(TaskError::executor("completed without an executor binding")),
                (Err(e), _) => Err(e),
            };
            let _ = reply.send(resolved);
        }

        self.emit(TaskEvent::Completed(snapshot));
    }

    fn evict_expired(&mut self) {
        let Some(cutoff) = SystemTime::now().checked_sub(self.retention) else {
            return;
        };
        let before = self.executions.len();
        self.executions.retain(|_, exec| {
            !(exec.status.is_terminal() && exec.completed_at.map_or(false, |at| at < cutoff))
        });

        let evicted = before - self.executions.len();
        if evicted > 0 {
            debug!(evicted, "expired execution records evicted");
        }
    }

    /// Shutdown: nothing queued or running survives the loop.
    fn drain(&mut self) {
        let queued = self.queue.drain_ordered();
        self.admission.leave(queued.len());
        for entry in queued {
            self.finish(entry.task.id(), ExecutionStatus::Cancelled, Err(TaskError::Cancelled), Duration::ZERO);
        }

        let running: Vec<(Uuid, Running)> = self.running.drain().collect();
        for (id, run) in running {
            run.timer.abort();
            if let Some(cancel_tx) = &run.cancel_tx {
                let _ = cancel_tx.send(true);
            }
            run.abort.abort();
            match &run.binding {
                Binding::Worker(worker) => self.pool.release(worker, RunOutcome::Cancelled),
                Binding::Peer(_) => {
                    if let Some(distributor) = &self.distributor {
                        distributor.abandon(id);
                    }
                }
            }
            self.finish(id, ExecutionStatus::Cancelled, Err(TaskError::Cancelled), run.started.elapsed());
        }
    }

    fn emit(&self, event: TaskEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "executor panicked".to_string()
    }
}
