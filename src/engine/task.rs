// src/engine/task.rs
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::serde_helpers::{duration_ms, option_duration_ms, option_system_time_serde, system_time_serde};
use crate::utils::error::TaskError;

pub type WorkerId = String;
pub type PeerId = String;

/// Deadline for tasks submitted without one and outside an [`Engine`](super::Engine).
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);

/// --------------------------------
/// Task Kind
/// --------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    Compute,
    Audio,
    AiInference,
    GpuCompute,
    FileProcessing,
    Crypto,
}

/// Display metadata for a kind, used by monitoring front-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindInfo {
    pub kind: TaskKind,
    pub name: &'static str,
    pub label: &'static str,
    pub icon: &'static str,
}

const KIND_TABLE: [KindInfo; 6] = [
    KindInfo { kind: TaskKind::Compute, name: "compute", label: "Compute", icon: "🧮" },
    KindInfo { kind: TaskKind::Audio, name: "audio", label: "Audio DSP", icon: "🎵" },
    KindInfo { kind: TaskKind::AiInference, name: "ai-inference", label: "AI Inference", icon: "🧠" },
    KindInfo { kind: TaskKind::GpuCompute, name: "gpu-compute", label: "GPU Compute", icon: "🎮" },
    KindInfo { kind: TaskKind::FileProcessing, name: "file-processing", label: "File Processing", icon: "📁" },
    KindInfo { kind: TaskKind::Crypto, name: "crypto", label: "Cryptography", icon: "🔐" },
];

impl TaskKind {
    pub const ALL: [TaskKind; 6] = [
        TaskKind::Compute,
        TaskKind::Audio,
        TaskKind::AiInference,
        TaskKind::GpuCompute,
        TaskKind::FileProcessing,
        TaskKind::Crypto,
    ];

    pub fn info(self) -> &'static KindInfo {
        // KIND_TABLE is ordered like the enum
        &KIND_TABLE[self as usize]
    }

    pub fn as_str(self) -> &'static str {
        self.info().name
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KIND_TABLE
            .iter()
            .find(|info| info.name == s)
            .map(|info| info.kind)
            .ok_or_else(|| TaskError::validation(format!("unrecognized task kind '{}'", s)))
    }
}

/// --------------------------------
/// Priority
/// --------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskPriority {
    Low = 1,
    Normal = 5,
    High = 10,
}

impl From<TaskPriority> for i32 {
    fn from(p: TaskPriority) -> Self {
        p as i32
    }
}

/// --------------------------------
/// Submission options
/// --------------------------------
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Higher runs sooner.
    pub priority: i32,
    /// `None` takes the engine's `default_timeout_ms`.
    #[serde(default, with = "option_duration_ms")]
    pub timeout: Option<Duration>,
    pub requires_gpu: bool,
    /// Permits offloading to a peer.
    pub distributed: bool,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            timeout: None,
            requires_gpu: false,
            distributed: false,
        }
    }
}

impl TaskOptions {
    pub fn with_priority(mut self, priority: impl Into<i32>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn requiring_gpu(mut self) -> Self {
        self.requires_gpu = true;
        self
    }

    pub fn distributed(mut self) -> Self {
        self.distributed = true;
        self
    }
}

/// --------------------------------
/// Task
/// --------------------------------

/// An immutable compute request. Runtime state lives in [`TaskExecution`].
///
/// Not `Clone`: an id names exactly one submission.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: Uuid,
    kind: TaskKind,
    payload: Value,
    options: TaskOptions,
}

impl Task {
    pub fn new(kind: TaskKind, payload: Value, options: TaskOptions) -> Result<Self, TaskError> {
        if options.timeout.map_or(false, |t| t.is_zero()) {
            return Err(TaskError::validation("timeout must be greater than zero"));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            options,
        })
    }

    /// Rebuild a task received over the wire, keeping its original id.
    pub(crate) fn restore(id: Uuid, kind: TaskKind, payload: Value, options: TaskOptions) -> Self {
        Self { id, kind, payload, options }
    }

    /// Same as [`Task::new`] with the kind given by its wire name.
    pub fn from_named(kind: &str, payload: Value, options: TaskOptions) -> Result<Self, TaskError> {
        Self::new(kind.parse()?, payload, options)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn priority(&self) -> i32 {
        self.options.priority
    }

    pub fn timeout(&self) -> Duration {
        self.options.timeout.unwrap_or(DEFAULT_TASK_TIMEOUT)
    }

    pub fn requires_gpu(&self) -> bool {
        self.options.requires_gpu
    }

    pub fn distributed(&self) -> bool {
        self.options.distributed
    }

    pub fn options(&self) -> &TaskOptions {
        &self.options
    }
}

/// --------------------------------
/// Execution record
/// --------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::TimedOut
                | ExecutionStatus::Cancelled
        )
    }
}

/// Where a task runs once it leaves the queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Binding {
    Worker(WorkerId),
    Peer(PeerId),
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Worker(id) => write!(f, "worker:{}", id),
            Binding::Peer(id) => write!(f, "peer:{}", id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task: Arc<Task>,
    pub status: ExecutionStatus,
    pub assigned_worker_id: Option<WorkerId>,
    pub assigned_peer_id: Option<PeerId>,
    #[serde(with = "system_time_serde")]
    pub submitted_at: SystemTime,
    #[serde(with = "option_system_time_serde")]
    pub started_at: Option<SystemTime>,
    #[serde(with = "option_system_time_serde")]
    pub completed_at: Option<SystemTime>,
    pub result: Option<Value>,
    pub error: Option<TaskError>,
}

impl TaskExecution {
    pub(crate) fn queued(task: Arc<Task>) -> Self {
        Self {
            task,
            status: ExecutionStatus::Queued,
            assigned_worker_id: None,
            assigned_peer_id: None,
            submitted_at: SystemTime::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.task.id()
    }

    pub fn binding(&self) -> Option<Binding> {
        match (&self.assigned_worker_id, &self.assigned_peer_id) {
            (Some(worker), _) => Some(Binding::Worker(worker.clone())),
            (None, Some(peer)) => Some(Binding::Peer(peer.clone())),
            (None, None) => None,
        }
    }

    pub(crate) fn assign(&mut self, binding: &Binding) {
        match binding {
            Binding::Worker(id) => self.assigned_worker_id = Some(id.clone()),
            Binding::Peer(id) => self.assigned_peer_id = Some(id.clone()),
        }
        self.status = ExecutionStatus::Assigned;
    }

    /// Back to the queue after a peer never received the task.
    pub(crate) fn requeue(&mut self) {
        self.status = ExecutionStatus::Queued;
        self.assigned_worker_id = None;
        self.assigned_peer_id = None;
        self.started_at = None;
    }

    pub(crate) fn start(&mut self) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(SystemTime::now());
    }

    pub(crate) fn finish(&mut self, status: ExecutionStatus, outcome: Result<Value, TaskError>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.completed_at = Some(SystemTime::now());
        match outcome {
            Ok(value) => self.result = Some(value),
            Err(err) => self.error = Some(err),
        }
    }

    /// Wall time between start and completion, if both happened.
    pub fn run_time(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.completed_at?);
        end.duration_since(start).ok()
    }
}

/// What a successful handle resolves to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub task_id: Uuid,
    pub result: Value,
    pub binding: Binding,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}
