use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use metrics::gauge;
use uuid::Uuid;

use super::task::Task;
use crate::utils::error::TaskError;

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_queue_size: usize,
}

impl QueueConfig {
    pub fn new(max_queue_size: usize) -> Self {
        Self { max_queue_size }
    }
}

/// A queued task plus the arrival sequence used for FIFO tie-breaks.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub task: Arc<Task>,
    seq: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap: higher priority first, then earlier arrival
        self.task
            .priority()
            .cmp(&other.task.priority())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority-ordered holding area for tasks awaiting a worker.
///
/// Owned by the dispatch loop, so it carries no lock of its own.
#[derive(Debug)]
pub struct TaskQueue {
    heap: BinaryHeap<QueueEntry>,
    ids: HashSet<Uuid>,
    next_seq: u64,
    config: QueueConfig,
}

impl TaskQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            heap: BinaryHeap::new(),
            ids: HashSet::new(),
            next_seq: 0,
            config,
        }
    }

    /// Enqueue a new task
    pub fn push(&mut self, task: Arc<Task>) -> Result<(), TaskError> {
        if self.ids.len() >= self.config.max_queue_size {
            return Err(TaskError::unavailable(format!(
                "queue is full ({} tasks)",
                self.config.max_queue_size
            )));
        }

        if !self.ids.insert(task.id()) {
            return Err(TaskError::validation(format!("task {} is already queued", task.id())));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueueEntry { task, seq });

        gauge!("taskmesh.scheduler.tasks_queued", self.ids.len() as f64);
        Ok(())
    }

    /// Put back a task that already held a queue slot. Skips the capacity
    /// check; the task joins the back of its priority.
    pub fn readmit(&mut self, task: Arc<Task>) {
        if !self.ids.insert(task.id()) {
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueueEntry { task, seq });
        gauge!("taskmesh.scheduler.tasks_queued", self.ids.len() as f64);
    }

    /// Highest priority first; FIFO within a priority.
    pub fn pop(&mut self) -> Option<Arc<Task>> {
        let entry = self.heap.pop()?;
        self.ids.remove(&entry.task.id());
        gauge!("taskmesh.scheduler.tasks_queued", self.ids.len() as f64);
        Some(entry.task)
    }

    /// Take every entry out in dispatch order.
    ///
    /// Entries handed back through [`TaskQueue::restore`] keep their original
    /// position, so a task skipped because its worker kind is saturated is not
    /// overtaken by later arrivals of the same priority.
    pub fn drain_ordered(&mut self) -> Vec<QueueEntry> {
        let mut entries = Vec::with_capacity(self.heap.len());
        while let Some(entry) = self.heap.pop() {
            entries.push(entry);
        }
        self.ids.clear();
        entries
    }

    pub fn restore(&mut self, entries: impl IntoIterator<Item = QueueEntry>) {
        for entry in entries {
            if self.ids.insert(entry.task.id()) {
                self.heap.push(entry);
            }
        }
        gauge!("taskmesh.scheduler.tasks_queued", self.ids.len() as f64);
    }

    /// Remove a task that has not been dispatched yet.
    pub fn remove(&mut self, id: Uuid) -> Option<Arc<Task>> {
        if !self.ids.remove(&id) {
            return None;
        }

        let mut removed = None;
        self.heap.retain(|entry| {
            if entry.task.id() == id {
                removed = Some(Arc::clone(&entry.task));
                false
            } else {
                true
            }
        });

        gauge!("taskmesh.scheduler.tasks_queued", self.ids.len() as f64);
        removed
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Pending tasks in dispatch order.
    pub fn snapshot(&self) -> Vec<Arc<Task>> {
        let mut entries: Vec<&QueueEntry> = self.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| Arc::clone(&e.task)).collect()
    }
}
