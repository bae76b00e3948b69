use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use super::CycleMode;

/// Priority levels for refresh triggers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum TaskPriority {
    /// Periodic timer ticks
    Background = 0,
    /// Archive change notifications
    #[default]
    Normal = 1,
    /// Explicit requests and retraining
    High = 2,
    /// Recovery after a failed or cancelled cycle, model migration
    Critical = 3,
}

/// A request to run one refresh cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTask {
    pub mode: CycleMode,
    pub priority: TaskPriority,
    pub created_at: u64, // Unix timestamp in seconds
    pub reason: String,
}

impl RefreshTask {
    pub fn new(mode: CycleMode, priority: TaskPriority, reason: impl Into<String>) -> Self {
        Self {
            mode,
            priority,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            reason: reason.into(),
        }
    }

    pub fn incremental(priority: TaskPriority, reason: impl Into<String>) -> Self {
        Self::new(CycleMode::Incremental, priority, reason)
    }

    pub fn full_rebuild(priority: TaskPriority, reason: impl Into<String>) -> Self {
        Self::new(CycleMode::FullRebuild, priority, reason)
    }

    /// Whether running `self` makes running `other` unnecessary.
    pub fn subsumes(&self, other: &RefreshTask) -> bool {
        self.mode == CycleMode::FullRebuild || other.mode == CycleMode::Incremental
    }

    pub fn description(&self) -> String {
        format!("{:?} ({:?}): {}", self.mode, self.priority, self.reason)
    }
}

/// Wrapper for priority queue ordering
#[derive(Debug)]
struct PriorityTask {
    task: RefreshTask,
    /// Submission order, earlier is better among equals
    sequence: u64,
}

impl PartialEq for PriorityTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PriorityTask {}

impl PartialOrd for PriorityTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Primary: task priority (higher is better)
        // Secondary: full rebuilds before incremental cycles
        // Tertiary: submission order (older is better)
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| self.task.mode.cmp(&other.task.mode))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Configuration for the task queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskQueueConfig {
    /// Maximum number of pending triggers
    pub max_queue_size: usize,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self { max_queue_size: 64 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskQueueError {
    #[error("refresh queue is full")]
    Full,
    #[error("refresh queue is closed")]
    Closed,
}

/// Priority queue of refresh triggers. Submissions go through a bounded
/// flume channel so they never block; the consumer drains the channel into
/// a heap and runs the best task. Queued tasks that the chosen task subsumes
/// are dropped.
pub struct TaskQueue {
    config: TaskQueueConfig,
    heap: Mutex<BinaryHeap<PriorityTask>>,
    sender: flume::Sender<RefreshTask>,
    receiver: flume::Receiver<RefreshTask>,
    sequence: AtomicU64,
    closed: AtomicBool,
}

impl TaskQueue {
    pub fn new(config: TaskQueueConfig) -> Self {
        let (sender, receiver) = flume::bounded(config.max_queue_size.max(1));
        Self {
            config,
            heap: Mutex::new(BinaryHeap::new()),
            sender,
            receiver,
            sequence: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &TaskQueueConfig {
        &self.config
    }

    pub fn submit(&self, task: RefreshTask) -> Result<(), TaskQueueError> {
        if self.closed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(TaskQueueError::Closed);
        }
        if self.len() >= self.config.max_queue_size.max(1) {
            warn!("Refresh queue is full, dropping task: {}", task.description());
            return Err(TaskQueueError::Full);
        }
        debug!("Submitting refresh task: {}", task.description());
        self.sender.try_send(task).map_err(|e| match e {
            flume::TrySendError::Full(_) => TaskQueueError::Full,
            flume::TrySendError::Disconnected(_) => TaskQueueError::Closed,
        })
    }

    /// Pop the best pending task, dropping the queued tasks it subsumes.
    pub fn pop(&self) -> Option<RefreshTask> {
        let mut heap = self.heap.lock().unwrap_or_else(PoisonError::into_inner);
        for task in self.receiver.try_iter() {
            let sequence = self
                .sequence
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            heap.push(PriorityTask { task, sequence });
        }
        let best = heap.pop()?.task;
        let before = heap.len();
        heap.retain(|pending| !best.subsumes(&pending.task));
        if heap.len() < before {
            debug!("Coalesced {} refresh tasks", before - heap.len());
        }
        Some(best)
    }

    /// Wait for the next task.
    pub async fn next(&self) -> Option<RefreshTask> {
        loop {
            if let Some(task) = self.pop() {
                return Some(task);
            }
            if self.is_closed() {
                return None;
            }
            let task = self.receiver.recv_async().await.ok()?;
            let sequence = self
                .sequence
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.heap
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(PriorityTask { task, sequence });
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner).len() + self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject further submissions. Pending tasks can still be popped.
    pub fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.receiver.drain().for_each(drop);
        debug!("Refresh queue cleared");
    }
}
