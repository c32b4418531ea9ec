// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

mod stats;

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use stats::{ExecutorStats, ExecutorStatsSnapshot, PriorityCounts};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    High,
    Normal,
}

impl Priority {
    pub(crate) fn index(&self) -> usize {
        match self {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Normal => 2,
        }
    }

    fn from_index(index: usize) -> Priority {
        match index {
            0 => Priority::Urgent,
            1 => Priority::High,
            _ => Priority::Normal,
        }
    }
}

/// Placement hint for a scheduled task. `CallerWorker` asks for the task to
/// run on the worker that scheduled it, which can help cache locality when
/// tasks chain; it is honored best-effort and never affects correctness.
/// With the shared per-priority queues any worker may pick the task up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Affinity {
    #[default]
    Any,
    CallerWorker,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("the {0:?} queue is at capacity")]
    QueueFull(Priority),
    #[error("the executor is stopped")]
    ShuttingDown,
    #[error("executor shutdown failed: {0}")]
    StopFailed(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub worker_count: usize,
    /// Capacity of each priority queue.
    pub queue_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 1024,
        }
    }
}

const STATE_RUNNING: u8 = 0;
const STATE_STOPPING: u8 = 1;

struct QueuedTask {
    future: BoxFuture<'static, ()>,
    cancelled: Option<Arc<AtomicBool>>,
}

impl QueuedTask {
    fn is_cancelled(&self) -> bool {
        self.cancelled
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }
}

struct DelayedTask {
    run_at: Instant,
    seq: u64,
    priority: Priority,
    task: QueuedTask,
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.seq == other.seq
    }
}

impl Eq for DelayedTask {}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline is on top
        other
            .run_at
            .cmp(&self.run_at)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Cancels a delayed task as long as it has not started running; cancelling
/// after that is a no-op.
#[derive(Clone)]
pub struct ScheduledTaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledTaskHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

struct ExecutorShared {
    queues: [Mutex<VecDeque<QueuedTask>>; 3],
    items: Semaphore,
    state: AtomicU8,
    queue_capacity: usize,
    stats: ExecutorStats,
}

impl ExecutorShared {
    fn pop_task(&self) -> Option<(Priority, QueuedTask)> {
        for index in 0..3 {
            let mut queue = self.queues[index].lock().unwrap();
            if let Some(task) = queue.pop_front() {
                let priority = Priority::from_index(index);
                self.stats.record_dequeued(priority);
                return Some((priority, task));
            }
        }
        None
    }

    fn enqueue(&self, priority: Priority, task: QueuedTask) -> Result<(), ExecutorError> {
        if self.state.load(Ordering::Acquire) != STATE_RUNNING {
            return Err(ExecutorError::ShuttingDown);
        }
        {
            let mut queue = self.queues[priority.index()].lock().unwrap();
            if queue.len() >= self.queue_capacity {
                return Err(ExecutorError::QueueFull(priority));
            }
            queue.push_back(task);
        }
        self.stats.record_enqueued(priority);
        self.items.add_permits(1);
        Ok(())
    }
}

struct Timer {
    heap: Mutex<BinaryHeap<DelayedTask>>,
    changed: Notify,
    seq: AtomicU64,
}

/// Bounded worker pool with urgent/high/normal lanes and support for
/// scheduled-for-time tasks.
///
/// Workers always drain urgent before high before normal; within a lane
/// tasks run in submission order. A dedicated ticker task moves due delayed
/// tasks into the lanes.
pub struct PriorityExecutor {
    shared: Arc<ExecutorShared>,
    timer: Arc<Timer>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl PriorityExecutor {
    /// Creates the executor and spawns its workers and ticker. Must be
    /// called from within a tokio runtime.
    pub fn new(config: &ExecutorConfig) -> Arc<PriorityExecutor> {
        let shared = Arc::new(ExecutorShared {
            queues: [
                Mutex::new(VecDeque::new()),
                Mutex::new(VecDeque::new()),
                Mutex::new(VecDeque::new()),
            ],
            items: Semaphore::new(0),
            state: AtomicU8::new(STATE_RUNNING),
            queue_capacity: config.queue_capacity,
            stats: ExecutorStats::default(),
        });
        let timer = Arc::new(Timer {
            heap: Mutex::new(BinaryHeap::new()),
            changed: Notify::new(),
            seq: AtomicU64::new(0),
        });
        let shutdown = CancellationToken::new();

        let workers = (0..config.worker_count.max(1))
            .map(|_| {
                let shared = shared.clone();
                tokio::spawn(Self::worker_loop(shared))
            })
            .collect();
        let ticker = {
            let shared = shared.clone();
            let timer = timer.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(Self::ticker_loop(shared, timer, shutdown))
        };

        Arc::new(PriorityExecutor {
            shared,
            timer,
            workers: Mutex::new(workers),
            ticker: Mutex::new(Some(ticker)),
            shutdown,
        })
    }

    /// Enqueues a task at the given priority. Fails only when the target
    /// queue is at capacity or the executor is stopped.
    pub fn schedule<F>(&self, priority: Priority, task: F) -> Result<(), ExecutorError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.schedule_with_affinity(priority, Affinity::Any, task)
    }

    pub fn schedule_with_affinity<F>(
        &self,
        priority: Priority,
        _affinity: Affinity,
        task: F,
    ) -> Result<(), ExecutorError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shared.enqueue(
            priority,
            QueuedTask {
                future: Box::pin(task),
                cancelled: None,
            },
        )
    }

    /// Enqueues a task that becomes runnable at `run_at`. The returned
    /// handle cancels it as long as it has not started.
    pub fn schedule_at<F>(
        &self,
        priority: Priority,
        run_at: Instant,
        task: F,
    ) -> Result<ScheduledTaskHandle, ExecutorError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shared.state.load(Ordering::Acquire) != STATE_RUNNING {
            return Err(ExecutorError::ShuttingDown);
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        let delayed = DelayedTask {
            run_at,
            seq: self.timer.seq.fetch_add(1, Ordering::Relaxed),
            priority,
            task: QueuedTask {
                future: Box::pin(task),
                cancelled: Some(cancelled.clone()),
            },
        };
        self.timer.heap.lock().unwrap().push(delayed);
        self.shared.stats.record_delayed_added();
        self.timer.changed.notify_one();
        Ok(ScheduledTaskHandle { cancelled })
    }

    pub fn schedule_in<F>(
        &self,
        priority: Priority,
        delay: Duration,
        task: F,
    ) -> Result<ScheduledTaskHandle, ExecutorError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.schedule_at(priority, Instant::now() + delay, task)
    }

    pub fn stats(&self) -> ExecutorStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Stops the executor. With `drop_pending` the queued tasks are
    /// discarded, otherwise they are drained first; tasks already running
    /// always complete. Not-yet-due delayed tasks are dropped in both modes.
    /// Fails when a worker or the ticker did not shut down cleanly (it
    /// panicked or was aborted); the queues are torn down regardless.
    pub async fn stop(&self, drop_pending: bool) -> Result<(), ExecutorError> {
        let mut first_failure = None;
        self.shared.state.store(STATE_STOPPING, Ordering::Release);

        self.shutdown.cancel();
        self.timer.changed.notify_one();
        let ticker = self.ticker.lock().unwrap().take();
        if let Some(ticker) = ticker {
            if let Err(error) = ticker.await {
                first_failure.get_or_insert(format!("ticker task failed: {error}"));
            }
        }
        let dropped_delayed = {
            let mut heap = self.timer.heap.lock().unwrap();
            let dropped = heap.len();
            heap.clear();
            dropped
        };
        for _ in 0..dropped_delayed {
            self.shared.stats.record_delayed_removed();
        }

        if drop_pending {
            for index in 0..3 {
                let dropped: Vec<_> = {
                    let mut queue = self.shared.queues[index].lock().unwrap();
                    queue.drain(..).collect()
                };
                for _ in &dropped {
                    self.shared.stats.record_dequeued(Priority::from_index(index));
                }
                if !dropped.is_empty() {
                    debug!(
                        priority = ?Priority::from_index(index),
                        count = dropped.len(),
                        "dropping pending executor tasks"
                    );
                }
            }
        }

        self.shared.items.close();
        let workers = {
            let mut workers = self.workers.lock().unwrap();
            std::mem::take(&mut *workers)
        };
        for worker in workers {
            if let Err(error) = worker.await {
                first_failure.get_or_insert(format!("worker task failed: {error}"));
            }
        }

        match first_failure {
            Some(failure) => Err(ExecutorError::StopFailed(failure)),
            None => Ok(()),
        }
    }

    async fn worker_loop(shared: Arc<ExecutorShared>) {
        loop {
            match shared.items.acquire().await {
                Ok(permit) => {
                    permit.forget();
                    if let Some((priority, task)) = shared.pop_task() {
                        Self::run_task(&shared, priority, task).await;
                    }
                }
                Err(_) => {
                    // Semaphore closed: stop was requested. Whatever is
                    // still queued at this point is meant to be drained.
                    while let Some((priority, task)) = shared.pop_task() {
                        Self::run_task(&shared, priority, task).await;
                    }
                    break;
                }
            }
        }
    }

    async fn run_task(shared: &ExecutorShared, priority: Priority, task: QueuedTask) {
        if task.is_cancelled() {
            return;
        }
        task.future.await;
        shared.stats.record_executed(priority);
    }

    async fn ticker_loop(
        shared: Arc<ExecutorShared>,
        timer: Arc<Timer>,
        shutdown: CancellationToken,
    ) {
        loop {
            let next_due = timer.heap.lock().unwrap().peek().map(|task| task.run_at);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.changed.notified() => {}
                _ = async {
                    match next_due {
                        Some(run_at) => tokio::time::sleep_until(run_at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    let now = Instant::now();
                    loop {
                        let due = {
                            let mut heap = timer.heap.lock().unwrap();
                            match heap.peek() {
                                Some(task) if task.run_at <= now => heap.pop(),
                                _ => None,
                            }
                        };
                        let Some(due) = due else { break };
                        shared.stats.record_delayed_removed();
                        if due.task.is_cancelled() {
                            continue;
                        }
                        if let Err(error) = shared.enqueue(due.priority, due.task) {
                            warn!(%error, "failed to enqueue a due delayed task");
                        }
                    }
                }
            }
        }
    }
}
