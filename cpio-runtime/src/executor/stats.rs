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

use std::sync::atomic::{AtomicU64, Ordering};

use super::Priority;

/// Executor counters, updated with relaxed atomics so that reading them
/// never blocks scheduling or execution.
#[derive(Debug, Default)]
pub struct ExecutorStats {
    executed: [AtomicU64; 3],
    queued: [AtomicU64; 3],
    delayed_pending: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PriorityCounts {
    pub urgent: u64,
    pub high: u64,
    pub normal: u64,
}

impl PriorityCounts {
    pub fn total(&self) -> u64 {
        self.urgent + self.high + self.normal
    }

    fn from_counters(counters: &[AtomicU64; 3]) -> Self {
        Self {
            urgent: counters[Priority::Urgent.index()].load(Ordering::Relaxed),
            high: counters[Priority::High.index()].load(Ordering::Relaxed),
            normal: counters[Priority::Normal.index()].load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecutorStatsSnapshot {
    pub tasks_executed: PriorityCounts,
    pub queue_depth: PriorityCounts,
    pub delayed_pending: u64,
}

impl ExecutorStats {
    pub fn record_executed(&self, priority: Priority) {
        self.executed[priority.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enqueued(&self, priority: Priority) {
        self.queued[priority.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dequeued(&self, priority: Priority) {
        self.queued[priority.index()].fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_delayed_added(&self) {
        self.delayed_pending.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delayed_removed(&self) {
        self.delayed_pending.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ExecutorStatsSnapshot {
        ExecutorStatsSnapshot {
            tasks_executed: PriorityCounts::from_counters(&self.executed),
            queue_depth: PriorityCounts::from_counters(&self.queued),
            delayed_pending: self.delayed_pending.load(Ordering::Relaxed),
        }
    }
}
