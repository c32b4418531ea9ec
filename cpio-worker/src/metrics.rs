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

use prometheus::{IntGaugeVec, Opts, Registry, TextEncoder};

use cpio_runtime::executor::ExecutorStatsSnapshot;

/// Creates the worker's metrics registry. Lifecycle metrics register into it
/// during bootstrap; process-wide counters (retries of external calls) live
/// in the prometheus default registry and are merged at scrape time.
pub fn register_all() -> Registry {
    Registry::new()
}

#[derive(Clone)]
pub struct ExecutorMetrics {
    queue_depth: IntGaugeVec,
    tasks_executed: IntGaugeVec,
    delayed_pending: IntGaugeVec,
}

impl ExecutorMetrics {
    pub fn register(registry: &Registry) -> prometheus::Result<ExecutorMetrics> {
        let queue_depth = IntGaugeVec::new(
            Opts::new("executor_queue_depth", "Tasks waiting per priority lane"),
            &["priority"],
        )?;
        let tasks_executed = IntGaugeVec::new(
            Opts::new(
                "executor_tasks_executed",
                "Tasks executed per priority lane since startup",
            ),
            &["priority"],
        )?;
        let delayed_pending = IntGaugeVec::new(
            Opts::new(
                "executor_delayed_pending",
                "Scheduled-for-time tasks not yet due",
            ),
            &["priority"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(tasks_executed.clone()))?;
        registry.register(Box::new(delayed_pending.clone()))?;
        Ok(ExecutorMetrics {
            queue_depth,
            tasks_executed,
            delayed_pending,
        })
    }

    /// Refreshes the gauges from an executor snapshot; called on scrape.
    pub fn update(&self, snapshot: &ExecutorStatsSnapshot) {
        for (priority, depth, executed) in [
            ("urgent", snapshot.queue_depth.urgent, snapshot.tasks_executed.urgent),
            ("high", snapshot.queue_depth.high, snapshot.tasks_executed.high),
            ("normal", snapshot.queue_depth.normal, snapshot.tasks_executed.normal),
        ] {
            self.queue_depth
                .with_label_values(&[priority])
                .set(depth as i64);
            self.tasks_executed
                .with_label_values(&[priority])
                .set(executed as i64);
        }
        self.delayed_pending
            .with_label_values(&["all"])
            .set(snapshot.delayed_pending as i64);
    }
}

/// Renders the worker registry merged with the process-default registry.
pub fn render(registry: &Registry) -> String {
    let mut families = registry.gather();
    families.extend(prometheus::gather());
    TextEncoder::new()
        .encode_to_string(&families)
        .unwrap_or_else(|err| format!("# failed to encode metrics: {err}\n"))
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use cpio_runtime::executor::{ExecutorConfig, PriorityExecutor};

    use super::*;

    #[test]
    async fn executor_gauges_follow_the_snapshot() {
        let registry = Registry::new();
        let metrics = ExecutorMetrics::register(&registry).unwrap();
        let executor = PriorityExecutor::new(&ExecutorConfig::default());

        executor
            .schedule(cpio_runtime::executor::Priority::Normal, async {})
            .unwrap();
        executor.stop(false).await.unwrap();

        metrics.update(&executor.stats());
        let rendered = render(&registry);
        assert!(rendered.contains("executor_tasks_executed"));
        assert!(rendered.contains("executor_queue_depth"));
    }
}
