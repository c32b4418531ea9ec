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

use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cpio_common::config::{ConfigExample, ConfigLoader, HasConfigExamples};
use cpio_common::tracing::TracingConfig;
use cpio_common::SafeDisplay;
use cpio_runtime::clients::memory::InMemoryJobClientConfig;
use cpio_runtime::executor::ExecutorConfig;
use cpio_runtime::lifecycle::JobLifecycleConfig;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub tracing: TracingConfig,
    /// Port of the /metrics and /healthz endpoint.
    pub http_port: u16,
    pub executor: ExecutorConfig,
    pub lifecycle: JobLifecycleConfig,
    pub job_store: JobStoreConfig,
    pub auto_scaling: AutoScalingMode,
    /// Claims made by this worker ask the extender to keep them invisible.
    pub extend_claimed_jobs: bool,
    /// Pause after a failed preparation before polling the queue again.
    #[serde(with = "humantime_serde")]
    pub idle_retry_delay: Duration,
    /// Jobs enqueued at startup; useful with the in-memory store.
    pub seed_jobs: Vec<SeedJobConfig>,
}

/// Which job backend the worker talks to. Cloud-vendor backends plug in as
/// further variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobStoreConfig {
    InMemory(InMemoryJobClientConfig),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AutoScalingMode {
    /// No autoscaler: the instance never drains.
    Disabled,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeedJobConfig {
    pub id: String,
    pub body: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("cpio-worker"),
            http_port: 9090,
            executor: ExecutorConfig::default(),
            lifecycle: JobLifecycleConfig::default(),
            job_store: JobStoreConfig::InMemory(InMemoryJobClientConfig::default()),
            auto_scaling: AutoScalingMode::Disabled,
            extend_claimed_jobs: true,
            idle_retry_delay: Duration::from_secs(10),
            seed_jobs: Vec::new(),
        }
    }
}

impl SafeDisplay for WorkerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "HTTP port: {}", self.http_port);
        let _ = writeln!(
            &mut result,
            "executor: {} workers, queue capacity {}",
            self.executor.worker_count, self.executor.queue_capacity
        );
        let _ = writeln!(&mut result, "lifecycle:");
        let _ = writeln!(&mut result, "{}", self.lifecycle.to_safe_string_indented());
        let _ = writeln!(
            &mut result,
            "job store: {}",
            match &self.job_store {
                JobStoreConfig::InMemory(_) => "in-memory",
            }
        );
        let _ = writeln!(&mut result, "extend claimed jobs: {}", self.extend_claimed_jobs);
        let _ = writeln!(&mut result, "idle retry delay: {:?}", self.idle_retry_delay);
        let _ = writeln!(&mut result, "seed jobs: {}", self.seed_jobs.len());
        result
    }
}

impl HasConfigExamples<WorkerConfig> for WorkerConfig {
    fn examples() -> Vec<ConfigExample<WorkerConfig>> {
        vec![(
            "local-dev-with-seed-jobs",
            WorkerConfig {
                seed_jobs: vec![SeedJobConfig {
                    id: "demo-1".to_string(),
                    body: r#"{"priority":"high","work-ms":250}"#.to_string(),
                }],
                ..WorkerConfig::default()
            },
        )]
    }
}

pub fn make_config_loader() -> ConfigLoader<WorkerConfig> {
    ConfigLoader::new_with_examples(&PathBuf::from("config/worker.toml"))
}
