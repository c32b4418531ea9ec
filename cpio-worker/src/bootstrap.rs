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

use std::sync::Arc;

use prometheus::Registry;
use tracing::{info, warn};

use cpio_common::model::JobId;
use cpio_runtime::clients::auto_scaling::{AutoScalingClient, NoopAutoScalingClient};
use cpio_runtime::clients::job::{JobClient, JobClientError};
use cpio_runtime::clients::memory::InMemoryJobClient;
use cpio_runtime::executor::PriorityExecutor;
use cpio_runtime::lifecycle::{JobLifecycleHelper, JobMetrics};

use crate::config::{AutoScalingMode, JobStoreConfig, WorkerConfig};

#[derive(Clone)]
pub struct Services {
    pub executor: Arc<PriorityExecutor>,
    pub job_client: Arc<dyn JobClient>,
    pub auto_scaling_client: Arc<dyn AutoScalingClient>,
    pub job_lifecycle_helper: Arc<JobLifecycleHelper>,
}

impl Services {
    pub async fn new(config: &WorkerConfig, registry: &Registry) -> Result<Services, String> {
        let executor = PriorityExecutor::new(&config.executor);

        let job_client: Arc<dyn JobClient> = match &config.job_store {
            JobStoreConfig::InMemory(store_config) => {
                Arc::new(InMemoryJobClient::new(store_config.clone()))
            }
        };

        let auto_scaling_client: Arc<dyn AutoScalingClient> = match config.auto_scaling {
            AutoScalingMode::Disabled => Arc::new(NoopAutoScalingClient),
        };

        let metrics = if config.lifecycle.enable_metrics_recording {
            JobMetrics::register(&config.lifecycle.metric_namespace, registry)
                .map_err(|err| format!("Failed to register lifecycle metrics: {err}"))?
        } else {
            JobMetrics::disabled()
        };

        let job_lifecycle_helper = Arc::new(JobLifecycleHelper::new(
            job_client.clone(),
            auto_scaling_client.clone(),
            config.lifecycle.clone(),
            metrics,
        ));
        job_lifecycle_helper.start();

        for seed in &config.seed_jobs {
            match job_client
                .put_job(JobId(seed.id.clone()), seed.body.clone())
                .await
            {
                Ok(job) => info!(job_id = %job.id, "seeded job"),
                Err(JobClientError::JobAlreadyExists(job_id)) => {
                    warn!(%job_id, "seed job already exists, skipping")
                }
                Err(err) => return Err(format!("Failed to seed job '{}': {err}", seed.id)),
            }
        }

        Ok(Services {
            executor,
            job_client,
            auto_scaling_client,
            job_lifecycle_helper,
        })
    }

    /// Stops the background services, draining queued executor tasks. Every
    /// service is stopped even when an earlier one fails; the first failure
    /// is reported.
    pub async fn stop(&self) -> Result<(), String> {
        let helper_result = self
            .job_lifecycle_helper
            .stop()
            .await
            .map_err(|err| format!("Failed to stop the job lifecycle helper: {err}"));
        let executor_result = self
            .executor
            .stop(false)
            .await
            .map_err(|err| format!("Failed to stop the executor: {err}"));
        helper_result.and(executor_result)
    }
}
