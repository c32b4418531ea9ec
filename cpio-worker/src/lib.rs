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

pub mod bootstrap;
pub mod config;
pub mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use prometheus::Registry;
use serde::Deserialize;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use warp::Filter;

use cpio_common::model::{Job, JobStatus};
use cpio_common::SafeDisplay;
use cpio_runtime::context::OperationContext;
use cpio_runtime::executor::{Priority, PriorityExecutor};
use cpio_runtime::lifecycle::{JobLifecycleError, PrepareNextJobRequest};

use crate::bootstrap::Services;
use crate::config::WorkerConfig;
use crate::metrics::ExecutorMetrics;

#[cfg(test)]
test_r::enable!();

/// What a job asks the worker to do, parsed from the job body. Bodies that
/// are not valid instructions process as an empty `success` job.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct JobInstructions {
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    work_ms: u64,
    #[serde(default)]
    outcome: JobOutcome,
    /// Visibility delay used when the outcome asks for a retry.
    #[serde(default)]
    release_delay_ms: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum JobOutcome {
    #[default]
    Success,
    Failure,
    Retry,
}

/// Runs the job's work on the processing executor and reports how the job
/// should be settled.
async fn process_job(executor: &PriorityExecutor, job: &Job) -> JobOutcome {
    let instructions: JobInstructions = serde_json::from_str(&job.body).unwrap_or_default();
    let priority = instructions.priority.unwrap_or(Priority::Normal);
    let work = Duration::from_millis(instructions.work_ms);
    let outcome = instructions.outcome;

    let (done, finished) = oneshot::channel();
    let scheduled = executor.schedule(priority, async move {
        tokio::time::sleep(work).await;
        let _ = done.send(outcome);
    });
    match scheduled {
        Ok(()) => finished.await.unwrap_or(JobOutcome::Failure),
        Err(err) => {
            // The lanes are saturated; running inline keeps the claim moving
            warn!(job_id = %job.id, error = %err, "executor rejected the task, processing inline");
            tokio::time::sleep(work).await;
            outcome
        }
    }
}

async fn settle_job(
    services: &Services,
    ctx: &OperationContext,
    job: &Job,
    outcome: JobOutcome,
    release_delay: Duration,
) -> Result<(), JobLifecycleError> {
    match outcome {
        JobOutcome::Success => {
            services
                .job_lifecycle_helper
                .mark_job_completed(ctx, job.id.clone(), JobStatus::Success)
                .await
        }
        JobOutcome::Failure => {
            services
                .job_lifecycle_helper
                .mark_job_completed(ctx, job.id.clone(), JobStatus::Failure)
                .await
        }
        JobOutcome::Retry => {
            services
                .job_lifecycle_helper
                .release_job_for_retry(ctx, job.id.clone(), release_delay)
                .await
        }
    }
}

fn start_http_server(config: &WorkerConfig, services: &Services, registry: Registry) {
    let executor_metrics = match ExecutorMetrics::register(&registry) {
        Ok(executor_metrics) => Some(executor_metrics),
        Err(err) => {
            warn!(error = %err, "failed to register executor metrics");
            None
        }
    };
    let executor = services.executor.clone();

    let metrics_route = warp::path("metrics").map(move || {
        if let Some(executor_metrics) = &executor_metrics {
            executor_metrics.update(&executor.stats());
        }
        metrics::render(&registry)
    });
    let health_route = warp::path("healthz").map(|| "ok");

    let port = config.http_port;
    tokio::spawn(warp::serve(metrics_route.or(health_route)).run(([0, 0, 0, 0], port)));
}

/// The worker's main loop: claim, process, settle, repeat. Returns cleanly
/// when the autoscaler drains the instance or the process is interrupted.
pub async fn run(config: WorkerConfig, registry: Registry) -> Result<(), anyhow::Error> {
    info!("starting worker with config:\n{}", config.to_safe_string());

    let services = Services::new(&config, &registry)
        .await
        .map_err(|err| anyhow!(err).context("Service initialization"))?;
    start_http_server(&config, &services, registry);

    let root_ctx = OperationContext::root();
    {
        let root_ctx = root_ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                root_ctx.cancel();
            }
        });
    }

    worker_loop(&config, &services, &root_ctx).await;

    services
        .stop()
        .await
        .map_err(|err| anyhow!(err).context("Service shutdown"))?;
    info!("worker stopped");
    Ok(())
}

async fn worker_loop(config: &WorkerConfig, services: &Services, root_ctx: &OperationContext) {
    while !root_ctx.is_cancelled() {
        let ctx = root_ctx.child();
        let job = match services
            .job_lifecycle_helper
            .prepare_next_job(
                &ctx,
                PrepareNextJobRequest {
                    is_visibility_timeout_extendable: config.extend_claimed_jobs,
                },
            )
            .await
        {
            Ok(job) => job,
            Err(JobLifecycleError::CurrentInstanceTerminating) => {
                info!("stopping: the current instance is scheduled for termination");
                break;
            }
            Err(JobLifecycleError::Cancelled) => break,
            Err(err) => {
                info!(error = %err, "no job prepared, backing off");
                tokio::select! {
                    _ = root_ctx.cancelled() => break,
                    _ = tokio::time::sleep(config.idle_retry_delay) => continue,
                }
            }
        };

        info!(job_id = %job.id, retry_count = job.retry_count, "processing job");
        let instructions: JobInstructions = serde_json::from_str(&job.body).unwrap_or_default();
        let release_delay = Duration::from_millis(instructions.release_delay_ms);
        let outcome = process_job(&services.executor, &job).await;

        match settle_job(services, &ctx, &job, outcome, release_delay).await {
            Ok(()) => info!(job_id = %job.id, ?outcome, "job settled"),
            Err(err) => {
                error!(job_id = %job.id, error = %err, "failed to settle job, backing off");
                tokio::select! {
                    _ = root_ctx.cancelled() => break,
                    _ = tokio::time::sleep(config.idle_retry_delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use cpio_runtime::executor::ExecutorConfig;

    use super::*;

    fn job_with_body(body: &str) -> Job {
        Job {
            id: cpio_common::model::JobId::from("job-1"),
            server_job_id: "job-00000001".to_string(),
            status: JobStatus::Created,
            body: body.to_string(),
            created_time: chrono::Utc::now(),
            updated_time: chrono::Utc::now(),
            processing_started_time: None,
            retry_count: 0,
        }
    }

    #[test]
    async fn job_bodies_drive_the_processing_outcome() {
        let executor = PriorityExecutor::new(&ExecutorConfig::default());

        let success = job_with_body(r#"{"priority":"high","work-ms":5}"#);
        assert_eq!(process_job(&executor, &success).await, JobOutcome::Success);

        let failure = job_with_body(r#"{"outcome":"failure"}"#);
        assert_eq!(process_job(&executor, &failure).await, JobOutcome::Failure);

        let retry = job_with_body(r#"{"outcome":"retry","release-delay-ms":100}"#);
        assert_eq!(process_job(&executor, &retry).await, JobOutcome::Retry);

        executor.stop(false).await.unwrap();
    }

    #[test]
    async fn malformed_job_bodies_process_as_empty_successes() {
        let executor = PriorityExecutor::new(&ExecutorConfig::default());
        let job = job_with_body("not json at all");
        assert_eq!(process_job(&executor, &job).await, JobOutcome::Success);
        executor.stop(false).await.unwrap();
    }
}
