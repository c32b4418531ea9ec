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

mod metrics;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cpio_common::model::{epoch, Job, JobId, JobStatus, ReceiptInfo};
use cpio_common::SafeDisplay;

use crate::clients::auto_scaling::{AutoScalingClient, AutoScalingError, TryFinishInstanceTerminationRequest};
use crate::clients::job::{JobClient, JobClientError, UpdateJobStatusRequest, MAX_VISIBILITY_TIMEOUT};
use crate::context::OperationContext;

pub use metrics::{event, JobMetrics};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobLifecycleConfig {
    /// A job is force-failed on the next claim once its retry count reaches
    /// this limit.
    pub retry_limit: u32,
    #[serde(with = "humantime_serde")]
    pub visibility_timeout_extend_time: Duration,
    /// Wall budget for processing a single job. Governs both the reclaim of
    /// jobs from crashed workers and the extender giving up on a job.
    #[serde(with = "humantime_serde")]
    pub job_processing_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub job_extending_worker_sleep_time: Duration,
    pub current_instance_resource_name: String,
    pub scale_in_hook_name: String,
    pub enable_metrics_recording: bool,
    pub metric_namespace: String,
}

impl Default for JobLifecycleConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            visibility_timeout_extend_time: Duration::from_secs(60),
            job_processing_timeout: Duration::from_secs(300),
            job_extending_worker_sleep_time: Duration::from_secs(15),
            current_instance_resource_name: String::new(),
            scale_in_hook_name: String::new(),
            enable_metrics_recording: true,
            metric_namespace: "cpio".to_string(),
        }
    }
}

impl SafeDisplay for JobLifecycleConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "retry limit: {}, visibility extend: {:?}, processing timeout: {:?}, extender sleep: {:?}, instance: {}, hook: {}",
            self.retry_limit,
            self.visibility_timeout_extend_time,
            self.job_processing_timeout,
            self.job_extending_worker_sleep_time,
            self.current_instance_resource_name,
            self.scale_in_hook_name,
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PrepareNextJobRequest {
    /// When set, the background extender keeps the claimed message invisible
    /// while this worker processes it.
    pub is_visibility_timeout_extendable: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobMessageMetadata {
    pub receipt: ReceiptInfo,
    pub is_visibility_timeout_extendable: bool,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobLifecycleError {
    #[error("the current instance is scheduled for termination")]
    CurrentInstanceTerminating,
    #[error("job {0} is orphaned: the queue message has no job entry")]
    OrphanedJobFound(JobId),
    #[error("job {0} is already completed")]
    JobAlreadyCompleted(JobId),
    #[error("job {0} is being processed by another worker")]
    JobBeingProcessed(JobId),
    #[error("job {0} exceeded its retry limit")]
    RetriesExhausted(JobId),
    #[error("job id is missing")]
    MissingJobId,
    #[error("job {job_id} has invalid status {status} for this operation")]
    InvalidJobStatus { job_id: JobId, status: JobStatus },
    #[error("duration before release {0:?} is out of range")]
    InvalidDurationBeforeRelease(Duration),
    #[error("receipt info for job {0} is missing from the claimed-jobs map")]
    MissingReceiptInfo(JobId),
    #[error("the operation was cancelled")]
    Cancelled,
    #[error("lifecycle helper shutdown failed: {0}")]
    StopFailed(String),
    #[error(transparent)]
    JobClient(#[from] JobClientError),
    #[error(transparent)]
    AutoScaling(#[from] AutoScalingError),
}

impl SafeDisplay for JobLifecycleError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

/// The claimed-jobs map: one entry per job this worker currently holds a
/// queue claim for. Insertions never overwrite; claims are recorded with an
/// erase-then-insert so a stale entry cannot block a fresh claim.
struct ClaimedJobs {
    entries: RwLock<HashMap<JobId, JobMessageMetadata>>,
}

impl ClaimedJobs {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn record_claim(&self, job_id: JobId, metadata: JobMessageMetadata) {
        let mut entries = self.entries.write().unwrap();
        entries.remove(&job_id);
        entries.insert(job_id, metadata);
    }

    fn find(&self, job_id: &JobId) -> Option<JobMessageMetadata> {
        self.entries.read().unwrap().get(job_id).cloned()
    }

    fn erase(&self, job_id: &JobId) -> bool {
        self.entries.write().unwrap().remove(job_id).is_some()
    }

    fn keys(&self) -> Vec<JobId> {
        self.entries.read().unwrap().keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }
}

/// Composes the job client and the auto-scaling client into the total
/// worker-side state machine: claim the next job, keep it invisible while
/// it is being processed, then complete or release it.
pub struct JobLifecycleHelper {
    job_client: Arc<dyn JobClient>,
    auto_scaling_client: Arc<dyn AutoScalingClient>,
    config: JobLifecycleConfig,
    claimed_jobs: Arc<ClaimedJobs>,
    metrics: JobMetrics,
    extender: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl JobLifecycleHelper {
    pub fn new(
        job_client: Arc<dyn JobClient>,
        auto_scaling_client: Arc<dyn AutoScalingClient>,
        config: JobLifecycleConfig,
        metrics: JobMetrics,
    ) -> Self {
        let metrics = if config.enable_metrics_recording {
            metrics
        } else {
            JobMetrics::disabled()
        };
        Self {
            job_client,
            auto_scaling_client,
            config,
            claimed_jobs: Arc::new(ClaimedJobs::new()),
            metrics,
            extender: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Starts the background extender. Idempotent.
    pub fn start(&self) {
        let mut extender = self.extender.lock().unwrap();
        if extender.is_some() {
            return;
        }
        *extender = Some(tokio::spawn(extender_loop(
            self.job_client.clone(),
            self.claimed_jobs.clone(),
            self.config.clone(),
            self.metrics.clone(),
            self.shutdown.clone(),
        )));
    }

    /// Stops the background extender and waits for it to finish. Fails when
    /// the extender did not shut down cleanly (it panicked or was aborted).
    pub async fn stop(&self) -> Result<(), JobLifecycleError> {
        self.shutdown.cancel();
        let handle = self.extender.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.await.map_err(|err| {
                JobLifecycleError::StopFailed(format!("extender task failed: {err}"))
            })?;
        }
        Ok(())
    }

    /// Job ids currently claimed by this worker.
    pub fn claimed_job_ids(&self) -> Vec<JobId> {
        self.claimed_jobs.keys()
    }

    pub fn claimed_job_count(&self) -> usize {
        self.claimed_jobs.len()
    }

    /// Claims the next job from the queue, after confirming with the
    /// autoscaler that this instance is not draining.
    ///
    /// Messages in inconsistent states (no job entry, job already terminal)
    /// are cleaned off the queue before the corresponding failure is
    /// returned; a job past its retry limit is marked failed first.
    pub async fn prepare_next_job(
        &self,
        ctx: &OperationContext,
        request: PrepareNextJobRequest,
    ) -> Result<Job, JobLifecycleError> {
        if ctx.is_cancelled() {
            return Err(JobLifecycleError::Cancelled);
        }

        let termination = self
            .auto_scaling_client
            .try_finish_instance_termination(TryFinishInstanceTerminationRequest {
                instance_resource_name: self.config.current_instance_resource_name.clone(),
                lifecycle_hook_name: self.config.scale_in_hook_name.clone(),
            })
            .await
            .map_err(|err| {
                self.metrics
                    .record_preparation_failure(event::TRY_FINISH_TERMINATION_FAILURE);
                error!(context = %ctx, error = %err, "failed to prepare job: try finish instance termination failed");
                err
            })?;
        if termination.termination_scheduled {
            self.metrics
                .record_preparation_failure(event::CURRENT_INSTANCE_TERMINATING);
            error!(context = %ctx, "failed to prepare job: the current instance is scheduled for termination");
            return Err(JobLifecycleError::CurrentInstanceTerminating);
        }

        if ctx.is_cancelled() {
            return Err(JobLifecycleError::Cancelled);
        }

        let message = match self.job_client.get_next_job().await {
            Ok(message) => message,
            Err(JobClientError::NoPendingJob) => {
                debug!(context = %ctx, "no pending job in the queue");
                return Err(JobClientError::NoPendingJob.into());
            }
            Err(err) => {
                self.metrics
                    .record_preparation_failure(event::GET_NEXT_JOB_FAILURE);
                error!(context = %ctx, error = %err, "failed to prepare job: get next job failed");
                return Err(err.into());
            }
        };
        self.metrics.record_preparation(event::PREPARATION);

        let job = message.job;
        let receipt = message.receipt;

        if job.status == JobStatus::Unknown && job.has_default_created_time() {
            error!(context = %ctx, job_id = %job.id, "failed to prepare job: the job is orphaned");
            self.cleanup_orphaned_message(ctx, &job.id, &receipt).await?;
            return Err(JobLifecycleError::OrphanedJobFound(job.id));
        }

        if job.status == JobStatus::Processing && !self.exceeding_processing_timeout(&job) {
            error!(context = %ctx, job_id = %job.id, "failed to prepare job: the job is being processed by another worker");
            return Err(JobLifecycleError::JobBeingProcessed(job.id));
        }

        if job.status.is_terminal() {
            error!(context = %ctx, job_id = %job.id, "failed to prepare job: the job is already completed");
            self.cleanup_orphaned_message(ctx, &job.id, &receipt).await?;
            return Err(JobLifecycleError::JobAlreadyCompleted(job.id));
        }

        if job.retry_count >= self.config.retry_limit {
            self.job_client
                .update_job_status(UpdateJobStatusRequest {
                    job_id: job.id.clone(),
                    job_status: JobStatus::Failure,
                    receipt: None,
                    expected_updated_time: None,
                })
                .await
                .map_err(|err| {
                    self.metrics
                        .record_preparation_failure(event::UPDATE_JOB_STATUS_FAILURE);
                    error!(context = %ctx, job_id = %job.id, error = %err, "failed to prepare job: marking an exhausted job failed");
                    err
                })?;
            error!(context = %ctx, job_id = %job.id, retry_count = job.retry_count, "failed to prepare job: the retry limit is exhausted");
            return Err(JobLifecycleError::RetriesExhausted(job.id));
        }

        self.claimed_jobs.record_claim(
            job.id.clone(),
            JobMessageMetadata {
                receipt,
                is_visibility_timeout_extendable: request.is_visibility_timeout_extendable,
            },
        );
        self.metrics.record_preparation(event::PREPARATION_SUCCESS);
        Ok(job)
    }

    /// Transitions a claimed job to its terminal status and settles the
    /// queue message.
    pub async fn mark_job_completed(
        &self,
        ctx: &OperationContext,
        job_id: JobId,
        job_status: JobStatus,
    ) -> Result<(), JobLifecycleError> {
        if ctx.is_cancelled() {
            return Err(JobLifecycleError::Cancelled);
        }
        if job_id.is_empty() {
            self.metrics.record_completion_failure(event::INVALID_REQUEST);
            error!(context = %ctx, "failed to mark job completed: missing job id");
            return Err(JobLifecycleError::MissingJobId);
        }
        if !job_status.is_terminal() {
            self.metrics.record_completion_failure(event::INVALID_REQUEST);
            error!(context = %ctx, job_id = %job_id, status = %job_status, "failed to mark job completed: the status is not terminal");
            return Err(JobLifecycleError::InvalidJobStatus { job_id, status: job_status });
        }

        let metadata = self.find_claim(&job_id)?;

        let row = self
            .job_client
            .get_job_by_id(&job_id)
            .await
            .map_err(|err| {
                self.metrics
                    .record_completion_failure(event::GET_JOB_BY_ID_FAILURE);
                error!(context = %ctx, job_id = %job_id, error = %err, "failed to mark job completed: get job by id failed");
                err
            })?;

        let updated = self
            .job_client
            .update_job_status(UpdateJobStatusRequest {
                job_id: job_id.clone(),
                job_status,
                receipt: Some(metadata.receipt),
                expected_updated_time: Some(row.updated_time),
            })
            .await
            .map_err(|err| {
                self.metrics
                    .record_completion_failure(event::UPDATE_JOB_STATUS_FAILURE);
                error!(context = %ctx, job_id = %job_id, error = %err, "failed to mark job completed: update job status failed");
                err
            })?;

        self.claimed_jobs.erase(&job_id);

        self.record_job_timings(ctx, &job_id, &row, updated.updated_time);
        self.metrics.record_completion(event::COMPLETION_SUCCESS);
        if job_status == JobStatus::Failure {
            self.metrics
                .record_completion(event::COMPLETION_WITH_FAILURE_STATUS);
        }
        Ok(())
    }

    /// Returns a claimed job to the queue for another worker: the row goes
    /// back to `created` and the message becomes visible again after
    /// `duration_before_release`.
    pub async fn release_job_for_retry(
        &self,
        ctx: &OperationContext,
        job_id: JobId,
        duration_before_release: Duration,
    ) -> Result<(), JobLifecycleError> {
        if ctx.is_cancelled() {
            return Err(JobLifecycleError::Cancelled);
        }
        if job_id.is_empty() {
            self.metrics.record_release_failure(event::INVALID_REQUEST);
            error!(context = %ctx, "failed to release job: missing job id");
            return Err(JobLifecycleError::MissingJobId);
        }
        if duration_before_release > MAX_VISIBILITY_TIMEOUT {
            self.metrics.record_release_failure(event::INVALID_REQUEST);
            error!(context = %ctx, job_id = %job_id, ?duration_before_release, "failed to release job: invalid duration before release");
            return Err(JobLifecycleError::InvalidDurationBeforeRelease(
                duration_before_release,
            ));
        }

        let metadata = self.find_claim(&job_id)?;
        self.metrics.record_release(event::RELEASE);

        let row = self
            .job_client
            .get_job_by_id(&job_id)
            .await
            .map_err(|err| {
                self.metrics
                    .record_release_failure(event::GET_JOB_BY_ID_FAILURE);
                error!(context = %ctx, job_id = %job_id, error = %err, "failed to release job: get job by id failed");
                err
            })?;

        if !matches!(row.status, JobStatus::Created | JobStatus::Processing) {
            self.metrics.record_release_failure(event::INVALID_JOB_STATUS);
            error!(context = %ctx, job_id = %job_id, status = %row.status, "failed to release job: invalid job status");
            self.claimed_jobs.erase(&job_id);
            return Err(JobLifecycleError::InvalidJobStatus {
                job_id,
                status: row.status,
            });
        }

        self.job_client
            .update_job_status(UpdateJobStatusRequest {
                job_id: job_id.clone(),
                job_status: JobStatus::Created,
                receipt: Some(metadata.receipt.clone()),
                expected_updated_time: Some(row.updated_time),
            })
            .await
            .map_err(|err| {
                self.metrics
                    .record_release_failure(event::UPDATE_JOB_STATUS_FAILURE);
                error!(context = %ctx, job_id = %job_id, error = %err, "failed to release job: update job status failed");
                err
            })?;

        self.job_client
            .update_job_visibility_timeout(&job_id, duration_before_release, &metadata.receipt)
            .await
            .map_err(|err| {
                self.metrics
                    .record_release_failure(event::UPDATE_VISIBILITY_TIMEOUT_FAILURE);
                error!(context = %ctx, job_id = %job_id, error = %err, "failed to release job: update job visibility timeout failed");
                err
            })?;

        self.claimed_jobs.erase(&job_id);
        self.metrics.record_release(event::RELEASE_SUCCESS);
        Ok(())
    }

    fn find_claim(&self, job_id: &JobId) -> Result<JobMessageMetadata, JobLifecycleError> {
        match self.claimed_jobs.find(job_id) {
            None => {
                self.metrics
                    .record_metadata_map_failure(event::FIND_METADATA_FAILURE);
                Err(JobLifecycleError::MissingReceiptInfo(job_id.clone()))
            }
            Some(metadata) if metadata.receipt.is_empty() => {
                self.metrics
                    .record_metadata_map_failure(event::MISSING_RECEIPT_INFO);
                warn!(job_id = %job_id, "claimed-jobs entry has no receipt, removing it");
                self.claimed_jobs.erase(job_id);
                Err(JobLifecycleError::MissingReceiptInfo(job_id.clone()))
            }
            Some(metadata) => Ok(metadata),
        }
    }

    fn exceeding_processing_timeout(&self, job: &Job) -> bool {
        exceeding_processing_timeout(job, self.config.job_processing_timeout)
    }

    fn record_job_timings(
        &self,
        ctx: &OperationContext,
        job_id: &JobId,
        row: &Job,
        completed_time: DateTime<Utc>,
    ) {
        let processing_started = row.processing_started_time.unwrap_or_else(epoch);
        let processing_ms = (completed_time - processing_started).num_milliseconds();
        if processing_ms < 0 {
            error!(context = %ctx, job_id = %job_id, "completed time precedes the processing start time");
            self.metrics
                .record_completion_failure(event::PROCESSING_TIME_ERROR);
        } else {
            self.metrics
                .record_processing_time_seconds(processing_ms as f64 / 1000.0);
        }
        let waiting_ms = (processing_started - row.created_time).num_milliseconds();
        if waiting_ms < 0 {
            error!(context = %ctx, job_id = %job_id, "processing start time precedes the created time");
            self.metrics
                .record_completion_failure(event::PROCESSING_TIME_ERROR);
        } else {
            self.metrics
                .record_waiting_time_seconds(waiting_ms as f64 / 1000.0);
        }
    }

    async fn cleanup_orphaned_message(
        &self,
        ctx: &OperationContext,
        job_id: &JobId,
        receipt: &ReceiptInfo,
    ) -> Result<(), JobLifecycleError> {
        self.job_client
            .delete_orphaned_job_message(job_id, receipt)
            .await
            .map_err(|err| {
                error!(context = %ctx, job_id = %job_id, error = %err, "failed to delete an orphaned job message");
                err
            })?;
        // A stale claim for this id may still be around from an earlier life
        self.claimed_jobs.erase(job_id);
        Ok(())
    }
}

fn exceeding_processing_timeout(job: &Job, timeout: Duration) -> bool {
    let processing_started = job.processing_started_time.unwrap_or_else(epoch);
    let processing_time = Utc::now() - processing_started;
    processing_time >= chrono::Duration::from_std(timeout).unwrap()
}

/// Periodically walks the claimed-jobs map and extends the visibility of
/// every extendable claim. One missed extension is not fatal: the queue's
/// own visibility window redelivers the job and the preparation-side checks
/// clean up.
async fn extender_loop(
    job_client: Arc<dyn JobClient>,
    claimed_jobs: Arc<ClaimedJobs>,
    config: JobLifecycleConfig,
    metrics: JobMetrics,
    shutdown: CancellationToken,
) {
    loop {
        for job_id in claimed_jobs.keys() {
            let Some(metadata) = claimed_jobs.find(&job_id) else {
                // completed or released since the snapshot
                continue;
            };
            if !metadata.is_visibility_timeout_extendable {
                continue;
            }
            if metadata.receipt.is_empty() {
                metrics.record_extender_failure(event::MISSING_RECEIPT_INFO);
                warn!(job_id = %job_id, "cannot extend a claim without a receipt, removing it");
                claimed_jobs.erase(&job_id);
                continue;
            }

            let row = match job_client.get_job_by_id(&job_id).await {
                Ok(row) => row,
                Err(err) => {
                    metrics.record_extender_failure(event::GET_JOB_BY_ID_FAILURE);
                    error!(job_id = %job_id, error = %err, "failed to extend job: get job by id failed");
                    continue;
                }
            };

            if exceeding_processing_timeout(&row, config.job_processing_timeout) {
                info!(job_id = %job_id, "job exceeded its processing timeout, abandoning the claim");
                claimed_jobs.erase(&job_id);
                continue;
            }

            if let Err(err) = job_client
                .update_job_visibility_timeout(
                    &job_id,
                    config.visibility_timeout_extend_time,
                    &metadata.receipt,
                )
                .await
            {
                metrics.record_extender_failure(event::UPDATE_VISIBILITY_TIMEOUT_FAILURE);
                error!(job_id = %job_id, error = %err, "failed to extend job: update job visibility timeout failed");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(config.job_extending_worker_sleep_time) => {}
        }
    }
}
