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

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use test_r::test;

use cpio_common::model::{Job, JobId, JobMessage, JobStatus, ReceiptInfo};
use cpio_runtime::clients::auto_scaling::{
    AutoScalingClient, AutoScalingError, NoopAutoScalingClient,
    TryFinishInstanceTerminationRequest, TryFinishInstanceTerminationResponse,
};
use cpio_runtime::clients::job::{
    JobClient, JobClientError, UpdateJobStatusRequest, UpdateJobStatusResponse,
};
use cpio_runtime::clients::memory::{InMemoryJobClient, InMemoryJobClientConfig};
use cpio_runtime::context::OperationContext;
use cpio_runtime::lifecycle::{
    JobLifecycleConfig, JobLifecycleError, JobLifecycleHelper, JobMetrics, PrepareNextJobRequest,
};

test_r::enable!();

#[derive(Clone, Debug, PartialEq)]
enum Call {
    GetNextJob,
    GetJobById(JobId),
    UpdateJobStatus(JobId, JobStatus),
    UpdateVisibility(JobId, Duration),
    DeleteOrphan(JobId),
}

/// Job client decorator recording the calls flowing through it and able to
/// fail selected operations, for asserting call sequences and propagation.
struct RecordingJobClient {
    inner: Arc<InMemoryJobClient>,
    calls: Mutex<Vec<Call>>,
    fail_next_update_status: Mutex<Option<JobClientError>>,
    fail_next_delete_orphan: Mutex<Option<JobClientError>>,
}

impl RecordingJobClient {
    fn new(inner: Arc<InMemoryJobClient>) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
            fail_next_update_status: Mutex::new(None),
            fail_next_delete_orphan: Mutex::new(None),
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn visibility_updates(&self, job_id: &JobId) -> Vec<Duration> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::UpdateVisibility(id, duration) if &id == job_id => Some(duration),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl JobClient for RecordingJobClient {
    async fn put_job(&self, job_id: JobId, body: String) -> Result<Job, JobClientError> {
        self.inner.put_job(job_id, body).await
    }

    async fn get_next_job(&self) -> Result<JobMessage, JobClientError> {
        self.record(Call::GetNextJob);
        self.inner.get_next_job().await
    }

    async fn get_job_by_id(&self, job_id: &JobId) -> Result<Job, JobClientError> {
        self.record(Call::GetJobById(job_id.clone()));
        self.inner.get_job_by_id(job_id).await
    }

    async fn update_job_status(
        &self,
        request: UpdateJobStatusRequest,
    ) -> Result<UpdateJobStatusResponse, JobClientError> {
        self.record(Call::UpdateJobStatus(
            request.job_id.clone(),
            request.job_status,
        ));
        if let Some(error) = self.fail_next_update_status.lock().unwrap().take() {
            return Err(error);
        }
        self.inner.update_job_status(request).await
    }

    async fn update_job_visibility_timeout(
        &self,
        job_id: &JobId,
        duration: Duration,
        receipt: &ReceiptInfo,
    ) -> Result<(), JobClientError> {
        self.record(Call::UpdateVisibility(job_id.clone(), duration));
        self.inner
            .update_job_visibility_timeout(job_id, duration, receipt)
            .await
    }

    async fn delete_orphaned_job_message(
        &self,
        job_id: &JobId,
        receipt: &ReceiptInfo,
    ) -> Result<(), JobClientError> {
        self.record(Call::DeleteOrphan(job_id.clone()));
        if let Some(error) = self.fail_next_delete_orphan.lock().unwrap().take() {
            return Err(error);
        }
        self.inner.delete_orphaned_job_message(job_id, receipt).await
    }
}

struct DrainingAutoScalingClient;

#[async_trait]
impl AutoScalingClient for DrainingAutoScalingClient {
    async fn try_finish_instance_termination(
        &self,
        _request: TryFinishInstanceTerminationRequest,
    ) -> Result<TryFinishInstanceTerminationResponse, AutoScalingError> {
        Ok(TryFinishInstanceTerminationResponse {
            termination_scheduled: true,
        })
    }
}

fn test_config() -> JobLifecycleConfig {
    JobLifecycleConfig {
        retry_limit: 3,
        visibility_timeout_extend_time: Duration::from_secs(30),
        job_processing_timeout: Duration::from_secs(120),
        job_extending_worker_sleep_time: Duration::from_millis(200),
        current_instance_resource_name: "projects/test/zones/a/instances/worker-0".to_string(),
        scale_in_hook_name: "scale-in".to_string(),
        enable_metrics_recording: true,
        metric_namespace: "cpio".to_string(),
    }
}

struct Fixture {
    store: Arc<InMemoryJobClient>,
    client: Arc<RecordingJobClient>,
    helper: JobLifecycleHelper,
    ctx: OperationContext,
}

fn fixture_with(config: JobLifecycleConfig, auto_scaling: Arc<dyn AutoScalingClient>) -> Fixture {
    let store = Arc::new(InMemoryJobClient::new(InMemoryJobClientConfig {
        default_visibility_timeout: Duration::from_secs(30),
    }));
    let client = Arc::new(RecordingJobClient::new(store.clone()));
    let registry = prometheus::Registry::new();
    let metrics = JobMetrics::register(&config.metric_namespace, &registry).unwrap();
    let helper = JobLifecycleHelper::new(client.clone(), auto_scaling, config, metrics);
    Fixture {
        store,
        client,
        helper,
        ctx: OperationContext::root(),
    }
}

fn fixture() -> Fixture {
    fixture_with(test_config(), Arc::new(NoopAutoScalingClient))
}

fn extendable() -> PrepareNextJobRequest {
    PrepareNextJobRequest {
        is_visibility_timeout_extendable: true,
    }
}

#[test]
async fn happy_path_claims_extends_and_completes_a_job() {
    let fixture = fixture();
    fixture
        .store
        .put_job(JobId::from("job-1"), "payload".to_string())
        .await
        .unwrap();
    fixture.helper.start();

    let job = fixture
        .helper
        .prepare_next_job(&fixture.ctx, extendable())
        .await
        .unwrap();
    assert_eq!(job.id, JobId::from("job-1"));
    assert_eq!(job.status, JobStatus::Created);
    assert_eq!(job.body, "payload");
    assert_eq!(fixture.helper.claimed_job_ids(), vec![JobId::from("job-1")]);

    // Let the extender run a few periods while the job is held
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let extensions = fixture.client.visibility_updates(&JobId::from("job-1"));
    assert!(
        (2..=7).contains(&extensions.len()),
        "expected a bounded number of extensions, got {}",
        extensions.len()
    );
    assert!(extensions
        .iter()
        .all(|duration| *duration == Duration::from_secs(30)));

    fixture
        .helper
        .mark_job_completed(&fixture.ctx, JobId::from("job-1"), JobStatus::Success)
        .await
        .unwrap();
    assert_eq!(fixture.helper.claimed_job_count(), 0);
    assert_eq!(fixture.store.message_count(), 0);
    let row = fixture
        .store
        .get_job_by_id(&JobId::from("job-1"))
        .await
        .unwrap();
    assert_eq!(row.status, JobStatus::Success);

    fixture.helper.stop().await.unwrap();
}

#[test]
async fn non_extendable_claims_are_never_extended() {
    let fixture = fixture();
    fixture
        .store
        .put_job(JobId::from("job-1"), "payload".to_string())
        .await
        .unwrap();
    fixture.helper.start();

    fixture
        .helper
        .prepare_next_job(&fixture.ctx, PrepareNextJobRequest::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(700)).await;

    assert!(fixture
        .client
        .visibility_updates(&JobId::from("job-1"))
        .is_empty());
    fixture.helper.stop().await.unwrap();
}

#[test]
async fn a_draining_instance_stops_claiming_before_touching_the_queue() {
    let fixture = fixture_with(test_config(), Arc::new(DrainingAutoScalingClient));

    let result = fixture
        .helper
        .prepare_next_job(&fixture.ctx, extendable())
        .await;
    assert_eq!(result, Err(JobLifecycleError::CurrentInstanceTerminating));
    assert!(!fixture.client.calls().contains(&Call::GetNextJob));
}

#[test]
async fn orphaned_messages_are_deleted_and_reported() {
    let fixture = fixture();
    fixture.store.enqueue_orphan(JobId::from("ghost"));

    let result = fixture
        .helper
        .prepare_next_job(&fixture.ctx, extendable())
        .await;
    assert_eq!(
        result,
        Err(JobLifecycleError::OrphanedJobFound(JobId::from("ghost")))
    );
    assert!(fixture
        .client
        .calls()
        .contains(&Call::DeleteOrphan(JobId::from("ghost"))));
    assert_eq!(fixture.store.message_count(), 0);
    assert_eq!(fixture.helper.claimed_job_count(), 0);
}

#[test]
async fn failing_orphan_cleanup_takes_priority_over_the_orphan_report() {
    let fixture = fixture();
    fixture.store.enqueue_orphan(JobId::from("ghost"));
    *fixture.client.fail_next_delete_orphan.lock().unwrap() =
        Some(JobClientError::Connection("queue unreachable".to_string()));

    let result = fixture
        .helper
        .prepare_next_job(&fixture.ctx, extendable())
        .await;
    assert_eq!(
        result,
        Err(JobLifecycleError::JobClient(JobClientError::Connection(
            "queue unreachable".to_string()
        )))
    );
}

#[test]
async fn completed_jobs_found_on_the_queue_are_cleaned_up() {
    let fixture = fixture();
    fixture
        .store
        .put_job(JobId::from("done"), "payload".to_string())
        .await
        .unwrap();
    fixture
        .store
        .modify_job(&JobId::from("done"), |job| {
            job.status = JobStatus::Success;
        })
        .unwrap();

    let result = fixture
        .helper
        .prepare_next_job(&fixture.ctx, extendable())
        .await;
    assert_eq!(
        result,
        Err(JobLifecycleError::JobAlreadyCompleted(JobId::from("done")))
    );
    assert_eq!(fixture.store.message_count(), 0);
}

#[test]
async fn jobs_held_by_a_live_worker_are_not_reclaimed() {
    let fixture = fixture();
    fixture
        .store
        .put_job(JobId::from("busy"), "payload".to_string())
        .await
        .unwrap();
    fixture
        .store
        .modify_job(&JobId::from("busy"), |job| {
            job.status = JobStatus::Processing;
            job.processing_started_time = Some(Utc::now());
        })
        .unwrap();

    let result = fixture
        .helper
        .prepare_next_job(&fixture.ctx, extendable())
        .await;
    assert_eq!(
        result,
        Err(JobLifecycleError::JobBeingProcessed(JobId::from("busy")))
    );
}

#[test]
async fn jobs_from_crashed_workers_are_reclaimed_after_the_timeout() {
    let fixture = fixture();
    fixture
        .store
        .put_job(JobId::from("stale"), "payload".to_string())
        .await
        .unwrap();
    fixture
        .store
        .modify_job(&JobId::from("stale"), |job| {
            job.status = JobStatus::Processing;
            job.processing_started_time = Some(Utc::now() - chrono::Duration::seconds(200));
        })
        .unwrap();

    let job = fixture
        .helper
        .prepare_next_job(&fixture.ctx, extendable())
        .await
        .unwrap();
    assert_eq!(job.id, JobId::from("stale"));
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(fixture.helper.claimed_job_count(), 1);
}

#[test]
async fn exhausted_jobs_are_marked_failed_before_reporting() {
    let fixture = fixture();
    fixture
        .store
        .put_job(JobId::from("worn"), "payload".to_string())
        .await
        .unwrap();
    fixture
        .store
        .modify_job(&JobId::from("worn"), |job| {
            job.status = JobStatus::Processing;
            job.processing_started_time = Some(Utc::now() - chrono::Duration::seconds(200));
            job.retry_count = 3;
        })
        .unwrap();

    let result = fixture
        .helper
        .prepare_next_job(&fixture.ctx, extendable())
        .await;
    assert_eq!(
        result,
        Err(JobLifecycleError::RetriesExhausted(JobId::from("worn")))
    );
    assert!(fixture
        .client
        .calls()
        .contains(&Call::UpdateJobStatus(JobId::from("worn"), JobStatus::Failure)));
    let row = fixture
        .store
        .get_job_by_id(&JobId::from("worn"))
        .await
        .unwrap();
    assert_eq!(row.status, JobStatus::Failure);
    assert_eq!(fixture.helper.claimed_job_count(), 0);
}

#[test]
async fn releasing_a_job_follows_the_status_then_visibility_sequence() {
    let fixture = fixture();
    fixture
        .store
        .put_job(JobId::from("job-1"), "payload".to_string())
        .await
        .unwrap();
    fixture
        .helper
        .prepare_next_job(&fixture.ctx, extendable())
        .await
        .unwrap();

    fixture
        .helper
        .release_job_for_retry(&fixture.ctx, JobId::from("job-1"), Duration::from_secs(10))
        .await
        .unwrap();

    let calls = fixture.client.calls();
    let release_calls: Vec<&Call> = calls
        .iter()
        .filter(|call| {
            matches!(
                call,
                Call::GetJobById(_) | Call::UpdateJobStatus(_, _) | Call::UpdateVisibility(_, _)
            )
        })
        .collect();
    assert_eq!(
        release_calls,
        vec![
            &Call::GetJobById(JobId::from("job-1")),
            &Call::UpdateJobStatus(JobId::from("job-1"), JobStatus::Created),
            &Call::UpdateVisibility(JobId::from("job-1"), Duration::from_secs(10)),
        ]
    );
    assert_eq!(fixture.helper.claimed_job_count(), 0);

    let row = fixture
        .store
        .get_job_by_id(&JobId::from("job-1"))
        .await
        .unwrap();
    assert_eq!(row.status, JobStatus::Created);
    assert_eq!(row.retry_count, 1);
    // the message stays invisible for the requested duration
    assert_eq!(
        fixture.store.get_next_job().await.unwrap_err(),
        JobClientError::NoPendingJob
    );
}

#[test]
async fn at_most_one_worker_holds_a_claim_at_a_time() {
    let store = Arc::new(InMemoryJobClient::new(InMemoryJobClientConfig::default()));
    let worker_a = JobLifecycleHelper::new(
        store.clone(),
        Arc::new(NoopAutoScalingClient),
        test_config(),
        JobMetrics::disabled(),
    );
    let worker_b = JobLifecycleHelper::new(
        store.clone(),
        Arc::new(NoopAutoScalingClient),
        test_config(),
        JobMetrics::disabled(),
    );
    let ctx = OperationContext::root();

    store
        .put_job(JobId::from("shared"), "payload".to_string())
        .await
        .unwrap();

    let job = worker_a.prepare_next_job(&ctx, extendable()).await.unwrap();
    assert_eq!(job.id, JobId::from("shared"));
    assert_eq!(worker_a.claimed_job_count(), 1);

    // The message is invisible while worker A holds the claim
    let result = worker_b.prepare_next_job(&ctx, extendable()).await;
    assert_eq!(
        result,
        Err(JobLifecycleError::JobClient(JobClientError::NoPendingJob))
    );
    assert_eq!(worker_b.claimed_job_count(), 0);

    // After a zero-delay release the other worker can claim it
    worker_a
        .release_job_for_retry(&ctx, JobId::from("shared"), Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(worker_a.claimed_job_count(), 0);

    let job = worker_b.prepare_next_job(&ctx, extendable()).await.unwrap();
    assert_eq!(job.id, JobId::from("shared"));
    assert_eq!(worker_b.claimed_job_count(), 1);
}

#[test]
async fn cas_conflicts_propagate_without_internal_retry() {
    let fixture = fixture();
    fixture
        .store
        .put_job(JobId::from("job-1"), "payload".to_string())
        .await
        .unwrap();
    fixture
        .helper
        .prepare_next_job(&fixture.ctx, extendable())
        .await
        .unwrap();

    let conflict = JobClientError::UpdateConflict {
        job_id: JobId::from("job-1"),
        expected: Utc::now(),
        actual: Utc::now(),
    };
    *fixture.client.fail_next_update_status.lock().unwrap() = Some(conflict.clone());

    let result = fixture
        .helper
        .mark_job_completed(&fixture.ctx, JobId::from("job-1"), JobStatus::Success)
        .await;
    assert_eq!(result, Err(JobLifecycleError::JobClient(conflict)));

    let update_calls = fixture
        .client
        .calls()
        .iter()
        .filter(|call| matches!(call, Call::UpdateJobStatus(_, JobStatus::Success)))
        .count();
    assert_eq!(update_calls, 1, "the CAS conflict must not be retried");
    // the claim stays recorded so the caller can retry deliberately
    assert_eq!(fixture.helper.claimed_job_count(), 1);
}

#[test]
async fn completing_an_unclaimed_job_fails_with_missing_receipt() {
    let fixture = fixture();
    fixture
        .store
        .put_job(JobId::from("job-1"), "payload".to_string())
        .await
        .unwrap();

    let result = fixture
        .helper
        .mark_job_completed(&fixture.ctx, JobId::from("job-1"), JobStatus::Success)
        .await;
    assert_eq!(
        result,
        Err(JobLifecycleError::MissingReceiptInfo(JobId::from("job-1")))
    );
}

#[test]
async fn input_validation_rejects_bad_requests() {
    let fixture = fixture();

    assert_eq!(
        fixture
            .helper
            .mark_job_completed(&fixture.ctx, JobId::from(""), JobStatus::Success)
            .await,
        Err(JobLifecycleError::MissingJobId)
    );
    assert_eq!(
        fixture
            .helper
            .mark_job_completed(&fixture.ctx, JobId::from("job-1"), JobStatus::Created)
            .await,
        Err(JobLifecycleError::InvalidJobStatus {
            job_id: JobId::from("job-1"),
            status: JobStatus::Created
        })
    );
    assert_eq!(
        fixture
            .helper
            .release_job_for_retry(&fixture.ctx, JobId::from("job-1"), Duration::from_secs(601))
            .await,
        Err(JobLifecycleError::InvalidDurationBeforeRelease(
            Duration::from_secs(601)
        ))
    );
}

#[test]
async fn releasing_a_terminal_job_clears_the_claim_and_fails() {
    let fixture = fixture();
    fixture
        .store
        .put_job(JobId::from("job-1"), "payload".to_string())
        .await
        .unwrap();
    fixture
        .helper
        .prepare_next_job(&fixture.ctx, extendable())
        .await
        .unwrap();
    fixture
        .store
        .modify_job(&JobId::from("job-1"), |job| {
            job.status = JobStatus::Success;
        })
        .unwrap();

    let result = fixture
        .helper
        .release_job_for_retry(&fixture.ctx, JobId::from("job-1"), Duration::from_secs(10))
        .await;
    assert_eq!(
        result,
        Err(JobLifecycleError::InvalidJobStatus {
            job_id: JobId::from("job-1"),
            status: JobStatus::Success
        })
    );
    assert_eq!(fixture.helper.claimed_job_count(), 0);
}

#[test]
async fn cancelled_contexts_resolve_with_cancelled() {
    let fixture = fixture();
    let ctx = OperationContext::root();
    ctx.cancel();

    assert_eq!(
        fixture.helper.prepare_next_job(&ctx, extendable()).await,
        Err(JobLifecycleError::Cancelled)
    );
    assert_eq!(
        fixture
            .helper
            .mark_job_completed(&ctx, JobId::from("job-1"), JobStatus::Success)
            .await,
        Err(JobLifecycleError::Cancelled)
    );
}

#[test]
async fn the_extender_abandons_jobs_past_the_processing_budget() {
    let fixture = fixture();
    fixture
        .store
        .put_job(JobId::from("job-1"), "payload".to_string())
        .await
        .unwrap();
    fixture.helper.start();

    fixture
        .helper
        .prepare_next_job(&fixture.ctx, extendable())
        .await
        .unwrap();
    assert_eq!(fixture.helper.claimed_job_count(), 1);

    // Simulate the job silently running over its wall budget
    fixture
        .store
        .modify_job(&JobId::from("job-1"), |job| {
            job.processing_started_time = Some(Utc::now() - chrono::Duration::seconds(200));
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(fixture.helper.claimed_job_count(), 0);
    fixture.helper.stop().await.unwrap();
}
