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

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cpio_common::model::{Job, JobId, JobMessage, JobStatus, ReceiptInfo};

use crate::clients::job::{
    JobClient, JobClientError, UpdateJobStatusRequest, UpdateJobStatusResponse,
    MAX_VISIBILITY_TIMEOUT,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InMemoryJobClientConfig {
    /// Visibility timeout applied to a message when it is claimed.
    #[serde(with = "humantime_serde")]
    pub default_visibility_timeout: Duration,
}

impl Default for InMemoryJobClientConfig {
    fn default() -> Self {
        Self {
            default_visibility_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug)]
struct QueueMessage {
    job_id: JobId,
    receipt: ReceiptInfo,
    visible_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    rows: HashMap<JobId, Job>,
    queue: VecDeque<QueueMessage>,
    next_server_id: u64,
}

/// Job backend holding the queue and the job table in process memory.
///
/// Behaves like the cloud pairing it stands in for: claiming a message hides
/// it for the configured visibility window and re-stamps the row as
/// processing (the returned snapshot is taken before that), releasing a job
/// back to `created` counts a retry, and terminal updates settle the queue
/// message when a receipt is supplied. Serves the test suites and the
/// worker's local mode.
pub struct InMemoryJobClient {
    config: InMemoryJobClientConfig,
    state: Mutex<State>,
}

impl InMemoryJobClient {
    pub fn new(config: InMemoryJobClientConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    /// Enqueues a message that has no corresponding row, producing the
    /// orphan shape the lifecycle helper cleans up.
    pub fn enqueue_orphan(&self, job_id: JobId) {
        let mut state = self.state.lock().unwrap();
        state.queue.push_back(QueueMessage {
            job_id,
            receipt: fresh_receipt(),
            visible_at: Utc::now(),
        });
    }

    /// Directly mutates a job row. Meant for arranging corner states in
    /// tests (crashed workers, exhausted retries).
    pub fn modify_job<F>(&self, job_id: &JobId, mutate: F) -> Result<(), JobClientError>
    where
        F: FnOnce(&mut Job),
    {
        let mut state = self.state.lock().unwrap();
        match state.rows.get_mut(job_id) {
            Some(job) => {
                mutate(job);
                Ok(())
            }
            None => Err(JobClientError::JobNotFound(job_id.clone())),
        }
    }

    pub fn message_count(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }
}

fn fresh_receipt() -> ReceiptInfo {
    ReceiptInfo(Uuid::new_v4().to_string())
}

/// `updated_time` doubles as the optimistic concurrency token, so every
/// write must produce a strictly newer value even within one clock tick.
fn next_updated_time(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + chrono::Duration::milliseconds(1)
    }
}

#[async_trait]
impl JobClient for InMemoryJobClient {
    async fn put_job(&self, job_id: JobId, body: String) -> Result<Job, JobClientError> {
        let mut state = self.state.lock().unwrap();
        if state.rows.contains_key(&job_id) {
            return Err(JobClientError::JobAlreadyExists(job_id));
        }
        state.next_server_id += 1;
        let now = Utc::now();
        let job = Job {
            id: job_id.clone(),
            server_job_id: format!("job-{:08}", state.next_server_id),
            status: JobStatus::Created,
            body,
            created_time: now,
            updated_time: now,
            processing_started_time: None,
            retry_count: 0,
        };
        state.rows.insert(job_id.clone(), job.clone());
        state.queue.push_back(QueueMessage {
            job_id,
            receipt: fresh_receipt(),
            visible_at: now,
        });
        Ok(job)
    }

    async fn get_next_job(&self) -> Result<JobMessage, JobClientError> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let position = state
            .queue
            .iter()
            .position(|message| message.visible_at <= now)
            .ok_or(JobClientError::NoPendingJob)?;

        let receipt = fresh_receipt();
        let visibility =
            chrono::Duration::from_std(self.config.default_visibility_timeout).unwrap();
        {
            let message = &mut state.queue[position];
            message.receipt = receipt.clone();
            message.visible_at = now + visibility;
        }
        let job_id = state.queue[position].job_id.clone();

        let snapshot = match state.rows.get_mut(&job_id) {
            Some(row) => {
                let snapshot = row.clone();
                if !row.status.is_terminal() {
                    row.status = JobStatus::Processing;
                    row.processing_started_time = Some(now);
                    row.updated_time = next_updated_time(row.updated_time);
                }
                snapshot
            }
            None => Job::orphaned(job_id),
        };

        Ok(JobMessage {
            job: snapshot,
            receipt,
        })
    }

    async fn get_job_by_id(&self, job_id: &JobId) -> Result<Job, JobClientError> {
        let state = self.state.lock().unwrap();
        state
            .rows
            .get(job_id)
            .cloned()
            .ok_or_else(|| JobClientError::JobNotFound(job_id.clone()))
    }

    async fn update_job_status(
        &self,
        request: UpdateJobStatusRequest,
    ) -> Result<UpdateJobStatusResponse, JobClientError> {
        let mut state = self.state.lock().unwrap();

        let updated_time = {
            let row = state
                .rows
                .get_mut(&request.job_id)
                .ok_or_else(|| JobClientError::JobNotFound(request.job_id.clone()))?;

            if let Some(expected) = request.expected_updated_time {
                if row.updated_time != expected {
                    return Err(JobClientError::UpdateConflict {
                        job_id: request.job_id.clone(),
                        expected,
                        actual: row.updated_time,
                    });
                }
            }

            row.status = request.job_status;
            if request.job_status == JobStatus::Created {
                // A release back to the queue counts as a retry
                row.retry_count += 1;
                row.processing_started_time = None;
            }
            row.updated_time = next_updated_time(row.updated_time);
            row.updated_time
        };

        if request.job_status.is_terminal() {
            if let Some(receipt) = &request.receipt {
                let position = state
                    .queue
                    .iter()
                    .position(|message| message.job_id == request.job_id);
                match position {
                    Some(position) if &state.queue[position].receipt == receipt => {
                        let _ = state.queue.remove(position);
                    }
                    Some(_) | None => {
                        return Err(JobClientError::InvalidReceipt(request.job_id.clone()))
                    }
                }
            }
        }

        Ok(UpdateJobStatusResponse { updated_time })
    }

    async fn update_job_visibility_timeout(
        &self,
        job_id: &JobId,
        duration: Duration,
        receipt: &ReceiptInfo,
    ) -> Result<(), JobClientError> {
        if duration > MAX_VISIBILITY_TIMEOUT {
            return Err(JobClientError::InvalidVisibilityTimeout(duration));
        }
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let message = state
            .queue
            .iter_mut()
            .find(|message| &message.job_id == job_id)
            .ok_or_else(|| JobClientError::InvalidReceipt(job_id.clone()))?;
        if &message.receipt != receipt {
            return Err(JobClientError::InvalidReceipt(job_id.clone()));
        }
        message.visible_at = now + chrono::Duration::from_std(duration).unwrap();
        Ok(())
    }

    async fn delete_orphaned_job_message(
        &self,
        job_id: &JobId,
        receipt: &ReceiptInfo,
    ) -> Result<(), JobClientError> {
        let mut state = self.state.lock().unwrap();
        let position = state
            .queue
            .iter()
            .position(|message| &message.job_id == job_id && &message.receipt == receipt)
            .ok_or_else(|| JobClientError::InvalidReceipt(job_id.clone()))?;
        let _ = state.queue.remove(position);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn client() -> InMemoryJobClient {
        InMemoryJobClient::new(InMemoryJobClientConfig::default())
    }

    #[test]
    async fn claiming_returns_the_pre_claim_snapshot_and_marks_processing() {
        let client = client();
        client
            .put_job(JobId::from("j1"), "body".to_string())
            .await
            .unwrap();

        let message = client.get_next_job().await.unwrap();
        assert_eq!(message.job.status, JobStatus::Created);

        let row = client.get_job_by_id(&JobId::from("j1")).await.unwrap();
        assert_eq!(row.status, JobStatus::Processing);
        assert!(row.processing_started_time.is_some());
    }

    #[test]
    async fn claimed_messages_are_invisible_until_the_timeout() {
        let client = client();
        client
            .put_job(JobId::from("j1"), "body".to_string())
            .await
            .unwrap();

        client.get_next_job().await.unwrap();
        assert_eq!(
            client.get_next_job().await.unwrap_err(),
            JobClientError::NoPendingJob
        );
    }

    #[test]
    async fn stale_updated_time_fails_the_cas() {
        let client = client();
        let job = client
            .put_job(JobId::from("j1"), "body".to_string())
            .await
            .unwrap();
        let stale = job.updated_time;

        client.get_next_job().await.unwrap();

        let result = client
            .update_job_status(UpdateJobStatusRequest {
                job_id: JobId::from("j1"),
                job_status: JobStatus::Success,
                receipt: None,
                expected_updated_time: Some(stale),
            })
            .await;
        assert!(matches!(
            result,
            Err(JobClientError::UpdateConflict { .. })
        ));
    }

    #[test]
    async fn terminal_update_with_receipt_settles_the_queue_message() {
        let client = client();
        client
            .put_job(JobId::from("j1"), "body".to_string())
            .await
            .unwrap();
        let message = client.get_next_job().await.unwrap();
        let row = client.get_job_by_id(&JobId::from("j1")).await.unwrap();

        client
            .update_job_status(UpdateJobStatusRequest {
                job_id: JobId::from("j1"),
                job_status: JobStatus::Success,
                receipt: Some(message.receipt),
                expected_updated_time: Some(row.updated_time),
            })
            .await
            .unwrap();
        assert_eq!(client.message_count(), 0);
    }

    #[test]
    async fn releasing_a_job_counts_a_retry() {
        let client = client();
        client
            .put_job(JobId::from("j1"), "body".to_string())
            .await
            .unwrap();
        client.get_next_job().await.unwrap();

        client
            .update_job_status(UpdateJobStatusRequest {
                job_id: JobId::from("j1"),
                job_status: JobStatus::Created,
                receipt: None,
                expected_updated_time: None,
            })
            .await
            .unwrap();

        let row = client.get_job_by_id(&JobId::from("j1")).await.unwrap();
        assert_eq!(row.status, JobStatus::Created);
        assert_eq!(row.retry_count, 1);
        assert_eq!(row.processing_started_time, None);
    }

    #[test]
    async fn orphan_messages_yield_a_default_row() {
        let client = client();
        client.enqueue_orphan(JobId::from("ghost"));

        let message = client.get_next_job().await.unwrap();
        assert_eq!(message.job.status, JobStatus::Unknown);
        assert!(message.job.has_default_created_time());

        client
            .delete_orphaned_job_message(&JobId::from("ghost"), &message.receipt)
            .await
            .unwrap();
        assert_eq!(client.message_count(), 0);
    }

    #[test]
    async fn visibility_updates_validate_the_receipt_and_duration() {
        let client = client();
        client
            .put_job(JobId::from("j1"), "body".to_string())
            .await
            .unwrap();
        let message = client.get_next_job().await.unwrap();

        assert!(matches!(
            client
                .update_job_visibility_timeout(
                    &JobId::from("j1"),
                    Duration::from_secs(601),
                    &message.receipt
                )
                .await,
            Err(JobClientError::InvalidVisibilityTimeout(_))
        ));
        assert!(matches!(
            client
                .update_job_visibility_timeout(
                    &JobId::from("j1"),
                    Duration::from_secs(10),
                    &ReceiptInfo("bogus".to_string())
                )
                .await,
            Err(JobClientError::InvalidReceipt(_))
        ));
        client
            .update_job_visibility_timeout(
                &JobId::from("j1"),
                Duration::from_secs(10),
                &message.receipt,
            )
            .await
            .unwrap();
    }

    #[test]
    async fn released_messages_become_visible_after_the_duration() {
        let client = client();
        client
            .put_job(JobId::from("j1"), "body".to_string())
            .await
            .unwrap();
        let message = client.get_next_job().await.unwrap();

        // zero duration makes the message immediately claimable again
        client
            .update_job_visibility_timeout(&JobId::from("j1"), Duration::ZERO, &message.receipt)
            .await
            .unwrap();
        let reclaimed = client.get_next_job().await.unwrap();
        assert_eq!(reclaimed.job.id, JobId::from("j1"));
        assert_ne!(reclaimed.receipt, message.receipt);
    }
}
