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

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use cpio_common::model::{Job, JobId, JobMessage, JobStatus, ReceiptInfo};
use cpio_common::SafeDisplay;

/// Queue messages can be hidden for at most this long in one operation.
pub const MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateJobStatusRequest {
    pub job_id: JobId,
    pub job_status: JobStatus,
    /// Required when the transition also settles the queue message
    /// (terminal statuses); optional otherwise.
    pub receipt: Option<ReceiptInfo>,
    /// When set, the update only succeeds if the row still carries this
    /// `updated_time`; a mismatch fails with `UpdateConflict`.
    pub expected_updated_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateJobStatusResponse {
    pub updated_time: DateTime<Utc>,
}

/// Storage and queue operations for jobs, backed by a queue + table pair.
/// The runtime consumes this interface only; concrete cloud bindings live
/// with their vendors.
#[async_trait]
pub trait JobClient: Send + Sync {
    /// Creates a job row and enqueues its message.
    async fn put_job(&self, job_id: JobId, body: String) -> Result<Job, JobClientError>;

    /// Claims the next visible queue message and loads the corresponding
    /// row. The message stays invisible to other consumers for the
    /// server-side default.
    async fn get_next_job(&self) -> Result<JobMessage, JobClientError>;

    /// Reads the job row only.
    async fn get_job_by_id(&self, job_id: &JobId) -> Result<Job, JobClientError>;

    async fn update_job_status(
        &self,
        request: UpdateJobStatusRequest,
    ) -> Result<UpdateJobStatusResponse, JobClientError>;

    /// Extends the queue-side invisibility of a claimed message.
    /// `duration` must not exceed [`MAX_VISIBILITY_TIMEOUT`].
    async fn update_job_visibility_timeout(
        &self,
        job_id: &JobId,
        duration: Duration,
        receipt: &ReceiptInfo,
    ) -> Result<(), JobClientError>;

    /// Removes a queue message whose row is missing or already terminal.
    async fn delete_orphaned_job_message(
        &self,
        job_id: &JobId,
        receipt: &ReceiptInfo,
    ) -> Result<(), JobClientError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobClientError {
    #[error("no job is available in the queue")]
    NoPendingJob,
    #[error("job {0} was not found")]
    JobNotFound(JobId),
    #[error("job {job_id} was updated concurrently (expected updated_time {expected}, found {actual})")]
    UpdateConflict {
        job_id: JobId,
        expected: DateTime<Utc>,
        actual: DateTime<Utc>,
    },
    #[error("job {0} already exists")]
    JobAlreadyExists(JobId),
    #[error("invalid visibility timeout {0:?}")]
    InvalidVisibilityTimeout(Duration),
    #[error("receipt for job {0} is not valid")]
    InvalidReceipt(JobId),
    #[error("job service error: {0}")]
    Service(String),
    #[error("job service connection error: {0}")]
    Connection(String),
}

impl JobClientError {
    pub fn is_retriable(error: &JobClientError) -> bool {
        matches!(error, JobClientError::Connection(_))
    }
}

impl SafeDisplay for JobClientError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}
