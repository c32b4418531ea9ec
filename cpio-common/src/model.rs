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

use std::fmt::{Display, Formatter};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub use crate::config::RetryConfig;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        JobId(value.to_string())
    }
}

/// Opaque token handed out by the queue together with a claimed message.
/// Required to extend the message's visibility, complete it or delete it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptInfo(pub String);

impl ReceiptInfo {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for ReceiptInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    #[default]
    Unknown,
    Created,
    Processing,
    Success,
    Failure,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failure)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Unknown => write!(f, "unknown"),
            JobStatus::Created => write!(f, "created"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Failure => write!(f, "failure"),
        }
    }
}

/// A unit of work as stored in the job table. `id` is the caller-assigned
/// identity used on the queue; `server_job_id` is assigned by the backing
/// store on creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub server_job_id: String,
    pub status: JobStatus,
    pub body: String,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    pub processing_started_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

impl Job {
    /// Placeholder row returned for a queue message without a corresponding
    /// job entry. All fields carry their defaults, which is what the orphan
    /// detection in job preparation keys off.
    pub fn orphaned(id: JobId) -> Job {
        Job {
            id,
            server_job_id: String::new(),
            status: JobStatus::Unknown,
            body: String::new(),
            created_time: epoch(),
            updated_time: epoch(),
            processing_started_time: None,
            retry_count: 0,
        }
    }

    pub fn has_default_created_time(&self) -> bool {
        self.created_time == epoch()
    }
}

pub fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).unwrap()
}

/// A claimed queue message: the job row snapshot taken at claim time plus
/// the receipt required for follow-up queue operations.
#[derive(Clone, Debug, PartialEq)]
pub struct JobMessage {
    pub job: Job,
    pub receipt: ReceiptInfo,
}

/// The cloud vendors the runtime can be pointed at. Only the few seams that
/// genuinely differ per vendor (auth endpoints, SDK factories) branch on
/// this; everything else goes through vendor-neutral interfaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudVendor {
    Aws,
    Gcp,
}

impl Display for CloudVendor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CloudVendor::Aws => write!(f, "aws"),
            CloudVendor::Gcp => write!(f, "gcp"),
        }
    }
}
