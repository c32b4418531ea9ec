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

use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry};

use cpio_common::metrics::DEFAULT_TIME_BUCKETS;

/// Event label values recorded against the lifecycle counters.
pub mod event {
    pub const PREPARATION: &str = "preparation";
    pub const PREPARATION_SUCCESS: &str = "preparation_success";
    pub const TRY_FINISH_TERMINATION_FAILURE: &str = "try_finish_instance_termination_failure";
    pub const CURRENT_INSTANCE_TERMINATING: &str = "current_instance_terminating";
    pub const GET_NEXT_JOB_FAILURE: &str = "get_next_job_failure";
    pub const UPDATE_JOB_STATUS_FAILURE: &str = "update_job_status_failure";

    pub const COMPLETION_SUCCESS: &str = "completion_success";
    pub const COMPLETION_WITH_FAILURE_STATUS: &str = "completion_with_failure_status";
    pub const INVALID_REQUEST: &str = "invalid_request";
    pub const GET_JOB_BY_ID_FAILURE: &str = "get_job_by_id_failure";
    pub const PROCESSING_TIME_ERROR: &str = "processing_time_error";

    pub const RELEASE: &str = "release";
    pub const RELEASE_SUCCESS: &str = "release_success";
    pub const INVALID_JOB_STATUS: &str = "invalid_job_status";
    pub const UPDATE_VISIBILITY_TIMEOUT_FAILURE: &str = "update_visibility_timeout_failure";

    pub const MISSING_RECEIPT_INFO: &str = "missing_receipt_info";
    pub const FIND_METADATA_FAILURE: &str = "find_metadata_failure";
}

struct Inner {
    job_preparation: IntCounterVec,
    job_preparation_failures: IntCounterVec,
    job_completion: IntCounterVec,
    job_completion_failures: IntCounterVec,
    job_release: IntCounterVec,
    job_release_failures: IntCounterVec,
    job_extender_failures: IntCounterVec,
    job_metadata_map_failures: IntCounterVec,
    job_processing_time: Histogram,
    job_waiting_time: Histogram,
}

/// Lifecycle metrics, namespaced per configuration. A disabled instance
/// turns every recording into a no-op while keeping call sites unchanged.
#[derive(Clone)]
pub struct JobMetrics {
    inner: Option<Arc<Inner>>,
}

fn event_counter(
    registry: &Registry,
    namespace: &str,
    name: &str,
    help: &str,
) -> prometheus::Result<IntCounterVec> {
    let counter = IntCounterVec::new(
        Opts::new(name, help).namespace(namespace.to_string()),
        &["event"],
    )?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn time_histogram(
    registry: &Registry,
    namespace: &str,
    name: &str,
    help: &str,
) -> prometheus::Result<Histogram> {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(name, help)
            .namespace(namespace.to_string())
            .buckets(DEFAULT_TIME_BUCKETS.to_vec()),
    )?;
    registry.register(Box::new(histogram.clone()))?;
    Ok(histogram)
}

impl JobMetrics {
    pub fn register(namespace: &str, registry: &Registry) -> prometheus::Result<JobMetrics> {
        Ok(JobMetrics {
            inner: Some(Arc::new(Inner {
                job_preparation: event_counter(
                    registry,
                    namespace,
                    "job_preparation_total",
                    "Number of job preparation events",
                )?,
                job_preparation_failures: event_counter(
                    registry,
                    namespace,
                    "job_preparation_failures_total",
                    "Number of failed job preparations by cause",
                )?,
                job_completion: event_counter(
                    registry,
                    namespace,
                    "job_completion_total",
                    "Number of job completion events",
                )?,
                job_completion_failures: event_counter(
                    registry,
                    namespace,
                    "job_completion_failures_total",
                    "Number of failed job completions by cause",
                )?,
                job_release: event_counter(
                    registry,
                    namespace,
                    "job_release_total",
                    "Number of job release events",
                )?,
                job_release_failures: event_counter(
                    registry,
                    namespace,
                    "job_release_failures_total",
                    "Number of failed job releases by cause",
                )?,
                job_extender_failures: event_counter(
                    registry,
                    namespace,
                    "job_extender_failures_total",
                    "Number of failed visibility extensions by cause",
                )?,
                job_metadata_map_failures: event_counter(
                    registry,
                    namespace,
                    "job_metadata_map_failures_total",
                    "Number of claimed-jobs map inconsistencies by cause",
                )?,
                job_processing_time: time_histogram(
                    registry,
                    namespace,
                    "job_processing_time_seconds",
                    "Time between the start of processing and completion of a job",
                )?,
                job_waiting_time: time_histogram(
                    registry,
                    namespace,
                    "job_waiting_time_seconds",
                    "Time a job spent queued before processing started",
                )?,
            })),
        })
    }

    pub fn disabled() -> JobMetrics {
        JobMetrics { inner: None }
    }

    pub fn record_preparation(&self, event: &str) {
        if let Some(inner) = &self.inner {
            inner.job_preparation.with_label_values(&[event]).inc();
        }
    }

    pub fn record_preparation_failure(&self, event: &str) {
        if let Some(inner) = &self.inner {
            inner
                .job_preparation_failures
                .with_label_values(&[event])
                .inc();
        }
    }

    pub fn record_completion(&self, event: &str) {
        if let Some(inner) = &self.inner {
            inner.job_completion.with_label_values(&[event]).inc();
        }
    }

    pub fn record_completion_failure(&self, event: &str) {
        if let Some(inner) = &self.inner {
            inner
                .job_completion_failures
                .with_label_values(&[event])
                .inc();
        }
    }

    pub fn record_release(&self, event: &str) {
        if let Some(inner) = &self.inner {
            inner.job_release.with_label_values(&[event]).inc();
        }
    }

    pub fn record_release_failure(&self, event: &str) {
        if let Some(inner) = &self.inner {
            inner.job_release_failures.with_label_values(&[event]).inc();
        }
    }

    pub fn record_extender_failure(&self, event: &str) {
        if let Some(inner) = &self.inner {
            inner
                .job_extender_failures
                .with_label_values(&[event])
                .inc();
        }
    }

    pub fn record_metadata_map_failure(&self, event: &str) {
        if let Some(inner) = &self.inner {
            inner
                .job_metadata_map_failures
                .with_label_values(&[event])
                .inc();
        }
    }

    pub fn record_processing_time_seconds(&self, seconds: f64) {
        if let Some(inner) = &self.inner {
            inner.job_processing_time.observe(seconds);
        }
    }

    pub fn record_waiting_time_seconds(&self, seconds: f64) {
        if let Some(inner) = &self.inner {
            inner.job_waiting_time.observe(seconds);
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn disabled_metrics_are_noops() {
        let metrics = JobMetrics::disabled();
        metrics.record_preparation(event::PREPARATION);
        metrics.record_processing_time_seconds(1.0);
    }

    #[test]
    fn registered_metrics_show_up_in_the_registry() {
        let registry = Registry::new();
        let metrics = JobMetrics::register("cpio", &registry).unwrap();
        metrics.record_preparation(event::PREPARATION_SUCCESS);
        metrics.record_waiting_time_seconds(0.25);

        let rendered = prometheus::TextEncoder::new()
            .encode_to_string(&registry.gather())
            .unwrap();
        assert!(rendered.contains("cpio_job_preparation_total"));
        assert!(rendered.contains("cpio_job_waiting_time_seconds"));
    }
}
