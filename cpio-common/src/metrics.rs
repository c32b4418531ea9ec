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

pub const DEFAULT_TIME_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

pub mod external_calls {
    use lazy_static::lazy_static;
    use prometheus::{register_int_counter_vec, IntCounterVec};

    lazy_static! {
        static ref EXTERNAL_CALL_RETRIES_TOTAL: IntCounterVec = register_int_counter_vec!(
            "external_call_retries_total",
            "Number of retried external calls",
            &["target", "op"]
        )
        .unwrap();
        static ref EXTERNAL_CALL_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
            "external_call_failures_total",
            "Number of external calls that failed after all retries",
            &["target", "op"]
        )
        .unwrap();
    }

    pub fn record_external_call_retry(target: &'static str, op: &'static str) {
        EXTERNAL_CALL_RETRIES_TOTAL
            .with_label_values(&[target, op])
            .inc();
    }

    pub fn record_external_call_failure(target: &'static str, op: &'static str) {
        EXTERNAL_CALL_FAILURES_TOTAL
            .with_label_values(&[target, op])
            .inc();
    }
}

pub mod caching {
    use lazy_static::lazy_static;
    use prometheus::{register_int_counter_vec, IntCounterVec};

    lazy_static! {
        static ref CACHE_HITS_TOTAL: IntCounterVec = register_int_counter_vec!(
            "cache_hits_total",
            "Number of cache hits",
            &["cache"]
        )
        .unwrap();
        static ref CACHE_MISSES_TOTAL: IntCounterVec = register_int_counter_vec!(
            "cache_misses_total",
            "Number of cache misses",
            &["cache"]
        )
        .unwrap();
        static ref CACHE_EVICTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
            "cache_evictions_total",
            "Number of cache entries evicted after expiry",
            &["cache"]
        )
        .unwrap();
    }

    pub fn record_cache_hit(cache: &'static str) {
        CACHE_HITS_TOTAL.with_label_values(&[cache]).inc();
    }

    pub fn record_cache_miss(cache: &'static str) {
        CACHE_MISSES_TOTAL.with_label_values(&[cache]).inc();
    }

    pub fn record_cache_eviction(cache: &'static str) {
        CACHE_EVICTIONS_TOTAL.with_label_values(&[cache]).inc();
    }
}
