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

use async_trait::async_trait;

use cpio_common::SafeDisplay;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TryFinishInstanceTerminationRequest {
    pub instance_resource_name: String,
    pub lifecycle_hook_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TryFinishInstanceTerminationResponse {
    /// `true` means the autoscaler decided to drain this instance; the
    /// caller must stop claiming new work.
    pub termination_scheduled: bool,
}

/// Gate between the worker and its autoscaler. Asking to finish the
/// instance's termination either completes a pending scale-in (the response
/// says so) or confirms the instance is safe to keep working.
#[async_trait]
pub trait AutoScalingClient: Send + Sync {
    async fn try_finish_instance_termination(
        &self,
        request: TryFinishInstanceTerminationRequest,
    ) -> Result<TryFinishInstanceTerminationResponse, AutoScalingError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AutoScalingError {
    #[error("instance resource name '{0}' is not valid")]
    InvalidResourceName(String),
    #[error("auto scaling service error: {0}")]
    Service(String),
    #[error("auto scaling connection error: {0}")]
    Connection(String),
}

impl AutoScalingError {
    pub fn is_retriable(error: &AutoScalingError) -> bool {
        matches!(error, AutoScalingError::Connection(_))
    }
}

impl SafeDisplay for AutoScalingError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

/// Stand-in for deployments without an autoscaler (local runs, fixed-size
/// fleets): the instance is never draining.
pub struct NoopAutoScalingClient;

#[async_trait]
impl AutoScalingClient for NoopAutoScalingClient {
    async fn try_finish_instance_termination(
        &self,
        _request: TryFinishInstanceTerminationRequest,
    ) -> Result<TryFinishInstanceTerminationResponse, AutoScalingError> {
        Ok(TryFinishInstanceTerminationResponse {
            termination_scheduled: false,
        })
    }
}
