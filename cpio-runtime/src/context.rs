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

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Carrier threaded through every asynchronous operation of the runtime.
///
/// The correlation pair groups the log lines of an operation with those of
/// the operations it spawned; it has no semantic effect. The cancellation
/// token propagates downward into sub-operations: cancelling a context
/// cancels everything derived from it, while a child completing or being
/// cancelled leaves the parent untouched. Cancellation is observed at
/// scheduling points only; an in-flight network call is never preempted.
#[derive(Clone, Debug)]
pub struct OperationContext {
    parent_id: Uuid,
    current_id: Uuid,
    cancellation: CancellationToken,
}

impl OperationContext {
    pub fn root() -> Self {
        Self {
            parent_id: Uuid::nil(),
            current_id: Uuid::new_v4(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Derives the context of a sub-operation: the current id becomes the
    /// parent, and cancellation chains downward.
    pub fn child(&self) -> Self {
        Self {
            parent_id: self.current_id,
            current_id: Uuid::new_v4(),
            cancellation: self.cancellation.child_token(),
        }
    }

    pub fn parent_id(&self) -> Uuid {
        self.parent_id
    }

    pub fn current_id(&self) -> Uuid {
        self.current_id
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::root()
    }
}

impl Display for OperationContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.parent_id, self.current_id)
    }
}
