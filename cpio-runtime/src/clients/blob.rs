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
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use cpio_common::SafeDisplay;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BlobStreamError {
    #[error("the stream session was cancelled")]
    StreamSessionCancelled,
    #[error("the stream session expired")]
    StreamSessionExpired,
    #[error("blob storage error: {0}")]
    Storage(String),
}

impl SafeDisplay for BlobStreamError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

/// Cancellation and expiry state of a chunked blob transfer. Streaming
/// implementations call [`StreamSession::checkpoint`] between chunks; there
/// is no preemption of the chunk currently on the wire.
pub struct StreamSession {
    cancellation: CancellationToken,
    expires_at: Instant,
}

impl StreamSession {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            cancellation: CancellationToken::new(),
            expires_at: Instant::now() + lifetime,
        }
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Polled between chunks; the first failed checkpoint ends the stream
    /// with the corresponding session error.
    pub fn checkpoint(&self) -> Result<(), BlobStreamError> {
        if self.cancellation.is_cancelled() {
            return Err(BlobStreamError::StreamSessionCancelled);
        }
        if Instant::now() >= self.expires_at {
            return Err(BlobStreamError::StreamSessionExpired);
        }
        Ok(())
    }
}

pub type BlobByteStream<'a> = BoxStream<'a, Result<Bytes, BlobStreamError>>;

/// Streaming blob access as consumed by the execution core. Vendor bindings
/// implement this against their SDKs; the core only relies on the chunked
/// contracts and the session semantics.
#[async_trait]
pub trait BlobStorageClient: Send + Sync {
    async fn get_blob_stream(
        &self,
        bucket: &str,
        key: &str,
        session: &StreamSession,
    ) -> Result<BlobByteStream<'static>, BlobStreamError>;

    async fn put_blob_stream(
        &self,
        bucket: &str,
        key: &str,
        data: BlobByteStream<'static>,
        session: &StreamSession,
    ) -> Result<(), BlobStreamError>;
}
