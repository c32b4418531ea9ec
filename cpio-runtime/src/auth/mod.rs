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

mod gcp;
mod tee;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use cpio_common::config::RetryConfig;
use cpio_common::model::CloudVendor;
use cpio_common::SafeDisplay;

use crate::context::OperationContext;

pub use gcp::GcpAuthTokenProvider;

/// Tokens are refreshed this much before their actual expiry so that a token
/// handed to a caller stays valid for the duration of the call it
/// authenticates.
pub const TOKEN_EXPIRY_GRACE: Duration = Duration::from_secs(300);

/// A session token together with its absolute expiry. Tokens without an
/// expiry (the TEE attestation tokens) are never considered reusable.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenRecord {
    pub session_token: String,
    pub expire_time: Option<DateTime<Utc>>,
}

impl TokenRecord {
    /// Whether the token is expired for client purposes, which happens
    /// [`TOKEN_EXPIRY_GRACE`] before the actual expiry.
    pub fn is_expired_for_client(&self, now: DateTime<Utc>) -> bool {
        match self.expire_time {
            Some(expire_time) => {
                now + chrono::Duration::from_std(TOKEN_EXPIRY_GRACE).unwrap() > expire_time
            }
            None => true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthTokenError {
    #[error("token endpoint request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("token endpoint returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("token endpoint returned malformed data: {0}")]
    MalformedToken(String),
    #[error("token endpoint returned an empty token")]
    EmptyToken,
    #[error("TEE token socket failure: {0}")]
    Socket(String),
}

impl AuthTokenError {
    pub fn is_retriable(error: &AuthTokenError) -> bool {
        match error {
            AuthTokenError::Transport(_) => true,
            AuthTokenError::Status(status) => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            // A bad response body usually means the metadata server answered
            // mid-rotation; the next attempt gets a consistent one.
            AuthTokenError::MalformedToken(_) => true,
            AuthTokenError::EmptyToken => false,
            AuthTokenError::Socket(_) => true,
        }
    }
}

impl SafeDisplay for AuthTokenError {
    fn to_safe_string(&self) -> String {
        // The variants never embed token material, only failure reasons
        self.to_string()
    }
}

/// Issues cloud session tokens, caching them until shortly before expiry.
///
/// Callers racing on the same audience may both end up fetching; the fetch
/// is idempotent, so the cache deliberately does not single-flight.
#[async_trait]
pub trait AuthTokenProvider: Send + Sync {
    /// Token of the instance's default service identity.
    async fn get_session_token(
        &self,
        ctx: &OperationContext,
    ) -> Result<TokenRecord, AuthTokenError>;

    /// Identity token scoped to the given audience URI.
    async fn get_session_token_for_target_audience(
        &self,
        ctx: &OperationContext,
        audience: &str,
    ) -> Result<TokenRecord, AuthTokenError>;

    /// Attestation token from the TEE launcher. Never cached.
    async fn get_tee_session_token(
        &self,
        ctx: &OperationContext,
        audience: &str,
        token_type: &str,
    ) -> Result<TokenRecord, AuthTokenError>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthTokenProviderConfig {
    pub metadata_base_url: Url,
    pub tee_socket_path: PathBuf,
    pub retries: RetryConfig,
    /// Hygiene lifetime of the per-audience cache entries. Tokens inside the
    /// entries carry their own expiry; this only bounds how long a stale
    /// audience lingers in the cache.
    #[serde(with = "humantime_serde")]
    pub audience_cache_lifetime: Duration,
}

impl AuthTokenProviderConfig {
    pub fn for_vendor(vendor: CloudVendor) -> Self {
        let metadata_base_url = match vendor {
            CloudVendor::Gcp => Url::parse("http://metadata.google.internal").unwrap(),
            CloudVendor::Aws => Url::parse("http://169.254.169.254").unwrap(),
        };
        Self {
            metadata_base_url,
            ..Self::default()
        }
    }
}

impl Default for AuthTokenProviderConfig {
    fn default() -> Self {
        Self {
            metadata_base_url: Url::parse("http://metadata.google.internal").unwrap(),
            tee_socket_path: PathBuf::from("/run/container_launcher/teeserver.sock"),
            retries: RetryConfig {
                max_attempts: 5,
                min_delay: Duration::from_millis(51),
                max_delay: Duration::from_secs(1),
                multiplier: 2.0,
                max_jitter_factor: None,
            },
            audience_cache_lifetime: Duration::from_secs(3600),
        }
    }
}

impl SafeDisplay for AuthTokenProviderConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "metadata base url: {}, TEE socket: {}, retries: {}",
            self.metadata_base_url,
            self.tee_socket_path.display(),
            self.retries.to_safe_string()
        )
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn tokens_expire_for_clients_before_their_actual_expiry() {
        let now = Utc::now();
        let token = TokenRecord {
            session_token: "token".to_string(),
            expire_time: Some(now + chrono::Duration::seconds(3600)),
        };
        assert!(!token.is_expired_for_client(now));
        assert!(!token.is_expired_for_client(now + chrono::Duration::seconds(3299)));
        assert!(token.is_expired_for_client(now + chrono::Duration::seconds(3301)));
    }

    #[test]
    fn tokens_without_expiry_are_never_reused() {
        let token = TokenRecord {
            session_token: "token".to_string(),
            expire_time: None,
        };
        assert!(token.is_expired_for_client(Utc::now()));
    }

    #[test]
    fn empty_tee_tokens_are_not_retriable() {
        assert!(!AuthTokenError::is_retriable(&AuthTokenError::EmptyToken));
        assert!(AuthTokenError::is_retriable(&AuthTokenError::MalformedToken(
            "bad".to_string()
        )));
    }
}
