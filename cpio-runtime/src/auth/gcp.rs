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

use std::sync::Mutex;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use cpio_common::cache::{AutoExpiryCache, CacheOptions};
use cpio_common::retries::with_retries;

use crate::auth::tee::fetch_tee_session_token;
use crate::auth::{AuthTokenError, AuthTokenProvider, AuthTokenProviderConfig, TokenRecord};
use crate::context::OperationContext;

const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";
const METADATA_FLAVOR_VALUE: &str = "Google";
const TOKEN_PATH: &str = "computeMetadata/v1/instance/service-accounts/default/token";
const IDENTITY_PATH: &str = "computeMetadata/v1/instance/service-accounts/default/identity";

const TARGET_LABEL: &str = "auth-token";

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    expires_in: i64,
    #[allow(dead_code)]
    token_type: String,
}

/// The identity token payload must carry all of these claims to be accepted.
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct IdentityTokenClaims {
    iss: String,
    aud: String,
    sub: String,
    iat: i64,
    exp: i64,
}

/// Token cache in front of the GCP instance metadata server.
///
/// The default service identity has a single cached slot behind a lock; the
/// audience-scoped identity tokens live in an auto-expiring map keyed by
/// audience URI. Both paths refetch through the retry driver once the cached
/// token enters its expiry grace window.
pub struct GcpAuthTokenProvider {
    http_client: reqwest::Client,
    config: AuthTokenProviderConfig,
    default_token: Mutex<Option<TokenRecord>>,
    audience_tokens: AutoExpiryCache<String, TokenRecord>,
}

impl GcpAuthTokenProvider {
    pub fn new(config: AuthTokenProviderConfig) -> Self {
        let audience_tokens = AutoExpiryCache::new(
            "auth-token-audience",
            CacheOptions {
                entry_lifetime: config.audience_cache_lifetime,
                eviction_resolution: std::time::Duration::from_secs(60),
                extend_on_access: false,
                block_in_use_entries: false,
                on_evict: None,
            },
        );
        Self {
            http_client: reqwest::Client::new(),
            config,
            default_token: Mutex::new(None),
            audience_tokens,
        }
    }

    /// Stops the audience cache's eviction task.
    pub async fn stop(&self) {
        self.audience_tokens.stop().await;
    }

    fn token_url(&self) -> Url {
        self.config
            .metadata_base_url
            .join(TOKEN_PATH)
            .expect("invalid metadata base url")
    }

    fn identity_url(&self, audience: &str) -> Url {
        let mut url = self
            .config
            .metadata_base_url
            .join(IDENTITY_PATH)
            .expect("invalid metadata base url");
        url.query_pairs_mut()
            .append_pair("audience", audience)
            .append_pair("format", "full");
        url
    }

    async fn fetch_default_token(
        http_client: &reqwest::Client,
        url: &Url,
    ) -> Result<TokenRecord, AuthTokenError> {
        let response = http_client
            .get(url.clone())
            .header(METADATA_FLAVOR_HEADER, METADATA_FLAVOR_VALUE)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AuthTokenError::Status(response.status()));
        }
        let body = response.bytes().await?;
        let parsed: TokenEndpointResponse = serde_json::from_slice(&body)
            .map_err(|err| AuthTokenError::MalformedToken(err.to_string()))?;
        Ok(TokenRecord {
            session_token: parsed.access_token,
            expire_time: Some(Utc::now() + chrono::Duration::seconds(parsed.expires_in)),
        })
    }

    async fn fetch_identity_token(
        http_client: &reqwest::Client,
        url: &Url,
    ) -> Result<TokenRecord, AuthTokenError> {
        let response = http_client
            .get(url.clone())
            .header(METADATA_FLAVOR_HEADER, METADATA_FLAVOR_VALUE)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AuthTokenError::Status(response.status()));
        }
        let body = response.text().await?;
        let claims = decode_identity_token_claims(&body)?;
        Ok(TokenRecord {
            session_token: body,
            expire_time: Some(
                Utc.timestamp_opt(claims.exp, 0)
                    .single()
                    .ok_or_else(|| AuthTokenError::MalformedToken("invalid exp".to_string()))?,
            ),
        })
    }
}

/// Validates the compact JWT shape and decodes its payload. The payload is
/// only inspected for the expiry; the token is used verbatim.
fn decode_identity_token_claims(token: &str) -> Result<IdentityTokenClaims, AuthTokenError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(AuthTokenError::MalformedToken(format!(
            "expected a compact JWT with 3 parts, got {}",
            parts.len()
        )));
    }
    let payload = pad_base64(parts[1]);
    let decoded = URL_SAFE
        .decode(payload.as_bytes())
        .map_err(|err| AuthTokenError::MalformedToken(format!("payload is not base64: {err}")))?;
    serde_json::from_slice(&decoded)
        .map_err(|err| AuthTokenError::MalformedToken(format!("payload is not valid: {err}")))
}

fn pad_base64(encoded: &str) -> String {
    let mut padded = encoded.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    padded
}

#[async_trait]
impl AuthTokenProvider for GcpAuthTokenProvider {
    async fn get_session_token(
        &self,
        ctx: &OperationContext,
    ) -> Result<TokenRecord, AuthTokenError> {
        {
            let cached = self.default_token.lock().unwrap();
            if let Some(token) = cached.as_ref() {
                if !token.is_expired_for_client(Utc::now()) {
                    debug!(context = %ctx, "found cached session token");
                    return Ok(token.clone());
                }
            }
        }

        let url = self.token_url();
        let token = with_retries(
            TARGET_LABEL,
            "get-session-token",
            Some(ctx.to_string()),
            &self.config.retries,
            &(self.http_client.clone(), url),
            |(http_client, url)| Box::pin(Self::fetch_default_token(http_client, url)),
            AuthTokenError::is_retriable,
        )
        .await?;

        *self.default_token.lock().unwrap() = Some(token.clone());
        Ok(token)
    }

    async fn get_session_token_for_target_audience(
        &self,
        ctx: &OperationContext,
        audience: &str,
    ) -> Result<TokenRecord, AuthTokenError> {
        if let Some(token) = self.audience_tokens.find(&audience.to_string()) {
            if !token.is_expired_for_client(Utc::now()) {
                debug!(context = %ctx, audience, "found cached session token for audience");
                return Ok(token);
            }
        }

        let url = self.identity_url(audience);
        let token = with_retries(
            TARGET_LABEL,
            "get-session-token-for-target-audience",
            Some(ctx.to_string()),
            &self.config.retries,
            &(self.http_client.clone(), url),
            |(http_client, url)| Box::pin(Self::fetch_identity_token(http_client, url)),
            AuthTokenError::is_retriable,
        )
        .await?;

        // The map does not overwrite, so replace by erase+insert. Losing
        // either race to a concurrent refresh is fine: the fetched token is
        // returned regardless and both tokens are equally fresh.
        let _ = self.audience_tokens.erase(&audience.to_string());
        let _ = self.audience_tokens.insert(audience.to_string(), token.clone());
        Ok(token)
    }

    async fn get_tee_session_token(
        &self,
        _ctx: &OperationContext,
        audience: &str,
        token_type: &str,
    ) -> Result<TokenRecord, AuthTokenError> {
        fetch_tee_session_token(&self.config.tee_socket_path, audience, token_type).await
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn encode_payload(payload: &str) -> String {
        URL_SAFE.encode(payload.as_bytes()).replace('=', "")
    }

    #[test]
    fn identity_token_claims_are_decoded_from_the_middle_part() {
        let payload = r#"{"iss":"https://accounts.google.com","aud":"https://example.com","sub":"12345","iat":1700000000,"exp":1700003600}"#;
        let token = format!("hdr.{}.sig", encode_payload(payload));
        let claims = decode_identity_token_claims(&token).unwrap();
        assert_eq!(claims.exp, 1700003600);
        assert_eq!(claims.aud, "https://example.com");
    }

    #[test]
    fn identity_tokens_with_missing_claims_are_rejected() {
        let payload = r#"{"iss":"https://accounts.google.com","aud":"https://example.com"}"#;
        let token = format!("hdr.{}.sig", encode_payload(payload));
        let result = decode_identity_token_claims(&token);
        assert!(matches!(result, Err(AuthTokenError::MalformedToken(_))));
    }

    #[test]
    fn identity_tokens_must_have_three_parts() {
        let result = decode_identity_token_claims("not-a-jwt");
        assert!(matches!(result, Err(AuthTokenError::MalformedToken(_))));
    }
}
