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
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cpio_common::cache::{AutoExpiryCache, CacheOptions, EntryGuard};
use cpio_common::model::CloudVendor;

/// Identity a cloud-SDK connection is created for. Two descriptors with the
/// same fields always map to the same pooled client.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub vendor: CloudVendor,
    pub region: Option<String>,
    pub service_account: Option<String>,
    pub endpoint_override: Option<String>,
}

impl ClientIdentity {
    pub fn for_vendor(vendor: CloudVendor) -> Self {
        Self {
            vendor,
            region: None,
            service_account: None,
            endpoint_override: None,
        }
    }

    /// Deterministic cache key; the field order is part of the contract and
    /// must stay stable across releases.
    pub fn cache_key(&self) -> String {
        fn part(value: &Option<String>) -> &str {
            value.as_deref().unwrap_or("-")
        }
        format!(
            "{}/{}/{}/{}",
            self.vendor,
            part(&self.region),
            part(&self.service_account),
            part(&self.endpoint_override)
        )
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientPoolError {
    #[error("failed to create a client for identity '{identity}': {reason}")]
    FactoryFailed { identity: String, reason: String },
}

pub type ClientFactory<C> =
    Arc<dyn Fn(&ClientIdentity) -> Result<C, ClientPoolError> + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientPoolConfig {
    /// How long an unused client stays pooled. Each use restarts the clock.
    #[serde(with = "humantime_serde")]
    pub client_lifetime: Duration,
}

impl Default for ClientPoolConfig {
    fn default() -> Self {
        Self {
            client_lifetime: Duration::from_secs(120),
        }
    }
}

/// Short-lived pool of cloud-SDK clients keyed by identity descriptor.
///
/// Lookups are lazy: a miss invokes the vendor factory and pools the result.
/// Expired idle clients are simply dropped (they are cheap to recreate);
/// a client checked out by an in-flight operation is never destroyed, the
/// returned guard keeps it alive until dropped.
pub struct ClientPool<C>
where
    C: Clone + Send + Sync + 'static,
{
    clients: AutoExpiryCache<String, C>,
    factory: ClientFactory<C>,
}

impl<C> ClientPool<C>
where
    C: Clone + Send + Sync + 'static,
{
    pub fn new(config: &ClientPoolConfig, factory: ClientFactory<C>) -> Self {
        Self {
            clients: AutoExpiryCache::new(
                "client-pool",
                CacheOptions::with_lifetime(config.client_lifetime),
            ),
            factory,
        }
    }

    pub fn get(&self, identity: &ClientIdentity) -> Result<EntryGuard<C>, ClientPoolError> {
        let key = identity.cache_key();
        if let Some(client) = self.clients.checkout(&key) {
            return Ok(client);
        }

        let client = (self.factory)(identity)?;
        // A concurrent caller may have inserted first; both hold equivalent
        // clients, so serve whichever is pooled now.
        let _ = self.clients.insert(key.clone(), client);
        self.clients
            .checkout(&key)
            .ok_or_else(|| ClientPoolError::FactoryFailed {
                identity: key,
                reason: "pooled client vanished during creation".to_string(),
            })
    }

    pub fn pooled_count(&self) -> usize {
        self.clients.len()
    }

    pub async fn stop(&self) {
        self.clients.stop().await;
    }
}
