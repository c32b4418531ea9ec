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

use std::collections::HashMap;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics::caching::{record_cache_eviction, record_cache_hit, record_cache_miss};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionDecision {
    Evict,
    Retain,
}

pub type EvictionVeto<K, V> = Arc<dyn Fn(&K, &V) -> EvictionDecision + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("entry already exists")]
    AlreadyExists,
    #[error("entry not found")]
    NotFound,
}

pub struct CacheOptions<K, V> {
    /// Lifetime of an entry, counted from insertion (and from the latest
    /// access when `extend_on_access` is set).
    pub entry_lifetime: Duration,
    /// Period of the background eviction scan. Must be below
    /// `entry_lifetime` to give expiry sub-entry resolution.
    pub eviction_resolution: Duration,
    pub extend_on_access: bool,
    /// When set, entries with live guards are never evicted.
    pub block_in_use_entries: bool,
    /// Consulted before removing an expired entry; `Retain` skips the
    /// eviction until a later scan.
    pub on_evict: Option<EvictionVeto<K, V>>,
}

impl<K, V> CacheOptions<K, V> {
    pub fn with_lifetime(entry_lifetime: Duration) -> Self {
        Self {
            entry_lifetime,
            eviction_resolution: (entry_lifetime / 4).max(Duration::from_millis(10)),
            extend_on_access: true,
            block_in_use_entries: true,
            on_evict: None,
        }
    }
}

struct CacheEntry<V> {
    value: V,
    expires_at: Mutex<Instant>,
    in_use: AtomicUsize,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= *self.expires_at.lock().unwrap()
    }

    fn touch(&self, lifetime: Duration) {
        *self.expires_at.lock().unwrap() = Instant::now() + lifetime;
    }
}

/// Holding a guard marks the entry as in use, which blocks its eviction when
/// the cache was created with `block_in_use_entries`.
pub struct EntryGuard<V: Clone> {
    value: V,
    entry: Arc<CacheEntry<V>>,
}

impl<V: Clone> Deref for EntryGuard<V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.value
    }
}

impl<V: Clone> Drop for EntryGuard<V> {
    fn drop(&mut self) {
        self.entry.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

struct CacheState<K, V> {
    entries: RwLock<HashMap<K, Arc<CacheEntry<V>>>>,
    entry_lifetime: Duration,
    extend_on_access: bool,
    block_in_use_entries: bool,
    on_evict: Option<EvictionVeto<K, V>>,
    name: &'static str,
}

/// Concurrent keyed cache with per-entry time-to-live, enforced by a
/// background eviction task. `insert` does not overwrite; callers that need
/// upsert semantics erase first.
pub struct AutoExpiryCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    state: Arc<CacheState<K, V>>,
    evictor: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl<K, V> AutoExpiryCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates the cache and spawns its eviction task. Must be called from
    /// within a tokio runtime.
    pub fn new(name: &'static str, options: CacheOptions<K, V>) -> Self {
        let state = Arc::new(CacheState {
            entries: RwLock::new(HashMap::new()),
            entry_lifetime: options.entry_lifetime,
            extend_on_access: options.extend_on_access,
            block_in_use_entries: options.block_in_use_entries,
            on_evict: options.on_evict,
            name,
        });
        let shutdown = CancellationToken::new();
        let evictor = {
            let state = state.clone();
            let shutdown = shutdown.clone();
            let resolution = options.eviction_resolution;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(resolution);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => Self::evict_expired(&state),
                    }
                }
            })
        };
        Self {
            state,
            evictor: Mutex::new(Some(evictor)),
            shutdown,
        }
    }

    pub fn insert(&self, key: K, value: V) -> Result<(), CacheError> {
        let mut entries = self.state.entries.write().unwrap();
        if entries.contains_key(&key) {
            return Err(CacheError::AlreadyExists);
        }
        entries.insert(
            key,
            Arc::new(CacheEntry {
                value,
                expires_at: Mutex::new(Instant::now() + self.state.entry_lifetime),
                in_use: AtomicUsize::new(0),
            }),
        );
        Ok(())
    }

    /// Clones the cached value out. Extends the entry's lifetime when the
    /// cache was created with `extend_on_access`.
    pub fn find(&self, key: &K) -> Option<V> {
        let entries = self.state.entries.read().unwrap();
        match entries.get(key) {
            Some(entry) => {
                if self.state.extend_on_access {
                    entry.touch(self.state.entry_lifetime);
                }
                record_cache_hit(self.state.name);
                Some(entry.value.clone())
            }
            None => {
                record_cache_miss(self.state.name);
                None
            }
        }
    }

    /// Like `find`, but the returned guard keeps the entry marked as in use
    /// until dropped.
    pub fn checkout(&self, key: &K) -> Option<EntryGuard<V>> {
        let entries = self.state.entries.read().unwrap();
        match entries.get(key) {
            Some(entry) => {
                entry.in_use.fetch_add(1, Ordering::AcqRel);
                if self.state.extend_on_access {
                    entry.touch(self.state.entry_lifetime);
                }
                record_cache_hit(self.state.name);
                Some(EntryGuard {
                    value: entry.value.clone(),
                    entry: entry.clone(),
                })
            }
            None => {
                record_cache_miss(self.state.name);
                None
            }
        }
    }

    pub fn erase(&self, key: &K) -> Result<(), CacheError> {
        let mut entries = self.state.entries.write().unwrap();
        entries.remove(key).map(|_| ()).ok_or(CacheError::NotFound)
    }

    pub fn keys(&self) -> Vec<K> {
        self.state.entries.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.entries.read().unwrap().is_empty()
    }

    fn evict_expired(state: &CacheState<K, V>) {
        let now = Instant::now();
        let candidates: Vec<(K, Arc<CacheEntry<V>>)> = {
            let entries = state.entries.read().unwrap();
            entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, entry)| (key.clone(), entry.clone()))
                .collect()
        };

        for (key, entry) in candidates {
            if state.block_in_use_entries && entry.in_use.load(Ordering::Acquire) > 0 {
                continue;
            }
            if let Some(on_evict) = &state.on_evict {
                if on_evict(&key, &entry.value) == EvictionDecision::Retain {
                    continue;
                }
            }
            let mut entries = state.entries.write().unwrap();
            let still_current = entries
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, &entry));
            // Re-verify under the write lock; a concurrent access may have
            // touched or replaced the entry since the scan.
            if still_current
                && entry.is_expired(Instant::now())
                && !(state.block_in_use_entries && entry.in_use.load(Ordering::Acquire) > 0)
            {
                entries.remove(&key);
                record_cache_eviction(state.name);
                debug!(cache = state.name, "evicted expired cache entry");
            }
        }
    }

    /// Stops the eviction task. The cache stays usable afterwards but no
    /// longer expires entries.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.evictor.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl<K, V> Drop for AutoExpiryCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
