//! Process-wide keyed TTL cache.
//!
//! Entries are partitioned by [`CacheGroup`] and addressed by a structural
//! [`CacheKey`]. Each entry records its own expiry at write time; an entry is
//! never handed out at or after that instant. Groups live in separate sharded
//! maps so a miss on one resource never blocks a hit on another, and no lock
//! is held across an `.await`.
//!
//! Values are stored type-erased (`Arc<dyn Any>`) so one cache can hold
//! connection handles and materialized list results side by side; reads are
//! typed and a type mismatch reads as a miss.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Namespace partitioning cache keys by resource family.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheGroup(Cow<'static, str>);

impl CacheGroup {
    pub const KUSTO: CacheGroup = CacheGroup(Cow::Borrowed("kusto"));
    pub const COSMOS: CacheGroup = CacheGroup(Cow::Borrowed("cosmos"));
    pub const KEY_VAULT: CacheGroup = CacheGroup(Cow::Borrowed("keyvault"));
    pub const SUBSCRIPTION: CacheGroup = CacheGroup(Cow::Borrowed("subscription"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Structural cache key: compared field by field, never by formatted string.
///
/// `endpoint` is normalised (lower-case, no trailing `/`) so the same resource
/// reached through slightly different URIs maps to one entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    endpoint: String,
    database: Option<String>,
    tenant: Option<String>,
    facet: Option<String>,
}

impl CacheKey {
    pub fn endpoint(endpoint: &str) -> Self {
        Self {
            endpoint: normalize_endpoint(endpoint),
            database: None,
            tenant: None,
            facet: None,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_tenant(mut self, tenant: Option<&str>) -> Self {
        self.tenant = tenant.map(str::to_string);
        self
    }

    /// Distinguishes different kinds of data cached for the same resource,
    /// e.g. `"tables"` vs. the connection handle itself.
    pub fn with_facet(mut self, facet: impl Into<String>) -> Self {
        self.facet = Some(facet.into());
        self
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    endpoint.trim().trim_end_matches('/').to_ascii_lowercase()
}

struct CacheEntry {
    value: Arc<dyn Any + Send + Sync>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

type GroupMap = DashMap<CacheKey, CacheEntry>;

/// In-process TTL cache shared by every service. Cheap to clone.
#[derive(Clone, Default)]
pub struct TtlCache {
    groups: Arc<DashMap<CacheGroup, Arc<GroupMap>>>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn group(&self, group: &CacheGroup) -> Option<Arc<GroupMap>> {
        self.groups.get(group).map(|g| Arc::clone(g.value()))
    }

    fn group_or_insert(&self, group: &CacheGroup) -> Arc<GroupMap> {
        if let Some(existing) = self.group(group) {
            return existing;
        }
        Arc::clone(self.groups.entry(group.clone()).or_default().value())
    }

    /// Return the live value stored under `(group, key)`.
    ///
    /// Expired entries are evicted on the way out and read as a miss.
    pub fn get<T>(&self, group: &CacheGroup, key: &CacheKey) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let map = self.group(group)?;
        let now = Instant::now();
        let value = {
            let entry = map.get(key)?;
            if entry.is_live(now) {
                Some(Arc::clone(&entry.value))
            } else {
                None
            }
        };
        match value {
            Some(value) => value.downcast::<T>().ok(),
            None => {
                map.remove_if(key, |_, entry| !entry.is_live(now));
                None
            }
        }
    }

    /// Store `value` until `now + ttl`, replacing any previous entry.
    pub fn set<T>(&self, group: &CacheGroup, key: CacheKey, value: Arc<T>, ttl: Duration)
    where
        T: Any + Send + Sync,
    {
        let expires_at = Instant::now() + ttl;
        self.group_or_insert(group)
            .insert(key, CacheEntry { value, expires_at });
    }

    pub fn remove(&self, group: &CacheGroup, key: &CacheKey) -> bool {
        self.group(group)
            .map(|map| map.remove(key).is_some())
            .unwrap_or(false)
    }

    /// Keys of all live entries in `group`.
    pub fn list_keys(&self, group: &CacheGroup) -> Vec<CacheKey> {
        let Some(map) = self.group(group) else {
            return Vec::new();
        };
        let now = Instant::now();
        map.iter()
            .filter(|entry| entry.value().is_live(now))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Cache-miss helper: return the cached value or run `build` and store
    /// its result.
    ///
    /// A failed build writes nothing, and neither does a build whose future
    /// is dropped before completing. Concurrent misses for the same key may
    /// each run `build`; the last write wins.
    pub async fn get_or_try_insert_with<T, E, F, Fut>(
        &self,
        group: &CacheGroup,
        key: CacheKey,
        ttl: Duration,
        build: F,
    ) -> Result<Arc<T>, E>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get::<T>(group, &key) {
            tracing::debug!(group = %group, key = ?key, "cache hit");
            return Ok(hit);
        }
        tracing::debug!(group = %group, key = ?key, "cache miss");
        let value = Arc::new(build().await?);
        self.set(group, key, Arc::clone(&value), ttl);
        Ok(value)
    }

    /// Tear down a whole group: every entry is removed and each value of type
    /// `T` (expired or not) is handed to `close`. Other groups are untouched.
    ///
    /// Returns the number of handles closed.
    pub fn dispose_group<T, F>(&self, group: &CacheGroup, mut close: F) -> usize
    where
        T: Any + Send + Sync,
        F: FnMut(&CacheKey, &T),
    {
        let Some((_, map)) = self.groups.remove(group) else {
            return 0;
        };
        let mut closed = 0;
        let keys: Vec<CacheKey> = map.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let Some((key, entry)) = map.remove(&key) else {
                continue;
            };
            if let Ok(handle) = entry.value.downcast::<T>() {
                close(&key, &handle);
                closed += 1;
            }
        }
        tracing::debug!(group = %group, closed, "cache group disposed");
        closed
    }

    /// Drop every expired entry in every group.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let groups: Vec<Arc<GroupMap>> = self.groups.iter().map(|g| Arc::clone(g.value())).collect();
        groups
            .iter()
            .map(|map| {
                let before = map.len();
                map.retain(|_, entry| entry.is_live(now));
                before.saturating_sub(map.len())
            })
            .sum()
    }

    /// Purge expired entries every `period` until `shutdown` fires.
    pub fn spawn_purge_task(
        &self,
        period: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, "expired cache entries purged");
                        }
                    }
                }
            }
        })
    }
}
