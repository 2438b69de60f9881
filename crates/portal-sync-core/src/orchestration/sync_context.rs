use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::models::{CoreError, CoreErrorKind, CoreResult, SyncContextStats};

type CacheKey = (String, String);

/// Chain-scoped memo of externally fetched entities, keyed by entity
/// namespace and natural id.
pub struct SyncContext {
    chain_id: String,
    entries: Mutex<HashMap<CacheKey, Value>>,
    hits: AtomicU64,
    misses: AtomicU64,
    closed: AtomicBool,
}

impl SyncContext {
    fn new(chain_id: String) -> Self {
        Self {
            chain_id,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Looks up a cached entity, counting the hit or miss.
    pub fn get(&self, namespace: &str, id: &str) -> Option<Value> {
        let found = self
            .lock()
            .get(&(namespace.to_string(), id.to_string()))
            .cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Ignored once the context has been torn down.
    pub fn insert(&self, namespace: &str, id: &str, value: Value) {
        if self.is_closed() {
            return;
        }
        self.lock()
            .insert((namespace.to_string(), id.to_string()), value);
    }

    pub fn contains(&self, namespace: &str, id: &str) -> bool {
        self.lock()
            .contains_key(&(namespace.to_string(), id.to_string()))
    }

    /// Check-then-fetch: returns the cached entity or runs `fetch` and caches
    /// its result.
    pub async fn get_or_fetch<T, F, Fut>(
        &self,
        namespace: &str,
        id: &str,
        fetch: F,
    ) -> CoreResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        if let Some(cached) = self.get(namespace, id) {
            return serde_json::from_value(cached).map_err(|error| {
                CoreError::new(
                    CoreErrorKind::Internal,
                    format!("cached '{namespace}' entity '{id}' has an unexpected shape: {error}"),
                )
            });
        }

        let fetched = fetch().await?;
        match serde_json::to_value(&fetched) {
            Ok(value) => self.insert(namespace, id, value),
            Err(error) => tracing::debug!(
                chain_id = %self.chain_id,
                namespace,
                id,
                %error,
                "fetched entity could not be cached"
            ),
        }
        Ok(fetched)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn stats(&self) -> SyncContextStats {
        SyncContextStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn close(&self) -> SyncContextStats {
        let stats = self.stats();
        self.closed.store(true, Ordering::SeqCst);
        self.lock().clear();
        stats
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Value>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fetches through the chain cache when one is active, directly otherwise.
pub async fn fetch_cached<T, F, Fut>(
    context: Option<&SyncContext>,
    namespace: &str,
    id: &str,
    fetch: F,
) -> CoreResult<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = CoreResult<T>>,
{
    match context {
        Some(context) if !context.is_closed() => context.get_or_fetch(namespace, id, fetch).await,
        _ => fetch().await,
    }
}

/// Live contexts of one engine, keyed by chain id.
#[derive(Clone, Default)]
pub struct SyncContextRegistry {
    contexts: Arc<Mutex<HashMap<String, Arc<SyncContext>>>>,
}

impl SyncContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, chain_id: impl Into<String>) -> CoreResult<SyncContextGuard> {
        let chain_id = chain_id.into();
        let mut contexts = self.lock();
        if contexts.contains_key(&chain_id) {
            return Err(CoreError::new(
                CoreErrorKind::Internal,
                format!("sync context for chain '{chain_id}' already exists"),
            ));
        }
        let context = Arc::new(SyncContext::new(chain_id.clone()));
        contexts.insert(chain_id, context.clone());
        Ok(SyncContextGuard {
            registry: self.clone(),
            context,
            torn_down: false,
        })
    }

    pub fn lookup(&self, chain_id: &str) -> Option<Arc<SyncContext>> {
        self.lock().get(chain_id).cloned()
    }

    pub fn active_chains(&self) -> usize {
        self.lock().len()
    }

    fn remove(&self, chain_id: &str) {
        self.lock().remove(chain_id);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<SyncContext>>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns a context for the lifetime of one chain run. Teardown happens
/// exactly once, explicitly or on drop.
pub struct SyncContextGuard {
    registry: SyncContextRegistry,
    context: Arc<SyncContext>,
    torn_down: bool,
}

impl SyncContextGuard {
    pub fn context(&self) -> &Arc<SyncContext> {
        &self.context
    }

    pub fn teardown(mut self) -> SyncContextStats {
        self.close()
    }

    fn close(&mut self) -> SyncContextStats {
        if self.torn_down {
            return self.context.stats();
        }
        self.torn_down = true;
        self.registry.remove(self.context.chain_id());
        let stats = self.context.close();
        tracing::debug!(
            chain_id = %self.context.chain_id(),
            entries = stats.entries,
            hits = stats.hits,
            misses = stats.misses,
            "sync context torn down"
        );
        stats
    }
}

impl Drop for SyncContextGuard {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::{SyncContextRegistry, fetch_cached};
    use crate::models::CoreResult;

    #[tokio::test]
    async fn second_lookup_is_served_from_cache() {
        let registry = SyncContextRegistry::new();
        let guard = registry.begin("chain-a").unwrap();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let user: serde_json::Value = guard
                .context()
                .get_or_fetch("user", "u-1", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    CoreResult::Ok(json!({"id": "u-1", "email": "a@example.com"}))
                })
                .await
                .unwrap();
            assert_eq!(user["id"], "u-1");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = guard.teardown();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.api_calls_avoided(), 2);
    }

    #[tokio::test]
    async fn concurrent_chains_do_not_share_entries() {
        let registry = SyncContextRegistry::new();
        let x = registry.begin("chain-x").unwrap();
        let y = registry.begin("chain-y").unwrap();

        x.context().insert("course", "c-9", json!({"npcu": 2}));
        assert!(x.context().contains("course", "c-9"));
        assert!(!y.context().contains("course", "c-9"));
        assert!(y.context().get("course", "c-9").is_none());

        drop(x);
        assert!(registry.lookup("chain-x").is_none());
        assert!(registry.lookup("chain-y").is_some());
        assert_eq!(registry.active_chains(), 1);
    }

    #[tokio::test]
    async fn teardown_clears_entries_and_later_inserts_are_ignored() {
        let registry = SyncContextRegistry::new();
        let guard = registry.begin("chain-z").unwrap();
        let context = guard.context().clone();
        context.insert("group", "g-1", json!({}));

        guard.teardown();
        assert!(registry.lookup("chain-z").is_none());
        assert!(context.is_closed());
        assert!(context.is_empty());
        context.insert("group", "g-2", json!({}));
        assert!(context.is_empty());
    }

    #[tokio::test]
    async fn fetch_without_context_goes_direct() {
        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            let value: u32 = fetch_cached(None, "course", "c-1", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                CoreResult::Ok(7)
            })
            .await
            .unwrap();
            assert_eq!(value, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn duplicate_chain_id_is_rejected() {
        let registry = SyncContextRegistry::new();
        let _first = registry.begin("chain-dup").unwrap();
        assert!(registry.begin("chain-dup").is_err());
    }
}
