//! In-memory cache with explicit miss detection and scoped invalidation.
//!
//! Values are returned as `Option<V>`: `None` means the key is absent, and
//! any stored value (including `serde_json::Value::Null`, `0`, `""` or an
//! empty collection) comes back as `Some`. There is no sentinel value that
//! could collide with cached data.
//!
//! Entries can be grouped by a namespace and any number of tags, and removed
//! in bulk by an [`InvalidationScope`]: a namespace, a tag, or a glob pattern
//! over keys. The [`Invalidator`] trait exposes bulk invalidation without the
//! value type, which is how the write queue evicts stale entries after a
//! write lands.
//!
//! # Example
//!
//! ```
//! use tasklink_store::cache::{Cache, CacheScope, InvalidationScope};
//!
//! let cache: Cache<serde_json::Value> = Cache::default();
//! cache.set_scoped("state:acme/widgets", serde_json::Value::Null, CacheScope::namespace("github-sync"));
//!
//! // A stored null is still a hit.
//! assert_eq!(cache.get("state:acme/widgets"), Some(serde_json::Value::Null));
//!
//! let removed = cache.invalidate(&InvalidationScope::Namespace("github-sync".into()));
//! assert_eq!(removed, 1);
//! assert_eq!(cache.get("state:acme/widgets"), None);
//! ```

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Default maximum number of entries before oldest-first eviction.
pub const DEFAULT_MAX_ENTRIES: usize = 1024;

/// Selector used to remove many cache entries at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationScope {
    /// Every entry stored under this namespace.
    Namespace(String),
    /// Every entry carrying this tag.
    Tag(String),
    /// Every entry whose key matches this glob pattern (e.g. `"tasks:*"`).
    Pattern(String),
}

impl std::fmt::Display for InvalidationScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Namespace(ns) => write!(f, "namespace:{ns}"),
            Self::Tag(tag) => write!(f, "tag:{tag}"),
            Self::Pattern(pattern) => write!(f, "pattern:{pattern}"),
        }
    }
}

/// Grouping information attached to an entry when it is stored.
#[derive(Debug, Clone, Default)]
pub struct CacheScope {
    /// Namespace the entry belongs to.
    pub namespace: Option<String>,
    /// Tags the entry carries.
    pub tags: Vec<String>,
    /// Time-to-live overriding the cache default.
    pub ttl: Option<Duration>,
}

impl CacheScope {
    /// Scope with only a namespace.
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Self::default()
        }
    }

    /// Adds a tag to the scope.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Sets a time-to-live for the entry.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Cache sizing and expiry settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of live entries.
    pub max_entries: usize,
    /// Time-to-live applied when a scope does not specify one.
    pub default_ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            default_ttl: None,
        }
    }
}

/// Counters describing cache activity since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found a live entry.
    pub hits: u64,
    /// Lookups that found nothing (or an expired entry).
    pub misses: u64,
    /// Values stored.
    pub sets: u64,
    /// Entries removed by invalidation or clear.
    pub invalidated: u64,
    /// Entries removed by capacity eviction.
    pub evictions: u64,
    /// Entries currently held.
    pub entries: usize,
}

/// Event delivered to [`CacheObserver`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A lookup found a value.
    Hit {
        /// Key looked up.
        key: String,
    },
    /// A lookup found nothing.
    Miss {
        /// Key looked up.
        key: String,
    },
    /// A value was stored.
    Set {
        /// Key stored.
        key: String,
    },
    /// A scoped invalidation ran.
    Invalidate {
        /// Selector used.
        scope: InvalidationScope,
        /// Number of entries removed.
        removed: usize,
    },
    /// The cache was cleared.
    Clear {
        /// Number of entries removed.
        removed: usize,
    },
}

/// Monitoring hook notified of cache activity.
///
/// Observer failures, including panics, are logged and otherwise ignored:
/// they never change cache contents or stop other observers from running.
pub trait CacheObserver: Send + Sync {
    /// Called after the cache has applied the event.
    ///
    /// # Errors
    ///
    /// Any error is logged by the cache and discarded.
    fn on_event(&self, event: &CacheEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Bulk invalidation independent of the cached value type.
pub trait Invalidator: Send + Sync {
    /// Removes every entry matching `scope`, returning how many were removed.
    fn invalidate(&self, scope: &InvalidationScope) -> usize;
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    namespace: Option<String>,
    tags: Vec<String>,
    expires_at: Option<Instant>,
    generation: u64,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn matches(&self, key: &str, scope: &InvalidationScope, pattern: Option<&glob::Pattern>) -> bool {
        match scope {
            InvalidationScope::Namespace(ns) => self.namespace.as_deref() == Some(ns.as_str()),
            InvalidationScope::Tag(tag) => self.tags.iter().any(|t| t == tag),
            InvalidationScope::Pattern(_) => pattern.is_some_and(|p| p.matches(key)),
        }
    }
}

struct CacheInner<V> {
    entries: HashMap<String, Entry<V>>,
    /// Insertion order for oldest-first eviction. Stale generations are skipped.
    order: VecDeque<(String, u64)>,
    next_generation: u64,
    stats: CacheStats,
}

impl<V> CacheInner<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            next_generation: 0,
            stats: CacheStats::default(),
        }
    }

    fn evict_oldest(&mut self) -> Option<String> {
        while let Some((key, generation)) = self.order.pop_front() {
            let live = self
                .entries
                .get(&key)
                .is_some_and(|entry| entry.generation == generation);
            if live {
                self.entries.remove(&key);
                self.stats.evictions += 1;
                return Some(key);
            }
        }
        None
    }

    fn compact_order(&mut self) {
        let entries = &self.entries;
        self.order.retain(|(key, generation)| {
            entries
                .get(key)
                .is_some_and(|entry| entry.generation == *generation)
        });
    }
}

/// Thread-safe key/value cache. See the [module docs](self).
pub struct Cache<V> {
    inner: Mutex<CacheInner<V>>,
    config: CacheConfig,
    observers: RwLock<Vec<Arc<dyn CacheObserver>>>,
}

impl<V: Clone> Default for Cache<V> {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl<V: Clone> Cache<V> {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Mutex::new(CacheInner::new()),
            config,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Registers a monitoring hook.
    pub fn add_observer(&self, observer: Arc<dyn CacheObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Looks up `key`. `None` is a miss; any stored value is `Some`.
    pub fn get(&self, key: &str) -> Option<V> {
        let result = {
            let mut inner = self.lock();
            let now = Instant::now();
            let expired = inner.entries.get(key).is_some_and(|e| e.is_expired(now));
            if expired {
                inner.entries.remove(key);
                trace!(key, "Cache entry expired");
            }
            let value = inner.entries.get(key).map(|entry| entry.value.clone());
            if value.is_some() {
                inner.stats.hits += 1;
            } else {
                inner.stats.misses += 1;
            }
            value
        };

        let key = key.to_string();
        self.notify(&if result.is_some() {
            CacheEvent::Hit { key }
        } else {
            CacheEvent::Miss { key }
        });
        result
    }

    /// Returns true when `key` holds a live entry. Does not count as a lookup.
    pub fn contains(&self, key: &str) -> bool {
        let inner = self.lock();
        let now = Instant::now();
        inner.entries.get(key).is_some_and(|e| !e.is_expired(now))
    }

    /// Stores `value` under `key` without namespace or tags.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_scoped(key, value, CacheScope::default());
    }

    /// Stores `value` under `key` with grouping information for invalidation.
    pub fn set_scoped(&self, key: impl Into<String>, value: V, scope: CacheScope) {
        let key = key.into();
        {
            let mut inner = self.lock();
            let generation = inner.next_generation;
            inner.next_generation += 1;

            let ttl = scope.ttl.or(self.config.default_ttl);
            inner.entries.insert(
                key.clone(),
                Entry {
                    value,
                    namespace: scope.namespace,
                    tags: scope.tags,
                    expires_at: ttl.map(|ttl| Instant::now() + ttl),
                    generation,
                },
            );
            inner.order.push_back((key.clone(), generation));
            inner.stats.sets += 1;

            while inner.entries.len() > self.config.max_entries.max(1) {
                match inner.evict_oldest() {
                    Some(evicted) => trace!(key = %evicted, "Evicted oldest cache entry"),
                    None => break,
                }
            }
            if inner.order.len() > self.config.max_entries.max(1) * 2 {
                inner.compact_order();
            }
        }
        self.notify(&CacheEvent::Set { key });
    }

    /// Removes a single key, returning whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.lock().entries.remove(key).is_some()
    }

    /// Removes every entry matching `scope` and reports how many were removed.
    ///
    /// An invalid glob pattern matches nothing.
    pub fn invalidate(&self, scope: &InvalidationScope) -> usize {
        let pattern = match scope {
            InvalidationScope::Pattern(raw) => match glob::Pattern::new(raw) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(pattern = %raw, error = %e, "Invalid cache invalidation pattern");
                    None
                }
            },
            _ => None,
        };

        let removed = {
            let mut inner = self.lock();
            let before = inner.entries.len();
            inner
                .entries
                .retain(|key, entry| !entry.matches(key, scope, pattern.as_ref()));
            let removed = before - inner.entries.len();
            inner.stats.invalidated += removed as u64;
            removed
        };

        debug!(scope = %scope, removed, "Cache invalidated");
        self.notify(&CacheEvent::Invalidate {
            scope: scope.clone(),
            removed,
        });
        removed
    }

    /// Removes every entry, returning how many were removed.
    pub fn clear(&self) -> usize {
        let removed = {
            let mut inner = self.lock();
            let removed = inner.entries.len();
            inner.entries.clear();
            inner.order.clear();
            inner.stats.invalidated += removed as u64;
            removed
        };
        self.notify(&CacheEvent::Clear { removed });
        removed
    }

    /// Number of entries currently held (expired entries included until touched).
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns true when the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the activity counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.entries.len(),
            ..inner.stats
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: &CacheEvent) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            match catch_unwind(AssertUnwindSafe(|| observer.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, ?event, "Cache observer failed"),
                Err(_) => warn!(?event, "Cache observer panicked"),
            }
        }
    }
}

impl<V: Clone + Send> Invalidator for Cache<V> {
    fn invalidate(&self, scope: &InvalidationScope) -> usize {
        Cache::invalidate(self, scope)
    }
}

/// Forwards each invalidation to several caches.
///
/// Lets a single write queue keep caches of different value types fresh.
#[derive(Clone, Default)]
pub struct InvalidatorSet {
    targets: Vec<Arc<dyn Invalidator>>,
}

impl InvalidatorSet {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a target.
    #[must_use]
    pub fn with(mut self, target: Arc<dyn Invalidator>) -> Self {
        self.targets.push(target);
        self
    }
}

impl Invalidator for InvalidatorSet {
    fn invalidate(&self, scope: &InvalidationScope) -> usize {
        self.targets.iter().map(|target| target.invalidate(scope)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn falsy_values_are_hits() {
        let cache: Cache<Value> = Cache::default();
        cache.set("null", Value::Null);
        cache.set("zero", json!(0));
        cache.set("empty-string", json!(""));
        cache.set("empty-list", json!([]));
        cache.set("false", json!(false));

        assert_eq!(cache.get("null"), Some(Value::Null));
        assert_eq!(cache.get("zero"), Some(json!(0)));
        assert_eq!(cache.get("empty-string"), Some(json!("")));
        assert_eq!(cache.get("empty-list"), Some(json!([])));
        assert_eq!(cache.get("false"), Some(json!(false)));
        assert_eq!(cache.get("absent"), None);
    }

    #[test]
    fn option_values_distinguish_stored_none_from_miss() {
        let cache: Cache<Option<u32>> = Cache::default();
        cache.set("stored-none", None);

        assert_eq!(cache.get("stored-none"), Some(None));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn invalidate_by_namespace_reports_count() {
        let cache: Cache<u32> = Cache::default();
        cache.set_scoped("a", 1, CacheScope::namespace("tasks"));
        cache.set_scoped("b", 2, CacheScope::namespace("tasks"));
        cache.set_scoped("c", 3, CacheScope::namespace("github-sync"));

        let removed = cache.invalidate(&InvalidationScope::Namespace("tasks".into()));

        assert_eq!(removed, 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn invalidate_by_tag() {
        let cache: Cache<u32> = Cache::default();
        cache.set_scoped("a", 1, CacheScope::default().with_tag("task:1"));
        cache.set_scoped("b", 2, CacheScope::default().with_tag("task:2").with_tag("all"));
        cache.set_scoped("c", 3, CacheScope::default().with_tag("all"));

        assert_eq!(cache.invalidate(&InvalidationScope::Tag("all".into())), 2);
        assert_eq!(cache.get("a"), Some(1));
    }

    #[test]
    fn invalidate_by_pattern() {
        let cache: Cache<u32> = Cache::default();
        cache.set("tasks:1", 1);
        cache.set("tasks:2", 2);
        cache.set("state:acme", 3);

        assert_eq!(cache.invalidate(&InvalidationScope::Pattern("tasks:*".into())), 2);
        assert!(cache.contains("state:acme"));
    }

    #[test]
    fn invalid_pattern_removes_nothing() {
        let cache: Cache<u32> = Cache::default();
        cache.set("tasks:1", 1);

        assert_eq!(cache.invalidate(&InvalidationScope::Pattern("[".into())), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let cache: Cache<u32> = Cache::new(CacheConfig {
            max_entries: 2,
            default_ttl: None,
        });
        cache.set("first", 1);
        cache.set("second", 2);
        cache.set("first", 10); // refresh moves "first" behind "second"
        cache.set("third", 3);

        assert_eq!(cache.get("second"), None);
        assert_eq!(cache.get("first"), Some(10));
        assert_eq!(cache.get("third"), Some(3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache: Cache<u32> = Cache::default();
        cache.set_scoped("short", 1, CacheScope::default().with_ttl(Duration::ZERO));

        assert_eq!(cache.get("short"), None);
    }

    #[test]
    fn clear_reports_removed_count() {
        let cache: Cache<u32> = Cache::default();
        cache.set("a", 1);
        cache.set("b", 2);

        assert_eq!(cache.clear(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let cache: Cache<u32> = Cache::default();
        cache.set("a", 1);
        cache.get("a");
        cache.get("b");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.entries, 1);
    }

    struct Counting(AtomicUsize);

    impl CacheObserver for Counting {
        fn on_event(
            &self,
            _event: &CacheEvent,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    impl CacheObserver for Failing {
        fn on_event(
            &self,
            _event: &CacheEvent,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Err("observer unavailable".into())
        }
    }

    struct Panicking;

    impl CacheObserver for Panicking {
        fn on_event(
            &self,
            _event: &CacheEvent,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            panic!("observer bug");
        }
    }

    #[test]
    fn failing_observers_do_not_affect_cache_or_other_observers() {
        let cache: Cache<u32> = Cache::default();
        let counter = Arc::new(Counting(AtomicUsize::new(0)));
        cache.add_observer(Arc::new(Failing));
        cache.add_observer(Arc::new(Panicking));
        cache.add_observer(counter.clone());

        cache.set("a", 1);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.invalidate(&InvalidationScope::Pattern("*".into())), 1);

        assert_eq!(counter.0.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn invalidator_trait_object_reaches_cache() {
        let cache = Arc::new(Cache::<u32>::default());
        cache.set_scoped("a", 1, CacheScope::namespace("tasks"));

        let invalidator: Arc<dyn Invalidator> = cache.clone();
        assert_eq!(
            invalidator.invalidate(&InvalidationScope::Namespace("tasks".into())),
            1
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidator_set_reaches_every_cache() {
        let numbers = Arc::new(Cache::<u32>::default());
        let names = Arc::new(Cache::<String>::default());
        numbers.set_scoped("n", 1, CacheScope::namespace("tasks"));
        names.set_scoped("s", "x".to_string(), CacheScope::namespace("tasks"));
        names.set_scoped("other", "y".to_string(), CacheScope::namespace("github-sync"));

        let set = InvalidatorSet::new().with(numbers.clone()).with(names.clone());
        let removed = set.invalidate(&InvalidationScope::Namespace("tasks".into()));

        assert_eq!(removed, 2);
        assert!(numbers.is_empty());
        assert_eq!(names.len(), 1);
    }
}
