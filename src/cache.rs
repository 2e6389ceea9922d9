//! The shared response cache (spec §4.2, §5): freshness classification,
//! storage, and the hit/miss counters surfaced for diagnostics.
//!
//! Modeled directly on the `MemoryCacheManager` shown in the cache crate
//! this proxy grew out of (`Arc<Mutex<HashMap<String, ...>>>`), simplified
//! to a plain `std::sync::Mutex` since eviction and persistence are out of
//! scope here: no `.await` is ever held across the lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::message::Response;

/// The outcome of classifying a cached entry against freshness rules
/// (spec §4.2). `classify` never introduces a fourth state for
/// `must-revalidate`; that flag only affects `get`'s staleness fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No entry for this key.
    Miss,
    /// An entry exists and is within its freshness lifetime.
    Fresh,
    /// An entry exists but is stale; a conditional revalidation is needed.
    MustRevalidate,
}

/// A single cached response plus the bookkeeping needed to classify it.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The response as it should be replayed or revalidated.
    pub response: Response,
    /// When this entry was stored (or last revalidated). Spec §9 resolves
    /// a 304 revalidation to refresh this timestamp, restarting the
    /// freshness window from the revalidation response's headers.
    pub inserted_at: SystemTime,
}

impl CacheEntry {
    /// Freshness lifetime computed per spec §4.2: `max-age` wins if set;
    /// else `Expires - Date` when both are present; else zero (the entry
    /// exists but is immediately stale).
    fn freshness_lifetime(&self) -> Duration {
        let cc = self.response.cache_control();
        if let Some(max_age) = cc.max_age {
            return Duration::from_secs(max_age);
        }
        if let (Some(date), Some(expires)) = (self.response.date(), self.response.expires()) {
            return expires.duration_since(date).unwrap_or(Duration::ZERO);
        }
        Duration::ZERO
    }

    fn is_fresh(&self, now: SystemTime) -> bool {
        let lifetime = self.freshness_lifetime();
        now.duration_since(self.inserted_at).map(|age| age < lifetime).unwrap_or(false)
    }
}

/// Whether a response is eligible for storage at all (spec §4.2
/// `is_cacheable`): status `200` and `Cache-Control` contains neither
/// `no-store` nor `private`. `no-cache` is cacheable but forces
/// revalidation via `classify`.
pub fn is_cacheable(response: &Response) -> bool {
    if response.status_code != 200 {
        return false;
    }
    let cc = response.cache_control();
    !cc.no_store && !cc.private
}

/// The shared cache: one entry per [`crate::message::Request::cache_key`].
pub struct Cache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Cache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()), hits: AtomicU64::new(0), misses: AtomicU64::new(0) }
    }

    /// Classifies the entry for `key` against `now` (spec §4.2 step 2).
    /// Bumps the hit/miss counters as a side effect.
    pub fn classify(&self, key: &str, now: SystemTime) -> Decision {
        self.classify_with_entry(key, now).0
    }

    /// Like [`Cache::classify`], but also returns the entry it classified
    /// (if any) from the *same* lock acquisition. Callers that need the
    /// entry behind a `Fresh`/`MustRevalidate` decision must use this
    /// instead of a separate `classify` + `get` pair: another worker can
    /// `delete`/`put` the same key in the gap between two separate calls
    /// (spec §5, concurrent requests to the same key), which would turn a
    /// subsequent `get(...).expect(...)` into a panic on valid, concurrent
    /// input.
    pub fn classify_with_entry(&self, key: &str, now: SystemTime) -> (Decision, Option<CacheEntry>) {
        let entries = self.entries.lock().expect("cache mutex poisoned");
        let Some(entry) = entries.get(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return (Decision::Miss, None);
        };
        self.hits.fetch_add(1, Ordering::Relaxed);
        let decision = if entry.response.cache_control().no_cache {
            Decision::MustRevalidate
        } else if entry.is_fresh(now) {
            Decision::Fresh
        } else {
            Decision::MustRevalidate
        };
        (decision, Some(entry.clone()))
    }

    /// Returns a clone of the cached entry for `key`, if any.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.lock().expect("cache mutex poisoned").get(key).cloned()
    }

    /// Stores (or replaces) the entry for `key`, stamping `inserted_at` with
    /// `now`. Callers must check [`is_cacheable`] first.
    pub fn put(&self, key: String, response: Response, now: SystemTime) {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        entries.insert(key, CacheEntry { response, inserted_at: now });
    }

    /// Refreshes an existing entry's `inserted_at` and conditional-validator
    /// headers after a `304 Not Modified` revalidation (spec §9 decision:
    /// a successful revalidation restarts the freshness window using the
    /// revalidation response's own `Cache-Control`/`Date`/`Expires`, with the
    /// cached body left untouched), returning the updated entry from the
    /// same lock acquisition (or `None` if another worker deleted the key
    /// first).
    ///
    /// A real origin's `304` is not required to repeat `Cache-Control` or
    /// `Expires` (RFC 7234 §4.3.4); when a header is absent from
    /// `revalidation_headers`, the cached entry's existing value for that
    /// header — and therefore its `freshness_lifetime` — is left untouched
    /// rather than cleared, per the recorded design decision ("keeping the
    /// existing freshness_lifetime").
    pub fn refresh_and_get(
        &self,
        key: &str,
        revalidation_headers: &Response,
        now: SystemTime,
    ) -> Option<CacheEntry> {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        let entry = entries.get_mut(key)?;
        for name in ["cache-control", "date", "expires", "etag", "last-modified"] {
            if let Some(v) = revalidation_headers.headers.get(name) {
                entry.response.headers.remove_all(name);
                entry.response.headers.append(name, v.to_string());
            }
        }
        entry.inserted_at = now;
        Some(entry.clone())
    }

    /// Refreshes an existing entry as [`Cache::refresh_and_get`] does,
    /// discarding the returned entry. Kept for callers that only need the
    /// side effect.
    pub fn refresh(&self, key: &str, revalidation_headers: &Response, now: SystemTime) {
        self.refresh_and_get(key, revalidation_headers, now);
    }

    /// Removes the entry for `key`, if any.
    pub fn delete(&self, key: &str) {
        self.entries.lock().expect("cache mutex poisoned").remove(key);
    }

    /// Total classify-hits (entry present, fresh or not) since startup.
    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Total classify-misses (no entry present) since startup.
    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeaderList;

    fn response_with(headers: &[(&str, &str)]) -> Response {
        let mut h = HeaderList::new();
        for (k, v) in headers {
            h.append(*k, *v);
        }
        Response {
            status_code: 200,
            reason: "OK".into(),
            version: "HTTP/1.1".into(),
            headers: h,
            body: b"body".to_vec(),
            raw: Vec::new(),
        }
    }

    #[test]
    fn miss_when_absent() {
        let cache = Cache::new();
        assert_eq!(cache.classify("k", SystemTime::now()), Decision::Miss);
        assert_eq!(cache.miss_count(), 1);
    }

    #[test]
    fn fresh_within_max_age() {
        let cache = Cache::new();
        let now = SystemTime::now();
        let resp = response_with(&[("Cache-Control", "max-age=60")]);
        cache.put("k".into(), resp, now);
        assert_eq!(cache.classify("k", now), Decision::Fresh);
        assert_eq!(cache.hit_count(), 1);
    }

    #[test]
    fn stale_after_max_age_elapses() {
        let cache = Cache::new();
        let inserted = SystemTime::now() - Duration::from_secs(120);
        let resp = response_with(&[("Cache-Control", "max-age=60")]);
        cache.put("k".into(), resp, inserted);
        assert_eq!(cache.classify("k", SystemTime::now()), Decision::MustRevalidate);
    }

    #[test]
    fn cacheable_without_freshness_hint_but_immediately_stale() {
        let cache = Cache::new();
        let resp = response_with(&[]);
        assert!(is_cacheable(&resp));
        let now = SystemTime::now();
        cache.put("k".into(), resp, now);
        assert_eq!(cache.classify("k", now), Decision::MustRevalidate);
    }

    #[test]
    fn not_cacheable_with_no_store() {
        let resp = response_with(&[("Cache-Control", "no-store, max-age=60")]);
        assert!(!is_cacheable(&resp));
    }

    #[test]
    fn not_cacheable_when_private() {
        let resp = response_with(&[("Cache-Control", "private, max-age=60")]);
        assert!(!is_cacheable(&resp));
    }

    #[test]
    fn cacheable_with_max_age() {
        let resp = response_with(&[("Cache-Control", "max-age=60")]);
        assert!(is_cacheable(&resp));
    }

    #[test]
    fn refresh_restarts_freshness_window() {
        let cache = Cache::new();
        let inserted = SystemTime::now() - Duration::from_secs(120);
        let resp = response_with(&[("Cache-Control", "max-age=60")]);
        cache.put("k".into(), resp, inserted);
        assert_eq!(cache.classify("k", SystemTime::now()), Decision::MustRevalidate);

        let revalidation = response_with(&[("Cache-Control", "max-age=60")]);
        let now = SystemTime::now();
        cache.refresh("k", &revalidation, now);
        assert_eq!(cache.classify("k", now), Decision::Fresh);
    }

    #[test]
    fn refresh_with_bare_304_keeps_existing_freshness_lifetime() {
        // A real origin's 304 is not required to repeat Cache-Control or
        // Expires (RFC 7234 §4.3.4). If refresh cleared the cached entry's
        // max-age whenever the 304 omits it, the entry would collapse to
        // MustRevalidate forever after the first revalidation.
        let cache = Cache::new();
        let inserted = SystemTime::now() - Duration::from_secs(120);
        let resp = response_with(&[("Cache-Control", "max-age=60"), ("ETag", "\"a\"")]);
        cache.put("k".into(), resp, inserted);
        assert_eq!(cache.classify("k", SystemTime::now()), Decision::MustRevalidate);

        let bare_304 = response_with(&[]);
        let now = SystemTime::now();
        let refreshed = cache.refresh_and_get("k", &bare_304, now).unwrap();
        assert_eq!(refreshed.response.cache_control().max_age, Some(60));
        assert_eq!(refreshed.response.etag(), Some("\"a\""));
        assert_eq!(cache.classify("k", now), Decision::Fresh);
    }

    #[test]
    fn classify_with_entry_returns_entry_atomically_with_decision() {
        let cache = Cache::new();
        let now = SystemTime::now();
        let resp = response_with(&[("Cache-Control", "max-age=60")]);
        cache.put("k".into(), resp, now);
        let (decision, entry) = cache.classify_with_entry("k", now);
        assert_eq!(decision, Decision::Fresh);
        assert!(entry.is_some());

        let (decision, entry) = cache.classify_with_entry("missing", now);
        assert_eq!(decision, Decision::Miss);
        assert!(entry.is_none());
    }

    #[test]
    fn refresh_and_get_returns_none_when_key_absent() {
        let cache = Cache::new();
        let revalidation = response_with(&[]);
        assert!(cache.refresh_and_get("missing", &revalidation, SystemTime::now()).is_none());
    }
}
