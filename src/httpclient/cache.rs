//! Byte-bounded LRU response cache.
//!
//! Approximates RFC 7234 for a shared cache: only cacheable statuses are
//! stored, `no-store`/`private` responses are skipped, freshness comes from
//! `s-maxage`, `max-age`, `Expires` or the `Last-Modified` heuristic, and
//! stale entries may still be served within the client's `max-stale`
//! allowance unless the origin demanded revalidation.
//!
//! Keys are `"<METHOD> <URL>"`. Capacity is counted in bytes (key + headers +
//! body) and can be changed at any time; shrinking takes effect on the next
//! access.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method, StatusCode, header};
use lru::LruCache;
use parking_lot::RwLock;
use url::Url;

/// A response as stored in, or served from, the cache.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

/// How long a response may be served without asking the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    /// Lifetime counted from the moment of storage
    pub lifetime: Duration,
    /// `must-revalidate`, `proxy-revalidate` or `no-cache` was present
    pub must_revalidate: bool,
}

/// Result of a cache lookup.
#[derive(Debug)]
pub enum Lookup {
    /// Usable as-is (fresh, or stale within `max-stale`)
    Hit(CachedResponse),
    /// Too stale, but carries validators for a conditional request
    Stale {
        /// The stored response, reused on `304 Not Modified`
        response: CachedResponse,
        /// Stored `ETag`
        etag: Option<header::HeaderValue>,
        /// Stored `Last-Modified`
        last_modified: Option<header::HeaderValue>,
    },
    /// Nothing usable
    Miss,
}

struct Entry {
    response: CachedResponse,
    stored_at: Instant,
    freshness: Freshness,
    size: usize,
}

struct Inner {
    entries: LruCache<String, Entry>,
    bytes: usize,
    max_bytes: usize,
}

impl Inner {
    fn enforce_capacity(&mut self, stats: &CacheStats) {
        while self.bytes > self.max_bytes {
            let Some((_, evicted)) = self.entries.pop_lru() else {
                self.bytes = 0;
                break;
            };
            self.bytes = self.bytes.saturating_sub(evicted.size);
            stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Lookups answered from the cache
    pub hits: AtomicU64,
    /// Lookups that went to the network
    pub misses: AtomicU64,
    /// Entries dropped by LRU pressure
    pub evictions: AtomicU64,
}

/// Shared, byte-bounded HTTP response cache.
pub struct HttpCache {
    inner: RwLock<Inner>,
    stats: CacheStats,
}

impl HttpCache {
    /// Create an empty cache holding at most `max_bytes`.
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: LruCache::unbounded(),
                bytes: 0,
                max_bytes,
            }),
            stats: CacheStats::default(),
        }
    }

    /// Change the capacity. Shrinking evicts lazily, on the next access.
    pub fn set_max_size(&self, max_bytes: usize) {
        self.inner.write().max_bytes = max_bytes;
    }

    /// Current capacity in bytes.
    pub fn max_size(&self) -> usize {
        self.inner.read().max_bytes
    }

    /// Bytes currently held.
    pub fn size(&self) -> usize {
        self.inner.read().bytes
    }

    /// Number of stored responses.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Statistics counters.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Look up `key`, tolerating up to `max_stale` past expiry.
    pub fn lookup(&self, key: &str, max_stale: Duration) -> Lookup {
        self.lookup_at(key, max_stale, Instant::now())
    }

    pub(crate) fn lookup_at(&self, key: &str, max_stale: Duration, now: Instant) -> Lookup {
        let found = {
            let inner = self.inner.read();
            inner.entries.peek(key).map(|entry| {
                let age = now.saturating_duration_since(entry.stored_at);
                let lifetime = entry.freshness.lifetime;
                let usable = age <= lifetime
                    || (!entry.freshness.must_revalidate && age <= lifetime + max_stale);
                if usable {
                    Lookup::Hit(entry.response.clone())
                } else {
                    let etag = entry.response.headers.get(header::ETAG).cloned();
                    let last_modified = entry.response.headers.get(header::LAST_MODIFIED).cloned();
                    if etag.is_none() && last_modified.is_none() {
                        Lookup::Miss
                    } else {
                        Lookup::Stale {
                            response: entry.response.clone(),
                            etag,
                            last_modified,
                        }
                    }
                }
            })
        };

        let mut inner = self.inner.write();
        match found {
            Some(Lookup::Hit(response)) => {
                inner.entries.promote(key);
                inner.enforce_capacity(&self.stats);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Lookup::Hit(response)
            }
            Some(stale @ Lookup::Stale { .. }) => {
                inner.enforce_capacity(&self.stats);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                stale
            }
            Some(Lookup::Miss) => {
                if let Some(dead) = inner.entries.pop(key) {
                    inner.bytes = inner.bytes.saturating_sub(dead.size);
                }
                inner.enforce_capacity(&self.stats);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Lookup::Miss
            }
            None => {
                inner.enforce_capacity(&self.stats);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Lookup::Miss
            }
        }
    }

    /// Store a response that [`freshness`] judged cacheable.
    pub fn store(&self, key: &str, response: CachedResponse, freshness: Freshness) {
        self.store_at(key, response, freshness, Instant::now());
    }

    pub(crate) fn store_at(
        &self,
        key: &str,
        response: CachedResponse,
        freshness: Freshness,
        now: Instant,
    ) {
        let size = entry_size(key, &response);
        let mut inner = self.inner.write();
        if size > inner.max_bytes {
            // Would flush everything else and still not fit.
            if let Some(old) = inner.entries.pop(key) {
                inner.bytes = inner.bytes.saturating_sub(old.size);
            }
            return;
        }
        let entry = Entry {
            response,
            stored_at: now,
            freshness,
            size,
        };
        if let Some(old) = inner.entries.put(key.to_string(), entry) {
            inner.bytes = inner.bytes.saturating_sub(old.size);
        }
        inner.bytes += size;
        inner.enforce_capacity(&self.stats);
    }

    /// Mark a stale entry fresh again after `304 Not Modified`.
    pub fn refresh(&self, key: &str, freshness: Freshness) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.stored_at = Instant::now();
            entry.freshness = freshness;
        }
    }
}

/// Cache key for a request.
pub fn cache_key(method: &Method, url: &Url) -> String {
    format!("{method} {url}")
}

fn entry_size(key: &str, response: &CachedResponse) -> usize {
    let headers: usize = response
        .headers
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len())
        .sum();
    key.len() + headers + response.body.len()
}

/// Decide whether a response may be stored, and for how long it is fresh.
///
/// Returns `None` for responses a shared cache must not keep.
pub fn freshness(status: StatusCode, headers: &HeaderMap) -> Option<Freshness> {
    freshness_at(status, headers, Utc::now())
}

pub(crate) fn freshness_at(
    status: StatusCode,
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Option<Freshness> {
    if !matches!(status.as_u16(), 200 | 203 | 300 | 301 | 308 | 404 | 410) {
        return None;
    }

    let directives = cache_control(headers);
    let has = |name: &str| directives.iter().any(|(k, _)| k == name);
    let seconds = |name: &str| {
        directives
            .iter()
            .find(|(k, _)| k == name)
            .and_then(|(_, v)| v.as_deref())
            .and_then(|v| v.trim_matches('"').parse::<u64>().ok())
    };

    if has("no-store") || has("private") {
        return None;
    }

    let must_revalidate = has("must-revalidate") || has("proxy-revalidate") || has("no-cache");
    let has_validator =
        headers.contains_key(header::ETAG) || headers.contains_key(header::LAST_MODIFIED);

    let date = http_date(headers, header::DATE).unwrap_or(now);
    let explicit = if has("no-cache") {
        Some(Duration::ZERO)
    } else if let Some(s) = seconds("s-maxage").or_else(|| seconds("max-age")) {
        Some(Duration::from_secs(s))
    } else {
        http_date(headers, header::EXPIRES).map(|expires| {
            (expires - date).to_std().unwrap_or(Duration::ZERO)
        })
    };

    let lifetime = match explicit {
        Some(lifetime) => lifetime,
        None => {
            // Heuristic: 10% of the time since last modification.
            let last_modified = http_date(headers, header::LAST_MODIFIED)?;
            (date - last_modified).to_std().unwrap_or(Duration::ZERO) / 10
        }
    };

    let age = headers
        .get(header::AGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(Duration::ZERO, Duration::from_secs);
    let lifetime = lifetime.saturating_sub(age);

    if lifetime.is_zero() && !has_validator {
        return None;
    }

    Some(Freshness {
        lifetime,
        must_revalidate,
    })
}

fn cache_control(headers: &HeaderMap) -> Vec<(String, Option<String>)> {
    headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| match d.split_once('=') {
            Some((k, v)) => (k.trim().to_ascii_lowercase(), Some(v.trim().to_string())),
            None => (d.to_ascii_lowercase(), None),
        })
        .collect()
}

fn http_date(headers: &HeaderMap, name: header::HeaderName) -> Option<DateTime<Utc>> {
    let raw = headers.get(name)?.to_str().ok()?;
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}
