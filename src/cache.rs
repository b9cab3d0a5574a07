//! Decision Cache: a bounded LRU from an observed `User-Agent` value to the
//! string that should be emitted in its place.
//!
//! The "leave unchanged" decision is represented by storing `value == key`
//! rather than a separate enum variant, so a single `String -> String` map
//! is enough and a hit never needs a second branch to interpret.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

pub struct DecisionCache {
    inner: Option<Mutex<LruCache<String, String>>>,
}

impl DecisionCache {
    pub fn new(capacity: usize) -> Self {
        let inner = NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap)));
        Self { inner }
    }

    /// Returns the cached replacement for `ua`, if any.
    pub fn get(&self, ua: &str) -> Option<String> {
        let inner = self.inner.as_ref()?;
        match inner.lock() {
            Ok(mut cache) => cache.get(ua).cloned(),
            Err(poisoned) => {
                log::error!("decision cache lock poisoned, recovering");
                poisoned.into_inner().get(ua).cloned()
            }
        }
    }

    /// Records the decision for `ua`. Pass `ua` itself as `replacement` to
    /// record "leave unchanged".
    pub fn put(&self, ua: String, replacement: String) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        match inner.lock() {
            Ok(mut cache) => {
                cache.put(ua, replacement);
            }
            Err(poisoned) => {
                log::error!("decision cache lock poisoned, recovering");
                poisoned.into_inner().put(ua, replacement);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_on_empty_cache() {
        let cache = DecisionCache::new(4);
        assert_eq!(cache.get("Mozilla/5.0"), None);
    }

    #[test]
    fn hit_returns_stored_value() {
        let cache = DecisionCache::new(4);
        cache.put("Mozilla/5.0".into(), "FFF".into());
        assert_eq!(cache.get("Mozilla/5.0"), Some("FFF".to_string()));
    }

    #[test]
    fn unchanged_sentinel_is_equality_with_key() {
        let cache = DecisionCache::new(4);
        cache.put("curl/8.0".into(), "curl/8.0".into());
        let got = cache.get("curl/8.0").unwrap();
        assert_eq!(got, "curl/8.0");
    }

    #[test]
    fn capacity_boundary_evicts_oldest() {
        let cache = DecisionCache::new(2);
        cache.put("a".into(), "a".into());
        cache.put("b".into(), "b".into());
        cache.put("c".into(), "c".into());
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some("b".to_string()));
        assert_eq!(cache.get("c"), Some("c".to_string()));
    }

    #[test]
    fn zero_capacity_never_retains() {
        let cache = DecisionCache::new(0);
        cache.put("a".into(), "a".into());
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn repeated_put_is_idempotent() {
        let cache = DecisionCache::new(4);
        cache.put("a".into(), "x".into());
        cache.put("a".into(), "x".into());
        assert_eq!(cache.get("a"), Some("x".to_string()));
    }
}
