//! Seam to the donor's write-set cache.
//!
//! The cache owns the bytes of every replicated event, indexed by seqno and
//! guaranteed contiguous. During a transfer the sender pins the range it
//! streams with a seqno lock so garbage collection cannot overtake it; the
//! lock is released when the sender is dropped, on every exit path.

use std::collections::BTreeMap;
use std::sync::Mutex;

use thiserror::Error;

use crate::event::Event;
use crate::seqno::Seqno;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("seqno {0} not in write-set cache")]
    NotFound(Seqno),
}

pub trait WriteSetCache: Send + Sync {
    /// Pin cached events from `first` onward against purging.
    fn seqno_lock(&self, first: Seqno);

    /// Return up to `max` contiguous events starting exactly at `start`.
    /// Fewer than `max` may come back near the tail of the cache; an absent
    /// `start` is an error.
    fn seqno_get_buffers(&self, start: Seqno, max: usize) -> Result<Vec<Event>, CacheError>;

    /// Release the seqno lock. Idempotent.
    fn seqno_unlock(&self);
}

/// In-memory write-set cache used by the test harness and small tools.
#[derive(Default)]
pub struct MemWriteSetCache {
    inner: Mutex<MemCacheInner>,
}

#[derive(Default)]
struct MemCacheInner {
    events: BTreeMap<i64, Event>,
    locked_from: Option<Seqno>,
}

impl MemWriteSetCache {
    pub fn new() -> Self {
        MemWriteSetCache::default()
    }

    pub fn insert(&self, event: Event) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.events.insert(event.seqno.get(), event);
    }

    pub fn locked_from(&self) -> Option<Seqno> {
        self.inner.lock().expect("cache lock poisoned").locked_from
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl WriteSetCache for MemWriteSetCache {
    fn seqno_lock(&self, first: Seqno) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.locked_from = Some(first);
    }

    fn seqno_get_buffers(&self, start: Seqno, max: usize) -> Result<Vec<Event>, CacheError> {
        let inner = self.inner.lock().expect("cache lock poisoned");
        let mut out = Vec::with_capacity(max.min(inner.events.len()));
        let mut expected = start.get();
        for (seqno, event) in inner.events.range(start.get()..) {
            if out.len() == max || *seqno != expected {
                break;
            }
            out.push(event.clone());
            expected += 1;
        }
        if out.is_empty() {
            return Err(CacheError::NotFound(start));
        }
        Ok(out)
    }

    fn seqno_unlock(&self) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.locked_from = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn fill(cache: &MemWriteSetCache, seqnos: impl IntoIterator<Item = i64>) {
        for s in seqnos {
            cache.insert(Event::writeset(Seqno::new(s), Bytes::from(vec![s as u8])));
        }
    }

    #[test]
    fn returns_contiguous_run_from_start() {
        let cache = MemWriteSetCache::new();
        fill(&cache, [3, 4, 5, 7, 8]);

        let events = cache.seqno_get_buffers(Seqno::new(3), 10).unwrap();
        let seqnos: Vec<i64> = events.iter().map(|e| e.seqno.get()).collect();
        assert_eq!(seqnos, vec![3, 4, 5]);
    }

    #[test]
    fn respects_max() {
        let cache = MemWriteSetCache::new();
        fill(&cache, 1..=100);
        let events = cache.seqno_get_buffers(Seqno::new(1), 10).unwrap();
        assert_eq!(events.len(), 10);
        let events = cache.seqno_get_buffers(Seqno::new(11), 1000).unwrap();
        assert_eq!(events.len(), 90);
    }

    #[test]
    fn missing_start_is_an_error() {
        let cache = MemWriteSetCache::new();
        fill(&cache, [5, 6]);
        assert!(matches!(
            cache.seqno_get_buffers(Seqno::new(4), 10),
            Err(CacheError::NotFound(_))
        ));
    }

    #[test]
    fn lock_unlock_is_observable_and_idempotent() {
        let cache = MemWriteSetCache::new();
        cache.seqno_lock(Seqno::new(2));
        assert_eq!(cache.locked_from(), Some(Seqno::new(2)));
        cache.seqno_unlock();
        cache.seqno_unlock();
        assert_eq!(cache.locked_from(), None);
    }
}
