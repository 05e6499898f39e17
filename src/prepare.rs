//! the prepared statement manager.
//!
//! per connection, never shared. decides which queries are worth preparing
//! server side and under what name, and reclaims statement slots in LRU
//! order once `prepared_max` is reached.

use core::num::NonZeroUsize;

use bytes::Bytes;
use lru::LruCache;
use postgres_types::Oid;

use crate::sql::Ident;

pub(crate) type QueryFingerprint = (Bytes, Vec<Oid>);

/// what the executor should do for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PrepareState {
    /// run unprepared.
    No,
    /// prepare under this name first, then run it.
    ToPrepare(String),
    /// already prepared under this name.
    Yes(String),
}

pub(crate) struct PrepareManager {
    /// executions of the same query before it is prepared. `None` disables
    /// automatic preparation.
    pub(crate) prepare_threshold: Option<u32>,
    counter: u64,
    // dropping a count early only delays preparation, so evictions here are
    // harmless; dropping a prepared name would leak the server slot, so that
    // cache only rotates through maintain()
    counts: LruCache<QueryFingerprint, u32>,
    prepared: LruCache<QueryFingerprint, String>,
}

impl PrepareManager {
    pub(crate) const DEFAULT_THRESHOLD: u32 = 5;
    pub(crate) const DEFAULT_MAX: usize = 100;

    pub(crate) fn new() -> Self {
        let cap = NonZeroUsize::new(Self::DEFAULT_MAX).expect("non zero constant");
        Self {
            prepare_threshold: Some(Self::DEFAULT_THRESHOLD),
            counter: 0,
            counts: LruCache::new(cap),
            prepared: LruCache::new(cap),
        }
    }

    pub(crate) fn prepared_max(&self) -> usize {
        self.prepared.cap().get()
    }

    pub(crate) fn set_prepared_max(&mut self, max: usize) {
        if let Some(max) = NonZeroUsize::new(max) {
            self.counts.resize(max);
            self.prepared.resize(max);
        }
    }

    fn next_name(&mut self) -> String {
        self.counter += 1;
        format!("_pg3_{}", self.counter)
    }

    /// decide how to run a query. `prepare` forces the decision either way;
    /// `None` applies the threshold rule.
    pub(crate) fn get(&mut self, key: &QueryFingerprint, prepare: Option<bool>) -> PrepareState {
        if prepare == Some(false) {
            return PrepareState::No;
        }

        if let Some(name) = self.prepared.get(key) {
            return PrepareState::Yes(name.clone());
        }

        match prepare {
            Some(_) => {
                let name = self.next_name();
                PrepareState::ToPrepare(name)
            }
            None => {
                let threshold = match self.prepare_threshold {
                    Some(threshold) => threshold,
                    None => return PrepareState::No,
                };
                let count = match self.counts.get_mut(key) {
                    Some(count) => {
                        *count += 1;
                        *count
                    }
                    None => {
                        self.counts.put(key.clone(), 1);
                        1
                    }
                };
                if count >= threshold {
                    let name = self.next_name();
                    PrepareState::ToPrepare(name)
                } else {
                    PrepareState::No
                }
            }
        }
    }

    /// record the outcome of an execution. when a newly prepared statement
    /// evicts an old one, the returned statement must be run to release the
    /// server side slot.
    pub(crate) fn maintain(
        &mut self,
        key: &QueryFingerprint,
        state: PrepareState,
        succeeded: bool,
    ) -> Option<String> {
        let name = match state {
            PrepareState::ToPrepare(name) if succeeded => name,
            _ => return None,
        };
        self.counts.pop(key);
        match self.prepared.push(key.clone(), name) {
            Some((old_key, old_name)) if old_key != *key => {
                Some(format!("DEALLOCATE {}", Ident(&old_name)))
            }
            _ => None,
        }
    }

    /// number of statements currently prepared on the server.
    pub(crate) fn prepared_len(&self) -> usize {
        self.prepared.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn key(q: &str) -> QueryFingerprint {
        (Bytes::copy_from_slice(q.as_bytes()), Vec::new())
    }

    #[test]
    fn threshold_promotes_to_prepare() {
        let mut mgr = PrepareManager::new();
        mgr.prepare_threshold = Some(3);
        let k = key("select 1");

        assert_eq!(mgr.get(&k, None), PrepareState::No);
        assert_eq!(mgr.get(&k, None), PrepareState::No);
        let state = mgr.get(&k, None);
        let name = match &state {
            PrepareState::ToPrepare(name) => name.clone(),
            other => panic!("expected ToPrepare, got {other:?}"),
        };

        assert!(mgr.maintain(&k, state, true).is_none());
        assert_eq!(mgr.get(&k, None), PrepareState::Yes(name));
        assert_eq!(mgr.prepared_len(), 1);
    }

    #[test]
    fn forced_prepare_skips_counting() {
        let mut mgr = PrepareManager::new();
        let k = key("select 2");
        match mgr.get(&k, Some(true)) {
            PrepareState::ToPrepare(_) => {}
            other => panic!("expected ToPrepare, got {other:?}"),
        }
        assert_eq!(mgr.get(&k, Some(false)), PrepareState::No);
    }

    #[test]
    fn failed_prepare_is_not_recorded() {
        let mut mgr = PrepareManager::new();
        let k = key("select nope");
        let state = mgr.get(&k, Some(true));
        assert!(mgr.maintain(&k, state, false).is_none());
        match mgr.get(&k, Some(true)) {
            PrepareState::ToPrepare(_) => {}
            other => panic!("expected ToPrepare, got {other:?}"),
        }
        assert_eq!(mgr.prepared_len(), 0);
    }

    #[test]
    fn eviction_emits_deallocate() {
        let mut mgr = PrepareManager::new();
        mgr.set_prepared_max(2);
        mgr.prepare_threshold = Some(1);

        for q in ["select 1", "select 2"] {
            let k = key(q);
            let state = mgr.get(&k, None);
            assert!(mgr.maintain(&k, state, true).is_none());
        }

        let k = key("select 3");
        let state = mgr.get(&k, None);
        let dealloc = mgr.maintain(&k, state, true).expect("lru slot must be reclaimed");
        assert!(dealloc.starts_with("DEALLOCATE "));
        assert!(dealloc.contains("_pg3_1"));
        assert_eq!(mgr.prepared_len(), 2);
    }
}
