//! Header index cache: block index -> header hash
//!
//! Hashes are persisted in batches of `HEADER_HASH_LIST_BATCH_SIZE`. Batch
//! `b` covers indices `[b * 2000, (b + 1) * 2000)`. Lookups go through a
//! small index -> hash LRU first. Full batches are read back through a
//! second LRU; hashes past the last full batch live in an in-memory tail
//! until the tail fills up.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::constants::{HEADER_HASH_LIST_BATCH_SIZE, HEADER_HASH_LIST_CACHE_SIZE, HEADER_INDEX_CACHE_SIZE};
use crate::entity::{Change, Record};
use crate::error::{LedgerError, Result};
use crate::state::{HeaderHashCount, HeaderHashList};
use crate::storage::Storage;
use crate::types::Hash256;

struct IndexState {
    hashes: LruCache<u32, Hash256>,
    batches: LruCache<u32, Arc<Vec<Hash256>>>,
    /// Hashes covered by fully persisted batches
    persisted_count: u32,
    tail: Vec<Hash256>,
}

impl IndexState {
    fn empty() -> Self {
        IndexState {
            hashes: lru(HEADER_INDEX_CACHE_SIZE),
            batches: lru(HEADER_HASH_LIST_CACHE_SIZE),
            persisted_count: 0,
            tail: Vec::new(),
        }
    }
}

pub struct HeaderIndexCache<S> {
    storage: Arc<S>,
    state: Mutex<IndexState>,
}

impl<S: Storage> HeaderIndexCache<S> {
    /// Load the persisted count and any partially flushed tail batch
    pub fn new(storage: Arc<S>) -> Result<Self> {
        let cache = HeaderIndexCache { storage, state: Mutex::new(IndexState::empty()) };
        cache.load()?;
        Ok(cache)
    }

    fn load(&self) -> Result<()> {
        let count = self
            .storage
            .try_get::<HeaderHashCount>(&())?
            .map_or(0, |stored| stored.count);
        let tail = self
            .storage
            .try_get::<HeaderHashList>(&batch_of(count))?
            .map(|list| list.hashes)
            .unwrap_or_default();

        let mut state = self.state.lock();
        *state = IndexState::empty();
        state.persisted_count = count;
        state.tail = tail;
        Ok(())
    }

    /// Number of indexed headers
    pub fn len(&self) -> u32 {
        let state = self.state.lock();
        state.persisted_count + state.tail.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn try_get(&self, index: u32) -> Result<Option<Hash256>> {
        let mut state = self.state.lock();
        if let Some(hash) = state.hashes.get(&index) {
            return Ok(Some(*hash));
        }

        let hash = if index >= state.persisted_count {
            state.tail.get((index - state.persisted_count) as usize).copied()
        } else {
            let batch = batch_of(index);
            let offset = (index as usize) % HEADER_HASH_LIST_BATCH_SIZE;
            let cached = state.batches.get(&batch).map(|hashes| hashes.get(offset).copied());
            match cached {
                Some(hash) => hash,
                None => match self.storage.try_get::<HeaderHashList>(&batch)? {
                    Some(list) => {
                        let hashes = Arc::new(list.hashes);
                        let hash = hashes.get(offset).copied();
                        state.batches.put(batch, hashes);
                        hash
                    }
                    None => None,
                },
            }
        };

        if let Some(hash) = hash {
            state.hashes.put(index, hash);
        }
        Ok(hash)
    }

    pub fn get(&self, index: u32) -> Result<Hash256> {
        self.try_get(index)?.ok_or_else(|| LedgerError::NotFound {
            kind: "headerIndex",
            key: index.to_string(),
        })
    }

    /// Append the hash of the next header
    ///
    /// Full batches are flushed to storage. A flush that fails keeps the
    /// tail intact and is retried on the next push.
    pub fn push(&self, hash: Hash256) -> Result<()> {
        let mut state = self.state.lock();
        state.tail.push(hash);

        while state.tail.len() >= HEADER_HASH_LIST_BATCH_SIZE {
            let batch = batch_of(state.persisted_count);
            let hashes: Vec<Hash256> = state.tail[..HEADER_HASH_LIST_BATCH_SIZE].to_vec();
            let count = state.persisted_count + HEADER_HASH_LIST_BATCH_SIZE as u32;

            if let Err(e) = self.storage.commit(vec![
                Change::Add(Record::HeaderHashList(HeaderHashList { batch, hashes: hashes.clone() })),
                Change::Add(Record::HeaderHashCount(HeaderHashCount { count })),
            ]) {
                warn!(batch, error = %e, "failed to flush header hash batch");
                return Err(e);
            }

            debug!(batch, count, "flushed header hash batch");
            state.tail.drain(..HEADER_HASH_LIST_BATCH_SIZE);
            state.persisted_count = count;
            state.batches.put(batch, Arc::new(hashes));
        }
        Ok(())
    }

    /// Persist the partial tail so a later instance can reload it
    pub fn dispose(&self) -> Result<()> {
        let state = self.state.lock();
        if state.tail.is_empty() {
            return Ok(());
        }
        self.storage.commit(vec![Change::Add(Record::HeaderHashList(HeaderHashList {
            batch: batch_of(state.persisted_count),
            hashes: state.tail.clone(),
        }))])
    }

    /// Drop all in-memory state
    pub fn reset(&self) {
        *self.state.lock() = IndexState::empty();
    }
}

fn lru<V>(size: usize) -> LruCache<u32, V> {
    LruCache::new(NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN))
}

fn batch_of(index: u32) -> u32 {
    index / HEADER_HASH_LIST_BATCH_SIZE as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::memory::MemoryStorage;
    use crate::storage::ReadStorage;

    fn hash(i: u32) -> Hash256 {
        let mut h = [0u8; 32];
        h[..4].copy_from_slice(&i.to_le_bytes());
        h
    }

    #[test]
    fn test_push_and_get_across_batches() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = HeaderIndexCache::new(storage.clone()).unwrap();
        for i in 0..4500 {
            cache.push(hash(i)).unwrap();
        }
        assert_eq!(cache.len(), 4500);
        assert_eq!(cache.get(0).unwrap(), hash(0));
        assert_eq!(cache.get(1999).unwrap(), hash(1999));
        assert_eq!(cache.get(2000).unwrap(), hash(2000));
        assert_eq!(cache.get(4499).unwrap(), hash(4499));
        assert!(cache.try_get(4500).unwrap().is_none());

        let count = storage.try_get::<HeaderHashCount>(&()).unwrap().unwrap();
        assert_eq!(count.count, 4000);
        assert!(storage.try_get::<HeaderHashList>(&2).unwrap().is_none());
    }

    #[test]
    fn test_reload_reads_batches_from_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = HeaderIndexCache::new(storage.clone()).unwrap();
        for i in 0..2001 {
            cache.push(hash(i)).unwrap();
        }

        // without dispose only full batches survive
        let reloaded = HeaderIndexCache::new(storage.clone()).unwrap();
        assert_eq!(reloaded.len(), 2000);
        assert_eq!(reloaded.get(1234).unwrap(), hash(1234));

        cache.dispose().unwrap();
        let reloaded = HeaderIndexCache::new(storage).unwrap();
        assert_eq!(reloaded.len(), 2001);
        assert_eq!(reloaded.get(2000).unwrap(), hash(2000));
    }

    #[test]
    fn test_recent_lookups_skip_the_batches() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = HeaderIndexCache::new(storage.clone()).unwrap();
        for i in 0..2001 {
            cache.push(hash(i)).unwrap();
        }
        assert_eq!(cache.get(5).unwrap(), hash(5));

        // batch 0 gone from memory and storage
        cache.state.lock().batches.clear();
        storage.commit(vec![Change::Delete(HeaderHashList::record_key(&0))]).unwrap();

        assert_eq!(cache.get(5).unwrap(), hash(5));
        assert!(cache.try_get(6).unwrap().is_none());
        assert_eq!(cache.get(2000).unwrap(), hash(2000));
    }

    #[test]
    fn test_reset_clears_memory() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = HeaderIndexCache::new(storage).unwrap();
        cache.push(hash(0)).unwrap();
        cache.reset();
        assert!(cache.is_empty());
        assert!(matches!(cache.get(0), Err(LedgerError::NotFound { .. })));
    }
}
