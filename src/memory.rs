//! In-memory storage backend

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use crate::entity::{Change, ChangeSet, Entity, EntityKind, Record, RecordKey, Scannable};
use crate::error::Result;
use crate::storage::{ReadStorage, Storage};
use crate::types::{Block, Header};

#[derive(Default)]
struct MemoryState {
    records: HashMap<EntityKind, BTreeMap<RecordKey, Record>>,
}

impl MemoryState {
    fn latest<'s, T: Entity>(&'s self, kind: EntityKind, index: impl Fn(&T) -> u32) -> Option<&'s T> {
        self.records
            .get(&kind)?
            .values()
            .filter_map(T::from_record)
            .max_by_key(|value| index(value))
    }
}

/// Storage backed by ordered in-memory maps
///
/// Change-sets are applied under a single write lock, so readers observe
/// either none or all of a commit.
#[derive(Default)]
pub struct MemoryStorage {
    state: RwLock<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records of `kind`
    pub fn count(&self, kind: EntityKind) -> usize {
        self.state.read().records.get(&kind).map_or(0, BTreeMap::len)
    }
}

impl ReadStorage for MemoryStorage {
    fn try_get<E: Entity>(&self, key: &E::Key) -> Result<Option<E>> {
        let state = self.state.read();
        Ok(state
            .records
            .get(&E::KIND)
            .and_then(|records| records.get(&E::record_key(key)))
            .and_then(E::from_record)
            .cloned())
    }

    fn scan<E: Scannable>(&self, partial: &E::PartialKey) -> Result<Vec<E>> {
        let state = self.state.read();
        Ok(state
            .records
            .get(&E::KIND)
            .map(|records| {
                records
                    .values()
                    .filter_map(E::from_record)
                    .filter(|value| value.matches(partial))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl Storage for MemoryStorage {
    fn try_get_latest_block(&self) -> Result<Option<Block>> {
        let state = self.state.read();
        Ok(state.latest::<Block>(EntityKind::Block, Block::index).cloned())
    }

    fn try_get_latest_header(&self) -> Result<Option<Header>> {
        let state = self.state.read();
        Ok(state.latest::<Header>(EntityKind::Header, |header| header.index).cloned())
    }

    fn commit(&self, changes: ChangeSet) -> Result<()> {
        let mut state = self.state.write();
        for change in changes {
            match change {
                Change::Add(record) => {
                    state.records.entry(record.kind()).or_default().insert(record.key(), record);
                }
                Change::Delete(key) => {
                    if let Some(records) = state.records.get_mut(&key.kind()) {
                        records.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        self.state.write().records.clear();
        Ok(())
    }
}
